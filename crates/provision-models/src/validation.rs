use serde::{Deserialize, Serialize};

/// Validation state carried by objects whose usability is computed
///
/// Cleared before every write and filled in by the object's hooks.
/// `available` is only ever true when `validated` is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Validation {
    #[serde(default)]
    pub validated: bool,
    #[serde(default)]
    pub available: bool,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl Validation {
    pub fn clear(&mut self) {
        *self = Validation::default();
    }

    /// Mark validated; available when no errors were recorded
    pub fn finish(&mut self, errors: Vec<String>) {
        self.validated = true;
        self.available = errors.is_empty();
        self.errors = errors;
    }
}
