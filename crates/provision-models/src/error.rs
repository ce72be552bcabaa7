//! Structured model errors
//!
//! Every failure that crosses the object store boundary is reported as a
//! [`ModelError`]: an HTTP status code, an error type, the model and key
//! it concerns, and a list of human readable messages. Validation hooks
//! accumulate messages into one error and only fail the operation once
//! they are done looking.

use crate::model::Model;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error type used when object content is invalid (422)
pub const VALIDATION_ERROR: &str = "ValidationError";

/// Error type used when a delete is blocked by a referencing object (409)
pub const STILL_IN_USE_ERROR: &str = "StillInUseError";

/// A structured, status-coded error with one or more messages
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModelError {
    /// HTTP-style status code
    pub code: u16,

    /// Error type, e.g. `ValidationError` or the failing verb (`CREATE`)
    #[serde(rename = "Type")]
    pub kind: String,

    /// Model prefix the error concerns
    pub model: String,

    /// Key of the object the error concerns
    pub key: String,

    /// Human readable messages
    #[serde(default)]
    pub messages: Vec<String>,
}

impl ModelError {
    /// Create an empty error
    pub fn new(
        code: u16,
        kind: impl Into<String>,
        model: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            code,
            kind: kind.into(),
            model: model.into(),
            key: key.into(),
            messages: Vec::new(),
        }
    }

    /// Create an empty error about a specific object
    pub fn for_object<T: Model>(code: u16, kind: impl Into<String>, obj: &T) -> Self {
        Self::new(code, kind, T::PREFIX.as_str(), obj.key())
    }

    /// 422 validation error about `obj`
    pub fn validation<T: Model>(obj: &T) -> Self {
        Self::for_object(422, VALIDATION_ERROR, obj)
    }

    /// 409 error for a delete blocked by a reference to `obj`
    pub fn still_in_use<T: Model>(obj: &T) -> Self {
        Self::for_object(409, STILL_IN_USE_ERROR, obj)
    }

    /// 409 conflict, e.g. a create over an existing key
    pub fn conflict(kind: impl Into<String>, model: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(409, kind, model, key)
    }

    pub fn not_found(kind: impl Into<String>, model: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(404, kind, model, key).with("Not Found")
    }

    pub fn bad_request(kind: impl Into<String>, model: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(400, kind, model, key)
    }

    /// 406, used when a patched body no longer decodes
    pub fn not_acceptable(kind: impl Into<String>, model: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(406, kind, model, key)
    }

    /// Add a message to the error
    pub fn push(&mut self, msg: impl Into<String>) -> &mut Self {
        self.messages.push(msg.into());
        self
    }

    /// Builder form of [`ModelError::push`]
    pub fn with(mut self, msg: impl Into<String>) -> Self {
        self.messages.push(msg.into());
        self
    }

    /// Fold the messages of another error into this one
    pub fn merge(&mut self, other: ModelError) {
        self.messages.extend(other.messages);
    }

    /// Whether any message has been recorded
    pub fn has_errors(&self) -> bool {
        !self.messages.is_empty()
    }

    /// `Ok(())` when no messages were recorded, `Err(self)` otherwise
    pub fn or_ok(self) -> Result<(), ModelError> {
        if self.has_errors() {
            Err(self)
        } else {
            Ok(())
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code == 404
    }

    pub fn is_conflict(&self) -> bool {
        self.code == 409
    }
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.key.is_empty() {
            write!(f, "{}: {}", self.model, self.kind)?;
        } else {
            write!(f, "{}/{}: {}", self.model, self.key, self.kind)?;
        }
        for msg in &self.messages {
            write!(f, "\n{}", msg)?;
        }
        Ok(())
    }
}

impl std::error::Error for ModelError {}
