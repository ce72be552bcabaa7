use serde::{Deserialize, Serialize};

/// A DHCP option attached to a subnet or reservation
///
/// `value` is a template that is rendered against the options of the
/// incoming packet before being converted to wire format for `code`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DhcpOption {
    pub code: u8,
    pub value: String,
}

impl DhcpOption {
    pub fn new(code: u8, value: impl Into<String>) -> Self {
        Self {
            code,
            value: value.into(),
        }
    }
}
