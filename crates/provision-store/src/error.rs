//! Error types for the object store

use provision_models::{ModelError, Prefix};
use thiserror::Error;

/// Error type for store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// Structured, status-coded error produced by the request pipeline
    #[error(transparent)]
    Model(#[from] ModelError),

    /// The backing store failed to persist or remove an object
    #[error("backing store failed on {prefix}/{key}: {message}")]
    Backing {
        prefix: Prefix,
        key: String,
        message: String,
    },

    /// A store was touched without holding its lock
    #[error("Tried to access unlocked resource {0}")]
    NotLocked(Prefix),

    /// An object operation was attempted outside of `RequestTracker::do_`
    #[error("RequestTracker used outside of Do")]
    OutsideDo,

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// The structured error, if this is one
    pub fn model(&self) -> Option<&ModelError> {
        match self {
            StoreError::Model(e) => Some(e),
            _ => None,
        }
    }

    /// HTTP-style status code for the error
    pub fn code(&self) -> u16 {
        match self {
            StoreError::Model(e) => e.code,
            _ => 500,
        }
    }
}

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StoreError::NotLocked(Prefix::Machines);
        assert_eq!(err.to_string(), "Tried to access unlocked resource machines");

        let err = StoreError::OutsideDo;
        assert_eq!(err.to_string(), "RequestTracker used outside of Do");
        assert_eq!(err.code(), 500);

        let err = StoreError::Backing {
            prefix: Prefix::Leases,
            key: "0A000005".to_string(),
            message: "disk full".to_string(),
        };
        assert!(err.to_string().contains("leases/0A000005"));
    }

    #[test]
    fn test_model_error_passthrough() {
        let err: StoreError = ModelError::new(404, "GET", "leases", "x").with("Not Found").into();
        assert_eq!(err.code(), 404);
        assert!(err.model().unwrap().is_not_found());
    }
}
