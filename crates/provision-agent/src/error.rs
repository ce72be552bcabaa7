//! Error types for the machine agent

use provision_models::ModelError;
use thiserror::Error;

/// Error type for agent operations
#[derive(Debug, Error)]
pub enum AgentError {
    /// The HTTP request could not be made
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with an error
    #[error("API error ({status}): {error}")]
    Api { status: u16, error: ModelError },

    /// A structured error raised by the agent itself
    #[error(transparent)]
    Model(#[from] ModelError),

    /// Waiting on the machine failed
    #[error("wait failed: {0}")]
    Wait(String),

    /// A task could not be prepared or run
    #[error("task runner: {0}")]
    Runner(String),

    /// Power control failed
    #[error("Failed to {0}")]
    Power(String),

    /// Local I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Body (de)serialization error
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AgentError {
    /// Whether the server reported the object as missing
    pub fn is_not_found(&self) -> bool {
        match self {
            AgentError::Api { status, .. } => *status == 404,
            AgentError::Model(e) => e.is_not_found(),
            _ => false,
        }
    }
}

/// Result type for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AgentError::Api {
            status: 404,
            error: ModelError::not_found("GET", "machines", "abc"),
        };
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "API error (404): machines/abc: GET\nNot Found");

        let err = AgentError::Power("reboot".to_string());
        assert_eq!(err.to_string(), "Failed to reboot");
        assert!(!err.is_not_found());
    }
}
