use flowforge_core::{AgentRole, CoreError, Stage};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid stage transition from {from} to {to}")]
    InvalidTransition { from: Stage, to: Stage },

    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("Cannot resume session {session_id} from stage {stage}: no in-memory blueprint")]
    ResumeUnsupported { session_id: Uuid, stage: Stage },

    #[error("Blueprint rejected by user")]
    BlueprintRejected,

    #[error("Build produced no resource id")]
    MissingResourceId,

    #[error("Agent {role} timed out after {timeout_ms}ms")]
    AgentTimeout { role: AgentRole, timeout_ms: u64 },

    #[error("Agent runtime error ({status_code:?}): {message}")]
    RuntimeApi {
        message: String,
        status_code: Option<u16>,
    },

    #[error("Rate limited, retry after {retry_after:?}s")]
    RateLimited { retry_after: Option<u64> },

    #[error("Field '{field}' is owned by {owner}, write by {writer} rejected")]
    WritePermissionDenied {
        field: String,
        writer: String,
        owner: String,
    },

    #[error("No answer for message {0} before timeout")]
    MessageTimeout(Uuid),

    #[error("No message handler registered for {0}")]
    NoHandler(AgentRole),

    #[error("No fix list for analysis {0}")]
    TodoNotFound(Uuid),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl OrchestratorError {
    /// Create an agent runtime API error.
    pub fn runtime_api(message: impl Into<String>, status_code: Option<u16>) -> Self {
        Self::RuntimeApi {
            message: message.into(),
            status_code,
        }
    }

    /// Whether a failed runtime request is worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::RuntimeApi {
                status_code: Some(code),
                ..
            } => *code >= 500,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OrchestratorError::InvalidTransition {
            from: Stage::Complete,
            to: Stage::Build,
        };
        assert_eq!(
            err.to_string(),
            "Invalid stage transition from complete to build"
        );

        let err = OrchestratorError::WritePermissionDenied {
            field: "researcher_findings".to_string(),
            writer: "architect".to_string(),
            owner: "researcher".to_string(),
        };
        assert!(err.to_string().contains("owned by researcher"));
    }

    #[test]
    fn test_retryable() {
        assert!(OrchestratorError::RateLimited { retry_after: None }.is_retryable());
        assert!(OrchestratorError::runtime_api("bad gateway", Some(502)).is_retryable());
        assert!(!OrchestratorError::runtime_api("bad request", Some(400)).is_retryable());
        assert!(!OrchestratorError::BlueprintRejected.is_retryable());
    }
}
