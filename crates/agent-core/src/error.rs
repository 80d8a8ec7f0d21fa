//! Error Types

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Agent error types
#[derive(Error, Debug)]
pub enum AgentError {
    /// Backend answered with a non-success HTTP status
    #[error("Protocol error: HTTP {status}: {body}")]
    Protocol { status: u16, body: String },

    /// Backend answered 2xx but the payload could not be mapped
    #[error("Malformed backend response: {0}")]
    MalformedResponse(String),

    /// Transport failure before any HTTP status was received
    #[error("Transport error: {0}")]
    Transport(String),

    /// No adapter registered for a channel type
    #[error("No adapter for channel type: {0}")]
    AdapterNotFound(String),

    /// Tool not found in registry
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Tool validation failed
    #[error("Tool validation error: {0}")]
    ToolValidation(String),

    /// Tool execution failed
    #[error("Tool execution error: {0}")]
    ToolExecution(String),

    /// Iteration or wall-clock budget exhausted
    #[error("Budget exceeded: {0}")]
    BudgetExceeded(String),

    /// Cooperative cancellation fired
    #[error("Cancelled")]
    Cancelled,

    /// Illegal tool-call status transition
    #[error("Invalid tool call transition for {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },

    /// Conversation store error
    #[error("Session error: {0}")]
    Session(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other/unknown error
    #[error("{0}")]
    Other(String),
}

impl AgentError {
    /// Check if error is retryable by a caller-level retry policy.
    ///
    /// The core itself never retries.
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::Protocol { status, .. } => *status == 429 || *status >= 500,
            AgentError::Transport(_) | AgentError::Io(_) => true,
            _ => false,
        }
    }

    /// Convert to a user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            AgentError::Protocol { status: 401 | 403, .. } => {
                "Authentication failed. Please check your channel credentials.".into()
            }
            AgentError::Protocol { status: 429, .. } => {
                "The AI service is rate limiting requests. Please wait a moment.".into()
            }
            AgentError::Protocol { status, body } => {
                format!("The AI service returned HTTP {status}: {body}")
            }
            AgentError::MalformedResponse(_) => "The AI service sent a response that could not be read.".into(),
            AgentError::Transport(_) => "The AI service is currently unreachable. Please try again.".into(),
            AgentError::ToolNotFound(name) => format!("The tool '{name}' is not available."),
            AgentError::ToolValidation(msg) => format!("Invalid tool input: {msg}"),
            AgentError::ToolExecution(msg) => format!("Tool error: {msg}"),
            AgentError::BudgetExceeded(msg) => format!("The request ran out of budget: {msg}"),
            AgentError::Cancelled => "The request was cancelled.".into(),
            AgentError::Config(msg) => format!("Configuration problem: {msg}"),
            _ => "An unexpected error occurred.".into(),
        }
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        AgentError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        let rate_limited = AgentError::Protocol { status: 429, body: String::new() };
        let server = AgentError::Protocol { status: 503, body: String::new() };
        let bad_request = AgentError::Protocol { status: 400, body: "bad".into() };

        assert!(rate_limited.is_retryable());
        assert!(server.is_retryable());
        assert!(!bad_request.is_retryable());
        assert!(!AgentError::Cancelled.is_retryable());
    }

    #[test]
    fn test_protocol_error_display_carries_body() {
        let err = AgentError::Protocol { status: 400, body: "{\"error\":\"nope\"}".into() };
        assert_eq!(err.to_string(), "Protocol error: HTTP 400: {\"error\":\"nope\"}");
    }
}
