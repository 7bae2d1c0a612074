use thiserror::Error;

use crate::errors::AgentError;

/// Failures talking to a remote tool server
#[derive(Error, Debug)]
pub enum ToolServerError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Tool server returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Could not decode tool server response: {0}")]
    Decode(String),
}

pub type ToolServerResult<T> = Result<T, ToolServerError>;

impl From<ToolServerError> for AgentError {
    fn from(err: ToolServerError) -> Self {
        match err {
            // Unknown tool or bad arguments are the model's mistake, the rest is ours
            ToolServerError::Rpc {
                code: -32602,
                message,
            } => AgentError::InvalidParameters(message),
            other => AgentError::ExecutionError(other.to_string()),
        }
    }
}
