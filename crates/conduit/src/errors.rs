use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Failures local to a single tool call. These travel inside the conversation as
/// tool-result data so the model can react to them.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum AgentError {
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Tool execution failed: {0}")]
    ExecutionError(String),

    /// Elapsed limit in milliseconds
    #[error("Tool execution timed out after {}s", Duration::from_millis(*.0).as_secs_f64())]
    Timeout(u64),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type AgentResult<T> = Result<T, AgentError>;

/// Failures talking to the model backend
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Backend request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Backend returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Backend API error: {0}")]
    Api(String),

    #[error("Context length exceeded. Message: {0}")]
    ContextLengthExceeded(String),

    #[error("Invalid backend request: {0}")]
    InvalidRequest(String),

    #[error("Could not decode backend response: {0}")]
    Decode(String),
}

/// Reasons the tool-calling loop stops before reaching a final answer
#[derive(Error, Debug)]
pub enum LoopError {
    #[error(transparent)]
    Backend(#[from] ProviderError),

    #[error("Client disconnected")]
    Disconnected,
}
