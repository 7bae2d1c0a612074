//! Tool Registry Client: discovers tools from remote JSON-RPC tool servers and merges them
//! into one callable namespace for the lifetime of a single chat request.
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::errors::AgentResult;

pub mod client;
pub mod error;
pub mod observe;
pub mod protocol;
pub mod registry;

pub use client::ToolServerClient;
pub use error::ToolServerError;
pub use registry::ToolRegistry;

/// Invokes one tool with its JSON arguments
pub type ToolExecutor = Arc<dyn Fn(Value) -> BoxFuture<'static, AgentResult<Value>> + Send + Sync>;

/// Where to find one remote tool server
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ToolServerDescriptor {
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
}

impl ToolServerDescriptor {
    pub fn new<S: Into<String>>(url: S) -> Self {
        Self {
            url: url.into(),
            token: None,
        }
    }

    /// Blank tokens are treated as absent
    pub fn with_token<S: Into<String>>(mut self, token: S) -> Self {
        let token = token.into();
        self.token = (!token.trim().is_empty()).then_some(token);
        self
    }
}
