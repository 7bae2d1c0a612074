use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::utils::message_to_chunks;
use crate::errors::ProviderError;
use crate::models::message::Message;
use crate::models::tool::Tool;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: Option<i32>,
    pub output_tokens: Option<i32>,
    pub total_tokens: Option<i32>,
}

impl Usage {
    pub fn new(
        input_tokens: Option<i32>,
        output_tokens: Option<i32>,
        total_tokens: Option<i32>,
    ) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens,
        }
    }

    /// Sum two usages, treating missing counts as zero once either side reports them
    pub fn add(&self, other: &Usage) -> Usage {
        fn sum(a: Option<i32>, b: Option<i32>) -> Option<i32> {
            match (a, b) {
                (None, None) => None,
                (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
            }
        }
        Usage::new(
            sum(self.input_tokens, other.input_tokens),
            sum(self.output_tokens, other.output_tokens),
            sum(self.total_tokens, other.total_tokens),
        )
    }
}

/// Everything the backend needs for one completion
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub tools: Vec<Tool>,
    pub max_tokens: Option<i32>,
}

impl ModelRequest {
    pub fn new<S: Into<String>>(model: S, messages: Vec<Message>, tools: Vec<Tool>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools,
            max_tokens: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: i32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// One incremental fragment of a streamed completion
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderChunk {
    TextDelta(String),
    /// The first fragment of a tool call; later fragments refer to it by index
    ToolCallStart {
        index: usize,
        id: String,
        name: String,
    },
    ToolCallArgsDelta {
        index: usize,
        delta: String,
    },
    Finish {
        reason: String,
    },
    Usage(Usage),
}

pub type ChunkStream = BoxStream<'static, Result<ProviderChunk, ProviderError>>;

/// Base trait for OpenAI-compatible model backends
#[async_trait]
pub trait Provider: Send + Sync {
    /// Generate the next message in one round trip
    async fn complete(&self, request: &ModelRequest) -> Result<(Message, Usage), ProviderError>;

    /// Generate the next message as a stream of fragments. Failing to open the stream is
    /// reported by the outer result, failures mid-stream by the items.
    async fn stream(&self, request: &ModelRequest) -> Result<ChunkStream, ProviderError> {
        let (message, usage) = self.complete(request).await?;
        let chunks = message_to_chunks(&message, usage);
        Ok(stream::iter(chunks.into_iter().map(Ok)).boxed())
    }

    /// The backend's model catalogue, passed through untouched
    async fn models(&self) -> Result<Value, ProviderError> {
        Err(ProviderError::Api(
            "This backend does not publish a model catalogue".to_string(),
        ))
    }
}
