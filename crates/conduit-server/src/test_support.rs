use crate::state::{AppState, Limits};
use axum::response::Response;
use conduit::providers::configs::OpenAiProviderConfig;
use conduit::providers::openai::OpenAiProvider;
use conduit::tools::ToolServerDescriptor;
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// State pointing at a mock backend, with short limits so failing tests fail fast
pub fn test_state(backend_url: &str, tool_servers: Vec<ToolServerDescriptor>) -> AppState {
    let config = OpenAiProviderConfig::new(
        Some(backend_url.to_string()),
        Some("test_api_key".to_string()),
    );
    let provider = OpenAiProvider::new(config).unwrap();
    AppState::new(
        Arc::new(provider),
        tool_servers,
        None,
        Limits {
            request_timeout: Duration::from_secs(10),
            tool_timeout: Duration::from_secs(5),
            ..Limits::default()
        },
    )
}

/// A streamed completion body made of the given chunks
pub fn sse_body(chunks: &[Value]) -> String {
    chunks
        .iter()
        .map(|chunk| format!("data: {}\n\n", chunk))
        .collect::<String>()
        + "data: [DONE]\n\n"
}

pub async fn body_text(response: Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}
