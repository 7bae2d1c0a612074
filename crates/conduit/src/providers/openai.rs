use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::header::ACCEPT;
use reqwest::Client;
use serde_json::{json, Map, Value};
use std::time::Duration;

use super::base::{ChunkStream, ModelRequest, Provider, ProviderChunk, Usage};
use super::configs::OpenAiProviderConfig;
use super::utils::{
    api_error, get_usage, http_error, insert_optional, messages_to_openai_spec,
    openai_chunk_to_deltas, openai_response_to_message, tools_to_openai_spec,
};
use crate::errors::ProviderError;
use crate::models::message::Message;
use crate::sse::{SseDecoder, DONE};

pub struct OpenAiProvider {
    client: Client,
    config: OpenAiProviderConfig,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiProviderConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.host.trim_end_matches('/'), path)
    }

    fn build_payload(&self, request: &ModelRequest, stream: bool) -> Result<Value, ProviderError> {
        let mut payload = Map::new();
        payload.insert("model".to_string(), json!(request.model));
        payload.insert(
            "messages".to_string(),
            json!(messages_to_openai_spec(&request.messages)),
        );

        // Some backends reject an empty tools array, so leave the key out entirely
        if !request.tools.is_empty() {
            payload.insert(
                "tools".to_string(),
                json!(tools_to_openai_spec(&request.tools)?),
            );
        }
        if stream {
            payload.insert("stream".to_string(), json!(true));
            payload.insert("stream_options".to_string(), json!({"include_usage": true}));
        }
        insert_optional(
            &mut payload,
            "temperature",
            self.config.temperature.map(|t| json!(t)),
        );
        insert_optional(
            &mut payload,
            "max_tokens",
            request.max_tokens.or(self.config.max_tokens).map(|t| json!(t)),
        );

        Ok(Value::Object(payload))
    }

    async fn post(
        &self,
        payload: &Value,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let accept = if stream {
            "text/event-stream"
        } else {
            "application/json"
        };
        let response = self
            .client
            .post(self.url("v1/chat/completions"))
            .bearer_auth(&self.config.api_key)
            .header(ACCEPT, accept)
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(http_error(status.as_u16(), body));
        }
        Ok(response)
    }
}

/// Decode a streamed completion body into fragments, stopping at the `[DONE]` sentinel
fn sse_chunks<S, B>(bytes: S) -> impl Stream<Item = Result<ProviderChunk, ProviderError>>
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]>,
{
    async_stream::try_stream! {
        let mut bytes = Box::pin(bytes);
        let mut decoder = SseDecoder::new();
        let mut done = false;

        while !done {
            let payloads = match bytes.next().await {
                Some(chunk) => {
                    let chunk = chunk.map_err(ProviderError::from)?;
                    decoder.push(chunk.as_ref())
                }
                None => {
                    done = true;
                    decoder.finish()
                }
            };

            for payload in payloads {
                if payload.trim() == DONE {
                    done = true;
                    break;
                }
                let chunk: Value = serde_json::from_str(&payload)
                    .map_err(|e| ProviderError::Decode(format!("{}: {}", e, payload)))?;
                for delta in openai_chunk_to_deltas(&chunk)? {
                    yield delta;
                }
            }
        }
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    async fn complete(&self, request: &ModelRequest) -> Result<(Message, Usage), ProviderError> {
        let payload = self.build_payload(request, false)?;
        let response: Value = self
            .post(&payload, false)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;

        if let Some(error) = response.get("error") {
            return Err(api_error(error));
        }

        let message = openai_response_to_message(&response)?;
        let usage = get_usage(&response);
        Ok((message, usage))
    }

    async fn stream(&self, request: &ModelRequest) -> Result<ChunkStream, ProviderError> {
        let payload = self.build_payload(request, true)?;
        let response = self.post(&payload, true).await?;
        Ok(Box::pin(sse_chunks(response.bytes_stream())))
    }

    async fn models(&self) -> Result<Value, ProviderError> {
        let response = self
            .client
            .get(self.url("api/chat/models"))
            .bearer_auth(&self.config.api_key)
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))
    }
}
