use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use super::error::{ToolServerError, ToolServerResult};
use super::protocol::{
    CallToolParams, CallToolResult, Implementation, InitializeParams, InitializeResult,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListToolsParams, ListToolsResult,
};
use super::ToolServerDescriptor;
use crate::errors::{AgentError, AgentResult};
use crate::models::content::{joined_text, Content};
use crate::models::tool::Tool;
use crate::sse::SseDecoder;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Upper bound on `tools/list` pages, in case a server keeps handing out cursors
const MAX_LIST_PAGES: usize = 64;

/// A JSON-RPC connection to one tool server over HTTP
pub struct ToolServerClient {
    client: Client,
    descriptor: ToolServerDescriptor,
    session_id: RwLock<Option<String>>,
    next_id: AtomicU64,
}

impl ToolServerClient {
    pub fn new(descriptor: ToolServerDescriptor) -> ToolServerResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(120))
            .build()?;

        Ok(Self {
            client,
            descriptor,
            session_id: RwLock::new(None),
            next_id: AtomicU64::new(1),
        })
    }

    /// Open a connection and complete the handshake
    pub async fn connect(descriptor: ToolServerDescriptor) -> ToolServerResult<Self> {
        let client = Self::new(descriptor)?;
        client.initialize().await?;
        Ok(client)
    }

    pub fn endpoint(&self) -> &str {
        &self.descriptor.url
    }

    pub async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }

    /// Negotiate the protocol version and confirm with `notifications/initialized`
    pub async fn initialize(&self) -> ToolServerResult<InitializeResult> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION,
            capabilities: Default::default(),
            client_info: Implementation {
                name: "conduit".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        let result: InitializeResult = self.request("initialize", &params).await?;

        let version = result.protocol_version.as_deref().unwrap_or("unknown");
        let server = result
            .server_info
            .as_ref()
            .map_or("unknown", |info| info.name.as_str());
        debug!(
            endpoint = %self.descriptor.url,
            protocol_version = %version,
            server = %server,
            "tool server initialized"
        );

        self.notify("notifications/initialized").await?;
        Ok(result)
    }

    /// All tools the server offers, following pagination
    pub async fn list_tools(&self) -> ToolServerResult<Vec<Tool>> {
        let mut tools = Vec::new();
        let mut params = ListToolsParams::default();

        for _ in 0..MAX_LIST_PAGES {
            let page: ListToolsResult = self.request("tools/list", &params).await?;
            tools.extend(page.tools);

            params.cursor = page.next_cursor.filter(|c| !c.is_empty());
            if params.cursor.is_none() {
                return Ok(tools);
            }
        }

        Err(ToolServerError::Protocol(format!(
            "tools/list did not finish within {} pages",
            MAX_LIST_PAGES
        )))
    }

    /// Invoke a tool by the name the server knows it under
    pub async fn call_tool(&self, name: &str, arguments: Value) -> AgentResult<Value> {
        let params = CallToolParams { name, arguments };
        let result: CallToolResult = self.request("tools/call", &params).await?;
        tool_output(result)
    }

    /// End the session, if the server opened one. Failures are only logged.
    pub async fn close(&self) {
        let Some(session_id) = self.session_id().await else {
            return;
        };

        let request = self
            .authorize(self.client.delete(&self.descriptor.url))
            .header(SESSION_HEADER, session_id);
        if let Err(e) = request.send().await {
            debug!(
                endpoint = %self.descriptor.url,
                error = %e,
                "failed to close tool server session"
            );
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.descriptor.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn post<B: Serialize>(&self, body: &B) -> ToolServerResult<Response> {
        let mut request = self
            .authorize(self.client.post(&self.descriptor.url))
            .header(ACCEPT, "application/json, text/event-stream")
            .json(body);
        if let Some(session_id) = self.session_id().await {
            request = request.header(SESSION_HEADER, session_id);
        }

        let response = request.send().await?;
        if let Some(session_id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.write().await = Some(session_id.to_string());
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ToolServerError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn request<P, R>(&self, method: &str, params: &P) -> ToolServerResult<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let response = self.post(&JsonRpcRequest::new(id, method, params)).await?;

        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream"));
        let text = response.text().await?;

        let message = if is_event_stream {
            find_event_response(&text, id)?
        } else {
            serde_json::from_str(&text)
                .map_err(|e| ToolServerError::Decode(format!("{}: {}", method, e)))?
        };
        let result = rpc_result(message)?;
        serde_json::from_value(result)
            .map_err(|e| ToolServerError::Decode(format!("{}: {}", method, e)))
    }

    async fn notify(&self, method: &str) -> ToolServerResult<()> {
        self.post(&JsonRpcNotification::new(method)).await?;
        Ok(())
    }
}

/// Pick the reply to request `id` out of an event-stream body
fn find_event_response(body: &str, id: u64) -> ToolServerResult<JsonRpcResponse> {
    let mut decoder = SseDecoder::new();
    let mut payloads = decoder.push(body.as_bytes());
    payloads.extend(decoder.finish());

    payloads
        .iter()
        .filter_map(|payload| serde_json::from_str::<JsonRpcResponse>(payload).ok())
        .find(|message| message.is_reply_to(id))
        .ok_or_else(|| {
            ToolServerError::Protocol(format!("no response for request {} in event stream", id))
        })
}

fn rpc_result(message: JsonRpcResponse) -> ToolServerResult<Value> {
    if let Some(error) = message.error {
        return Err(ToolServerError::Rpc {
            code: error.code,
            message: error.message,
        });
    }
    message
        .result
        .ok_or_else(|| ToolServerError::Protocol("response has neither result nor error".into()))
}

/// Shape a `tools/call` result into the output handed to the model
fn tool_output(result: CallToolResult) -> AgentResult<Value> {
    if result.is_error {
        let contents: Vec<Content> = result
            .content
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect();
        let message = joined_text(&contents);
        return Err(AgentError::ExecutionError(if message.is_empty() {
            "Tool reported an error without details".to_string()
        } else {
            message
        }));
    }

    let mut output = json!({ "content": result.content });
    if let Some(structured) = result.structured_content {
        output["structuredContent"] = structured;
    }
    Ok(output)
}
