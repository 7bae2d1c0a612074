//! Stream Multiplexer: turns loop events into data-stream frames, one `<code>:<json>\n` line
//! per event, in the order the loop emitted them.
use axum::http::header;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use conduit::agent::AgentEvent;
use conduit::providers::base::Usage;
use futures::Stream;
use serde_json::{json, Value};
use std::{
    convert::Infallible,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Sent when the event channel closes without a terminal event
const INTERRUPTED: &str = "The response was interrupted";

// Protocol-specific message formatting
pub struct ProtocolFormatter;

impl ProtocolFormatter {
    pub fn format_start_step(message_id: &str) -> String {
        format!("f:{}\n", json!({ "messageId": message_id }))
    }

    pub fn format_text(text: &str) -> String {
        format!("0:{}\n", Value::String(text.to_string()))
    }

    pub fn format_tool_call_start(id: &str, name: &str) -> String {
        let start = json!({
            "toolCallId": id,
            "toolName": name,
        });
        format!("b:{}\n", start)
    }

    pub fn format_tool_call_delta(id: &str, delta: &str) -> String {
        let delta = json!({
            "toolCallId": id,
            "argsTextDelta": delta,
        });
        format!("c:{}\n", delta)
    }

    pub fn format_tool_call(id: &str, name: &str, args: &Value) -> String {
        // Tool calls start with "9:"
        let tool_call = json!({
            "toolCallId": id,
            "toolName": name,
            "args": args
        });
        format!("9:{}\n", tool_call)
    }

    pub fn format_tool_response(id: &str, result: &Value) -> String {
        // Tool responses start with "a:"
        let response = json!({
            "toolCallId": id,
            "result": result,
        });
        format!("a:{}\n", response)
    }

    pub fn format_tool_error(id: &str, error: &str) -> String {
        let response = json!({
            "toolCallId": id,
            "result": error,
            "isError": true,
        });
        format!("a:{}\n", response)
    }

    pub fn format_step_finish(reason: &str, usage: &Usage) -> String {
        let finish = json!({
            "finishReason": finish_reason(reason),
            "usage": usage_json(usage),
            "isContinued": false,
        });
        format!("e:{}\n", finish)
    }

    pub fn format_finish(reason: &str, usage: &Usage) -> String {
        // Finish messages start with "d:"
        let finish = json!({
            "finishReason": finish_reason(reason),
            "usage": usage_json(usage),
        });
        format!("d:{}\n", finish)
    }

    pub fn format_error(message: &str) -> String {
        format!("3:{}\n", Value::String(message.to_string()))
    }

    pub fn format_event(event: &AgentEvent) -> String {
        match event {
            AgentEvent::StartStep { message_id } => Self::format_start_step(message_id),
            AgentEvent::TextDelta { text } => Self::format_text(text),
            AgentEvent::ToolCallStart { id, name } => Self::format_tool_call_start(id, name),
            AgentEvent::ToolCallArgsDelta { id, delta } => Self::format_tool_call_delta(id, delta),
            AgentEvent::ToolCall {
                id,
                name,
                arguments,
            } => Self::format_tool_call(id, name, arguments),
            AgentEvent::ToolResult { id, output } => Self::format_tool_response(id, output),
            AgentEvent::ToolError { id, error } => Self::format_tool_error(id, error),
            AgentEvent::FinishStep { reason, usage } => Self::format_step_finish(reason, usage),
            AgentEvent::Finish { reason, usage } => Self::format_finish(reason, usage),
            AgentEvent::Error { message } => Self::format_error(message),
        }
    }
}

/// Backend finish reasons in the client's vocabulary
fn finish_reason(reason: &str) -> &str {
    match reason {
        "stop" => "stop",
        "length" => "length",
        "tool_calls" | "function_call" => "tool-calls",
        "content_filter" => "content-filter",
        "error" => "error",
        _ => "unknown",
    }
}

fn usage_json(usage: &Usage) -> Value {
    json!({
        "promptTokens": usage.input_tokens.unwrap_or(0),
        "completionTokens": usage.output_tokens.unwrap_or(0),
    })
}

/// Streamed response body in the data-stream protocol. Guarantees the body ends with exactly
/// one terminal frame, even if the producer goes away without sending one.
pub struct DataStreamResponse {
    first: Option<AgentEvent>,
    rx: ReceiverStream<AgentEvent>,
    terminated: bool,
}

impl DataStreamResponse {
    /// `first` is an event already taken off `rx`
    pub fn new(first: AgentEvent, rx: mpsc::Receiver<AgentEvent>) -> Self {
        Self {
            first: Some(first),
            rx: ReceiverStream::new(rx),
            terminated: false,
        }
    }

    fn frame(&mut self, event: AgentEvent) -> Option<Result<Bytes, Infallible>> {
        if self.terminated {
            return None;
        }
        self.terminated = event.is_terminal();
        Some(Ok(Bytes::from(ProtocolFormatter::format_event(&event))))
    }
}

impl Stream for DataStreamResponse {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(first) = self.first.take() {
            return Poll::Ready(self.frame(first));
        }
        if self.terminated {
            return Poll::Ready(None);
        }

        match Pin::new(&mut self.rx).poll_next(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(self.frame(event)),
            Poll::Ready(None) => {
                tracing::warn!("event stream closed without a terminal event");
                let frame = self.frame(AgentEvent::Error {
                    message: INTERRUPTED.to_string(),
                });
                Poll::Ready(frame)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl IntoResponse for DataStreamResponse {
    fn into_response(self) -> Response {
        let body = axum::body::Body::from_stream(self);

        (
            [
                (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
                (header::CACHE_CONTROL, "no-cache"),
                (header::HeaderName::from_static("x-vercel-ai-data-stream"), "v1"),
            ],
            body,
        )
            .into_response()
    }
}
