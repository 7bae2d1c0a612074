//! Inbound chat requests and their conversion into the conversation the loop works on.
use conduit::errors::AgentError;
use conduit::models::message::{Message, MessageContent};
use conduit::models::role::Role;
use conduit::models::tool::ToolCall;
use serde::Deserialize;
use serde_json::{json, Value};

// Types matching the incoming JSON structure. Only `messages` is strict, optional fields of
// the wrong shape are ignored.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<UiMessage>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub model: Option<Value>,
}

impl ChatRequest {
    /// `body.model`, when it is a string
    pub fn body_model(&self) -> Option<&str> {
        self.body
            .as_ref()
            .and_then(|body| body.get("model"))
            .and_then(Value::as_str)
    }

    pub fn top_level_model(&self) -> Option<&str> {
        self.model.as_ref().and_then(Value::as_str)
    }
}

#[derive(Debug, Deserialize)]
pub struct UiMessage {
    #[serde(default)]
    pub role: String,
    /// Older clients send `content`, either a string or an array of text items
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default)]
    pub parts: Vec<Value>,
}

/// Collects an assistant turn, which may interleave text with completed tool calls
struct AssistantTurn {
    messages: Vec<Message>,
    current: Message,
    results: Message,
}

impl AssistantTurn {
    fn new() -> Self {
        Self {
            messages: Vec::new(),
            current: Message::assistant(),
            results: Message::tool(),
        }
    }

    fn text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        // Text after tool results belongs to the next model step
        if !self.results.is_empty() {
            self.flush();
        }
        self.current.content.push(MessageContent::text(text));
    }

    fn tool(
        &mut self,
        id: String,
        name: String,
        arguments: Value,
        result: Result<Value, AgentError>,
    ) {
        self.current = std::mem::replace(&mut self.current, Message::assistant())
            .with_tool_request(id.clone(), Ok(ToolCall::new(name, arguments)));
        self.results = std::mem::replace(&mut self.results, Message::tool())
            .with_tool_response(id, result);
    }

    fn flush(&mut self) {
        let current = std::mem::replace(&mut self.current, Message::assistant());
        let results = std::mem::replace(&mut self.results, Message::tool());
        if !current.is_empty() {
            self.messages.push(current);
        }
        if !results.is_empty() {
            self.messages.push(results);
        }
    }

    fn finish(mut self) -> Vec<Message> {
        self.flush();
        self.messages
    }
}

/// Convert UI messages to the internal conversation. Messages with unknown roles or no
/// usable content are skipped.
pub fn convert_messages(incoming: &[UiMessage]) -> Vec<Message> {
    let mut messages = Vec::new();

    for msg in incoming {
        match Role::parse(&msg.role) {
            Some(Role::User) => push_text(&mut messages, Message::user(), msg),
            Some(Role::System) => push_text(&mut messages, Message::system(), msg),
            Some(Role::Assistant) => {
                let mut turn = AssistantTurn::new();
                for text in content_texts(msg.content.as_ref()) {
                    turn.text(&text);
                }
                for part in &msg.parts {
                    if let Some(text) = text_part(part) {
                        turn.text(text);
                    } else if let Some((id, name, arguments, result)) = tool_part(part) {
                        turn.tool(id, name, arguments, result);
                    }
                }
                messages.extend(turn.finish());
            }
            _ => {
                tracing::warn!("Unknown role: {}", msg.role);
            }
        }
    }

    messages
}

fn push_text(messages: &mut Vec<Message>, mut message: Message, msg: &UiMessage) {
    let texts = content_texts(msg.content.as_ref())
        .into_iter()
        .chain(msg.parts.iter().filter_map(text_part).map(str::to_string));
    for text in texts {
        if !text.is_empty() {
            message = message.with_text(text);
        }
    }
    if !message.is_empty() {
        messages.push(message);
    }
}

fn content_texts(content: Option<&Value>) -> Vec<String> {
    match content {
        Some(Value::String(text)) => vec![text.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn text_part(part: &Value) -> Option<&str> {
    if part.get("type").and_then(Value::as_str) != Some("text") {
        return None;
    }
    part.get("text").and_then(Value::as_str)
}

/// A finished tool part: `(call id, tool name, input, output or error)`
fn tool_part(part: &Value) -> Option<(String, String, Value, Result<Value, AgentError>)> {
    let kind = part.get("type").and_then(Value::as_str)?;
    let name = if kind == "dynamic-tool" {
        part.get("toolName").and_then(Value::as_str)?
    } else {
        kind.strip_prefix("tool-")?
    };
    let id = part.get("toolCallId").and_then(Value::as_str)?;
    let arguments = part.get("input").cloned().unwrap_or_else(|| json!({}));

    let result = match part.get("state").and_then(Value::as_str)? {
        "output-available" => Ok(part.get("output").cloned().unwrap_or(Value::Null)),
        "output-error" => Err(AgentError::ExecutionError(
            part.get("errorText")
                .and_then(Value::as_str)
                .unwrap_or("Tool execution failed")
                .to_string(),
        )),
        // Still streaming or awaiting input, nothing to replay
        _ => return None,
    };

    Some((id.to_string(), name.to_string(), arguments, result))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(value: Value) -> Vec<Message> {
        let request: ChatRequest = serde_json::from_value(value).unwrap();
        convert_messages(&request.messages)
    }

    #[test]
    fn test_content_string_and_array() {
        let messages = parse(json!({"messages": [
            {"role": "system", "content": "Be brief."},
            {"role": "user", "content": [{"type": "text", "text": "what is "}, {"type": "text", "text": "1+2"}]},
            {"role": "narrator", "content": "ignored"}
        ]}));

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1].role, Role::User);
        assert_eq!(messages[1].text(), "what is 1+2");
    }

    #[test]
    fn test_parts_with_tool_history() {
        let messages = parse(json!({"messages": [
            {"role": "user", "parts": [{"type": "text", "text": "what is 1+2"}]},
            {"role": "assistant", "parts": [
                {"type": "step-start"},
                {"type": "text", "text": "Let me calculate."},
                {"type": "tool-calculate", "toolCallId": "toolu_12345", "state": "output-available",
                 "input": {"expression": "1+2"}, "output": {"content": [{"type": "text", "text": "3"}]}},
                {"type": "dynamic-tool", "toolName": "lookup", "toolCallId": "call_2", "state": "output-error",
                 "input": {}, "errorText": "lookup failed"},
                {"type": "tool-calculate", "toolCallId": "call_3", "state": "input-streaming"},
                {"type": "text", "text": "The result is 3."}
            ]},
            {"role": "user", "parts": [{"type": "text", "text": "thanks"}]}
        ]}));

        let roles: Vec<_> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant, Role::User]
        );

        let calls: Vec<_> = messages[1].tool_requests().collect();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "toolu_12345");
        assert_eq!(
            calls[0].tool_call,
            Ok(ToolCall::new("calculate", json!({"expression": "1+2"})))
        );
        assert_eq!(calls[1].tool_call.as_ref().unwrap().name, "lookup");
        assert_eq!(messages[1].text(), "Let me calculate.");

        let results: Vec<_> = messages[2].tool_responses().collect();
        assert_eq!(results[0].id, "toolu_12345");
        assert_eq!(
            results[1].tool_result,
            Err(AgentError::ExecutionError("lookup failed".to_string()))
        );
        assert_eq!(messages[3].text(), "The result is 3.");
    }

    #[test]
    fn test_request_models() {
        let request: ChatRequest = serde_json::from_value(json!({
            "messages": [],
            "body": {"model": "from-body"},
            "model": "top-level"
        }))
        .unwrap();
        assert_eq!(request.body_model(), Some("from-body"));
        assert_eq!(request.top_level_model(), Some("top-level"));

        let request: ChatRequest = serde_json::from_value(json!({
            "messages": [],
            "body": "x",
            "model": 42
        }))
        .unwrap();
        assert_eq!(request.body_model(), None);
        assert_eq!(request.top_level_model(), None);

        let request: ChatRequest = serde_json::from_value(json!({
            "messages": [],
            "body": {"model": ["not", "a", "name"]},
            "model": null
        }))
        .unwrap();
        assert_eq!(request.body_model(), None);
        assert_eq!(request.top_level_model(), None);

        assert!(serde_json::from_value::<ChatRequest>(json!({})).is_err());
        assert!(serde_json::from_value::<ChatRequest>(json!({"messages": "hi"})).is_err());
        assert!(serde_json::from_value::<ChatRequest>(json!({"messages": [42]})).is_err());
    }
}
