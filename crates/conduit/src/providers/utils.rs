use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Map, Value};

use super::base::{ProviderChunk, Usage};
use crate::errors::{AgentError, ProviderError};
use crate::models::message::{Message, MessageContent};
use crate::models::tool::{Tool, ToolCall};

lazy_static! {
    static ref INVALID_NAME_CHARS: Regex = Regex::new(r"[^a-zA-Z0-9_-]").unwrap();
    static ref VALID_NAME: Regex = Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap();
}

/// Placeholder name for tool calls the model produced but we could not parse. The backend
/// still needs a matching tool_calls entry for the error result that follows it.
const INVALID_TOOL_CALL: &str = "invalid_tool_call";

/// Convert internal Message format to OpenAI's API message specification
pub fn messages_to_openai_spec(messages: &[Message]) -> Vec<Value> {
    let mut messages_spec = Vec::new();

    for message in messages {
        let mut converted = json!({
            "role": message.role
        });
        let mut text = String::new();
        let mut tool_calls = Vec::new();
        let mut output = Vec::new();

        for content in &message.content {
            match content {
                MessageContent::Text(t) => text.push_str(&t.text),
                MessageContent::ToolRequest(request) => {
                    let (name, arguments) = match &request.tool_call {
                        Ok(tool_call) => (
                            sanitize_function_name(&tool_call.name),
                            tool_call.arguments.to_string(),
                        ),
                        Err(_) => (INVALID_TOOL_CALL.to_string(), "{}".to_string()),
                    };
                    tool_calls.push(json!({
                        "id": request.id,
                        "type": "function",
                        "function": {
                            "name": name,
                            "arguments": arguments,
                        }
                    }));
                }
                MessageContent::ToolResponse(response) => {
                    let content = match &response.tool_result {
                        Ok(value) => tool_output_text(value),
                        // A tool result error is shown as output so the model can interpret it
                        Err(e) => format!("The tool call returned the following error:\n{}", e),
                    };
                    output.push(json!({
                        "role": "tool",
                        "content": content,
                        "tool_call_id": response.id
                    }));
                }
            }
        }

        if !text.is_empty() {
            converted["content"] = json!(text);
        }
        if !tool_calls.is_empty() {
            converted["tool_calls"] = json!(tool_calls);
            if text.is_empty() {
                converted["content"] = Value::Null;
            }
        }

        if converted.get("content").is_some() {
            output.insert(0, converted);
        }
        messages_spec.extend(output);
    }

    messages_spec
}

/// Tool outputs are JSON; the backend wants a string
pub fn tool_output_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Convert internal Tool format to OpenAI's API tool specification
pub fn tools_to_openai_spec(tools: &[Tool]) -> Result<Vec<Value>, ProviderError> {
    let mut tool_names = std::collections::HashSet::new();
    let mut result = Vec::new();

    for tool in tools {
        if !tool_names.insert(&tool.name) {
            return Err(ProviderError::InvalidRequest(format!(
                "Duplicate tool name: {}",
                tool.name
            )));
        }

        result.push(json!({
            "type": "function",
            "function": {
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.input_schema,
            }
        }));
    }

    Ok(result)
}

/// Turn the pieces of a model-issued tool call into a request part. Bad names and
/// unparseable arguments become errors that are later reported back to the model.
pub fn parse_tool_call(id: String, name: &str, arguments: &str) -> MessageContent {
    if !is_valid_function_name(name) {
        let error = AgentError::ToolNotFound(format!(
            "The provided function name '{}' had invalid characters, \
             it must match this regex [a-zA-Z0-9_-]+",
            name
        ));
        return MessageContent::tool_request(id, Err(error));
    }

    // Some backends send an empty string for tools without parameters
    let arguments = if arguments.trim().is_empty() {
        "{}"
    } else {
        arguments
    };

    match serde_json::from_str::<Value>(arguments) {
        Ok(params) => MessageContent::tool_request(id, Ok(ToolCall::new(name, params))),
        Err(e) => {
            let error = AgentError::InvalidParameters(format!(
                "Could not interpret tool use parameters for id {}: {}",
                id, e
            ));
            MessageContent::tool_request(id, Err(error))
        }
    }
}

/// Convert OpenAI's API response to internal Message format
pub fn openai_response_to_message(response: &Value) -> Result<Message, ProviderError> {
    let original = response
        .pointer("/choices/0/message")
        .ok_or_else(|| ProviderError::Decode("response has no choices".to_string()))?;
    let mut message = Message::assistant();

    if let Some(text) = original.get("content").and_then(|t| t.as_str()) {
        if !text.is_empty() {
            message = message.with_text(text);
        }
    }

    if let Some(tool_calls) = original.get("tool_calls").and_then(|t| t.as_array()) {
        for tool_call in tool_calls {
            let id = tool_call["id"].as_str().unwrap_or_default().to_string();
            let function_name = tool_call["function"]["name"].as_str().unwrap_or_default();
            let arguments = tool_call["function"]["arguments"]
                .as_str()
                .unwrap_or_default();
            message = message.with_content(parse_tool_call(id, function_name, arguments));
        }
    }

    Ok(message)
}

pub fn get_usage(data: &Value) -> Usage {
    let Some(usage) = data.get("usage").filter(|u| u.is_object()) else {
        return Usage::default();
    };

    let count = |key: &str| usage.get(key).and_then(|v| v.as_i64()).map(|v| v as i32);
    let input_tokens = count("prompt_tokens");
    let output_tokens = count("completion_tokens");
    let total_tokens = count("total_tokens").or_else(|| match (input_tokens, output_tokens) {
        (Some(input), Some(output)) => Some(input + output),
        _ => None,
    });

    Usage::new(input_tokens, output_tokens, total_tokens)
}

/// Split one streamed `chat.completion.chunk` into fragments
pub fn openai_chunk_to_deltas(chunk: &Value) -> Result<Vec<ProviderChunk>, ProviderError> {
    if let Some(error) = chunk.get("error") {
        return Err(api_error(error));
    }

    let mut deltas = Vec::new();

    if let Some(choice) = chunk.pointer("/choices/0") {
        let delta = &choice["delta"];

        if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
            if !text.is_empty() {
                deltas.push(ProviderChunk::TextDelta(text.to_string()));
            }
        }

        if let Some(tool_calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
            for (position, tool_call) in tool_calls.iter().enumerate() {
                let index = tool_call
                    .get("index")
                    .and_then(|i| i.as_u64())
                    .map(|i| i as usize)
                    .unwrap_or(position);
                let id = tool_call.get("id").and_then(|i| i.as_str());
                let name = tool_call.pointer("/function/name").and_then(|n| n.as_str());

                if id.is_some() || name.is_some() {
                    deltas.push(ProviderChunk::ToolCallStart {
                        index,
                        id: id.unwrap_or_default().to_string(),
                        name: name.unwrap_or_default().to_string(),
                    });
                }

                if let Some(arguments) = tool_call
                    .pointer("/function/arguments")
                    .and_then(|a| a.as_str())
                {
                    if !arguments.is_empty() {
                        deltas.push(ProviderChunk::ToolCallArgsDelta {
                            index,
                            delta: arguments.to_string(),
                        });
                    }
                }
            }
        }

        if let Some(reason) = choice.get("finish_reason").and_then(|r| r.as_str()) {
            deltas.push(ProviderChunk::Finish {
                reason: reason.to_string(),
            });
        }
    }

    if chunk.get("usage").is_some_and(|u| u.is_object()) {
        deltas.push(ProviderChunk::Usage(get_usage(chunk)));
    }

    Ok(deltas)
}

/// Replay a complete message as fragments, for backends that cannot stream
pub fn message_to_chunks(message: &Message, usage: Usage) -> Vec<ProviderChunk> {
    let mut chunks = Vec::new();
    let mut index = 0;

    for content in &message.content {
        match content {
            MessageContent::Text(text) if !text.text.is_empty() => {
                chunks.push(ProviderChunk::TextDelta(text.text.clone()));
            }
            MessageContent::ToolRequest(request) => {
                let (name, arguments) = match &request.tool_call {
                    Ok(call) => (call.name.clone(), call.arguments.to_string()),
                    Err(_) => (INVALID_TOOL_CALL.to_string(), "{".to_string()),
                };
                chunks.push(ProviderChunk::ToolCallStart {
                    index,
                    id: request.id.clone(),
                    name,
                });
                chunks.push(ProviderChunk::ToolCallArgsDelta {
                    index,
                    delta: arguments,
                });
                index += 1;
            }
            _ => {}
        }
    }

    let reason = if index > 0 { "tool_calls" } else { "stop" };
    chunks.push(ProviderChunk::Finish {
        reason: reason.to_string(),
    });
    chunks.push(ProviderChunk::Usage(usage));
    chunks
}

pub fn sanitize_function_name(name: &str) -> String {
    INVALID_NAME_CHARS.replace_all(name, "_").to_string()
}

pub fn is_valid_function_name(name: &str) -> bool {
    VALID_NAME.is_match(name)
}

pub fn check_openai_context_length_error(error: &Value) -> Option<ProviderError> {
    let code = error.get("code")?.as_str()?;
    if code == "context_length_exceeded" || code == "string_above_max_length" {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("Unknown error")
            .to_string();
        Some(ProviderError::ContextLengthExceeded(message))
    } else {
        None
    }
}

/// Classify an `error` object found in a backend payload
pub fn api_error(error: &Value) -> ProviderError {
    if let Some(err) = check_openai_context_length_error(error) {
        return err;
    }
    let message = error
        .get("message")
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string());
    ProviderError::Api(message)
}

/// Classify a non-success HTTP response from the backend
pub fn http_error(status: u16, body: String) -> ProviderError {
    if let Ok(value) = serde_json::from_str::<Value>(&body) {
        if let Some(err) = value.get("error").and_then(check_openai_context_length_error) {
            return err;
        }
    }
    ProviderError::Http { status, body }
}

/// Insert optional payload fields only when they are set
pub fn insert_optional(payload: &mut Map<String, Value>, key: &str, value: Option<Value>) {
    if let Some(value) = value {
        payload.insert(key.to_string(), value);
    }
}
