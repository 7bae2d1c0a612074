use crate::state::AppState;
use axum::{extract::State, routing::post, Json, Router};
use bytes::Bytes;
use conduit::{
    errors::ProviderError,
    models::message::Message,
    providers::{base::ModelRequest, configs::resolve_model},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const FOLLOW_UP_SYSTEM: &str = "You suggest follow-up questions. Given an assistant's message, \
output 3 to 5 short follow-up questions a user might ask next.
Return only a JSON array of strings. No markdown, no explanation. \
Example: [\"First question?\",\"Second question?\"]";

/// Only the tail of long answers is sent to the model
const MAX_PROMPT_CHARS: usize = 4000;
const MAX_SUGGESTIONS: usize = 6;
const MAX_TOKENS: i32 = 300;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SuggestionsRequest {
    #[serde(default)]
    last_message: Option<String>,
    #[serde(default)]
    model: Option<Value>,
}

#[derive(Debug, Default, Serialize)]
struct SuggestionsResponse {
    suggestions: Vec<String>,
}

async fn handler(State(state): State<AppState>, body: Bytes) -> Json<SuggestionsResponse> {
    let request: SuggestionsRequest = serde_json::from_slice(&body).unwrap_or_default();
    let last_message = request.last_message.as_deref().unwrap_or_default().trim();
    if last_message.is_empty() {
        return Json(SuggestionsResponse::default());
    }

    let requested = request.model.as_ref().and_then(Value::as_str);
    let model = resolve_model(&[requested, state.default_model.as_deref()]);
    match generate(&state, &model, last_message).await {
        Ok(suggestions) => Json(SuggestionsResponse { suggestions }),
        Err(e) => {
            tracing::warn!(model = %model, error = %e, "suggestion generation failed");
            Json(SuggestionsResponse::default())
        }
    }
}

async fn generate(
    state: &AppState,
    model: &str,
    last_message: &str,
) -> Result<Vec<String>, ProviderError> {
    let request = ModelRequest::new(
        model,
        vec![
            Message::system().with_text(FOLLOW_UP_SYSTEM),
            Message::user().with_text(tail(last_message, MAX_PROMPT_CHARS)),
        ],
        vec![],
    )
    .with_max_tokens(MAX_TOKENS);

    let (message, _) = state.provider.complete(&request).await?;
    Ok(parse_suggestions(&message.text()))
}

/// The last `max` characters of `text`
fn tail(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    match text.char_indices().nth(count - max) {
        Some((start, _)) => &text[start..],
        None => text,
    }
}

/// Pull a list of questions out of the model's answer, tolerating a markdown code fence
fn parse_suggestions(text: &str) -> Vec<String> {
    let mut raw = text.trim();
    if let Some(rest) = raw.strip_prefix("```") {
        raw = rest.strip_prefix("json").unwrap_or(rest);
    }
    raw = raw.trim();
    if let Some(rest) = raw.strip_suffix("```") {
        raw = rest.trim();
    }

    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .take(MAX_SUGGESTIONS)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

// Configure routes for this module
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/suggestions", post(handler))
        .with_state(state)
}
