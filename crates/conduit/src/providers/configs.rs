pub const DEFAULT_BACKEND_URL: &str = "http://localhost:3001";
pub const DEFAULT_API_KEY: &str = "local";
pub const FALLBACK_MODEL: &str = "meta.llama-4-scout-17b-16e-instruct";

#[derive(Debug, Clone)]
pub struct OpenAiProviderConfig {
    pub host: String,
    pub api_key: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<i32>,
}

impl OpenAiProviderConfig {
    /// Blank values fall back to a local development backend
    pub fn new(host: Option<String>, api_key: Option<String>) -> Self {
        Self {
            host: non_empty(host).unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string()),
            api_key: non_empty(api_key).unwrap_or_else(|| DEFAULT_API_KEY.to_string()),
            temperature: None,
            max_tokens: None,
        }
    }
}

impl Default for OpenAiProviderConfig {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// Pick the model for a request: the first non-blank candidate wins, in the order
/// explicit override, top-level request field, process default.
pub fn resolve_model(candidates: &[Option<&str>]) -> String {
    candidates
        .iter()
        .flatten()
        .map(|candidate| candidate.trim())
        .find(|candidate| !candidate.is_empty())
        .unwrap_or(FALLBACK_MODEL)
        .to_string()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
