use futures::FutureExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use super::ToolExecutor;

/// Longest error message recorded for a failed invocation
pub const MAX_ERROR_CHARS: usize = 100;

/// Shorten an error message for the invocation log
pub fn truncate_error(message: &str) -> String {
    let message = message.trim();
    if message.is_empty() {
        return "Unknown error".to_string();
    }
    message.chars().take(MAX_ERROR_CHARS).collect()
}

/// Wrap an executor so every invocation logs its start, its outcome and how long it took.
/// The result is passed through untouched.
pub fn observed<S: Into<String>>(name: S, executor: ToolExecutor) -> ToolExecutor {
    let name: Arc<str> = Arc::from(name.into());

    Arc::new(move |arguments: Value| {
        let name = name.clone();
        let executor = executor.clone();

        async move {
            let started = Instant::now();
            info!(tool = %name, "tool invocation start");

            let result = executor(arguments).await;
            let duration_ms = started.elapsed().as_millis() as u64;
            match &result {
                Ok(_) => info!(tool = %name, duration_ms, "tool invocation success"),
                Err(e) => info!(
                    tool = %name,
                    duration_ms,
                    error = %truncate_error(&e.to_string()),
                    "tool invocation error"
                ),
            }
            result
        }
        .boxed()
    })
}
