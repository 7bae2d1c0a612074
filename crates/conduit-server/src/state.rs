use conduit::errors::ProviderError;
use conduit::providers::base::Provider;
use conduit::providers::openai::OpenAiProvider;
use conduit::tools::ToolServerDescriptor;
use std::sync::Arc;
use std::time::Duration;

use crate::configuration::Settings;

/// Bounds applied to every chat request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_steps: usize,
    pub request_timeout: Duration,
    pub tool_timeout: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_steps: conduit::agent::DEFAULT_MAX_STEPS,
            request_timeout: Duration::from_secs(30),
            tool_timeout: conduit::agent::DEFAULT_TOOL_TIMEOUT,
        }
    }
}

/// Shared application state, read-only once the server is running
#[derive(Clone)]
pub struct AppState {
    pub provider: Arc<dyn Provider>,
    pub tool_servers: Arc<Vec<ToolServerDescriptor>>,
    pub default_model: Option<String>,
    pub limits: Limits,
}

impl AppState {
    pub fn new(
        provider: Arc<dyn Provider>,
        tool_servers: Vec<ToolServerDescriptor>,
        default_model: Option<String>,
        limits: Limits,
    ) -> Self {
        Self {
            provider,
            tool_servers: Arc::new(tool_servers),
            default_model,
            limits,
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, ProviderError> {
        let provider = OpenAiProvider::new(settings.backend.provider_config())?;
        Ok(Self::new(
            Arc::new(provider),
            settings.tool_server_descriptors(),
            settings.backend.default_model(),
            settings.limits(),
        ))
    }
}
