use crate::error::{to_env_var, ConfigError};
use crate::state::Limits;
use conduit::providers::configs::{OpenAiProviderConfig, DEFAULT_API_KEY, DEFAULT_BACKEND_URL};
use conduit::tools::ToolServerDescriptor;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

/// Path of an explicit configuration file, overriding `conduit.toml` in the working directory
pub const CONFIG_PATH_VAR: &str = "CONDUIT_CONFIG";

#[derive(Debug, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl ServerSettings {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::InvalidValue {
                env_var: to_env_var("server.host"),
                message: e.to_string(),
            })
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BackendSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key")]
    pub api_key: String,
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<i32>,
}

impl BackendSettings {
    // Convert to the conduit provider config
    pub fn provider_config(&self) -> OpenAiProviderConfig {
        let mut config =
            OpenAiProviderConfig::new(Some(self.base_url.clone()), Some(self.api_key.clone()));
        config.temperature = self.temperature;
        config.max_tokens = self.max_tokens;
        config
    }

    pub fn default_model(&self) -> Option<String> {
        self.default_model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
    }
}

/// A configured tool server: a bare URL, or a table with an optional token
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ToolServerEntry {
    Url(String),
    Server(ToolServerDescriptor),
}

#[derive(Debug, Deserialize)]
pub struct LimitSettings {
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    pub backend: BackendSettings,
    #[serde(default)]
    pub tool_servers: Vec<ToolServerEntry>,
    /// Tokens for bare-URL tool servers, by position
    #[serde(default)]
    pub tool_server_tokens: Vec<String>,
    pub limits: LimitSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::load_and_validate()
    }

    fn load_and_validate() -> Result<Self, ConfigError> {
        // An explicit path must exist, the default file is optional
        let file = match std::env::var(CONFIG_PATH_VAR) {
            Ok(path) if !path.trim().is_empty() => File::with_name(&path).required(true),
            _ => File::with_name("conduit").required(false),
        };

        // Start with default configuration
        let config = Config::builder()
            // Server defaults
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port())?
            // Backend defaults
            .set_default("backend.base_url", default_base_url())?
            .set_default("backend.api_key", default_api_key())?
            // Limit defaults
            .set_default("limits.max_steps", default_max_steps() as u64)?
            .set_default("limits.request_timeout_secs", default_request_timeout_secs())?
            .set_default("limits.tool_timeout_secs", default_tool_timeout_secs())?
            .add_source(file)
            // Layer on the environment variables
            .add_source(
                Environment::with_prefix("CONDUIT")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("tool_servers")
                    .with_list_parse_key("tool_server_tokens"),
            )
            .build()?;

        let settings: Self = config.try_deserialize().map_err(|err| {
            tracing::debug!("Configuration error: {:?}", &err);
            ConfigError::Other(err)
        })?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("limits.request_timeout_secs", self.limits.request_timeout_secs),
            ("limits.tool_timeout_secs", self.limits.tool_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    env_var: to_env_var(field),
                    message: "must be at least 1 second".to_string(),
                });
            }
        }
        self.server.socket_addr()?;
        Ok(())
    }

    /// Tool servers in configuration order, blank entries dropped
    pub fn tool_server_descriptors(&self) -> Vec<ToolServerDescriptor> {
        let mut tokens = self.tool_server_tokens.iter();

        self.tool_servers
            .iter()
            .filter_map(|entry| {
                let descriptor = match entry {
                    ToolServerEntry::Url(url) => {
                        let descriptor = ToolServerDescriptor::new(url.trim());
                        match tokens.next() {
                            Some(token) => descriptor.with_token(token.trim()),
                            None => descriptor,
                        }
                    }
                    ToolServerEntry::Server(server) => {
                        let descriptor = ToolServerDescriptor::new(server.url.trim());
                        match &server.token {
                            Some(token) => descriptor.with_token(token.trim()),
                            None => descriptor,
                        }
                    }
                };
                (!descriptor.url.is_empty()).then_some(descriptor)
            })
            .collect()
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_steps: self.limits.max_steps,
            request_timeout: Duration::from_secs(self.limits.request_timeout_secs),
            tool_timeout: Duration::from_secs(self.limits.tool_timeout_secs),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_base_url() -> String {
    DEFAULT_BACKEND_URL.to_string()
}

fn default_api_key() -> String {
    DEFAULT_API_KEY.to_string()
}

fn default_max_steps() -> usize {
    5
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_tool_timeout_secs() -> u64 {
    15
}
