use crate::models::ToolDefinition;
use crate::providers::ProviderConfig;
use crate::tools::search::SearchConfig;
use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment prefix for overrides, e.g. `CHATMUX__SERVER__PORT=9000`
pub const ENV_PREFIX: &str = "CHATMUX";

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Extra tool definitions offered to models, alongside the builtins
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<SearchConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Access password for `/api/*`; unset means open access
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "crate::providers::serialize_redacted_opt",
        deserialize_with = "crate::providers::deserialize_secret_opt"
    )]
    pub password: Option<SecretString>,
    /// Directory with the UI bundle, served as the fallback route
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_dir: Option<PathBuf>,
    #[serde(default)]
    pub tracing: TracingConfig,
}

impl ServerConfig {
    /// Check a presented password against the configured one
    pub fn password_matches(&self, presented: Option<&str>) -> bool {
        match &self.password {
            None => true,
            Some(expected) => presented == Some(expected.expose_secret().as_str()),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            password: None,
            static_dir: None,
            tracing: TracingConfig::default(),
        }
    }
}

/// Message tracing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_trace_path")]
    pub path: String,
    #[serde(default)]
    pub omit_system_prompt: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_trace_path(),
            omit_system_prompt: false,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    13458
}

fn default_trace_path() -> String {
    "~/.chat-mux/traces.jsonl".to_string()
}

impl AppConfig {
    /// Default config location: `~/.chat-mux/config.toml`
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home.join(".chat-mux").join("config.toml"))
    }

    /// Load configuration from a TOML file layered with `CHATMUX__*` environment overrides.
    ///
    /// A missing file yields the defaults plus whatever the environment sets.
    pub fn from_file(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to load config from {}", path.display()))?;

        let config: AppConfig = settings
            .try_deserialize()
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        tracing::debug!(
            "Loaded config from {} with {} providers",
            path.display(),
            config.providers.len()
        );
        Ok(config)
    }

    /// Render the config as TOML with secrets redacted
    pub fn to_redacted_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}
