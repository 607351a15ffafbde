//! Configuration management with layered file and environment variable sources.

use anyhow::{anyhow, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub enable_cors: bool,
    pub cors_origins: Vec<String>,
    pub max_request_size_kb: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            enable_cors: true,
            cors_origins: vec!["*".to_string()],
            max_request_size_kb: 64,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// Scheduling budgets for orchestration runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Upper bound on agents running at once within one run; `None` means unbounded.
    pub max_concurrent_agents: Option<usize>,
    pub agent_timeout_seconds: u64,
    /// Overall wall-clock budget for a run; `None` disables it.
    pub run_timeout_seconds: Option<u64>,
    pub retention_seconds: u64,
    pub sweep_interval_seconds: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_agents: None,
            agent_timeout_seconds: 60,
            run_timeout_seconds: Some(300),
            retention_seconds: 900,
            sweep_interval_seconds: 60,
        }
    }
}

impl OrchestratorConfig {
    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_seconds)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_seconds.map(Duration::from_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_seconds)
    }
}

/// Upstream device-safety data source (openFDA compatible)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSourceConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub request_timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub record_limit: usize,
}

impl Default for DataSourceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.fda.gov".to_string(),
            api_key: None,
            request_timeout_seconds: 20,
            max_retries: 2,
            retry_backoff_ms: 500,
            record_limit: 100,
        }
    }
}

/// Narrative generation endpoint (OpenAI-compatible chat completions)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub api_base: String,
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub request_timeout_seconds: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            max_tokens: 800,
            temperature: 0.2,
            request_timeout_seconds: 60,
        }
    }
}

/// Main settings structure with all configuration sections
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub orchestrator: OrchestratorConfig,
    pub data_source: DataSourceConfig,
    pub generation: GenerationConfig,
}

impl Settings {
    /// Load the embedded defaults, then `path` (or a local `config.toml`
    /// when `None`), then `COPILOT__` environment overrides
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            // Start with default settings
            .add_source(File::from_str(include_str!("../config.toml"), FileFormat::Toml));

        builder = match path {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::with_name("config").required(false)),
        };

        let config = builder
            // Environment variables such as COPILOT__SERVER__PORT=9000
            .add_source(
                Environment::with_prefix("COPILOT")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("server.cors_origins")
                    .try_parsing(true),
            )
            .build()?;

        let mut settings: Settings = config.try_deserialize()?;

        Self::apply_env_overrides(&mut settings);

        settings.validate()?;

        Ok(settings)
    }

    /// Apply well-known credential variables that do not follow the prefixed layout
    fn apply_env_overrides(settings: &mut Settings) {
        if let Ok(api_key) = std::env::var("OPENFDA_API_KEY") {
            settings.data_source.api_key = Some(api_key);
        }
        if let Ok(api_key) = std::env::var("COPILOT_LLM_API_KEY") {
            settings.generation.api_key = Some(api_key);
        }
    }

    /// Validate settings for consistency
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }
        if self.server.max_request_size_kb == 0 {
            return Err(anyhow!("Request size limit cannot be 0"));
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(anyhow!(
                "Unknown log format '{}', expected 'text' or 'json'",
                self.logging.format
            ));
        }

        if self.orchestrator.max_concurrent_agents == Some(0) {
            return Err(anyhow!("max_concurrent_agents must be at least 1 when set"));
        }
        if self.orchestrator.agent_timeout_seconds == 0 {
            return Err(anyhow!("agent_timeout_seconds cannot be 0"));
        }
        if self.orchestrator.run_timeout_seconds == Some(0) {
            return Err(anyhow!("run_timeout_seconds cannot be 0 when set"));
        }

        if self.data_source.base_url.is_empty() {
            return Err(anyhow!("Data source base_url cannot be empty"));
        }
        if self.data_source.record_limit == 0 {
            return Err(anyhow!("Data source record_limit cannot be 0"));
        }

        if self.generation.api_key.is_none() {
            warn!("No generation API key configured; narrative stages will fail");
        }

        Ok(())
    }
}
