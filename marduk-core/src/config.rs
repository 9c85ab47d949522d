//! Configuration records for the coordination core.
//!
//! Every recognized option is an explicit field with its default; there are
//! no dynamic option bags. The composition root builds one [`MardukConfig`]
//! and passes borrowed slices of it down to the components that need them.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// OpenAI provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    /// API key. Required; startup fails without it.
    pub api_key: String,
    /// Model identifier sent with every completion request.
    pub model: String,
    /// Optional organization header.
    pub organization: Option<String>,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "gpt-4-1106-preview".to_string(),
            organization: None,
        }
    }
}

/// Listener settings for the worker channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8080,
        }
    }
}

/// Filesystem roots for persisted state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryPathsConfig {
    /// Root for per-subsystem stores and the context cache.
    pub data_dir: String,
    /// Root for best-effort backups.
    pub backup_dir: String,
}

impl Default for MemoryPathsConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data/memory".to_string(),
            backup_dir: "./data/backups".to_string(),
        }
    }
}

/// Logging output settings, consumed by the CLI composition root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: "./logs/marduk.log".to_string(),
        }
    }
}

/// Coordinator behavior knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiSettings {
    pub default_temperature: f64,
    pub default_max_tokens: u32,
    /// Maximum context items passed to the LLM after ranking.
    pub context_limit: usize,
    /// Weighted-LRU capacity for the context cache.
    pub cache_limit: usize,
    /// Sources consulted per fan-out, highest priority first.
    pub max_sources_per_query: usize,
    pub enable_context_persistence: bool,
    /// Auto-save interval for the context cache, in milliseconds.
    pub context_persistence_interval_ms: u64,
    pub enable_context_validation: bool,
    /// Periodic validation interval, in milliseconds.
    pub context_validation_interval_ms: u64,
    pub auto_fix_validation_issues: bool,
    pub strict_validation_mode: bool,
}

impl Default for AiSettings {
    fn default() -> Self {
        Self {
            default_temperature: 0.7,
            default_max_tokens: 1024,
            context_limit: 10,
            cache_limit: 200,
            max_sources_per_query: 5,
            enable_context_persistence: true,
            context_persistence_interval_ms: 300_000,
            enable_context_validation: true,
            context_validation_interval_ms: 900_000,
            auto_fix_validation_issues: true,
            strict_validation_mode: false,
        }
    }
}

/// Top-level configuration for one coordinator process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MardukConfig {
    pub openai: OpenAiConfig,
    pub server: ServerConfig,
    pub memory: MemoryPathsConfig,
    pub logging: LoggingConfig,
    pub ai: AiSettings,
}

impl MardukConfig {
    /// Build a configuration from the environment.
    ///
    /// `OPENAI_API_KEY` is required; everything else falls back to defaults
    /// overridable via `MARDUK_*` variables.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| Error::Configuration("OPENAI_API_KEY is not set".to_string()))?;
        if api_key.trim().is_empty() {
            return Err(Error::Configuration("OPENAI_API_KEY is empty".to_string()));
        }

        let mut config = Self::default();
        config.openai.api_key = api_key;

        if let Ok(model) = std::env::var("OPENAI_MODEL") {
            config.openai.model = model;
        }
        if let Ok(org) = std::env::var("OPENAI_ORGANIZATION") {
            config.openai.organization = Some(org);
        }
        if let Ok(host) = std::env::var("MARDUK_HOST") {
            config.server.host = host;
        }
        if let Ok(port) = std::env::var("MARDUK_PORT") {
            config.server.port = port
                .parse()
                .map_err(|_| Error::Configuration(format!("invalid MARDUK_PORT: {port}")))?;
        }
        if let Ok(dir) = std::env::var("MARDUK_DATA_DIR") {
            config.memory.data_dir = dir;
        }
        if let Ok(dir) = std::env::var("MARDUK_BACKUP_DIR") {
            config.memory.backup_dir = dir;
        }
        if let Ok(level) = std::env::var("MARDUK_LOG_LEVEL") {
            config.logging.level = level;
        }

        Ok(config)
    }

    /// Validate cross-field constraints before handing the config to the
    /// composition root.
    pub fn validate(&self) -> Result<()> {
        if self.openai.api_key.trim().is_empty() {
            return Err(Error::Configuration("openai.apiKey is required".to_string()));
        }
        if self.ai.context_limit == 0 {
            return Err(Error::Configuration("ai.contextLimit must be positive".to_string()));
        }
        if self.ai.cache_limit == 0 {
            return Err(Error::Configuration("ai.cacheLimit must be positive".to_string()));
        }
        if !(0.0..=2.0).contains(&self.ai.default_temperature) {
            return Err(Error::Configuration(format!(
                "ai.defaultTemperature out of range: {}",
                self.ai.default_temperature
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_recognized_options() {
        let config = MardukConfig::default();
        assert_eq!(config.openai.model, "gpt-4-1106-preview");
        assert_eq!(config.server.host, "localhost");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.memory.data_dir, "./data/memory");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.ai.context_limit, 10);
        assert_eq!(config.ai.cache_limit, 200);
        assert_eq!(config.ai.max_sources_per_query, 5);
        assert_eq!(config.ai.context_persistence_interval_ms, 300_000);
        assert_eq!(config.ai.context_validation_interval_ms, 900_000);
        assert!(config.ai.auto_fix_validation_issues);
        assert!(!config.ai.strict_validation_mode);
    }

    #[test]
    fn test_validate_requires_api_key() {
        let config = MardukConfig::default();
        assert!(config.validate().is_err());

        let mut config = MardukConfig::default();
        config.openai.api_key = "sk-test".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut config = MardukConfig::default();
        config.openai.api_key = "sk-test".to_string();
        config.ai.context_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = MardukConfig::default();
        config.openai.api_key = "sk-test".to_string();
        let serialized = toml::to_string(&config).unwrap();
        let parsed: MardukConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.openai.model, config.openai.model);
        assert_eq!(parsed.ai.cache_limit, config.ai.cache_limit);
    }
}
