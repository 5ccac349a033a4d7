//! Multi-tier TOML configuration for Conduit.
//!
//! Reads configuration from multiple sources with precedence:
//! CLI flags > env vars > `~/.conduit/config.toml` > defaults

use conduit_mcp::McpConfig;
use conduit_types::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 4096;
pub const DEFAULT_TOP_P: f32 = 1.0;

/// Which LLM wire format the backend speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    OpenAi,
    Google,
}

impl Provider {
    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com/v1",
            Self::Google => "https://generativelanguage.googleapis.com/v1beta",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Self::OpenAi => "gpt-4o-mini",
            Self::Google => "gemini-2.0-flash",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Google => "google",
        }
    }
}

/// Resolved configuration for a Conduit run.
#[derive(Debug, Clone)]
pub struct ConduitConfig {
    pub provider: Provider,
    /// Absent until an LLM is actually needed; see [`ConduitConfig::require_api_key`].
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub system_prompt: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub mcp: McpConfig,
    pub config_dir: PathBuf,
}

/// Settings that can be read from a TOML config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub llm: LlmSettings,
    #[serde(default)]
    pub mcp: McpConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmSettings {
    pub provider: Option<Provider>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
}

/// CLI overrides that take highest precedence.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    /// Read this file instead of `<config_dir>/config.toml`.
    pub config_file: Option<PathBuf>,
    pub model: Option<String>,
    pub base_url: Option<String>,
}

impl ConduitConfig {
    /// Load configuration from all sources, applying precedence rules.
    ///
    /// A malformed or unreadable config file is logged and ignored.
    pub fn load(overrides: CliOverrides) -> Result<Self, ConfigError> {
        let env = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
        let config_dir = config_dir();
        let path = overrides
            .config_file
            .clone()
            .unwrap_or_else(|| config_dir.join("config.toml"));
        let settings = load_settings_file(&path);
        Self::resolve(settings, &env, overrides, config_dir)
    }

    /// Merge file settings with environment (looked up through `env`) and CLI
    /// overrides.
    pub fn resolve(
        settings: SettingsFile,
        env: &dyn Fn(&str) -> Option<String>,
        overrides: CliOverrides,
        config_dir: PathBuf,
    ) -> Result<Self, ConfigError> {
        let llm = settings.llm;
        let provider = llm.provider.unwrap_or_default();

        let api_key = env("CONDUIT_API_KEY").or(llm.api_key);
        let model = overrides
            .model
            .or_else(|| env("CONDUIT_MODEL"))
            .or(llm.model)
            .unwrap_or_else(|| provider.default_model().to_string());
        let base_url = overrides
            .base_url
            .or_else(|| env("CONDUIT_BASE_URL"))
            .or(llm.base_url)
            .unwrap_or_else(|| provider.default_base_url().to_string());

        let temperature = llm.temperature.unwrap_or(DEFAULT_TEMPERATURE);
        if !(0.0..=2.0).contains(&temperature) {
            return Err(ConfigError::InvalidValue {
                key: "llm.temperature".into(),
                message: format!("{temperature} is outside 0.0..=2.0"),
            });
        }
        let top_p = llm.top_p.unwrap_or(DEFAULT_TOP_P);
        if !(0.0..=1.0).contains(&top_p) {
            return Err(ConfigError::InvalidValue {
                key: "llm.top_p".into(),
                message: format!("{top_p} is outside 0.0..=1.0"),
            });
        }

        Ok(ConduitConfig {
            provider,
            api_key,
            base_url,
            model,
            system_prompt: llm.system_prompt,
            temperature,
            max_tokens: llm.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            top_p,
            mcp: settings.mcp,
            config_dir,
        })
    }

    /// The API key, or an error naming where to set it.
    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ConfigError::MissingKey {
                key: "api_key (set CONDUIT_API_KEY or [llm].api_key in ~/.conduit/config.toml)"
                    .into(),
            })
    }
}

/// Get the Conduit config directory path (~/.conduit/).
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CONDUIT_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".conduit")
}

/// Load and parse a TOML settings file, returning defaults on any error.
pub fn load_settings_file(path: &Path) -> SettingsFile {
    match std::fs::read_to_string(path) {
        Ok(content) => toml::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!("Failed to parse {}: {}", path.display(), e);
            SettingsFile::default()
        }),
        Err(e) => {
            tracing::debug!("No config at {}: {e}", path.display());
            SettingsFile::default()
        }
    }
}
