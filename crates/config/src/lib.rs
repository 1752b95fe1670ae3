use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use core_types::{DEFAULT_MAX_TOKENS, EvalOptions};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const CURRENT_SCHEMA_VERSION: u32 = 2;
pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";

pub const ENV_ENDPOINT: &str = "RELAY_ENDPOINT";
pub const ENV_MODEL: &str = "RELAY_MODEL";
pub const ENV_MAX_TOKENS: &str = "RELAY_MAX_TOKENS";
pub const ENV_API_KEY: &str = "RELAY_API_KEY";
pub const ENV_OPENAI_API_KEY: &str = "OPENAI_API_KEY";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayConfig {
    pub schema_version: u32,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub extra_headers: Vec<(String, String)>,
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            endpoint: default_endpoint(),
            api_key: None,
            model: None,
            max_tokens: Some(DEFAULT_MAX_TOKENS),
            extra_headers: Vec::new(),
        }
    }
}

impl RelayConfig {
    /// Overlays environment variables on top of the file values.
    ///
    /// `OPENAI_API_KEY` is only consulted when no key is configured anywhere else.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        if let Some(endpoint) = lookup(ENV_ENDPOINT) {
            self.endpoint = endpoint;
        }
        if let Some(model) = lookup(ENV_MODEL) {
            self.model = Some(model);
        }
        if let Some(raw) = lookup(ENV_MAX_TOKENS) {
            match raw.trim().parse::<u32>() {
                Ok(max_tokens) => self.max_tokens = Some(max_tokens),
                Err(err) => warn!(value = %raw, %err, "ignoring invalid {ENV_MAX_TOKENS}"),
            }
        }
        if let Some(api_key) = lookup(ENV_API_KEY) {
            self.api_key = Some(api_key);
        } else if self.api_key.is_none() {
            self.api_key = lookup(ENV_OPENAI_API_KEY);
        }
    }

    pub fn apply_process_env(&mut self) {
        self.apply_env_overrides(|name| std::env::var(name).ok());
    }

    /// Options seeded from the configured token limit; the callback is left to the caller.
    pub fn eval_options(&self) -> EvalOptions {
        match self.max_tokens {
            Some(max_tokens) => EvalOptions::new().with_max_tokens(max_tokens),
            None => EvalOptions::new(),
        }
    }
}

pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            path: dir.into().join("config.json"),
        }
    }

    pub fn from_default_location() -> Result<Self> {
        let mut dir = dirs::config_dir().context("failed to resolve config_dir")?;
        dir.push("relay");
        Ok(Self::from_dir(dir))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load_or_init(&self) -> Result<RelayConfig> {
        if !self.path.exists() {
            let config = RelayConfig::default();
            self.save(&config)?;
            return Ok(config);
        }

        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let mut config: RelayConfig =
            serde_json::from_str(&raw).context("failed to parse relay config json")?;
        if self.migrate(&mut config) {
            self.save(&config)?;
        }
        Ok(config)
    }

    pub fn save(&self, config: &RelayConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let text = serde_json::to_string_pretty(config).context("failed to serialize config")?;
        fs::write(&self.path, text)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }

    fn migrate(&self, config: &mut RelayConfig) -> bool {
        if config.schema_version >= CURRENT_SCHEMA_VERSION {
            return false;
        }

        warn!(
            from = config.schema_version,
            to = CURRENT_SCHEMA_VERSION,
            "migrating relay config schema"
        );

        // v1 files stored no token limit and relied on the built-in default.
        if config.schema_version < 2 && config.max_tokens.is_none() {
            config.max_tokens = Some(DEFAULT_MAX_TOKENS);
        }
        if config.endpoint.trim().is_empty() {
            config.endpoint = default_endpoint();
        }
        config.schema_version = CURRENT_SCHEMA_VERSION;
        true
    }
}
