//! Typed settings.
//!
//! Loaded from `~/.tinker/config.toml` with environment overrides
//! (`TINKER_PROVIDER`, `TINKER_MODEL`).  A missing file yields the defaults;
//! a malformed file is a hard [`AgentError::Config`] so a typo does not
//! silently fall back to a different model.

pub mod auth;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::compaction::CompactionConfig;
use crate::error::{AgentError, Result};
use crate::llm::gateway::Provider;
use crate::retry::RetryPolicy;

/// Session settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// The default provider for new sessions.
    pub provider: Provider,
    /// Model override; the provider's default model when absent.
    pub model: Option<String>,
    pub compaction: CompactionSettings,
    pub retry: RetrySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider: Provider::Anthropic,
            model: None,
            compaction: CompactionSettings::default(),
            retry: RetrySettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompactionSettings {
    pub token_threshold: u64,
    pub recent_turns: usize,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        let defaults = CompactionConfig::default();
        Self {
            token_threshold: defaults.token_threshold,
            recent_turns: defaults.recent_turns,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let defaults = RetryPolicy::default();
        Self {
            max_retries: defaults.max_retries,
            base_delay_ms: defaults.base_delay.as_millis() as u64,
        }
    }
}

impl Settings {
    /// Load from the default path and apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut settings = match default_path() {
            Some(path) if path.exists() => Self::from_path(&path)?,
            _ => Self::default(),
        };
        settings.apply_env(|var| std::env::var(var).ok())?;
        Ok(settings)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| AgentError::Config {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
        toml::from_str(&content).map_err(|e| AgentError::Config {
            reason: format!("failed to parse {}: {e}", path.display()),
        })
    }

    /// The effective model for the selected provider.
    pub fn model(&self) -> String {
        self.model
            .clone()
            .unwrap_or_else(|| self.provider.default_model().to_owned())
    }

    pub fn compaction(&self) -> CompactionConfig {
        CompactionConfig {
            token_threshold: self.compaction.token_threshold,
            recent_turns: self.compaction.recent_turns,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
        }
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(provider) = env("TINKER_PROVIDER").filter(|p| !p.is_empty()) {
            self.provider = provider.parse()?;
        }
        if let Some(model) = env("TINKER_MODEL").filter(|m| !m.is_empty()) {
            self.model = Some(model);
        }
        Ok(())
    }
}

fn default_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".tinker").join("config.toml"))
}
