//! Credential lookup.
//!
//! API keys come from environment variables first, then from the on-disk
//! profile file (`~/.tinker/auth.toml`):
//!
//! ```toml
//! [anthropic]
//! api_key = "sk-ant-..."
//!
//! [google]
//! api_key = "AIza..."
//! ```
//!
//! A missing or malformed file is not an error -- the store simply falls back
//! to the environment.  The store is read-only after construction; a missing
//! key surfaces as [`crate::error::AgentError::MissingApiKey`] at request
//! time, in the gateway.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::llm::gateway::Provider;

#[derive(Debug, Clone, Default, Deserialize)]
struct Credential {
    api_key: Option<String>,
}

/// Environment variables consulted per provider, in precedence order.
fn env_vars(provider: Provider) -> &'static [&'static str] {
    match provider {
        Provider::Anthropic => &["ANTHROPIC_API_KEY"],
        Provider::Google => &["GOOGLE_API_KEY", "GEMINI_API_KEY"],
        Provider::OpenAi => &["OPENAI_API_KEY"],
    }
}

/// Read-only API-key store.
pub struct CredentialStore {
    profiles: HashMap<String, Credential>,
    use_env: bool,
}

impl CredentialStore {
    /// Load from the default profile path, with environment fallback.
    pub fn load() -> Self {
        match default_path() {
            Some(path) => Self::from_path(&path),
            None => Self {
                profiles: HashMap::new(),
                use_env: true,
            },
        }
    }

    /// Load from a specific profile file, with environment fallback.  A
    /// missing or malformed file yields an empty profile set.
    pub fn from_path(path: &Path) -> Self {
        let profiles = std::fs::read_to_string(path)
            .ok()
            .and_then(|content| match toml::from_str(&content) {
                Ok(profiles) => Some(profiles),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "ignoring malformed auth profile file");
                    None
                }
            })
            .unwrap_or_default();

        Self {
            profiles,
            use_env: true,
        }
    }

    /// A store with no credentials at all, not even from the environment.
    /// For hermetic tests and hosts that inject keys explicitly.
    pub fn empty() -> Self {
        Self {
            profiles: HashMap::new(),
            use_env: false,
        }
    }

    /// A store holding exactly the given keys, ignoring the environment.
    pub fn from_keys(keys: impl IntoIterator<Item = (Provider, String)>) -> Self {
        let profiles = keys
            .into_iter()
            .map(|(provider, key)| {
                (
                    provider.as_str().to_owned(),
                    Credential { api_key: Some(key) },
                )
            })
            .collect();
        Self {
            profiles,
            use_env: false,
        }
    }

    /// Look up the API key for a provider.
    pub fn get(&self, provider: Provider) -> Option<String> {
        self.lookup(provider, |var| std::env::var(var).ok())
    }

    /// Whether any provider has a key configured.
    pub fn has_any_key(&self) -> bool {
        [Provider::Anthropic, Provider::Google, Provider::OpenAi]
            .into_iter()
            .any(|p| self.get(p).is_some())
    }

    fn lookup(
        &self,
        provider: Provider,
        env: impl Fn(&str) -> Option<String>,
    ) -> Option<String> {
        if self.use_env {
            for var in env_vars(provider) {
                if let Some(value) = env(var).filter(|v| !v.is_empty()) {
                    return Some(value);
                }
            }
        }
        self.profiles
            .get(provider.as_str())
            .and_then(|c| c.api_key.clone())
            .filter(|v| !v.is_empty())
    }
}

fn default_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".tinker").join("auth.toml"))
}
