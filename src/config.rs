use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
pub const MIN_TIMEOUT_MS: u64 = 100;
pub const MAX_TIMEOUT_MS: u64 = 60_000;

/// Workspace settings key holding the persisted remote configuration.
pub const SETTINGS_KEY: &str = "remote.config";

pub const ENV_BASE_URL: &str = "SCHOOLD_API_BASE_URL";
pub const ENV_TIMEOUT_MS: &str = "SCHOOLD_API_TIMEOUT_MS";
pub const ENV_TOKEN: &str = "SCHOOLD_API_TOKEN";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub base_url: Option<String>,
    pub timeout_ms: u64,
    pub auth_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            auth_token: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Config::default();
        if let Some(v) = lookup(ENV_BASE_URL) {
            cfg.base_url = non_empty(&v);
        }
        if let Some(v) = lookup(ENV_TIMEOUT_MS) {
            match v.trim().parse::<u64>() {
                Ok(ms) => cfg.timeout_ms = ms,
                Err(_) => tracing::warn!(value = %v, "ignoring non-numeric {}", ENV_TIMEOUT_MS),
            }
        }
        if let Some(v) = lookup(ENV_TOKEN) {
            cfg.auth_token = non_empty(&v);
        }
        cfg.normalized()
    }

    /// Applies a camelCase JSON patch (persisted settings or `remote.configure`
    /// params). An explicit `null` or empty string clears an optional field.
    pub fn with_patch(mut self, patch: &serde_json::Value) -> Self {
        let Some(obj) = patch.as_object() else {
            return self;
        };
        if let Some(v) = obj.get("baseUrl") {
            self.base_url = v.as_str().and_then(non_empty);
        }
        if let Some(ms) = obj.get("timeoutMs").and_then(|v| v.as_u64()) {
            self.timeout_ms = ms;
        }
        if let Some(v) = obj.get("authToken") {
            self.auth_token = v.as_str().and_then(non_empty);
        }
        self.normalized()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Settings view without the credential.
    pub fn redacted(&self) -> serde_json::Value {
        serde_json::json!({
            "baseUrl": self.base_url,
            "timeoutMs": self.timeout_ms,
            "hasAuthToken": self.auth_token.is_some(),
        })
    }

    fn normalized(mut self) -> Self {
        self.timeout_ms = self.timeout_ms.clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS);
        self.base_url = self
            .base_url
            .map(|u| u.trim().trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty());
        self
    }
}

fn non_empty(s: &str) -> Option<String> {
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}
