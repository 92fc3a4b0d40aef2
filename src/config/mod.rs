pub mod actions;
pub mod key;
pub mod keybindings;
pub mod loader;
pub mod resolver;

pub use actions::*;
use keybindings::KeybindingsConfig;
pub use loader::{load, save_last_selection};
pub use resolver::KeyResolver;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThemeConfig {
    pub name: String,
}

impl Default for ThemeConfig {
    fn default() -> Self {
        Self {
            name: "Catppuccin Mocha".to_string(),
        }
    }
}

/// Remote API settings. Durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the management API. Demo data is served when unset.
    pub endpoint: Option<String>,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub page_size: usize,
    /// Upper bound on pages pulled by one refresh before it stops and
    /// leaves the rest to "load more".
    pub max_pages_per_fetch: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_ms: 30_000,
            max_retries: 3,
            backoff_base_ms: 250,
            backoff_max_ms: 8_000,
            page_size: 50,
            max_pages_per_fetch: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub stale_after_secs: u64,
    pub max_items_per_kind: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 30,
            max_items_per_kind: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Environment variable holding the bearer token.
    pub token_env: String,
    /// Shell command printing a bearer token, preferred over `token_env`.
    pub token_command: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_env: "ANVIL_ACCESS_TOKEN".to_string(),
            token_command: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub theme: ThemeConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub keybindings: KeybindingsConfig,
    /// Scope path of the last opened project.
    #[serde(default)]
    pub last_selection: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_sections_fall_back_to_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [api]
            endpoint = "https://foundry.example.com/v1"
            max_retries = 5

            [cache]
            stale_after_secs = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.api.endpoint.as_deref(), Some("https://foundry.example.com/v1"));
        assert_eq!(config.api.max_retries, 5);
        assert_eq!(config.api.page_size, 50);
        assert_eq!(config.cache.stale_after_secs, 10);
        assert_eq!(config.cache.max_items_per_kind, 2_000);
        assert_eq!(config.auth.token_env, "ANVIL_ACCESS_TOKEN");
        assert_eq!(config.theme, ThemeConfig::default());
    }

    #[test]
    fn test_empty_file_is_default() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.api, ApiConfig::default());
        assert!(config.last_selection.is_none());
    }
}
