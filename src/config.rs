use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const DEFAULT_CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub browser: BrowserConfig,
    pub instagram: InstagramConfig,
    pub retry: RetryConfig,
    pub pagination: PaginationConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Largest `max_reels` a request may ask for.
    pub max_reels_limit: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".to_string(),
            max_reels_limit: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub headless: bool,
    pub window: (u32, u32),
    pub action_delay_ms: u64,
    pub navigation_timeout_secs: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            window: (1920, 1080),
            action_delay_ms: 2000,
            navigation_timeout_secs: 30,
        }
    }
}

impl BrowserConfig {
    pub fn action_delay(&self) -> Duration {
        Duration::from_millis(self.action_delay_ms)
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_secs(self.navigation_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstagramConfig {
    pub base_url: String,
    pub login_url: String,
    pub graphql_url: String,
    pub profile_info_url: String,
    /// Persisted query id of the profile reels tab connection, used when
    /// none is captured from the web app during login.
    pub reels_doc_id: String,
    /// Friendly name the web app gives the reels tab query.
    pub reels_query_name: String,
    /// How long to watch the reels tab for that query after login.
    pub capture_timeout_secs: u64,
    pub app_id: String,
    pub page_size: u32,
    pub user_agent: String,
    pub request_timeout_secs: u64,
    /// Fragments of the messages shown under a rejected login form.
    pub login_error_texts: Vec<String>,
}

impl Default for InstagramConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.instagram.com/".to_string(),
            login_url: "https://www.instagram.com/accounts/login/".to_string(),
            graphql_url: "https://www.instagram.com/graphql/query".to_string(),
            profile_info_url: "https://www.instagram.com/api/v1/users/web_profile_info/"
                .to_string(),
            reels_doc_id: "8515196628595751".to_string(),
            reels_query_name: "PolarisProfileReelsTabContentQuery".to_string(),
            capture_timeout_secs: 10,
            app_id: "936619743392459".to_string(),
            page_size: 12,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36"
                .to_string(),
            request_timeout_secs: 30,
            login_error_texts: vec![
                "Sorry, your password was incorrect".to_string(),
                "The username you entered doesn't belong to an account".to_string(),
                "There was a problem logging you into Instagram".to_string(),
            ],
        }
    }
}

impl InstagramConfig {
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per page while the platform answers "rate limited".
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: u32,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 5000,
            backoff_factor: 2,
            max_delay_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaginationConfig {
    pub page_delay_min_ms: u64,
    pub page_delay_max_ms: u64,
    pub max_pages: usize,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            page_delay_min_ms: 500,
            page_delay_max_ms: 2000,
            max_pages: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Resolves the config file (`explicit`, then `REELS_CONFIG`, then
    /// `./config.toml` when present), then applies environment overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("REELS_CONFIG").map(PathBuf::from));

        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&contents)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind) = var("REELS_BIND") {
            self.server.bind = bind;
        }
        if let Some(dir) = var("REELS_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Some(headless) = var("REELS_HEADLESS").and_then(|v| v.parse().ok()) {
            debug!(headless, "Override browser.headless from env");
            self.browser.headless = headless;
        }
        if let Some(level) = var("REELS_LOG_LEVEL") {
            self.logging.level = level;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_yields_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.server.bind, "127.0.0.1:8000");
        assert!(config.browser.headless);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [retry]
            max_attempts = 5

            [browser]
            headless = false
            "#,
        )
        .unwrap();

        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.backoff_factor, 2);
        assert!(!config.browser.headless);
        assert_eq!(config.instagram.page_size, 12);
    }

    #[test]
    fn environment_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            ("REELS_BIND", "0.0.0.0:9000"),
            ("REELS_HEADLESS", "false"),
            ("REELS_DATA_DIR", "/var/lib/reels"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert!(!config.browser.headless);
        assert_eq!(config.storage.data_dir, PathBuf::from("/var/lib/reels"));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(AppConfig::from_toml("[retry]\nmax_attempts = \"three\"").is_err());
    }
}
