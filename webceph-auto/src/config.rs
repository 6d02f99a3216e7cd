use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::errors::AutomationError;
use crate::sync::RetryPolicy;
use crate::window::{ActivationPolicy, PatternTiers};

pub const APP_DIR_NAME: &str = "WebCephAuto";
pub const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub timeout_secs: u64,
    /// Extra attempts after a transient HTTP failure (429 or 5xx)
    pub retry_count: u32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.webceph.com".to_string(),
            username: String::new(),
            password: String::new(),
            timeout_secs: 30,
            retry_count: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    /// Pause after navigation before looking for elements
    pub wait_time_secs: u64,
    pub poll_interval_secs: u64,
    pub max_analysis_minutes: u64,
    pub strategy_timeout_ms: u64,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            wait_time_secs: 1,
            poll_interval_secs: 15,
            max_analysis_minutes: 10,
            strategy_timeout_ms: 2000,
        }
    }
}

impl AutomationConfig {
    pub fn wait_time(&self) -> Duration {
        Duration::from_secs(self.wait_time_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn max_analysis_wait(&self) -> Duration {
        Duration::from_secs(self.max_analysis_minutes * 60)
    }

    pub fn strategy_timeout(&self) -> Duration {
        Duration::from_millis(self.strategy_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Where the browser saves downloaded reports
    pub report_folder: PathBuf,
    /// Holds the offline queue file
    pub cache_folder: PathBuf,
    pub backup_folder: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let base = app_data_dir();
        Self {
            report_folder: dirs::download_dir()
                .unwrap_or_else(|| base.clone())
                .join(APP_DIR_NAME),
            cache_folder: base.join("cache"),
            backup_folder: base.join("backup"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataStoreConfig {
    pub api_url: String,
    pub api_key: String,
    pub base_id: String,
    pub table_name: String,
    pub operator_name: String,
}

impl Default for DataStoreConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.airtable.com/v0".to_string(),
            api_key: String::new(),
            base_id: String::new(),
            table_name: "Patients".to_string(),
            operator_name: "시스템".to_string(),
        }
    }
}

impl DataStoreConfig {
    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty() && !self.base_id.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceWindowConfig {
    pub patterns: PatternTiers,
    pub activation: ActivationPolicy,
}

/// Application settings. Read-only for the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub remote: RemoteConfig,
    pub automation: AutomationConfig,
    pub paths: PathsConfig,
    pub data_store: DataStoreConfig,
    pub source_window: SourceWindowConfig,
}

/// Sign-in credentials for the remote application.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// `<data_local_dir>/WebCephAuto`, falling back to the working directory.
pub fn app_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
        .join(CONFIG_FILE_NAME)
}

impl AppConfig {
    /// Load from the default location, then apply environment overrides.
    pub fn load() -> Result<Self, AutomationError> {
        Self::load_from(&default_config_path())
    }

    /// Load from `path` (a missing file yields defaults), then apply
    /// environment overrides.
    pub fn load_from(path: &Path) -> Result<Self, AutomationError> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: AppConfig = serde_json::from_str(&content)?;
            info!("Loaded configuration from {}", path.display());
            config
        } else {
            debug!("No configuration at {}, using defaults", path.display());
            AppConfig::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `WEBCEPH_*` / `AIRTABLE_*` overrides from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |target: &mut String, key: &str| {
            if let Some(value) = lookup(key).filter(|v| !v.is_empty()) {
                debug!("Configuration override from {}", key);
                *target = value;
            }
        };
        set(&mut self.remote.base_url, "WEBCEPH_URL");
        set(&mut self.remote.username, "WEBCEPH_USERNAME");
        set(&mut self.remote.password, "WEBCEPH_PASSWORD");
        set(&mut self.data_store.api_key, "AIRTABLE_API_KEY");
        set(&mut self.data_store.base_id, "AIRTABLE_BASE_ID");
        set(&mut self.data_store.table_name, "AIRTABLE_TABLE");
    }

    pub fn credentials(&self) -> Result<Credentials, AutomationError> {
        if self.remote.username.trim().is_empty() || self.remote.password.is_empty() {
            return Err(AutomationError::MissingCredentials(
                "remote username and password must be configured".to_string(),
            ));
        }
        Ok(Credentials {
            username: self.remote.username.trim().to_string(),
            password: self.remote.password.clone(),
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.remote.timeout_secs)
    }

    /// Backoff starts at one second and doubles per retry.
    pub fn http_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.remote.retry_count, Duration::from_secs(1))
    }

    pub fn queue_path(&self) -> PathBuf {
        self.paths.cache_folder.join(crate::queue::QUEUE_FILE_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, r#"{"remote": {"username": "doctor@example.com"}}"#).unwrap();

        let config: AppConfig =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(config.remote.username, "doctor@example.com");
        assert_eq!(config.remote.base_url, "https://www.webceph.com");
        assert_eq!(config.automation.poll_interval_secs, 15);
        assert_eq!(config.data_store.table_name, "Patients");
        assert_eq!(config.http_retry().max_retries, 3);
    }

    #[test]
    fn environment_overrides_win() {
        let env: HashMap<&str, &str> = [
            ("WEBCEPH_USERNAME", "env-user"),
            ("WEBCEPH_PASSWORD", "secret"),
            ("AIRTABLE_TABLE", ""),
        ]
        .into_iter()
        .collect();
        let mut config = AppConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.remote.username, "env-user");
        assert_eq!(config.data_store.table_name, "Patients");
        assert!(config.credentials().is_ok());
    }

    #[test]
    fn missing_password_is_fatal() {
        let mut config = AppConfig::default();
        config.remote.username = "user".into();
        let err = config.credentials().unwrap_err();
        assert!(err.is_fatal());
    }
}
