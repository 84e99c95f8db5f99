//! Configuration loader and validator for the forms→Sheets bridge.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub google: Google,
    pub uploads: Uploads,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub listen_addr: String,
    pub public_url: String,
    pub nonce_secret: String,
    #[serde(default = "default_nonce_lifetime")]
    pub nonce_lifetime_secs: u64,
    #[serde(default)]
    pub dispatch: DispatchMode,
    pub poll_interval_ms: u64,
    pub max_backoff_seconds: u64,
    #[serde(default = "default_reconcile_wait")]
    pub reconcile_wait_ms: u64,
}

/// How queued feeds reach the follow-up handler.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Fire-and-forget HTTP call to our own `/deferred` endpoint.
    #[default]
    Http,
    /// Durable SQLite outbox drained by a worker.
    Outbox,
}

/// Google OAuth settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Google {
    pub redirect_uri: String,
    pub return_uri: String,
    pub timeout_secs: u64,
    #[serde(default)]
    pub default_app: Option<DefaultApp>,
}

/// Built-in OAuth application used when `default_app_enabled` is set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DefaultApp {
    pub client_id: String,
    pub client_secret: String,
}

/// Local upload storage and remote job polling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Uploads {
    pub base_url: String,
    pub base_dir: String,
    #[serde(default)]
    pub keep_local: bool,
    pub job_poll_interval_ms: u64,
    pub max_job_polls: u32,
}

fn default_nonce_lifetime() -> u64 {
    86_400
}

fn default_reconcile_wait() -> u64 {
    30_000
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.google.timeout_secs.max(1))
    }

    pub fn job_poll_interval(&self) -> Duration {
        Duration::from_millis(self.uploads.job_poll_interval_ms)
    }

    pub fn reconcile_wait(&self) -> Duration {
        Duration::from_millis(self.app.reconcile_wait_ms)
    }

    /// Database URL derived from `data_dir`, unless `DATABASE_URL` overrides it.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/bridge.db", self.app.data_dir))
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.listen_addr.trim().is_empty() {
        return Err(ConfigError::Invalid("app.listen_addr must be non-empty"));
    }
    if cfg.app.public_url.trim().is_empty() {
        return Err(ConfigError::Invalid("app.public_url must be non-empty"));
    }
    if cfg.app.nonce_secret.trim().is_empty() {
        return Err(ConfigError::Invalid("app.nonce_secret must be non-empty"));
    }
    if cfg.app.nonce_lifetime_secs < 2 {
        return Err(ConfigError::Invalid("app.nonce_lifetime_secs must be >= 2"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }

    if cfg.google.redirect_uri.trim().is_empty() {
        return Err(ConfigError::Invalid("google.redirect_uri must be non-empty"));
    }
    if cfg.google.return_uri.trim().is_empty() {
        return Err(ConfigError::Invalid("google.return_uri must be non-empty"));
    }
    if let Some(app) = &cfg.google.default_app {
        if app.client_id.trim().is_empty() || app.client_secret.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "google.default_app needs client_id and client_secret",
            ));
        }
    }

    if cfg.uploads.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("uploads.base_url must be non-empty"));
    }
    if cfg.uploads.base_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("uploads.base_dir must be non-empty"));
    }
    if cfg.uploads.job_poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("uploads.job_poll_interval_ms must be > 0"));
    }
    if cfg.uploads.max_job_polls == 0 {
        return Err(ConfigError::Invalid("uploads.max_job_polls must be > 0"));
    }

    Ok(())
}

/// Returns a complete example YAML document.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  listen_addr: "127.0.0.1:8080"
  public_url: "http://127.0.0.1:8080"
  nonce_secret: "change-me"
  nonce_lifetime_secs: 86400
  dispatch: "http"
  poll_interval_ms: 500
  max_backoff_seconds: 60
  reconcile_wait_ms: 30000

google:
  redirect_uri: "http://127.0.0.1:8080/auth/callback"
  return_uri: "http://127.0.0.1:8080/settings"
  timeout_secs: 30
  default_app:
    client_id: "YOUR_GOOGLE_CLIENT_ID"
    client_secret: "YOUR_GOOGLE_CLIENT_SECRET"

uploads:
  base_url: "https://forms.example.com/uploads/"
  base_dir: "./data/uploads/"
  keep_local: false
  job_poll_interval_ms: 2000
  max_job_polls: 150
"#
}
