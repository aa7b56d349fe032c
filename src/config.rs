//! Runtime configuration: orchestration tunables (TOML) and Salesforce
//! connection settings (environment).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::salesforce::auth::{Grant, LoginEnvironment, OAuthAuthenticator};
use crate::sync::splitter::BatchSize;

// ─────────────────────────────────────────────────────────────────────────────
// SyncConfig
// ─────────────────────────────────────────────────────────────────────────────

/// Tunables for one `BulkSync` instance. Every field has a default, so an
/// empty TOML document is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Largest number of records sent in one bulk job
    pub max_batch_size: usize,

    /// Jobs submitted at once within one call
    pub max_concurrent_jobs: usize,

    /// Delay between completion checks
    pub poll_interval_secs: u64,

    /// How long a load job may be polled before it is reported as pending
    pub load_poll_max_wait_secs: u64,

    /// Cap for query jobs; `None` polls until a terminal state
    pub query_poll_max_wait_secs: Option<u64>,

    /// Status-check interval during the submission window
    pub submit_poll_interval_ms: u64,

    /// Length of the submission window before a job is handed to the poller
    pub submit_poll_timeout_secs: u64,

    /// Deadline for a whole call; pending jobs are reported when it passes
    pub overall_timeout_secs: Option<u64>,

    /// Where result pages are staged while being read
    pub staging_dir: PathBuf,

    /// `maxRecords` for query result pages
    pub query_page_size: Option<u64>,
}

fn default_staging_dir() -> PathBuf {
    std::env::temp_dir().join("sf-bulk-sync")
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_batch_size: BatchSize::Large.as_usize(),
            max_concurrent_jobs: 10,
            poll_interval_secs: 10,
            load_poll_max_wait_secs: 2_000,
            query_poll_max_wait_secs: None,
            submit_poll_interval_ms: 1_000,
            submit_poll_timeout_secs: 10,
            overall_timeout_secs: None,
            staging_dir: default_staging_dir(),
            query_page_size: None,
        }
    }
}

impl SyncConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, AppError> {
        let config: SyncConfig =
            toml::from_str(content).map_err(|e| AppError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, AppError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Rejects values the orchestrator cannot run with.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.max_batch_size == 0 {
            return Err(AppError::InvalidArgument(
                "max_batch_size must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(AppError::Config(
                "max_concurrent_jobs must be at least 1".to_string(),
            ));
        }
        if self.poll_interval_secs == 0 {
            return Err(AppError::Config(
                "poll_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.staging_dir.as_os_str().is_empty() {
            return Err(AppError::Config("staging_dir must not be empty".to_string()));
        }
        if self.query_page_size == Some(0) {
            return Err(AppError::Config(
                "query_page_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn load_poll_max_wait(&self) -> Duration {
        Duration::from_secs(self.load_poll_max_wait_secs)
    }

    pub fn query_poll_max_wait(&self) -> Option<Duration> {
        self.query_poll_max_wait_secs.map(Duration::from_secs)
    }

    pub fn submit_poll_interval(&self) -> Duration {
        Duration::from_millis(self.submit_poll_interval_ms)
    }

    pub fn submit_poll_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_poll_timeout_secs)
    }

    pub fn overall_timeout(&self) -> Option<Duration> {
        self.overall_timeout_secs.map(Duration::from_secs)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ConnectionConfig
// ─────────────────────────────────────────────────────────────────────────────

/// Salesforce connected-app settings and the grant to authenticate with.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub login: LoginEnvironment,
    pub client_id: String,
    pub client_secret: Option<SecretString>,
    pub grant: Grant,
}

impl ConnectionConfig {
    /// Reads `SF_*` variables, loading `.env` first when present.
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Builds the config from a variable lookup.
    ///
    /// The username-password grant is used when both `SF_USERNAME` and
    /// `SF_PASSWORD` are set, otherwise `SF_REFRESH_TOKEN`.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let login = match var("SF_LOGIN_ENV") {
            Some(value) => LoginEnvironment::parse(&value)?,
            None => LoginEnvironment::Production,
        };

        let client_id =
            var("SF_CLIENT_ID").ok_or_else(|| AppError::Config("SF_CLIENT_ID is not set".into()))?;
        let client_secret = var("SF_CLIENT_SECRET").map(SecretString::from);

        let grant = match (var("SF_USERNAME"), var("SF_PASSWORD"), var("SF_REFRESH_TOKEN")) {
            (Some(username), Some(password), _) => Grant::Password {
                username,
                password: SecretString::from(password),
            },
            (_, _, Some(token)) => Grant::RefreshToken(SecretString::from(token)),
            _ => {
                return Err(AppError::Config(
                    "set SF_USERNAME and SF_PASSWORD, or SF_REFRESH_TOKEN".into(),
                ))
            }
        };

        Ok(Self {
            login,
            client_id,
            client_secret,
            grant,
        })
    }

    pub fn into_authenticator(self, http: Arc<reqwest::Client>) -> OAuthAuthenticator {
        OAuthAuthenticator::new(
            http,
            self.login,
            self.client_id,
            self.client_secret,
            self.grant,
        )
    }
}
