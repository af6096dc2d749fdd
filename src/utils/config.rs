use crate::error::{BackupError, Result};
use crate::utils::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Name of the optional config file looked up in the working directory
const CONFIG_FILE: &str = "cloud-backup";

/// Prefix for environment overrides, e.g. `CLOUD_BACKUP_UPLOAD_TIMEOUT=1h`
const ENV_PREFIX: &str = "CLOUD_BACKUP";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Persisted task list, relative to the working directory unless absolute
    pub task_file: PathBuf,

    /// Directory holding the encrypted credential store
    pub credentials_dir: PathBuf,

    /// Directory holding per-task sync fingerprints
    pub state_dir: PathBuf,

    /// Scratch space for encrypted / compressed side-car artifacts
    pub staging_dir: PathBuf,

    /// Hard ceiling for a one-shot scheduled run
    #[serde(with = "humantime_duration")]
    pub one_shot_timeout: Duration,

    /// Ceiling for a single provider upload
    #[serde(with = "humantime_duration")]
    pub upload_timeout: Duration,

    pub retry: RetryPolicy,

    /// Default filter when RUST_LOG is unset
    pub log_level: String,

    /// Emit JSON log lines instead of plain text
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        let app_dir = |base: Option<PathBuf>| {
            base.unwrap_or_else(std::env::temp_dir).join("cloud-backup")
        };

        Self {
            task_file: PathBuf::from("backup_tasks.json"),
            credentials_dir: app_dir(dirs::config_dir()),
            state_dir: app_dir(dirs::data_local_dir()).join("sync"),
            staging_dir: std::env::temp_dir().join("cloud-backup").join("staging"),
            one_shot_timeout: Duration::from_secs(30 * 60),
            upload_timeout: Duration::from_secs(2 * 60 * 60),
            retry: RetryPolicy::default(),
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl Config {
    /// Load config: defaults, then `cloud-backup.{toml,json,yaml}`, then `.env`
    /// and `CLOUD_BACKUP_*` environment variables.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = config::Config::try_from(&Config::default())
            .map_err(|e| BackupError::Config(e.to_string()))?;

        let settings = config::Config::builder()
            .add_source(defaults)
            .add_source(config::File::with_name(CONFIG_FILE).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| BackupError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| BackupError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(BackupError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.backoff_factor < 1.0 {
            return Err(BackupError::Config("retry.backoff_factor must be >= 1.0".into()));
        }
        if !(0.0..1.0).contains(&self.retry.jitter) {
            return Err(BackupError::Config("retry.jitter must be in [0, 1)".into()));
        }
        if self.one_shot_timeout.is_zero() || self.upload_timeout.is_zero() {
            return Err(BackupError::Config("timeouts must be non-zero".into()));
        }
        Ok(())
    }
}

pub fn load_config() -> Result<Config> {
    Config::load()
}

/// Serde adapter writing durations as humantime strings ("90s", "30m").
pub mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}
