use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::alert::{AlarmRule, DEFAULT_PATTERNS};
use crate::error::ConfigError;
use crate::queue::QueueConfig;
use crate::schedule::{CronSchedule, DEFAULT_CRON, INGEST_TRIGGER};
use crate::worker::WorkerConfig;

pub const CONFIG_PATHS: [&str; 2] = ["sluice.toml", "/etc/sluice/sluice.toml"];

pub const SCRAPER_QUEUE: &str = "scraper-queue";
pub const NLP_QUEUE: &str = "nlp-queue";

/// Top-level pipeline configuration, deserializable from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub storage: StorageConfig,
    pub scraper_queue: QueueSection,
    pub nlp_queue: QueueSection,
    pub schedule: ScheduleConfig,
    pub workers: WorkersConfig,
    pub alerting: AlertingConfig,
}

#[derive(Debug, Clone, Deserialize)]
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

/// Per-queue overrides. Unset fields fall back to the stage's defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub name: Option<String>,
    pub visibility_timeout_ms: Option<u64>,
    pub max_receive_count: Option<u32>,
    pub dead_letter_queue: Option<String>,
    pub dead_letter_retention_ms: Option<u64>,
    pub max_payload_bytes: Option<usize>,
}

/// Both stages lease for 15 minutes by default.
pub const DEFAULT_STAGE_VISIBILITY_TIMEOUT_MS: u64 = 900_000;

impl QueueSection {
    fn resolve(&self, default_name: &str, default_max_receive_count: u32) -> QueueConfig {
        let name = self.name.as_deref().unwrap_or(default_name);
        let mut config = QueueConfig::new(name);
        config.visibility_timeout_ms = self
            .visibility_timeout_ms
            .unwrap_or(DEFAULT_STAGE_VISIBILITY_TIMEOUT_MS);
        config.max_receive_count = self.max_receive_count.unwrap_or(default_max_receive_count);
        if let Some(dlq) = &self.dead_letter_queue {
            config.dead_letter_queue = Some(dlq.clone());
        }
        if let Some(retention) = self.dead_letter_retention_ms {
            config.dead_letter_retention_ms = retention;
        }
        if let Some(limit) = self.max_payload_bytes {
            config.max_payload_bytes = limit;
        }
        config
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub name: String,
    pub cron: String,
    pub payload: String,
    pub skip_if_older_than_ms: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: "daily-ingest".to_string(),
            cron: DEFAULT_CRON.to_string(),
            payload: INGEST_TRIGGER.to_string(),
            skip_if_older_than_ms: 60 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub scraper_concurrency: usize,
    pub nlp_concurrency: usize,
    pub wait_timeout_ms: u64,
    pub processing_timeout_ms: u64,
    pub restart_delay_ms: u64,
    /// Delay before checking on a submitted analysis batch.
    pub follow_up_delay_ms: u64,
    pub scraper_command: Vec<String>,
    pub nlp_command: Vec<String>,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            scraper_concurrency: 1,
            nlp_concurrency: 1,
            wait_timeout_ms: 20_000,
            processing_timeout_ms: 840_000,
            restart_delay_ms: 5_000,
            follow_up_delay_ms: 120_000,
            scraper_command: vec!["scraper-stage".to_string()],
            nlp_command: vec!["nlp-stage".to_string()],
        }
    }
}

impl WorkersConfig {
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            wait_timeout: Duration::from_millis(self.wait_timeout_ms),
            processing_timeout: Duration::from_millis(self.processing_timeout_ms),
            restart_delay: Duration::from_millis(self.restart_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertingConfig {
    pub error_threshold: f64,
    pub evaluation_window_ms: u64,
    pub tick_interval_ms: u64,
    pub signal_capacity: usize,
    pub patterns: Vec<String>,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            error_threshold: 1.0,
            evaluation_window_ms: 300_000,
            tick_interval_ms: 10_000,
            signal_capacity: 1024,
            patterns: DEFAULT_PATTERNS.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl AlertingConfig {
    pub fn rules(&self) -> Vec<AlarmRule> {
        AlarmRule::defaults(
            self.error_threshold,
            Duration::from_millis(self.evaluation_window_ms),
            &self.patterns,
        )
    }
}

impl PipelineConfig {
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Load from `SLUICE_CONFIG`, else the first existing file in
    /// [`CONFIG_PATHS`], else defaults. `SLUICE_DATA_DIR` overrides the data
    /// directory. The result is validated.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    pub fn load_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match lookup("SLUICE_CONFIG") {
            Some(path) => Self::read(Path::new(&path))?,
            None => match CONFIG_PATHS.iter().map(Path::new).find(|p| p.exists()) {
                Some(path) => Self::read(path)?,
                None => {
                    info!("no config file found, using defaults");
                    Self::default()
                }
            },
        };
        if let Some(dir) = lookup("SLUICE_DATA_DIR") {
            config.storage.data_dir = PathBuf::from(dir);
        }
        config.validate()?;
        Ok(config)
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&contents)?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Scraper queue: 5 receives before dead-lettering.
    pub fn scraper_queue_config(&self) -> QueueConfig {
        self.scraper_queue.resolve(SCRAPER_QUEUE, 5)
    }

    /// NLP queue: 2 receives before dead-lettering.
    pub fn nlp_queue_config(&self) -> QueueConfig {
        self.nlp_queue.resolve(NLP_QUEUE, 2)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let scraper = self.scraper_queue_config();
        let nlp = self.nlp_queue_config();
        scraper.validate()?;
        nlp.validate()?;
        if scraper.name == nlp.name {
            return Err(ConfigError::Invalid(format!(
                "scraper and nlp queues must differ, both are {}",
                scraper.name
            )));
        }

        let processing = self.workers.processing_timeout_ms;
        for queue in [&scraper, &nlp] {
            if processing >= queue.visibility_timeout_ms {
                return Err(ConfigError::Invalid(format!(
                    "processing_timeout_ms ({processing}) must be below the visibility timeout of {} ({})",
                    queue.name, queue.visibility_timeout_ms
                )));
            }
        }
        if self.workers.scraper_concurrency == 0 || self.workers.nlp_concurrency == 0 {
            return Err(ConfigError::Invalid("worker concurrency must be at least 1".into()));
        }
        if self.workers.scraper_command.is_empty() || self.workers.nlp_command.is_empty() {
            return Err(ConfigError::Invalid("stage commands must not be empty".into()));
        }

        if self.schedule.enabled {
            CronSchedule::parse(&self.schedule.cron)
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        if self.alerting.tick_interval_ms == 0 || self.alerting.signal_capacity == 0 {
            return Err(ConfigError::Invalid(
                "alerting tick_interval_ms and signal_capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Opaque values handed to the stage commands. Required ones fail fast.
#[derive(Clone, PartialEq)]
pub struct StageEnv {
    pub bucket: String,
    pub db_uri: String,
    pub api_key: String,
    pub scraper_queue_url: Option<String>,
    pub nlp_queue_url: Option<String>,
}

impl StageEnv {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |key: &'static str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::MissingEnv(key))
        };
        Ok(Self {
            bucket: required("SLUICE_BUCKET")?,
            db_uri: required("SLUICE_DB_URI")?,
            api_key: required("SLUICE_API_KEY")?,
            scraper_queue_url: lookup("SLUICE_SCRAPER_QUEUE_URL"),
            nlp_queue_url: lookup("SLUICE_NLP_QUEUE_URL"),
        })
    }

    /// Variables to set on a stage process.
    pub fn vars(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![
            ("SLUICE_BUCKET", self.bucket.clone()),
            ("SLUICE_DB_URI", self.db_uri.clone()),
            ("SLUICE_API_KEY", self.api_key.clone()),
        ];
        if let Some(url) = &self.scraper_queue_url {
            vars.push(("SLUICE_SCRAPER_QUEUE_URL", url.clone()));
        }
        if let Some(url) = &self.nlp_queue_url {
            vars.push(("SLUICE_NLP_QUEUE_URL", url.clone()));
        }
        vars
    }
}

impl fmt::Debug for StageEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageEnv")
            .field("bucket", &self.bucket)
            .field("db_uri", &"<redacted>")
            .field("api_key", &"<redacted>")
            .field("scraper_queue_url", &self.scraper_queue_url)
            .field("nlp_queue_url", &self.nlp_queue_url)
            .finish()
    }
}
