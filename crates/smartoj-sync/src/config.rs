//! Configuration for smartoj-sync
//!
//! Loaded from a YAML file with `${VAR}` / `${VAR:-default}` environment
//! expansion, then validated field-by-field (`validator`) and across
//! sections.
//!
//! ```yaml
//! source:
//!   host: ${MYSQL_HOST:-127.0.0.1}
//!   user: repl
//!   password: ${MYSQL_PASSWORD}
//! index:
//!   url: http://127.0.0.1:9200
//! broker:
//!   kind: local
//! ```

use crate::registry::KnownTable;
use crate::credential::Credential;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use validator::Validate;

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SyncConfig {
    /// Replication source
    #[validate(nested)]
    pub source: SourceConfig,

    /// Reader → dispatcher handoff
    #[serde(default)]
    #[validate(nested)]
    pub queue: QueueConfig,

    /// Binlog position persistence
    #[serde(default)]
    #[validate(nested)]
    pub checkpoint: CheckpointConfig,

    /// Task broker
    #[serde(default)]
    #[validate(nested)]
    pub broker: BrokerConfig,

    /// Search index
    #[validate(nested)]
    pub index: IndexConfig,

    /// Lifecycle settings
    #[serde(default)]
    #[validate(nested)]
    pub pipeline: PipelineConfig,
}

/// MySQL replication source
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SourceConfig {
    /// MySQL host
    #[validate(length(min = 1))]
    pub host: String,

    /// MySQL port (default: 3306)
    #[serde(default = "default_port")]
    #[validate(range(min = 1, max = 65535))]
    pub port: u16,

    /// Replication user
    #[validate(length(min = 1))]
    pub user: String,

    /// Password (redacted in logs)
    #[serde(default)]
    pub password: Credential,

    /// Schema to follow
    #[serde(default = "default_database")]
    #[validate(length(min = 1))]
    pub database: String,

    /// Server ID for replication (must be unique among all replicas)
    #[serde(default = "default_server_id")]
    #[validate(range(min = 1))]
    pub server_id: u32,

    /// Heartbeat period requested from the server; silence for twice this
    /// long is treated as a lost connection
    #[serde(default = "default_heartbeat_interval")]
    #[validate(range(min = 1, max = 3600))]
    pub heartbeat_interval_secs: u64,

    /// Table allow-list
    #[serde(default = "default_tables")]
    #[validate(length(min = 1))]
    pub tables: Vec<String>,

    /// Upper bound of the metadata / directory connection pool
    #[serde(default = "default_pool_max")]
    #[validate(range(min = 1, max = 100))]
    pub pool_max_connections: usize,
}

impl SourceConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Connection options for the `mysql_async` pool.
    pub fn pool_opts(&self) -> mysql_async::Opts {
        let constraints = mysql_async::PoolConstraints::new(1, self.pool_max_connections)
            .unwrap_or_default();
        mysql_async::OptsBuilder::default()
            .ip_or_hostname(self.host.clone())
            .tcp_port(self.port)
            .user(Some(self.user.clone()))
            .pass(Some(self.password.expose_secret().to_string()))
            .db_name(Some(self.database.clone()))
            .pool_opts(mysql_async::PoolOpts::default().with_constraints(constraints))
            .into()
    }
}

fn default_port() -> u16 {
    3306
}

fn default_database() -> String {
    "smartoj".to_string()
}

fn default_server_id() -> u32 {
    1
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_tables() -> Vec<String> {
    KnownTable::ALL.iter().map(|t| t.name().to_string()).collect()
}

fn default_pool_max() -> usize {
    4
}

/// Handoff queue settings
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct QueueConfig {
    /// Maximum batches buffered between reader and dispatcher
    #[serde(default = "default_queue_capacity")]
    #[validate(range(min = 1, max = 100000))]
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
        }
    }
}

fn default_queue_capacity() -> usize {
    100
}

/// Position store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    /// JSON file on local disk
    #[default]
    File,
    /// Process memory (dry runs)
    Memory,
}

/// Checkpoint settings
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CheckpointConfig {
    #[serde(default)]
    pub backend: CheckpointBackend,

    /// Directory holding `<key>.json`
    #[serde(default = "default_checkpoint_dir")]
    pub dir: PathBuf,

    /// Checkpoint key
    #[serde(default = "default_checkpoint_key")]
    #[validate(length(min = 1, max = 128))]
    pub key: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            backend: CheckpointBackend::default(),
            dir: default_checkpoint_dir(),
            key: default_checkpoint_key(),
        }
    }
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("./data/checkpoints")
}

fn default_checkpoint_key() -> String {
    crate::checkpoint::CHECKPOINT_KEY.to_string()
}

/// Broker flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// External ingest endpoint
    Http,
    /// Embedded worker pool running the handlers in-process
    #[default]
    Local,
}

/// Task broker settings
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct BrokerConfig {
    #[serde(default)]
    pub kind: BrokerKind,

    /// Ingest URL (http broker)
    #[serde(default)]
    #[validate(url)]
    pub url: Option<String>,

    /// Request timeout (http broker)
    #[serde(default = "default_request_timeout")]
    #[validate(range(min = 1, max = 300))]
    pub timeout_secs: u64,

    /// Worker tasks (local broker); 1 keeps per-table apply order
    #[serde(default = "default_workers")]
    #[validate(range(min = 1, max = 64))]
    pub workers: usize,

    /// Jobs waiting for a free worker (local broker)
    #[serde(default = "default_intake_capacity")]
    #[validate(range(min = 1))]
    pub intake_capacity: usize,

    /// Attempts before a job is dead-lettered (local broker)
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1, max = 100))]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    #[validate(range(min = 1))]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    #[validate(range(min = 1))]
    pub max_backoff_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::default(),
            url: None,
            timeout_secs: default_request_timeout(),
            workers: default_workers(),
            intake_capacity: default_intake_capacity(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_request_timeout() -> u64 {
    10
}

fn default_workers() -> usize {
    1
}

fn default_intake_capacity() -> usize {
    1024
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

/// Search index settings
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct IndexConfig {
    /// Elasticsearch base URL
    #[validate(url)]
    pub url: String,

    /// Index holding question documents
    #[serde(default = "default_index_name")]
    #[validate(length(min = 1, max = 255))]
    pub index: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<Credential>,

    #[serde(default = "default_request_timeout")]
    #[validate(range(min = 1, max = 300))]
    pub timeout_secs: u64,

    /// Create the index with its mapping on startup when missing
    #[serde(default = "default_true")]
    pub ensure_index: bool,
}

fn default_index_name() -> String {
    "question".to_string()
}

fn default_true() -> bool {
    true
}

/// Lifecycle settings
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct PipelineConfig {
    /// Name used in logs and progress events
    #[serde(default = "default_pipeline_name")]
    #[validate(length(min = 1))]
    pub name: String,

    /// Bound on waiting for the reader thread during shutdown
    #[serde(default = "default_join_timeout")]
    #[validate(range(min = 1, max = 300))]
    pub reader_join_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: default_pipeline_name(),
            reader_join_timeout_secs: default_join_timeout(),
        }
    }
}

fn default_pipeline_name() -> String {
    "smartoj-sync".to_string()
}

fn default_join_timeout() -> u64 {
    5
}

impl SyncConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e))?;
        Self::from_yaml(&content)
    }

    /// Parse, expand and validate YAML content
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let expanded = Self::expand_env_vars(content);

        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;

        config.check()?;
        Ok(config)
    }

    /// Expand environment variables in the format ${VAR} or ${VAR:-default}
    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Field rules plus cross-section checks
    pub fn check(&self) -> anyhow::Result<()> {
        self.validate()
            .map_err(|e| anyhow::anyhow!("Config validation failed: {}", e))?;

        if self.broker.kind == BrokerKind::Http && self.broker.url.is_none() {
            anyhow::bail!("broker.url is required when broker.kind is 'http'");
        }

        if self.broker.max_backoff_ms < self.broker.initial_backoff_ms {
            anyhow::bail!(
                "broker.max_backoff_ms ({}) must be >= broker.initial_backoff_ms ({})",
                self.broker.max_backoff_ms,
                self.broker.initial_backoff_ms
            );
        }

        if self.index.password.is_some() && self.index.username.is_none() {
            anyhow::bail!("index.password is set without index.username");
        }

        crate::checkpoint::validate_key(&self.checkpoint.key)
            .map_err(|e| anyhow::anyhow!("checkpoint.key: {}", e))?;

        for table in &self.source.tables {
            if KnownTable::from_name(table).is_none() {
                tracing::warn!(
                    "source.tables contains '{}', which has no handler; its records will be skipped",
                    table
                );
            }
        }

        Ok(())
    }

    pub fn reader_join_timeout(&self) -> Duration {
        Duration::from_secs(self.pipeline.reader_join_timeout_secs)
    }
}
