//! Scheduler configuration.
//!
//! Loads settings from `scheduler.toml` with environment variable overrides.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded in this priority order (highest wins):
//! 1. Environment variables (e.g., `VALIDATOR_RATIO`, `MAX_RETRY_COUNT`)
//! 2. TOML file (`scheduler.toml` by default)
//! 3. Built-in defaults
//!
//! # Example
//!
//! ```toml
//! server_id = "scheduler-eu-1"
//!
//! [network]
//! listen_addr = "0.0.0.0:3456"
//!
//! [election]
//! validator_ratio = 0.3
//! election_cycle_days = 1
//!
//! [assets]
//! min_retry_time_secs = 60
//! max_retry_count = 3
//! ```

use common::MinioConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Identifier of this scheduler instance, recorded on node rows
    #[serde(default = "default_server_id")]
    pub server_id: String,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub election: ElectionConfig,
    #[serde(default)]
    pub assets: AssetsConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    /// Object-store credentials handed to candidate nodes on demand
    #[serde(default)]
    pub minio: MinioConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            server_id: default_server_id(),
            network: NetworkConfig::default(),
            election: ElectionConfig::default(),
            assets: AssetsConfig::default(),
            keys: KeysConfig::default(),
            minio: MinioConfig::default(),
        }
    }
}

fn default_server_id() -> String {
    "scheduler".to_string()
}

/// Network configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    "0.0.0.0:3456".parse().expect("static listen addr")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data/scheduler")
}

/// Validator election configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ElectionConfig {
    /// Fraction of candidate nodes to elect as validators, in [0, 1]
    #[serde(default = "default_validator_ratio")]
    pub validator_ratio: f64,
    /// Election cycle length in days
    #[serde(default = "default_election_cycle_days")]
    pub election_cycle_days: u32,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            validator_ratio: default_validator_ratio(),
            election_cycle_days: default_election_cycle_days(),
        }
    }
}

impl ElectionConfig {
    pub fn election_cycle(&self) -> Duration {
        Duration::from_secs(u64::from(self.election_cycle_days) * 24 * 3600)
    }
}

fn default_validator_ratio() -> f64 {
    0.2
}

fn default_election_cycle_days() -> u32 {
    1
}

/// Asset replication tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct AssetsConfig {
    /// Minimum cool-down between pull retries, in seconds
    #[serde(default = "default_min_retry_time_secs")]
    pub min_retry_time_secs: u64,
    /// Retries before an asset is parked in the failed state
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: i64,
    /// How long outstanding pulls may stay unreported before the per-asset
    /// timer drains them
    #[serde(default = "default_pull_timeout_secs")]
    pub pull_timeout_secs: u64,
    /// Lifetime of minted pull tokens, in hours
    #[serde(default = "default_token_expiration_hours")]
    pub token_expiration_hours: u64,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            min_retry_time_secs: default_min_retry_time_secs(),
            max_retry_count: default_max_retry_count(),
            pull_timeout_secs: default_pull_timeout_secs(),
            token_expiration_hours: default_token_expiration_hours(),
        }
    }
}

impl AssetsConfig {
    pub fn min_retry_time(&self) -> Duration {
        Duration::from_secs(self.min_retry_time_secs)
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_timeout_secs)
    }

    pub fn token_expiration(&self) -> Duration {
        Duration::from_secs(self.token_expiration_hours * 3600)
    }
}

fn default_min_retry_time_secs() -> u64 {
    60
}

fn default_max_retry_count() -> i64 {
    3
}

fn default_pull_timeout_secs() -> u64 {
    600
}

fn default_token_expiration_hours() -> u64 {
    24
}

/// Scheduler key material.
#[derive(Debug, Clone, Deserialize)]
pub struct KeysConfig {
    /// PKCS#8 PEM private key path. Generated on first start when absent.
    #[serde(default = "default_private_key_path")]
    pub private_key_path: PathBuf,
    /// Bit size used when generating a fresh key
    #[serde(default = "default_key_bits")]
    pub key_bits: usize,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            private_key_path: default_private_key_path(),
            key_bits: default_key_bits(),
        }
    }
}

fn default_private_key_path() -> PathBuf {
    PathBuf::from("data/scheduler/private_key.pem")
}

fn default_key_bits() -> usize {
    2048
}

/// Load configuration from TOML file with environment variable overrides.
pub fn load_config(path: Option<&str>) -> anyhow::Result<SchedulerConfig> {
    let config_path = path.map(std::path::Path::new).or_else(|| {
        let default = std::path::Path::new("scheduler.toml");
        default.exists().then_some(default)
    });

    let config = match config_path {
        Some(p) => toml::from_str(&std::fs::read_to_string(p)?)?,
        None => SchedulerConfig::default(),
    };

    Ok(validate(apply_env_overrides(config)))
}

/// Read an env var and parse it, returning None if missing or parse fails.
fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn apply_env_overrides(mut config: SchedulerConfig) -> SchedulerConfig {
    if let Ok(val) = std::env::var("SCHEDULER_SERVER_ID") {
        config.server_id = val;
    }
    if let Some(addr) = env_parse("SCHEDULER_LISTEN_ADDR") {
        config.network.listen_addr = addr;
    }
    if let Ok(val) = std::env::var("SCHEDULER_DATA_DIR") {
        config.network.data_dir = PathBuf::from(val);
    }
    if let Some(v) = env_parse("VALIDATOR_RATIO") {
        config.election.validator_ratio = v;
    }
    if let Some(v) = env_parse("ELECTION_CYCLE_DAYS") {
        config.election.election_cycle_days = v;
    }
    if let Some(v) = env_parse("MIN_RETRY_TIME_SECS") {
        config.assets.min_retry_time_secs = v;
    }
    if let Some(v) = env_parse("MAX_RETRY_COUNT") {
        config.assets.max_retry_count = v;
    }
    if let Some(v) = env_parse("PULL_TIMEOUT_SECS") {
        config.assets.pull_timeout_secs = v;
    }
    if let Some(v) = env_parse("TOKEN_EXPIRATION_HOURS") {
        config.assets.token_expiration_hours = v;
    }
    if let Ok(val) = std::env::var("SCHEDULER_PRIVATE_KEY_PATH") {
        config.keys.private_key_path = PathBuf::from(val);
    }
    if let Ok(val) = std::env::var("MINIO_ENDPOINT") {
        config.minio.endpoint = val;
    }
    if let Ok(val) = std::env::var("MINIO_ACCESS_KEY_ID") {
        config.minio.access_key_id = val;
    }
    if let Ok(val) = std::env::var("MINIO_SECRET_ACCESS_KEY") {
        config.minio.secret_access_key = val;
    }
    config
}

fn validate(mut config: SchedulerConfig) -> SchedulerConfig {
    if !(0.0..=1.0).contains(&config.election.validator_ratio) {
        warn!(
            validator_ratio = config.election.validator_ratio,
            "validator_ratio outside [0, 1], clamping"
        );
        config.election.validator_ratio = config.election.validator_ratio.clamp(0.0, 1.0);
    }
    if config.election.election_cycle_days == 0 {
        warn!("election_cycle_days must be at least 1, using default");
        config.election.election_cycle_days = default_election_cycle_days();
    }
    config
}
