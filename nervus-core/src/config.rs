//! Layered configuration for the event distribution core: Bus, Store,
//! Metrics and Distributor sections (§6), loadable from JSON/TOML/YAML and
//! overridable from the environment, the way `NarayanaConfig` does it.

use serde::{Deserialize, Serialize};
use std::time::Duration;

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    pub channel_buffer_size: usize,
    pub max_subscribers: usize,
    #[serde(with = "duration_secs")]
    pub event_ttl: Duration,
    #[serde(with = "duration_secs")]
    pub cleanup_interval: Duration,
    #[serde(with = "duration_secs")]
    pub metrics_interval: Duration,
    #[serde(with = "duration_secs")]
    pub dedup_window: Duration,
    pub max_event_size: usize,
    pub persistence_enabled: bool,
    pub persistence_buffer: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            channel_buffer_size: 1000,
            max_subscribers: 10_000,
            event_ttl: secs(300),
            cleanup_interval: secs(30),
            metrics_interval: secs(10),
            dedup_window: secs(5),
            max_event_size: 1_000_000,
            persistence_enabled: false,
            persistence_buffer: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub db_path: String,
    pub buffer_size: usize,
    pub batch_size: usize,
    #[serde(with = "duration_secs")]
    pub flush_interval: Duration,
    #[serde(with = "duration_secs")]
    pub retention_period: Duration,
    #[serde(with = "duration_secs")]
    pub cleanup_interval: Duration,
    pub enable_compression: bool,
    pub enable_replication: bool,
    pub max_disk_usage: u64,
    pub enable_backup: bool,
    #[serde(with = "duration_secs")]
    pub backup_interval: Duration,
    pub verify_integrity: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: "nervus_events.db".to_string(),
            buffer_size: 10_000,
            batch_size: 100,
            flush_interval: Duration::from_millis(500),
            retention_period: secs(7 * 24 * 3600),
            cleanup_interval: secs(3600),
            enable_compression: false,
            enable_replication: false,
            max_disk_usage: 10 * 1024 * 1024 * 1024,
            enable_backup: false,
            backup_interval: secs(24 * 3600),
            verify_integrity: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertThresholds {
    pub max_error_rate: f64,
    pub max_latency: f64,
    pub min_throughput: f64,
    pub max_memory: f64,
    pub max_cpu: f64,
    pub max_queue_depth: u64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            max_error_rate: 5.0,
            max_latency: 1000.0,
            min_throughput: 0.0,
            max_memory: 0.9,
            max_cpu: 0.9,
            max_queue_depth: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(with = "duration_secs")]
    pub collection_interval: Duration,
    #[serde(with = "duration_secs")]
    pub retention_period: Duration,
    #[serde(default)]
    pub time_window_sizes: Vec<u64>,
    pub detailed_stats: bool,
    pub performance_metrics: bool,
    pub max_event_types: usize,
    pub max_sources: usize,
    pub max_subscribers: usize,
    pub enable_alerting: bool,
    pub alert_thresholds: AlertThresholds,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            collection_interval: secs(10),
            retention_period: secs(3600),
            time_window_sizes: vec![60, 300, 3600],
            detailed_stats: true,
            performance_metrics: true,
            max_event_types: 1000,
            max_sources: 1000,
            max_subscribers: 10_000,
            enable_alerting: false,
            alert_thresholds: AlertThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributorConfig {
    pub queue_size: usize,
    pub worker_count: usize,
    pub batch_size: usize,
    #[serde(with = "duration_secs")]
    pub flush_interval: Duration,
    pub enable_websocket: bool,
    pub enable_push: bool,
    pub enable_filtering: bool,
    pub enable_persistence: bool,
    pub enable_metrics: bool,
    pub retry_attempts: u32,
    #[serde(with = "duration_secs")]
    pub retry_delay: Duration,
    #[serde(with = "duration_secs")]
    pub deduplication_window: Duration,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            queue_size: 10_000,
            worker_count: 5,
            batch_size: 100,
            flush_interval: Duration::from_millis(500),
            enable_websocket: true,
            enable_push: true,
            enable_filtering: true,
            enable_persistence: true,
            enable_metrics: true,
            retry_attempts: 3,
            retry_delay: secs(1),
            deduplication_window: secs(5),
        }
    }
}

/// Top-level configuration: one section per component, loaded together.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NervusConfig {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub distributor: DistributorConfig,
}

impl NervusConfig {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path, e)))?;
        Self::from_str(&content)
    }

    /// Tries JSON, then TOML, then YAML; the first that parses wins.
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        if let Ok(config) = serde_json::from_str::<NervusConfig>(content) {
            return Ok(config);
        }
        if let Ok(config) = toml::from_str::<NervusConfig>(content) {
            return Ok(config);
        }
        if let Ok(config) = serde_yaml::from_str::<NervusConfig>(content) {
            return Ok(config);
        }
        Err(ConfigError::Parse("unrecognised config format".to_string()))
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("NERVUS_DB_PATH") {
            config.store.db_path = path;
        }
        if let Ok(workers) = std::env::var("NERVUS_WORKER_COUNT") {
            if let Ok(n) = workers.parse::<usize>() {
                config.distributor.worker_count = n;
            }
        }
        if let Ok(buf) = std::env::var("NERVUS_CHANNEL_BUFFER_SIZE") {
            if let Ok(n) = buf.parse::<usize>() {
                config.bus.channel_buffer_size = n;
            }
        }
        config
    }

    pub fn merge(&mut self, other: NervusConfig) {
        self.bus = other.bus;
        self.store = other.store;
        self.metrics = other.metrics;
        self.distributor = other.distributor;
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.channel_buffer_size == 0 {
            return Err(ConfigError::Validation(
                "bus.channel_buffer_size must be > 0".to_string(),
            ));
        }
        if self.store.batch_size == 0 {
            return Err(ConfigError::Validation(
                "store.batch_size must be > 0".to_string(),
            ));
        }
        if self.distributor.worker_count == 0 {
            return Err(ConfigError::Validation(
                "distributor.worker_count must be > 0".to_string(),
            ));
        }
        if self.metrics.collection_interval.is_zero() {
            return Err(ConfigError::Validation(
                "metrics.collection_interval must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "io error: {}", e),
            ConfigError::Parse(e) => write!(f, "parse error: {}", e),
            ConfigError::Validation(e) => write!(f, "validation error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(NervusConfig::default().validate().is_ok());
    }

    #[test]
    fn from_str_accepts_toml() {
        let toml = r#"
            [bus]
            channel_buffer_size = 42
            max_subscribers = 10
            event_ttl = 300
            cleanup_interval = 30
            metrics_interval = 10
            dedup_window = 5
            max_event_size = 1000
            persistence_enabled = false
            persistence_buffer = 10

            [store]
            db_path = "test.db"
            buffer_size = 10
            batch_size = 5
            flush_interval = 1
            retention_period = 60
            cleanup_interval = 60
            enable_compression = false
            enable_replication = false
            max_disk_usage = 1000
            enable_backup = false
            backup_interval = 60
            verify_integrity = false

            [metrics]
            collection_interval = 10
            retention_period = 60
            time_window_sizes = [60]
            detailed_stats = true
            performance_metrics = true
            max_event_types = 10
            max_sources = 10
            max_subscribers = 10
            enable_alerting = false
            [metrics.alert_thresholds]
            max_error_rate = 5.0
            max_latency = 100.0
            min_throughput = 0.0
            max_memory = 0.9
            max_cpu = 0.9
            max_queue_depth = 10

            [distributor]
            queue_size = 10
            worker_count = 2
            batch_size = 5
            flush_interval = 1
            enable_websocket = true
            enable_push = true
            enable_filtering = true
            enable_persistence = true
            enable_metrics = true
            retry_attempts = 3
            retry_delay = 1
            deduplication_window = 5
        "#;
        let config = NervusConfig::from_str(toml).unwrap();
        assert_eq!(config.bus.channel_buffer_size, 42);
    }

    #[test]
    fn validate_rejects_zero_worker_count() {
        let mut config = NervusConfig::default();
        config.distributor.worker_count = 0;
        assert!(config.validate().is_err());
    }
}
