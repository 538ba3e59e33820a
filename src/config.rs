use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::collector::ThreadingMode;
use crate::sink::shm::{DEFAULT_SHM_CAPACITY, DEFAULT_SHM_DIR};
use crate::sink::SNAPSHOT_WORD_SIZE;
use crate::task::{CategoryId, DEFAULT_TASK_CAPACITY};

/// Top-level configuration for the perfshm agent.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Collection loop configuration.
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Snapshot destination configuration.
    #[serde(default)]
    pub sink: SinkConfig,

    /// Snapshot schema: one integer per entry, in this order.
    #[serde(default = "default_metrics")]
    pub metrics: Vec<MetricDef>,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Synthetic load generator configuration.
    #[serde(default)]
    pub load: LoadConfig,
}

/// Collection loop configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    /// Name of the shared region readers attach to. Default: "perfshm".
    #[serde(default = "default_sink_name")]
    pub sink_name: String,

    /// Flush interval. Anything under 1ms falls back to 1s. Default: 1s.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Who drives collection ticks. Default: worker.
    #[serde(default)]
    pub mode: CollectorMode,
}

/// Who drives collection ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectorMode {
    /// The agent's own event loop calls tick.
    Manual,
    /// The collector runs a dedicated thread.
    #[default]
    Worker,
}

impl From<CollectorMode> for ThreadingMode {
    fn from(mode: CollectorMode) -> Self {
        match mode {
            CollectorMode::Manual => ThreadingMode::Manual,
            CollectorMode::Worker => ThreadingMode::Worker,
        }
    }
}

/// Snapshot destination configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    /// Sink implementation. Default: shared_memory.
    #[serde(default)]
    pub kind: SinkKind,

    /// Directory holding named regions. Default: "/dev/shm".
    #[serde(default = "default_shm_dir")]
    pub dir: PathBuf,

    /// Region size in bytes. Default: 1024.
    #[serde(default = "default_shm_capacity")]
    pub capacity: usize,
}

/// Available sink implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    #[default]
    SharedMemory,
    /// In-process only; nothing is visible outside the agent.
    Memory,
}

/// How a metric folds the tasks of its category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Number of tasks.
    Count,
    /// Sum of the selected slot.
    Sum,
    /// Smallest value of the selected slot.
    Min,
    /// Largest value of the selected slot.
    Max,
    /// Most recent value of the selected slot.
    Last,
}

impl MetricKind {
    /// Returns the canonical config/log label.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Sum => "sum",
            Self::Min => "min",
            Self::Max => "max",
            Self::Last => "last",
        }
    }
}

/// One snapshot entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MetricDef {
    /// Category id whose tasks feed this metric.
    pub id: CategoryId,
    /// Unique label, used by `dump`.
    pub name: String,
    pub kind: MetricKind,
    /// Task slot read by value-based kinds. Default: 0.
    #[serde(default)]
    pub slot: usize,
}

impl MetricDef {
    pub fn new(id: CategoryId, name: impl Into<String>, kind: MetricKind) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            slot: 0,
        }
    }

    pub fn with_slot(mut self, slot: usize) -> Self {
        self.slot = slot;
        self
    }
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics and /healthz. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// Synthetic load generator configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoadConfig {
    /// Number of producer threads. Zero disables synthetic load. Default: 1.
    #[serde(default = "default_producers")]
    pub producers: usize,

    /// Delay between rounds of one producer. Default: 1s.
    #[serde(default = "default_load_period", with = "humantime_serde")]
    pub period: Duration,

    /// How long to produce before shutting down. Zero runs until a
    /// signal arrives. Default: 6s.
    #[serde(default = "default_load_duration", with = "humantime_serde")]
    pub duration: Duration,

    /// Value placed in every task slot. Default: 1000.
    #[serde(default = "default_load_value")]
    pub value: i32,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_sink_name() -> String {
    "perfshm".to_string()
}

fn default_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_shm_dir() -> PathBuf {
    PathBuf::from(DEFAULT_SHM_DIR)
}

fn default_shm_capacity() -> usize {
    DEFAULT_SHM_CAPACITY
}

fn default_metrics() -> Vec<MetricDef> {
    vec![
        MetricDef::new(1, "send_packet", MetricKind::Count),
        MetricDef::new(2, "send_packet_amount", MetricKind::Sum),
    ]
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

fn default_producers() -> usize {
    1
}

fn default_load_period() -> Duration {
    Duration::from_secs(1)
}

fn default_load_duration() -> Duration {
    Duration::from_secs(6)
}

fn default_load_value() -> i32 {
    1000
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            collector: CollectorConfig::default(),
            sink: SinkConfig::default(),
            metrics: default_metrics(),
            health: HealthConfig::default(),
            load: LoadConfig::default(),
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            sink_name: default_sink_name(),
            interval: default_interval(),
            mode: CollectorMode::default(),
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::default(),
            dir: default_shm_dir(),
            capacity: default_shm_capacity(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_health_addr(),
        }
    }
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            producers: default_producers(),
            period: default_load_period(),
            duration: default_load_duration(),
            value: default_load_value(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        Self::from_yaml(&data).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(data).context("decoding YAML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        let name = &self.collector.sink_name;
        if name.is_empty() {
            bail!("collector.sink_name is required");
        }
        if name.contains(['/', '\\']) || name == "." || name == ".." {
            bail!("collector.sink_name must not contain path separators: {name}");
        }

        if i64::try_from(self.collector.interval.as_millis()).is_err() {
            bail!("collector.interval is too large");
        }

        if self.sink.capacity == 0 {
            bail!("sink.capacity must be positive");
        }

        if self.sink.kind == SinkKind::SharedMemory && self.sink.dir.as_os_str().is_empty() {
            bail!("sink.dir is required for the shared_memory sink");
        }

        if self.metrics.is_empty() {
            bail!("metrics must declare at least one entry");
        }

        let snapshot_bytes = self.metrics.len() * SNAPSHOT_WORD_SIZE;
        if snapshot_bytes > self.sink.capacity {
            bail!(
                "{} metrics need {snapshot_bytes} bytes but sink.capacity is {}",
                self.metrics.len(),
                self.sink.capacity
            );
        }

        let mut names = HashSet::new();
        for def in &self.metrics {
            if def.name.is_empty() {
                bail!("metric with id {} has an empty name", def.id);
            }

            if !names.insert(def.name.as_str()) {
                bail!("duplicate metric name: {}", def.name);
            }

            if def.slot >= DEFAULT_TASK_CAPACITY {
                bail!(
                    "metric {} reads slot {} but tasks hold {DEFAULT_TASK_CAPACITY} slots",
                    def.name,
                    def.slot
                );
            }
        }

        if self.health.enabled && self.health.addr.is_empty() {
            bail!("health.addr is required when enabled");
        }

        if self.load.producers > 0 && self.load.period.is_zero() {
            bail!("load.period must be positive when producers are configured");
        }

        Ok(())
    }

    /// Whether the interval rounds down to 0 ms, so the collector's
    /// default interval applies instead.
    pub fn interval_falls_back(&self) -> bool {
        self.collector.interval.as_millis() == 0
    }

    /// Flush interval in the collector's millisecond form.
    pub fn interval_ms(&self) -> i64 {
        i64::try_from(self.collector.interval.as_millis()).unwrap_or(i64::MAX)
    }
}
