//! Scheduler configuration
//!
//! Defaults are layered under a YAML file and `MESH_SCHEDULER__*`
//! environment overrides. Durations are plain `*_ms` integers.

use crate::{EndpointSelection, Error, HeadroomStrategy, ProfileName, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming an explicit configuration file
pub const CONFIG_ENV: &str = "MESH_SCHEDULER_CONFIG";

/// Prefix of environment overrides, e.g. `MESH_SCHEDULER__HEADROOM__STRATEGY=most`
pub const ENV_PREFIX: &str = "MESH_SCHEDULER";

/// Baseline scorer plugin names
pub const QUEUE_PLUGIN: &str = "queue";
pub const KV_CACHE_PLUGIN: &str = "kv-cache";
pub const PREFIX_PLUGIN: &str = "prefix";

/// Predictive scorer plugin name
pub const SLO_HEADROOM_PLUGIN: &str = "slo-headroom";

/// Main configuration structure for the scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub server: ServerConfig,
    pub forecast: ForecastConfig,
    pub headroom: HeadroomConfig,
    pub profiles: ProfilesConfig,
    pub tracker: TrackerConfig,
    pub samples: SamplesConfig,
    pub trainer: TrainerConfig,
    pub observability: ObservabilityConfig,
}

impl SchedulerConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Environment variables (highest)
    /// 2. Configuration file
    /// 3. Defaults (lowest)
    ///
    /// Command line overrides are applied by the binary on top of the result.
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&Self::default())?);

        if let Ok(config_path) = std::env::var(CONFIG_ENV) {
            builder = builder.add_source(config::File::with_name(&config_path).required(true));
        } else {
            for path in &["./mesh-scheduler.yaml", "/etc/mesh-scheduler/config.yaml"] {
                builder = builder.add_source(config::File::with_name(path).required(false));
            }
        }

        builder = builder.add_source(Self::environment());

        let config = builder.build()?;
        let parsed: Self = config.try_deserialize()?;
        parsed.validate()?;

        Ok(parsed)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(config::File::from(path))
            .add_source(Self::environment());

        let config = builder.build()?;
        let parsed: Self = config.try_deserialize()?;
        parsed.validate()?;

        Ok(parsed)
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("forecast.endpoints")
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.forecast.validate()?;
        self.headroom.validate()?;
        self.profiles.validate()?;
        self.tracker.validate()?;
        self.samples.validate()?;
        self.trainer.validate()?;
        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            forecast: ForecastConfig::default(),
            headroom: HeadroomConfig::default(),
            profiles: ProfilesConfig::default(),
            tracker: TrackerConfig::default(),
            samples: SamplesConfig::default(),
            trainer: TrainerConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// IP address to bind to
    pub bind_ip: std::net::IpAddr,

    /// HTTP port
    pub port: u16,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            port: 9002,
        }
    }
}

/// Forecaster client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastConfig {
    /// Replicated forecaster base URLs
    pub endpoints: Vec<String>,

    /// How an endpoint is chosen per call
    pub selection: EndpointSelection,

    /// Per-call timeout in milliseconds
    pub call_timeout_ms: u64,

    /// Deadline for the whole per-decision fan-out in milliseconds
    pub fanout_timeout_ms: u64,
}

impl ForecastConfig {
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(Error::config("At least one forecaster endpoint is required"));
        }
        if self.endpoints.iter().any(|e| e.trim().is_empty()) {
            return Err(Error::config("Forecaster endpoints cannot be empty"));
        }
        if self.call_timeout_ms == 0 {
            return Err(Error::config("forecast.call_timeout_ms must be > 0"));
        }
        if self.fanout_timeout_ms == 0 {
            return Err(Error::config("forecast.fanout_timeout_ms must be > 0"));
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn fanout_timeout(&self) -> Duration {
        Duration::from_millis(self.fanout_timeout_ms)
    }
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:8000".to_string()],
            selection: EndpointSelection::RoundRobin,
            call_timeout_ms: 250,
            fanout_timeout_ms: 300,
        }
    }
}

/// Headroom scoring tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadroomConfig {
    /// TTFT weight in the positive-headroom blend
    pub positive_ttft_weight: f64,

    /// TPOT weight in the positive-headroom blend
    pub positive_tpot_weight: f64,

    /// TTFT weight in the negative-headroom deficit blend
    pub negative_ttft_weight: f64,

    /// TPOT weight in the negative-headroom deficit blend
    pub negative_tpot_weight: f64,

    /// Ranking inside the positive bucket
    pub strategy: HeadroomStrategy,

    /// Multiplier applied to TPOT targets
    pub slo_buffer_factor: f64,
}

impl HeadroomConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, w) in [
            ("positive_ttft_weight", self.positive_ttft_weight),
            ("positive_tpot_weight", self.positive_tpot_weight),
            ("negative_ttft_weight", self.negative_ttft_weight),
            ("negative_tpot_weight", self.negative_tpot_weight),
        ] {
            if !w.is_finite() || w < 0.0 {
                return Err(Error::config(format!("headroom.{} must be >= 0", name)));
            }
        }
        if self.positive_ttft_weight + self.positive_tpot_weight == 0.0 {
            return Err(Error::config("Positive headroom weights cannot both be 0"));
        }
        if self.negative_ttft_weight + self.negative_tpot_weight == 0.0 {
            return Err(Error::config("Negative headroom weights cannot both be 0"));
        }
        if !self.slo_buffer_factor.is_finite() || self.slo_buffer_factor <= 0.0 {
            return Err(Error::config("headroom.slo_buffer_factor must be > 0"));
        }
        Ok(())
    }
}

impl Default for HeadroomConfig {
    fn default() -> Self {
        Self {
            positive_ttft_weight: 0.8,
            positive_tpot_weight: 0.2,
            negative_ttft_weight: 0.8,
            negative_tpot_weight: 0.2,
            strategy: HeadroomStrategy::Least,
            slo_buffer_factor: 1.0,
        }
    }
}

/// One scorer plugin inside a profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    pub name: String,
    #[serde(default = "default_plugin_weight")]
    pub weight: f64,
}

fn default_plugin_weight() -> f64 {
    1.0
}

impl PluginConfig {
    pub fn new(name: impl Into<String>, weight: f64) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }
}

/// Named scheduling profiles and the plugins they run, in order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfilesConfig {
    pub default: Vec<PluginConfig>,
    pub slo: Vec<PluginConfig>,
}

impl ProfilesConfig {
    /// Plugins of the named profile
    pub fn plugins(&self, profile: ProfileName) -> &[PluginConfig] {
        match profile {
            ProfileName::Default => &self.default,
            ProfileName::Slo => &self.slo,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.default.is_empty() {
            return Err(Error::config("The default profile needs at least one scorer"));
        }
        for plugin in &self.default {
            if ![QUEUE_PLUGIN, KV_CACHE_PLUGIN, PREFIX_PLUGIN].contains(&plugin.name.as_str()) {
                return Err(Error::config(format!(
                    "Unknown scorer '{}' in default profile",
                    plugin.name
                )));
            }
            if !plugin.weight.is_finite() || plugin.weight < 0.0 {
                return Err(Error::config(format!("Scorer '{}' has a negative weight", plugin.name)));
            }
        }
        if self.slo.len() != 1 || self.slo[0].name != SLO_HEADROOM_PLUGIN {
            return Err(Error::config(format!(
                "The slo profile must run exactly the '{}' scorer",
                SLO_HEADROOM_PLUGIN
            )));
        }
        Ok(())
    }
}

impl Default for ProfilesConfig {
    fn default() -> Self {
        Self {
            default: vec![
                PluginConfig::new(QUEUE_PLUGIN, 1.0),
                PluginConfig::new(KV_CACHE_PLUGIN, 1.0),
                PluginConfig::new(PREFIX_PLUGIN, 1.0),
            ],
            slo: vec![PluginConfig::new(SLO_HEADROOM_PLUGIN, 1.0)],
        }
    }
}

/// Request SLO tracker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Entries older than this are considered stale
    pub expiry_ms: u64,

    /// Interval of the stale-entry sweep
    pub cleanup_interval_ms: u64,
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.expiry_ms == 0 || self.cleanup_interval_ms == 0 {
            return Err(Error::config("Tracker expiry and cleanup interval must be > 0"));
        }
        Ok(())
    }

    pub fn expiry(&self) -> Duration {
        Duration::from_millis(self.expiry_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            expiry_ms: 10 * 60 * 1000,
            cleanup_interval_ms: 30 * 1000,
        }
    }
}

/// Sample collection and upload configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplesConfig {
    /// Every `tpot_stride`-th decode token is sampled
    pub tpot_stride: u32,

    /// Maximum buffered samples before oldest-first eviction
    pub buffer_capacity: usize,

    /// Upload interval in milliseconds
    pub flush_interval_ms: u64,

    /// Maximum samples per upload
    pub batch_size: usize,

    /// Retries per flush before the batch waits for the next interval
    pub max_retries: u32,

    /// First retry delay in milliseconds, doubled per attempt
    pub retry_base_delay_ms: u64,

    /// Cap on the retry delay in milliseconds
    pub retry_max_delay_ms: u64,
}

impl SamplesConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tpot_stride == 0 {
            return Err(Error::config("samples.tpot_stride must be > 0"));
        }
        if self.buffer_capacity == 0 || self.batch_size == 0 {
            return Err(Error::config("Sample buffer capacity and batch size must be > 0"));
        }
        if self.flush_interval_ms == 0 {
            return Err(Error::config("samples.flush_interval_ms must be > 0"));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(Error::config("samples.retry_base_delay_ms exceeds retry_max_delay_ms"));
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl Default for SamplesConfig {
    fn default() -> Self {
        Self {
            tpot_stride: 200,
            buffer_capacity: 10_000,
            flush_interval_ms: 1_000,
            batch_size: 500,
            max_retries: 3,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 5_000,
        }
    }
}

/// Training service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// Trainer base URL
    pub url: String,

    /// Model whose metadata is polled
    pub model_name: String,

    /// HTTP request timeout in milliseconds
    pub request_timeout_ms: u64,

    /// Metadata and readiness poll interval in milliseconds
    pub poll_interval_ms: u64,
}

impl TrainerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(Error::config("trainer.url cannot be empty"));
        }
        if self.request_timeout_ms == 0 || self.poll_interval_ms == 0 {
            return Err(Error::config("Trainer timeouts and intervals must be > 0"));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8001".to_string(),
            model_name: "latency".to_string(),
            request_timeout_ms: 2_000,
            poll_interval_ms: 30_000,
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics
    pub metrics_enabled: bool,

    /// Log level
    pub log_level: String,

    /// Log format (json or text)
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
        }
    }
}
