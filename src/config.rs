//! Configuration module for Switchyard.
//!
//! Loads configuration once at startup from a TOML file with environment
//! variable substitution. The result is immutable for the process lifetime.
//!
//! # Example
//!
//! ```toml
//! default_lane = "default"
//!
//! [store]
//! url = "${REDIS_URL}"
//!
//! [retry]
//! max_retries = 3
//! base_delay_ms = 1000
//! backoff_multiplier = 2.0
//!
//! [lanes.deploy]
//! default_priority = "high"
//! concurrency = 2
//!
//! [handlers]
//! deploy = "log:deploy"
//! ```

use crate::event::{EventKind, Priority};
use crate::handlers::{Handler, LogHandler};
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fs;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default config path when `SWITCHYARD_CONFIG` is not set.
pub const DEFAULT_CONFIG_PATH: &str = "config/switchyard.toml";

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var pattern is a valid regex")
});

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct SwitchyardConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub processor: ProcessorConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    /// Lane that unknown or disabled lanes fall back to.
    #[serde(default = "default_lane_name")]
    pub default_lane: String,

    /// Static lane set, keyed by lane name.
    #[serde(default = "default_lanes")]
    pub lanes: BTreeMap<String, LaneConfig>,

    /// Handler binding per event kind: `"log"` or `"log:<prefix>"`.
    #[serde(default = "default_handlers")]
    pub handlers: HashMap<EventKind, String>,
}

impl Default for SwitchyardConfig {
    fn default() -> Self {
        let mut config = Self {
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            retry: RetryConfig::default(),
            processor: ProcessorConfig::default(),
            health: HealthConfig::default(),
            audit: AuditConfig::default(),
            default_lane: default_lane_name(),
            lanes: default_lanes(),
            handlers: default_handlers(),
        };
        config.fill_lane_names();
        config
    }
}

/// HTTP server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            api_key: None,
        }
    }
}

fn default_port() -> u16 {
    3000
}

/// Which queue store implementation to use.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Redis,
    Memory,
}

/// Queue store configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    #[serde(default = "default_redis_url")]
    pub url: String,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_key_prefix() -> String {
    "switchyard".to_string()
}

/// Retry and backoff configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Upper bound for a single backoff delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    3_600_000
}

/// Consumer loop configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ProcessorConfig {
    /// Bounded wait for each blocking pop; keeps shutdown prompt.
    #[serde(default = "default_pop_timeout_ms")]
    pub pop_timeout_ms: u64,

    /// Per-invocation handler timeout. `0` disables it.
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_timeout_ms: u64,

    /// Pause after an unexpected loop-level error.
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            pop_timeout_ms: default_pop_timeout_ms(),
            handler_timeout_ms: default_handler_timeout_ms(),
            error_backoff_ms: default_error_backoff_ms(),
        }
    }
}

impl ProcessorConfig {
    pub fn pop_timeout(&self) -> Duration {
        Duration::from_millis(self.pop_timeout_ms)
    }

    pub fn handler_timeout(&self) -> Option<Duration> {
        (self.handler_timeout_ms > 0).then(|| Duration::from_millis(self.handler_timeout_ms))
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

fn default_pop_timeout_ms() -> u64 {
    1000
}

fn default_handler_timeout_ms() -> u64 {
    30_000
}

fn default_error_backoff_ms() -> u64 {
    1000
}

/// Health probe configuration
#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,

    /// Expiry of the persisted "latest" health record.
    #[serde(default = "default_record_ttl_secs")]
    pub record_ttl_secs: u64,

    /// Lane for the synthetic probe. Falls back to the default lane.
    #[serde(default)]
    pub lane: Option<String>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_health_interval_ms(),
            record_ttl_secs: default_record_ttl_secs(),
            lane: None,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn record_ttl(&self) -> Duration {
        Duration::from_secs(self.record_ttl_secs)
    }
}

fn default_health_interval_ms() -> u64 {
    30_000
}

fn default_record_ttl_secs() -> u64 {
    120
}

/// Audit artifact configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_audit_dir")]
    pub dir: String,

    /// Also write an artifact for every routed event.
    #[serde(default)]
    pub routed: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_audit_dir(),
            routed: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_audit_dir() -> String {
    "audit".to_string()
}

/// Static configuration of one lane.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LaneConfig {
    /// Filled in from the table key on load.
    #[serde(default)]
    pub name: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub default_priority: Option<Priority>,

    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
}

impl LaneConfig {
    pub fn new(name: impl Into<String>, default_priority: Option<Priority>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            default_priority,
            concurrency: default_concurrency(),
        }
    }
}

fn default_concurrency() -> u32 {
    1
}

fn default_lane_name() -> String {
    "default".to_string()
}

fn default_lanes() -> BTreeMap<String, LaneConfig> {
    [
        LaneConfig::new("default", Some(Priority::Normal)),
        LaneConfig::new("build", Some(Priority::Normal)),
        LaneConfig::new("test", Some(Priority::Low)),
        LaneConfig::new("deploy", Some(Priority::High)),
        LaneConfig::new("monitoring", Some(Priority::High)),
    ]
    .into_iter()
    .map(|lane| (lane.name.clone(), lane))
    .collect()
}

fn default_handlers() -> HashMap<EventKind, String> {
    [
        EventKind::Build,
        EventKind::Test,
        EventKind::Deploy,
        EventKind::Alert,
    ]
    .into_iter()
    .map(|kind| (kind, "log".to_string()))
    .collect()
}

impl SwitchyardConfig {
    /// Load configuration from the default path or SWITCHYARD_CONFIG env var.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            env::var("SWITCHYARD_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }

        info!(path = %path.display(), "Loading configuration");

        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse, normalize and validate a TOML document.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content);

        debug!("Parsing TOML configuration");
        let mut config: SwitchyardConfig = toml::from_str(&content)?;
        config.fill_lane_names();
        config.validate()?;

        info!(
            lanes = config.lanes.len(),
            default_lane = %config.default_lane,
            handlers = config.handlers.len(),
            max_retries = config.retry.max_retries,
            "Configuration loaded"
        );

        Ok(config)
    }

    fn fill_lane_names(&mut self) {
        for (name, lane) in self.lanes.iter_mut() {
            lane.name = name.clone();
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.lanes.get(&self.default_lane) {
            None => {
                return Err(ConfigError::ValidationError(format!(
                    "default lane '{}' is not configured",
                    self.default_lane
                )))
            }
            Some(lane) if !lane.enabled => {
                return Err(ConfigError::ValidationError(format!(
                    "default lane '{}' must be enabled",
                    self.default_lane
                )))
            }
            Some(_) => {}
        }

        for (name, lane) in &self.lanes {
            if name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "lane names must not be empty".to_string(),
                ));
            }
            if lane.concurrency == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "lane '{}' concurrency must be at least 1",
                    name
                )));
            }
        }

        if !self.retry.backoff_multiplier.is_finite() || self.retry.backoff_multiplier <= 0.0 {
            return Err(ConfigError::ValidationError(
                "retry.backoff_multiplier must be a positive number".to_string(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            warn!(
                multiplier = self.retry.backoff_multiplier,
                "Backoff multiplier below 1.0, retry delays will shrink"
            );
        }

        if self.processor.pop_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "processor.pop_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.health.interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "health.interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.health.record_ttl_secs == 0 {
            return Err(ConfigError::ValidationError(
                "health.record_ttl_secs must be greater than 0".to_string(),
            ));
        }

        if let Some(lane) = &self.health.lane {
            if !self.lanes.contains_key(lane) {
                return Err(ConfigError::ValidationError(format!(
                    "health lane '{}' is not configured",
                    lane
                )));
            }
        }

        if self.store.backend == StoreBackend::Redis && self.store.url.contains("${") {
            warn!(
                url = %self.store.url,
                "Store URL contains unsubstituted environment variable"
            );
        }

        for (kind, handler_ref) in &self.handlers {
            if *kind == EventKind::Health {
                return Err(ConfigError::ValidationError(
                    "the health handler is built in and cannot be rebound".to_string(),
                ));
            }
            parse_handler_ref(handler_ref).ok_or_else(|| {
                ConfigError::ValidationError(format!(
                    "handler for '{}' has invalid reference '{}'",
                    kind, handler_ref
                ))
            })?;
        }

        for kind in EventKind::ALL {
            if kind != EventKind::Health && !self.handlers.contains_key(&kind) {
                warn!(
                    event_type = %kind,
                    "No handler bound, events of this type will be dropped"
                );
            }
        }

        Ok(())
    }

    /// Look up a lane by name.
    pub fn lane(&self, name: &str) -> Option<&LaneConfig> {
        self.lanes.get(name)
    }

    /// Lane used by the synthetic health probe.
    pub fn health_lane(&self) -> &str {
        match &self.health.lane {
            Some(lane) if self.lanes.get(lane).is_some_and(|l| l.enabled) => lane,
            _ => &self.default_lane,
        }
    }

    /// Build handler instances from the `[handlers]` table.
    pub fn build_handlers(&self) -> Vec<(EventKind, Arc<dyn Handler>)> {
        let mut handlers: Vec<(EventKind, Arc<dyn Handler>)> = Vec::new();

        for (kind, handler_ref) in &self.handlers {
            match parse_handler_ref(handler_ref) {
                Some(HandlerRef::Log(Some(prefix))) => {
                    handlers.push((*kind, Arc::new(LogHandler::with_prefix(prefix))));
                }
                Some(HandlerRef::Log(None)) => {
                    handlers.push((*kind, Arc::new(LogHandler::new())));
                }
                None => {
                    warn!(
                        event_type = %kind,
                        handler = %handler_ref,
                        "Skipping invalid handler reference"
                    );
                }
            }
        }

        handlers
    }
}

#[derive(Debug, PartialEq)]
enum HandlerRef<'a> {
    Log(Option<&'a str>),
}

fn parse_handler_ref(handler_ref: &str) -> Option<HandlerRef<'_>> {
    match handler_ref.split_once(':') {
        Some(("log", prefix)) if !prefix.is_empty() => Some(HandlerRef::Log(Some(prefix))),
        None if handler_ref == "log" => Some(HandlerRef::Log(None)),
        _ => None,
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    ENV_VAR_PATTERN
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            match env::var(var_name) {
                Ok(value) => value,
                Err(_) => {
                    debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                    caps[0].to_string()
                }
            }
        })
        .to_string()
}
