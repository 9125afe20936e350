use crate::{Result, SchedulerError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level scheduler configuration, loadable from YAML.
///
/// Every section falls back to its defaults, so an empty file is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub queue: QueueConfig,
    pub engine: EngineConfig,
    pub profile: ProfileConfig,
    pub extenders: Vec<ExtenderConfig>,
    pub observability: ObservabilityConfig,
}

impl SchedulerConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            SchedulerError::invalid_config(
                format!("cannot read {}: {}", path.display(), e),
                "Pass an existing file to --config",
            )
        })?;
        Self::from_yaml(&text)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text).map_err(|e| {
            SchedulerError::invalid_config(
                format!("malformed configuration: {}", e),
                "Check the YAML against the documented sections: queue, engine, profile, extenders, observability",
            )
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the scheduler cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.engine.parallelism == 0 {
            return Err(SchedulerError::invalid_config(
                "engine.parallelism must be at least 1",
                "The default is 16",
            ));
        }
        if self.queue.backoff_multiplier == 0 {
            return Err(SchedulerError::invalid_config(
                "queue.backoff_multiplier must be at least 1",
                "Use 1 for constant backoff or 2 for doubling",
            ));
        }
        if self.queue.initial_backoff > self.queue.max_backoff {
            return Err(SchedulerError::invalid_config(
                "queue.initial_backoff_ms exceeds queue.max_backoff_ms",
                "Raise max_backoff_ms or lower initial_backoff_ms",
            ));
        }
        if self.observability.cycle_log_capacity == 0 {
            return Err(SchedulerError::invalid_config(
                "observability.cycle_log_capacity must be at least 1",
                "The default is 256",
            ));
        }
        Ok(())
    }
}

/// Retry and sweep settings of the scheduling queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Backoff after the first failure
    #[serde(rename = "initial_backoff_ms", with = "millis")]
    pub initial_backoff: Duration,
    /// Upper bound of the backoff
    #[serde(rename = "max_backoff_ms", with = "millis")]
    pub max_backoff: Duration,
    /// Growth factor per additional failure
    pub backoff_multiplier: u32,
    /// How often expired backoffs are moved to Active
    #[serde(rename = "backoff_flush_interval_ms", with = "millis")]
    pub backoff_flush_interval: Duration,
    /// How often the unschedulable set is swept
    #[serde(rename = "unschedulable_flush_interval_ms", with = "millis")]
    pub unschedulable_flush_interval: Duration,
    /// Dwell time after which an unschedulable unit is retried regardless of events
    #[serde(rename = "max_unschedulable_dwell_ms", with = "millis")]
    pub max_unschedulable_dwell: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2,
            backoff_flush_interval: Duration::from_secs(1),
            unschedulable_flush_interval: Duration::from_secs(30),
            max_unschedulable_dwell: Duration::from_secs(60),
        }
    }
}

/// Decision engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Workers evaluating nodes within one scoring stage
    pub parallelism: usize,
    /// Deadline for PreScore, Score and NormalizeScore of one pod
    #[serde(rename = "cycle_timeout_ms", with = "millis")]
    pub cycle_timeout: Duration,
    /// Fixed seed for the tie-break RNG; random when unset
    pub seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallelism: 16,
            cycle_timeout: Duration::from_secs(5),
            seed: None,
        }
    }
}

/// Enabled score plugins and their weights
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    pub plugins: Vec<PluginConfig>,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            plugins: vec![
                PluginConfig::new("LeastAllocated", 1),
                PluginConfig::new("BalancedAllocation", 1),
                PluginConfig::new("NodeAffinity", 2),
                PluginConfig::new("TaintToleration", 3),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Keep the entry but leave the plugin out of the profile
    #[serde(default)]
    pub disabled: bool,
}

impl PluginConfig {
    pub fn new(name: impl Into<String>, weight: u32) -> Self {
        Self {
            name: name.into(),
            weight,
            disabled: false,
        }
    }
}

fn default_weight() -> u32 {
    1
}

/// A legacy HTTP scoring extender
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtenderConfig {
    pub name: String,
    /// Base URL; the `prioritize` verb is appended
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(rename = "timeout_ms", with = "millis", default = "default_extender_timeout")]
    pub timeout: Duration,
    /// Skip this extender instead of failing the cycle when it errors
    #[serde(default)]
    pub ignorable: bool,
}

fn default_extender_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Read-only observability outputs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Number of recent cycles kept in the cycle log
    pub cycle_log_capacity: usize,
    /// Capacity of the scheduler event broadcast channel
    pub event_capacity: usize,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            cycle_log_capacity: 256,
            event_capacity: 1024,
        }
    }
}

/// Durations are written as integer milliseconds
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
