//! Score plugin contract and the immutable profile built from it.

use crate::config::ProfileConfig;
use crate::plugins;
use crate::types::{HostScore, NodeInfo, WorkUnit};
use crate::{Result, SchedulerError};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Error returned by a plugin hook
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PluginError {
    pub message: String,
}

impl PluginError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub type PluginResult<T> = std::result::Result<T, PluginError>;

/// Optional hooks a plugin implements
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub pre_score: bool,
    pub normalize_score: bool,
}

/// Per-cycle scratch space, keyed by plugin name.
///
/// Written during PreScore, read during Score and NormalizeScore, and
/// dropped when the cycle ends.
#[derive(Default)]
pub struct CycleState {
    entries: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl CycleState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.entries.insert(key.into(), Box::new(value));
    }

    pub fn read<T: Any + Send + Sync>(&self, key: &str) -> PluginResult<&T> {
        self.entries
            .get(key)
            .ok_or_else(|| PluginError::new(format!("no cycle state under {}", key)))?
            .downcast_ref::<T>()
            .ok_or_else(|| PluginError::new(format!("cycle state under {} has another type", key)))
    }
}

/// A soft-preference scoring plugin.
///
/// `score` must return a value in `[0, MAX_NODE_SCORE]`. Plugins that
/// declare `normalize_score` must also leave every score in that range after
/// normalization.
pub trait ScorePlugin: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Called once per cycle with the whole feasible set
    fn pre_score(
        &self,
        _state: &mut CycleState,
        _unit: &WorkUnit,
        _nodes: &[NodeInfo],
    ) -> PluginResult<()> {
        Ok(())
    }

    /// Called once per feasible node, possibly from several threads
    fn score(&self, state: &CycleState, unit: &WorkUnit, node: &NodeInfo) -> PluginResult<i64>;

    /// Called once per cycle with this plugin's raw scores
    fn normalize_score(
        &self,
        _state: &CycleState,
        _unit: &WorkUnit,
        _scores: &mut [HostScore],
    ) -> PluginResult<()> {
        Ok(())
    }
}

/// A plugin together with its weight
#[derive(Clone)]
pub struct PluginDescriptor {
    pub plugin: Arc<dyn ScorePlugin>,
    pub weight: u32,
    pub capabilities: Capabilities,
}

impl PluginDescriptor {
    pub fn new(plugin: Arc<dyn ScorePlugin>, weight: u32) -> Self {
        let capabilities = plugin.capabilities();
        Self {
            plugin,
            weight,
            capabilities,
        }
    }

    pub fn name(&self) -> &str {
        self.plugin.name()
    }
}

impl std::fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("name", &self.name())
            .field("weight", &self.weight)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

/// Ordered set of enabled plugins, fixed for the life of the scheduler
#[derive(Debug, Clone, Default)]
pub struct Profile {
    plugins: Vec<PluginDescriptor>,
}

impl Profile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a plugin; names must be unique
    pub fn with_plugin(mut self, plugin: Arc<dyn ScorePlugin>, weight: u32) -> Result<Self> {
        if self.plugins.iter().any(|d| d.name() == plugin.name()) {
            return Err(SchedulerError::invalid_config(
                format!("plugin {} is listed twice", plugin.name()),
                "Each plugin may appear once in the profile",
            ));
        }
        self.plugins.push(PluginDescriptor::new(plugin, weight));
        Ok(self)
    }

    /// Build the profile from configuration, resolving names against the
    /// built-in plugins
    pub fn from_config(config: &ProfileConfig) -> Result<Self> {
        let mut profile = Self::new();
        for entry in config.plugins.iter().filter(|p| !p.disabled) {
            let plugin = plugins::by_name(&entry.name).ok_or_else(|| {
                SchedulerError::invalid_config(
                    format!("unknown score plugin {}", entry.name),
                    format!("Known plugins: {}", plugins::NAMES.join(", ")),
                )
            })?;
            profile = profile.with_plugin(plugin, entry.weight)?;
        }

        info!(
            "Score profile: {}",
            profile
                .plugins
                .iter()
                .map(|d| format!("{}={}", d.name(), d.weight))
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(profile)
    }

    pub fn plugins(&self) -> &[PluginDescriptor] {
        &self.plugins
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}
