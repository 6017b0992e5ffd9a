//! Controller configuration.
//!
//! Loaded by the daemon from an optional JSON file plus environment
//! overrides. Defaults describe the standard three-class deployment:
//!
//! ```text
//! class     rank  min  max  prefetch  high_watermark
//! priority    3    1    3      1          10
//! express     2    1    2      5          10
//! standard    1    1    1     10           5
//! ```

use crate::domain::{PriorityRank, QueueClass};
use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Default scheduling tick (5s)
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 5_000;

/// Default simulated processing time per message (1s)
pub const DEFAULT_SIMULATED_PROCESSING_MS: u64 = 1_000;

/// Default bound on QueueStatus.recent_latencies
pub const DEFAULT_LATENCY_HISTORY: usize = 100;

/// How the scheduling loop sizes pools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingMode {
    /// Backlog-driven scaling within [min, max]
    #[default]
    Adaptive,
    /// Baseline: every class pinned at max_consumers, no scaling
    Fixed,
}

impl std::str::FromStr for ScalingMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "adaptive" => Ok(ScalingMode::Adaptive),
            "fixed" | "baseline" => Ok(ScalingMode::Fixed),
            other => Err(AppError::Config(format!("unknown scaling mode `{}`", other))),
        }
    }
}

/// Per-class pool limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassConfig {
    pub name: String,
    pub priority_rank: PriorityRank,
    pub min_consumers: usize,
    pub max_consumers: usize,
    pub prefetch_limit: u16,
    /// Backlog above which the pool grows by one per tick
    pub high_watermark: u64,
}

impl ClassConfig {
    pub fn new(
        class: &QueueClass,
        min_consumers: usize,
        max_consumers: usize,
        prefetch_limit: u16,
        high_watermark: u64,
    ) -> Self {
        Self {
            name: class.name().to_string(),
            priority_rank: class.priority_rank(),
            min_consumers,
            max_consumers,
            prefetch_limit,
            high_watermark,
        }
    }

    pub fn queue_class(&self) -> QueueClass {
        QueueClass::new(self.name.clone(), self.priority_rank)
    }

    /// Clamp a requested pool size into [min_consumers, max_consumers]
    pub fn clamp(&self, requested: usize) -> usize {
        requested.clamp(self.min_consumers, self.max_consumers)
    }
}

/// Full controller configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub broker_host: String,
    pub classes: Vec<ClassConfig>,
    pub tick_interval_ms: u64,
    /// Test/benchmark hook for the simulated processor
    pub simulated_processing_ms: u64,
    pub scaling_mode: ScalingMode,
    /// Optional cap on consumers across all classes
    pub max_total_consumers: Option<usize>,
    /// Consecutive empty ticks required before shrinking a pool
    pub scale_down_after_empty_ticks: u32,
    pub latency_history: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            classes: vec![
                ClassConfig::new(&QueueClass::priority(), 1, 3, 1, 10),
                ClassConfig::new(&QueueClass::express(), 1, 2, 5, 10),
                ClassConfig::new(&QueueClass::standard(), 1, 1, 10, 5),
            ],
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            simulated_processing_ms: DEFAULT_SIMULATED_PROCESSING_MS,
            scaling_mode: ScalingMode::Adaptive,
            max_total_consumers: None,
            scale_down_after_empty_ticks: 1,
            latency_history: DEFAULT_LATENCY_HISTORY,
        }
    }
}

impl ControllerConfig {
    /// Parse JSON (missing keys take defaults) and validate
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn simulated_processing(&self) -> Duration {
        Duration::from_millis(self.simulated_processing_ms)
    }

    pub fn class(&self, name: &str) -> Option<&ClassConfig> {
        self.classes.iter().find(|c| c.name == name)
    }

    /// Class configs, most urgent first
    pub fn classes_by_priority(&self) -> Vec<ClassConfig> {
        let mut classes = self.classes.clone();
        classes.sort_by(|a, b| {
            b.priority_rank
                .cmp(&a.priority_rank)
                .then_with(|| a.name.cmp(&b.name))
        });
        classes
    }

    /// Reject configurations the controller cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.broker_host.trim().is_empty() {
            return Err(AppError::Config("broker_host must not be empty".into()));
        }
        if self.classes.is_empty() {
            return Err(AppError::Config("at least one queue class is required".into()));
        }
        if self.tick_interval_ms == 0 {
            return Err(AppError::Config("tick_interval_ms must be > 0".into()));
        }
        if self.scale_down_after_empty_ticks == 0 {
            return Err(AppError::Config(
                "scale_down_after_empty_ticks must be >= 1".into(),
            ));
        }
        if self.latency_history == 0 {
            return Err(AppError::Config("latency_history must be > 0".into()));
        }

        let mut names = HashSet::new();
        let mut ranks = HashSet::new();
        for class in &self.classes {
            if class.name.trim().is_empty() {
                return Err(AppError::Config("class name must not be empty".into()));
            }
            if !names.insert(class.name.as_str()) {
                return Err(AppError::Config(format!("duplicate class `{}`", class.name)));
            }
            if !ranks.insert(class.priority_rank) {
                return Err(AppError::Config(format!(
                    "duplicate priority rank {} (class `{}`)",
                    class.priority_rank, class.name
                )));
            }
            if class.max_consumers == 0 || class.min_consumers > class.max_consumers {
                return Err(AppError::Config(format!(
                    "class `{}`: need 0 <= min_consumers <= max_consumers and max_consumers > 0 (got {}..{})",
                    class.name, class.min_consumers, class.max_consumers
                )));
            }
            if class.prefetch_limit == 0 {
                return Err(AppError::Config(format!(
                    "class `{}`: prefetch_limit must be > 0",
                    class.name
                )));
            }
        }
        Ok(())
    }
}
