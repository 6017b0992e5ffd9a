// Daemon settings: JSON config file plus environment overrides

use anyhow::{anyhow, Context, Result};
use orderpool_core::config::{ControllerConfig, ScalingMode};
use std::path::PathBuf;
use std::str::FromStr;

pub const ENV_CONFIG: &str = "ORDERPOOL_CONFIG";
pub const ENV_BROKER_HOST: &str = "ORDERPOOL_BROKER_HOST";
pub const ENV_TICK_MS: &str = "ORDERPOOL_TICK_MS";
pub const ENV_PROCESSING_MS: &str = "ORDERPOOL_PROCESSING_MS";
pub const ENV_SCALING_MODE: &str = "ORDERPOOL_SCALING_MODE";
pub const ENV_LOAD: &str = "ORDERPOOL_LOAD";
pub const ENV_LOG_FORMAT: &str = "ORDERPOOL_LOG_FORMAT";
pub const ENV_LOG_FILE: &str = "ORDERPOOL_LOG_FILE";

/// Built-in order producer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadMode {
    Off,
    /// One order every 0.5-2s
    Steady,
    /// Steady, plus a 5s burst at 100ms spacing every 30s
    #[default]
    Spiked,
}

impl FromStr for LoadMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" => Ok(LoadMode::Off),
            "steady" => Ok(LoadMode::Steady),
            "spiked" => Ok(LoadMode::Spiked),
            other => Err(anyhow!("unknown load mode `{}` (off|steady|spiked)", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            other => Err(anyhow!("unknown log format `{}` (json|pretty)", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub controller: ControllerConfig,
    pub load: LoadMode,
    pub log_format: LogFormat,
    pub log_file: Option<PathBuf>,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve settings through `lookup` (env var name -> value)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut controller = match lookup(ENV_CONFIG) {
            Some(path) => {
                let json = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading config file {}", path))?;
                ControllerConfig::from_json_str(&json)
                    .with_context(|| format!("parsing config file {}", path))?
            }
            None => ControllerConfig::default(),
        };

        if let Some(host) = lookup(ENV_BROKER_HOST) {
            controller.broker_host = host;
        }
        if let Some(ms) = lookup(ENV_TICK_MS) {
            controller.tick_interval_ms = parse_number(ENV_TICK_MS, &ms)?;
        }
        if let Some(ms) = lookup(ENV_PROCESSING_MS) {
            controller.simulated_processing_ms = parse_number(ENV_PROCESSING_MS, &ms)?;
        }
        if let Some(mode) = lookup(ENV_SCALING_MODE) {
            controller.scaling_mode = ScalingMode::from_str(&mode)?;
        }
        controller.validate()?;

        let load = lookup(ENV_LOAD)
            .map(|s| LoadMode::from_str(&s))
            .transpose()?
            .unwrap_or_default();
        let log_format = lookup(ENV_LOG_FORMAT)
            .map(|s| LogFormat::from_str(&s))
            .transpose()?
            .unwrap_or_default();
        let log_file = lookup(ENV_LOG_FILE)
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        Ok(Self {
            controller,
            load,
            log_format,
            log_file,
        })
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .with_context(|| format!("{} must be a number, got `{}`", key, value))
}
