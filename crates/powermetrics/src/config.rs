use powermetrics_capture::{SampleOptions, UnwindOptions};
use powermetrics_types::MAX_FRAME_DEPTH;
use std::error::Error;
use std::fmt;
use std::num::NonZeroUsize;
use std::time::Duration;

pub const INTERVAL_ENV: &str = "POWERMETRICS_INTERVAL_MS";
pub const HISTORY_ENV: &str = "POWERMETRICS_HISTORY";
pub const QUEUE_LABELS_ENV: &str = "POWERMETRICS_QUEUE_LABELS";
pub const STACKS_ENV: &str = "POWERMETRICS_STACKS";
pub const MAX_FRAMES_ENV: &str = "POWERMETRICS_MAX_FRAMES";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerMetricsConfig {
    pub sampling_interval: Duration,
    pub stored_samples: NonZeroUsize,
    pub capture_queue_labels: bool,
    pub capture_stacks: bool,
    pub max_frame_depth: NonZeroUsize,
}

impl Default for PowerMetricsConfig {
    fn default() -> Self {
        Self {
            sampling_interval: Duration::from_millis(500),
            stored_samples: NonZeroUsize::new(60)
                .expect("invariant violated: default stored_samples must be non-zero"),
            capture_queue_labels: true,
            capture_stacks: false,
            max_frame_depth: NonZeroUsize::new(MAX_FRAME_DEPTH)
                .expect("invariant violated: default max_frame_depth must be non-zero"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue {
        variable: &'static str,
        value: String,
        expected: &'static str,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue {
                variable,
                value,
                expected,
            } => write!(f, "invalid {variable}={value:?}: expected {expected}"),
        }
    }
}

impl Error for ConfigError {}

impl PowerMetricsConfig {
    /// Defaults overridden by `POWERMETRICS_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(value) = lookup(INTERVAL_ENV) {
            let millis = parse_non_zero(INTERVAL_ENV, &value)?;
            config.sampling_interval = Duration::from_millis(millis.get() as u64);
        }
        if let Some(value) = lookup(HISTORY_ENV) {
            config.stored_samples = parse_non_zero(HISTORY_ENV, &value)?;
        }
        if let Some(value) = lookup(QUEUE_LABELS_ENV) {
            config.capture_queue_labels = parse_flag(QUEUE_LABELS_ENV, &value)?;
        }
        if let Some(value) = lookup(STACKS_ENV) {
            config.capture_stacks = parse_flag(STACKS_ENV, &value)?;
        }
        if let Some(value) = lookup(MAX_FRAMES_ENV) {
            config.max_frame_depth = parse_non_zero(MAX_FRAMES_ENV, &value)?;
        }
        Ok(config)
    }

    pub fn sample_options(&self) -> SampleOptions {
        SampleOptions {
            capture_queue_labels: self.capture_queue_labels,
            capture_stacks: self.capture_stacks,
            unwind: UnwindOptions {
                max_depth: self.max_frame_depth,
                ..UnwindOptions::default()
            },
        }
    }
}

fn parse_non_zero(variable: &'static str, value: &str) -> Result<NonZeroUsize, ConfigError> {
    value
        .trim()
        .parse::<NonZeroUsize>()
        .map_err(|_| ConfigError::InvalidValue {
            variable,
            value: value.to_owned(),
            expected: "a positive integer",
        })
}

fn parse_flag(variable: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            variable,
            value: value.to_owned(),
            expected: "1/0, true/false, yes/no or on/off",
        }),
    }
}
