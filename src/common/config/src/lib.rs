//! Configuration management for Spillway.
//!
//! Provides runtime configuration for the retry executors and the device
//! memory model.

use std::fmt;
use std::str::FromStr;

use common_error::{SpillwayError, SpillwayResult};
use serde::{Deserialize, Serialize};

/// Global Spillway configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SpillwayConfig {
    /// Retry executor configuration.
    pub retry: RetryConfig,
    /// Device memory configuration.
    pub memory: MemoryConfig,
}

/// Retry executor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Upper bound on identical retries of one unit (`None` = unbounded).
    ///
    /// Once exceeded the executor gives up with an out-of-memory error.
    pub max_retries: Option<usize>,
    /// Enable retry metrics collection.
    pub collect_metrics: bool,
    /// Force out-of-memory signals to exercise the retry paths in tests.
    pub inject_oom: Option<OomInjectionConfig>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: None,
            collect_metrics: true,
            inject_oom: None,
        }
    }
}

impl RetryConfig {
    /// Bound the number of identical retries per unit.
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Enable or disable metrics collection.
    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.collect_metrics = enabled;
        self
    }

    /// Inject out-of-memory signals at the start of every retry block.
    pub fn with_injection(mut self, injection: OomInjectionConfig) -> Self {
        self.inject_oom = Some(injection);
        self
    }
}

/// Which signal an injected out-of-memory raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OomInjectionType {
    /// Inject `RetryOom`.
    #[default]
    Retry,
    /// Inject `SplitAndRetryOom`.
    SplitAndRetry,
}

impl fmt::Display for OomInjectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retry => f.write_str("RETRY"),
            Self::SplitAndRetry => f.write_str("SPLIT_AND_RETRY"),
        }
    }
}

impl FromStr for OomInjectionType {
    type Err = SpillwayError;

    fn from_str(s: &str) -> SpillwayResult<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "RETRY" => Ok(Self::Retry),
            "SPLIT_AND_RETRY" => Ok(Self::SplitAndRetry),
            other => Err(SpillwayError::invalid_parameter(format!(
                "unknown OOM injection type '{other}'"
            ))),
        }
    }
}

/// Out-of-memory injection settings.
///
/// The first `skip_count` allocations are let through, then the next
/// `num_ooms` allocations fail with the configured signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OomInjectionConfig {
    /// Signal to raise.
    pub oom_type: OomInjectionType,
    /// Number of allocations to fail.
    pub num_ooms: usize,
    /// Number of allocations to let through before failing.
    pub skip_count: usize,
}

impl Default for OomInjectionConfig {
    fn default() -> Self {
        Self {
            oom_type: OomInjectionType::Retry,
            num_ooms: 1,
            skip_count: 0,
        }
    }
}

impl OomInjectionConfig {
    /// Inject `num_ooms` retry signals.
    pub fn retry(num_ooms: usize) -> Self {
        Self {
            oom_type: OomInjectionType::Retry,
            num_ooms,
            skip_count: 0,
        }
    }

    /// Inject `num_ooms` split-and-retry signals.
    pub fn split_and_retry(num_ooms: usize) -> Self {
        Self {
            oom_type: OomInjectionType::SplitAndRetry,
            num_ooms,
            skip_count: 0,
        }
    }

    /// Let `skip_count` allocations through first.
    pub fn with_skip(mut self, skip_count: usize) -> Self {
        self.skip_count = skip_count;
        self
    }

    /// Parse a setting string.
    ///
    /// Accepts `"true"`/`"false"` or a comma separated list of
    /// `num_ooms=<n>`, `skip=<n>` and `type=RETRY|SPLIT_AND_RETRY`.
    /// `"false"` and the empty string disable injection.
    pub fn parse_setting(s: &str) -> SpillwayResult<Option<Self>> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("false") {
            return Ok(None);
        }
        if s.eq_ignore_ascii_case("true") {
            return Ok(Some(Self::default()));
        }

        let mut config = Self::default();
        for part in s.split(',') {
            let (key, value) = part.split_once('=').ok_or_else(|| {
                SpillwayError::invalid_parameter(format!(
                    "expected key=value in OOM injection setting, got '{part}'"
                ))
            })?;
            let (key, value) = (key.trim(), value.trim());
            match key.to_ascii_lowercase().as_str() {
                "num_ooms" => config.num_ooms = parse_count(key, value)?,
                "skip" => config.skip_count = parse_count(key, value)?,
                "type" => config.oom_type = value.parse()?,
                other => {
                    return Err(SpillwayError::invalid_parameter(format!(
                        "unknown OOM injection key '{other}'"
                    )));
                }
            }
        }
        Ok(Some(config))
    }
}

impl fmt::Display for OomInjectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "num_ooms={},skip={},type={}",
            self.num_ooms, self.skip_count, self.oom_type
        )
    }
}

fn parse_count(key: &str, value: &str) -> SpillwayResult<usize> {
    value.parse().map_err(|e| {
        SpillwayError::invalid_parameter(format!("invalid value '{value}' for {key}: {e}"))
    })
}

/// Device memory configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Device memory limit in bytes (`None` = unlimited).
    pub device_limit: Option<usize>,
    /// Allow the catalog to move batches to host memory under pressure.
    pub spill_enabled: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            device_limit: None,
            spill_enabled: true,
        }
    }
}

impl MemoryConfig {
    /// Set the device memory limit.
    pub fn with_device_limit(mut self, limit: usize) -> Self {
        self.device_limit = Some(limit);
        self
    }

    /// Enable or disable spilling.
    pub fn with_spill(mut self, enabled: bool) -> Self {
        self.spill_enabled = enabled;
        self
    }
}
