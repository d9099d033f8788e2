//! Balancer configuration, loaded from TOML.
//!
//! Every field has a default, so an empty file yields a working (balancing
//! only, no consolidation) configuration.
//!
//! ```toml
//! [loadbalancer]
//! threshold_class = "standard_deviation"
//! balancer_class = "minimize_sd"
//! enable_underload = true
//!
//! [mean_underload]
//! suspend_cpu = 5.0
//! resume_cpu = 40.0
//!
//! [intervals]
//! balance = "60s"
//! clear_stats = "5m"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use hostbal_state::MigrationKind;

use crate::error::{BalancerError, BalancerResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub loadbalancer: LoadBalancerConfig,
    pub clear_stats: ClearStatsConfig,
    pub step_threshold: StepThresholdConfig,
    pub standard_deviation: StandardDeviationConfig,
    pub mean_underload: MeanUnderloadConfig,
    pub intervals: IntervalsConfig,
}

/// Strategy selection and feature switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    pub threshold_class: String,
    pub balancer_class: String,
    pub underload_class: String,
    pub enable_balancer: bool,
    pub enable_underload: bool,
    /// How the balancer moves instances.
    pub migration_kind: MigrationKind,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            threshold_class: "standard_deviation".to_string(),
            balancer_class: "minimize_sd".to_string(),
            underload_class: "mean_underload".to_string(),
            enable_balancer: true,
            enable_underload: false,
            migration_kind: MigrationKind::Live,
        }
    }
}

/// Retention of host/instance stat rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClearStatsConfig {
    pub ttl_secs: u64,
    /// Extra retention covering clock skew between reporters and this node.
    pub clock_skew_secs: u64,
}

impl Default for ClearStatsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            clock_skew_secs: 0,
        }
    }
}

impl ClearStatsConfig {
    /// Rows created before this timestamp are expired at `now`.
    pub fn cutoff(&self, now: u64) -> u64 {
        now.saturating_sub(self.ttl_secs.saturating_add(self.clock_skew_secs))
    }
}

/// Static limits, in percent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StepThresholdConfig {
    pub cpu_limit: f64,
    pub memory_limit: f64,
}

impl Default for StepThresholdConfig {
    fn default() -> Self {
        Self {
            cpu_limit: 80.0,
            memory_limit: 80.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StandardDeviationConfig {
    /// `k` in `mean + k·stddev`.
    pub deviation_factor: f64,
}

impl Default for StandardDeviationConfig {
    fn default() -> Self {
        Self {
            deviation_factor: 1.0,
        }
    }
}

/// Consolidation thresholds, in percent.
///
/// Resume thresholds must be strictly above the suspend thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeanUnderloadConfig {
    pub suspend_cpu: f64,
    pub suspend_memory: f64,
    pub resume_cpu: f64,
    pub resume_memory: f64,
}

impl Default for MeanUnderloadConfig {
    fn default() -> Self {
        Self {
            suspend_cpu: 5.0,
            suspend_memory: 5.0,
            resume_cpu: 40.0,
            resume_memory: 40.0,
        }
    }
}

/// Periods of the control-loop entry points ("30s", "5m", or bare seconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntervalsConfig {
    pub balance: String,
    pub clear_stats: String,
    pub reconcile: String,
    pub confirm: String,
}

impl Default for IntervalsConfig {
    fn default() -> Self {
        Self {
            balance: "60s".to_string(),
            clear_stats: "5m".to_string(),
            reconcile: "60s".to_string(),
            confirm: "30s".to_string(),
        }
    }
}

/// Parsed tick periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickIntervals {
    pub balance: Duration,
    pub clear_stats: Duration,
    pub reconcile: Duration,
    pub confirm: Duration,
}

impl IntervalsConfig {
    pub fn parse(&self) -> BalancerResult<TickIntervals> {
        let field = |name: &str, value: &str| {
            parse_duration(value)
                .filter(|d| !d.is_zero())
                .ok_or_else(|| BalancerError::InvalidConfig(format!("intervals.{name}: {value:?}")))
        };
        Ok(TickIntervals {
            balance: field("balance", &self.balance)?,
            clear_stats: field("clear_stats", &self.clear_stats)?,
            reconcile: field("reconcile", &self.reconcile)?,
            confirm: field("confirm", &self.confirm)?,
        })
    }
}

impl BalancerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: BalancerConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check numeric settings. Strategy names are checked when the
    /// strategies are built.
    pub fn validate(&self) -> BalancerResult<()> {
        let u = &self.mean_underload;
        if u.resume_cpu <= u.suspend_cpu {
            return Err(BalancerError::InvalidConfig(format!(
                "mean_underload.resume_cpu ({}) must be greater than suspend_cpu ({})",
                u.resume_cpu, u.suspend_cpu
            )));
        }
        if u.resume_memory <= u.suspend_memory {
            return Err(BalancerError::InvalidConfig(format!(
                "mean_underload.resume_memory ({}) must be greater than suspend_memory ({})",
                u.resume_memory, u.suspend_memory
            )));
        }

        let k = self.standard_deviation.deviation_factor;
        if !k.is_finite() || k < 0.0 {
            return Err(BalancerError::InvalidConfig(format!(
                "standard_deviation.deviation_factor must be a non-negative number, got {k}"
            )));
        }

        if self.clear_stats.ttl_secs == 0 {
            return Err(BalancerError::InvalidConfig(
                "clear_stats.ttl_secs must be positive".to_string(),
            ));
        }

        self.intervals.parse()?;
        Ok(())
    }
}

/// Parse a duration string like "30s", "5m" or "120".
fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let secs = if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok()?
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok()?.checked_mul(60)?
    } else {
        s.parse::<u64>().ok()?
    };
    Some(Duration::from_secs(secs))
}
