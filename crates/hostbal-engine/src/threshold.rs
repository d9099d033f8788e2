//! Threshold detection — pick the overloaded host, if any.
//!
//! ```text
//! step_threshold:      cpu% > cpu_limit  or  mem% > memory_limit
//! standard_deviation:  cpu% > μ_cpu + k·σ_cpu  or  mem% > μ_mem + k·σ_mem
//! ```
//!
//! σ is the population standard deviation over the snapshot hosts.

use tracing::debug;

use crate::config::BalancerConfig;
use crate::error::{BalancerError, BalancerResult};
use crate::stats::{FleetSnapshot, FleetStats, HostLoad};

/// Result of one detection pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// The host to relieve, if one exceeds the limits.
    pub candidate: Option<HostLoad>,
    /// Snapshot hosts other than the candidate.
    pub pool: Vec<HostLoad>,
    pub stats: FleetStats,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ThresholdStrategy {
    Step { cpu_limit: f64, memory_limit: f64 },
    StandardDeviation { deviation_factor: f64 },
}

impl ThresholdStrategy {
    pub fn from_config(config: &BalancerConfig) -> BalancerResult<Self> {
        match config.loadbalancer.threshold_class.as_str() {
            "step_threshold" => Ok(Self::Step {
                cpu_limit: config.step_threshold.cpu_limit,
                memory_limit: config.step_threshold.memory_limit,
            }),
            "standard_deviation" => Ok(Self::StandardDeviation {
                deviation_factor: config.standard_deviation.deviation_factor,
            }),
            other => Err(BalancerError::UnknownStrategy {
                axis: "threshold",
                name: other.to_string(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Step { .. } => "step_threshold",
            Self::StandardDeviation { .. } => "standard_deviation",
        }
    }

    pub fn indicate(&self, snapshot: &FleetSnapshot) -> Detection {
        let stats = FleetStats::of(&snapshot.hosts);

        let candidate = match *self {
            Self::Step {
                cpu_limit,
                memory_limit,
            } => snapshot
                .hosts
                .iter()
                .find(|h| h.cpu_percent > cpu_limit || h.memory_percent > memory_limit),
            Self::StandardDeviation { deviation_factor: k } => {
                let cpu_limit = stats.cpu_mean + k * stats.cpu_sd;
                let memory_limit = stats.memory_mean + k * stats.memory_sd;
                // Hosts are in id order, so keeping the first maximum breaks
                // CPU ties by lowest id.
                snapshot
                    .hosts
                    .iter()
                    .filter(|h| h.cpu_percent > cpu_limit || h.memory_percent > memory_limit)
                    .fold(None, |best: Option<&HostLoad>, h| match best {
                        Some(b) if b.cpu_percent >= h.cpu_percent => Some(b),
                        _ => Some(h),
                    })
            }
        };

        let candidate = candidate.cloned();
        let pool = match &candidate {
            Some(c) => snapshot.others(&c.host),
            None => snapshot.hosts.clone(),
        };
        if let Some(c) = &candidate {
            debug!(
                strategy = self.name(),
                host = %c.host,
                cpu = c.cpu_percent,
                memory = c.memory_percent,
                "overloaded host detected"
            );
        }

        Detection {
            candidate,
            pool,
            stats,
        }
    }
}
