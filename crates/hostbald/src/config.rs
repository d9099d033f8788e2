//! Daemon configuration: the engine's `BalancerConfig` plus the `[power]`
//! section used by the command-based power controller.
//!
//! ```toml
//! [power]
//! mac_command = "cat /etc/hostbal/macs/{host}"
//! suspend_command = "ssh {host} systemctl suspend"
//! wake_command = "wakeonlan {mac}"
//! ```

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use hostbal_engine::BalancerConfig;

/// Command templates. `{host}` and `{mac}` are substituted per argument;
/// commands are split on whitespace and run without a shell.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    pub mac_command: Option<String>,
    pub suspend_command: Option<String>,
    pub wake_command: Option<String>,
}

impl PowerConfig {
    pub fn is_configured(&self) -> bool {
        self.mac_command.is_some() && self.suspend_command.is_some() && self.wake_command.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct DaemonConfig {
    pub balancer: BalancerConfig,
    pub power: PowerConfig,
}

#[derive(Deserialize)]
struct PowerSection {
    #[serde(default)]
    power: PowerConfig,
}

impl DaemonConfig {
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let balancer = BalancerConfig::from_toml_str(content)?;
        let PowerSection { power } = toml::from_str(content)?;
        Ok(Self { balancer, power })
    }

    /// Load from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                Self::from_toml_str(&content)
                    .with_context(|| format!("parsing config {}", path.display()))
            }
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_section_is_optional() {
        let config =
            DaemonConfig::from_toml_str("[loadbalancer]\nenable_underload = true\n").unwrap();
        assert!(config.balancer.loadbalancer.enable_underload);
        assert_eq!(config.power, PowerConfig::default());
        assert!(!config.power.is_configured());
    }

    #[test]
    fn reads_power_commands() {
        let config = DaemonConfig::from_toml_str(
            r#"
[power]
mac_command = "cat /macs/{host}"
suspend_command = "ssh {host} systemctl suspend"
wake_command = "wakeonlan {mac}"

[step_threshold]
cpu_limit = 90.0
"#,
        )
        .unwrap();

        assert!(config.power.is_configured());
        assert_eq!(config.power.wake_command.as_deref(), Some("wakeonlan {mac}"));
        assert_eq!(config.balancer.step_threshold.cpu_limit, 90.0);
    }

    #[test]
    fn load_without_path_gives_defaults() {
        let config = DaemonConfig::load(None).unwrap();
        assert_eq!(config.balancer.loadbalancer.balancer_class, "minimize_sd");
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hostbal.toml");
        std::fs::write(&path, "[clear_stats]\nttl_secs = 60\n").unwrap();

        let config = DaemonConfig::load(Some(&path)).unwrap();
        assert_eq!(config.balancer.clear_stats.ttl_secs, 60);
    }
}
