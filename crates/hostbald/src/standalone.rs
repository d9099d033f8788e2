//! Standalone collaborators.
//!
//! Without an external compute API the daemon drives:
//! - `RuleFilter`: honours `host_pattern` rules, keeps candidate order
//! - `SimulatedExecutor`: moves instances in the state store and finishes
//!   their migration records right away
//! - `CommandPower`: runs the `[power]` command templates
//! - `SimulatedPower`: logs power actions and derives MACs from host names

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use anyhow::{Context, bail};
use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, info, warn};

use hostbal_engine::{ExecutorReply, MigrationExecutor, PlacementFilter, PowerControl};
use hostbal_state::*;

use crate::config::PowerConfig;

// ── Placement ──────────────────────────────────────────────────

/// Applies `host_pattern` rules to candidate hosts.
///
/// A host matching a deny rule is dropped. When allow rules exist, a host
/// must match at least one of them. `ha_group` rules need group membership
/// this filter does not know about and are ignored.
pub struct RuleFilter;

impl PlacementFilter for RuleFilter {
    fn filter_hosts(
        &self,
        instance_id: &str,
        candidates: &[String],
        rules: &[LoadBalanceRule],
    ) -> Vec<String> {
        let mut allow = Vec::new();
        let mut deny = Vec::new();
        for rule in rules.iter().filter(|r| r.rule_type == RuleType::HostPattern) {
            match Regex::new(&rule.value) {
                Ok(re) if rule.allow => allow.push(re),
                Ok(re) => deny.push(re),
                Err(e) => warn!(id = rule.id, error = %e, "skipping invalid host pattern"),
            }
        }

        let permitted: Vec<String> = candidates
            .iter()
            .filter(|host| !deny.iter().any(|re| re.is_match(host)))
            .filter(|host| allow.is_empty() || allow.iter().any(|re| re.is_match(host)))
            .cloned()
            .collect();
        debug!(
            instance = instance_id,
            candidates = candidates.len(),
            permitted = permitted.len(),
            "placement filtered"
        );
        permitted
    }
}

// ── Migration execution ────────────────────────────────────────

/// Executes migrations against the state store only.
pub struct SimulatedExecutor {
    store: StateStore,
}

impl SimulatedExecutor {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    fn move_to(&self, instance_id: &str, destination: &str) -> anyhow::Result<ExecutorReply> {
        let Some(node) = self.store.get_node(destination)? else {
            return Ok(ExecutorReply::NoValidHost);
        };
        if !node.suspend_state.is_active() {
            return Ok(ExecutorReply::NoValidHost);
        }
        self.store.move_instance(instance_id, destination)?;
        self.store
            .finish_migrations_for_instance(instance_id, destination)?;
        info!(instance = instance_id, %destination, "simulated migration finished");
        Ok(ExecutorReply::Accepted)
    }

    /// First active host, by id, that is not the instance's current host
    /// and has unallocated memory for it.
    fn schedule(&self, instance: &InstanceRecord) -> anyhow::Result<Option<String>> {
        let instances = self.store.list_instances()?;
        for node in self.store.list_nodes_in(SuspendFilter::Active)? {
            if node.host == instance.host {
                continue;
            }
            let allocated: u64 = instances
                .iter()
                .filter(|i| i.host == node.host)
                .map(|i| i.memory_mb)
                .sum();
            if node.memory_total_mb.saturating_sub(allocated) >= instance.memory_mb {
                return Ok(Some(node.host));
            }
        }
        Ok(None)
    }

    fn instance(&self, instance_id: &str) -> anyhow::Result<InstanceRecord> {
        self.store
            .get_instance(instance_id)?
            .with_context(|| format!("unknown instance {instance_id}"))
    }
}

#[async_trait]
impl MigrationExecutor for SimulatedExecutor {
    async fn live_migrate(
        &self,
        instance_id: &str,
        destination: Option<&str>,
    ) -> anyhow::Result<ExecutorReply> {
        let instance = self.instance(instance_id)?;
        let destination = match destination {
            Some(d) => Some(d.to_string()),
            None => self.schedule(&instance)?,
        };
        match destination {
            Some(d) => self.move_to(instance_id, &d),
            None => Ok(ExecutorReply::NoValidHost),
        }
    }

    async fn resize(&self, instance_id: &str) -> anyhow::Result<ExecutorReply> {
        let instance = self.instance(instance_id)?;
        match self.schedule(&instance)? {
            Some(d) => self.move_to(instance_id, &d),
            None => Ok(ExecutorReply::NoValidHost),
        }
    }

    async fn confirm_resize(&self, instance_id: &str) -> anyhow::Result<()> {
        debug!(instance = instance_id, "simulated resize confirmed");
        Ok(())
    }
}

// ── Power ──────────────────────────────────────────────────────

/// Runs the configured power command templates.
pub struct CommandPower {
    config: PowerConfig,
}

impl CommandPower {
    pub fn new(config: PowerConfig) -> anyhow::Result<Self> {
        if !config.is_configured() {
            bail!("[power] needs mac_command, suspend_command and wake_command");
        }
        Ok(Self { config })
    }

    async fn run(template: Option<&str>, host: &str, mac: &str) -> anyhow::Result<String> {
        let template = template.context("power command not configured")?;
        let argv = render(template, host, mac);
        let Some((program, args)) = argv.split_first() else {
            bail!("empty power command");
        };

        debug!(%program, ?args, "running power command");
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .with_context(|| format!("spawning {program}"))?;
        if !output.status.success() {
            bail!(
                "{program} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Split a template on whitespace and substitute `{host}` and `{mac}`.
fn render(template: &str, host: &str, mac: &str) -> Vec<String> {
    template
        .split_whitespace()
        .map(|arg| arg.replace("{host}", host).replace("{mac}", mac))
        .collect()
}

#[async_trait]
impl PowerControl for CommandPower {
    async fn host_mac_address(&self, host: &str) -> anyhow::Result<String> {
        let mac = Self::run(self.config.mac_command.as_deref(), host, "").await?;
        if mac.is_empty() {
            bail!("mac command printed nothing for {host}");
        }
        Ok(mac)
    }

    async fn suspend_host(&self, host: &str) -> anyhow::Result<()> {
        Self::run(self.config.suspend_command.as_deref(), host, "").await?;
        info!(%host, "suspend command issued");
        Ok(())
    }

    async fn wake_host(&self, mac: &str) -> anyhow::Result<()> {
        Self::run(self.config.wake_command.as_deref(), "", mac).await?;
        info!(%mac, "wake command issued");
        Ok(())
    }
}

/// Logs power actions instead of performing them.
pub struct SimulatedPower;

#[async_trait]
impl PowerControl for SimulatedPower {
    async fn host_mac_address(&self, host: &str) -> anyhow::Result<String> {
        Ok(simulated_mac(host))
    }

    async fn suspend_host(&self, host: &str) -> anyhow::Result<()> {
        info!(%host, "simulated suspend");
        Ok(())
    }

    async fn wake_host(&self, mac: &str) -> anyhow::Result<()> {
        info!(%mac, "simulated wake");
        Ok(())
    }
}

/// Locally administered MAC derived from the host name.
fn simulated_mac(host: &str) -> String {
    let mut hasher = DefaultHasher::new();
    host.hash(&mut hasher);
    let bytes = hasher.finish().to_be_bytes();
    format!(
        "02:00:{:02x}:{:02x}:{:02x}:{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3]
    )
}
