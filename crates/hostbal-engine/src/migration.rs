//! Migration orchestrator — live and cold moves with bookkeeping.
//!
//! Every move the engine issues gets a `MigrationRecord` before the
//! executor is called, so reconciliation can see it in flight:
//!
//! ```text
//! in_progress ──► finished ──► confirmed      (observed on the new host)
//!      │
//!      └────────► failed                      (no valid host / executor error)
//! ```
//!
//! Records become `finished` outside the orchestrator, when the instance
//! is reported on its new host. Only cold migrations need an explicit
//! confirmation from the executor.

use std::sync::Arc;

use tracing::{debug, info, warn};

use hostbal_state::*;

use crate::collaborators::{ExecutorReply, MigrationExecutor};
use crate::error::BalancerResult;

/// One instance move to issue.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationRequest {
    pub instance_id: InstanceId,
    pub source: HostId,
    /// `None` lets the external scheduler choose.
    pub destination: Option<HostId>,
    pub kind: MigrationKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MigrationOutcome {
    /// The executor accepted the move.
    Started(MigrationRecord),
    /// The executor found no host for the instance.
    NoValidHost,
}

impl MigrationOutcome {
    pub fn is_started(&self) -> bool {
        matches!(self, Self::Started(_))
    }
}

pub struct MigrationOrchestrator {
    store: StateStore,
    executor: Arc<dyn MigrationExecutor>,
}

impl MigrationOrchestrator {
    pub fn new(store: StateStore, executor: Arc<dyn MigrationExecutor>) -> Self {
        Self { store, executor }
    }

    /// Issue `request` with the mechanism its kind names.
    pub async fn migrate(&self, request: &MigrationRequest) -> BalancerResult<MigrationOutcome> {
        match request.kind {
            MigrationKind::Live => self.live_migrate(request).await,
            MigrationKind::Cold => self.cold_migrate(request).await,
        }
    }

    pub async fn live_migrate(
        &self,
        request: &MigrationRequest,
    ) -> BalancerResult<MigrationOutcome> {
        let record = self.record(request, MigrationKind::Live)?;
        let reply = self
            .executor
            .live_migrate(&request.instance_id, request.destination.as_deref())
            .await;
        self.settle(record, reply)
    }

    /// Resize-based move; the destination is always left to the scheduler.
    pub async fn cold_migrate(
        &self,
        request: &MigrationRequest,
    ) -> BalancerResult<MigrationOutcome> {
        let record = self.record(request, MigrationKind::Cold)?;
        let reply = self.executor.resize(&request.instance_id).await;
        self.settle(record, reply)
    }

    /// Confirm one finished migration.
    ///
    /// Returns false when the record is not `finished`, so a migration is
    /// confirmed at most once.
    pub async fn confirm_migration(&self, record: &MigrationRecord) -> BalancerResult<bool> {
        if record.status != MigrationStatus::Finished {
            return Ok(false);
        }
        if record.kind == MigrationKind::Cold {
            self.executor.confirm_resize(&record.instance_id).await?;
        }
        self.store
            .set_migration_status(record.id, MigrationStatus::Confirmed)?;
        debug!(id = record.id, instance = %record.instance_id, "migration confirmed");
        Ok(true)
    }

    /// Confirm every finished migration. Returns how many were confirmed.
    ///
    /// A failed confirmation leaves the record `finished` for the next pass.
    pub async fn confirm_finished(&self) -> BalancerResult<u32> {
        let mut confirmed = 0;
        for record in self
            .store
            .list_migrations_with_status(MigrationStatus::Finished)?
        {
            match self.confirm_migration(&record).await {
                Ok(true) => confirmed += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    id = record.id,
                    instance = %record.instance_id,
                    error = %e,
                    "migration confirmation failed"
                ),
            }
        }
        Ok(confirmed)
    }

    fn record(
        &self,
        request: &MigrationRequest,
        kind: MigrationKind,
    ) -> BalancerResult<MigrationRecord> {
        let destination = match kind {
            MigrationKind::Live => request.destination.as_deref(),
            MigrationKind::Cold => None,
        };
        Ok(self
            .store
            .create_migration(&request.instance_id, &request.source, destination, kind)?)
    }

    fn settle(
        &self,
        record: MigrationRecord,
        reply: anyhow::Result<ExecutorReply>,
    ) -> BalancerResult<MigrationOutcome> {
        match reply {
            Ok(ExecutorReply::Accepted) => {
                info!(
                    id = record.id,
                    instance = %record.instance_id,
                    source = %record.source,
                    destination = record.destination.as_deref().unwrap_or("<scheduler>"),
                    "migration started"
                );
                Ok(MigrationOutcome::Started(record))
            }
            Ok(ExecutorReply::NoValidHost) => {
                self.store
                    .set_migration_status(record.id, MigrationStatus::Failed)?;
                warn!(instance = %record.instance_id, "no valid host for migration");
                Ok(MigrationOutcome::NoValidHost)
            }
            Err(e) => {
                self.store
                    .set_migration_status(record.id, MigrationStatus::Failed)?;
                Err(e.into())
            }
        }
    }
}
