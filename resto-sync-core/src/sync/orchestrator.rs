//! Drains the operation log against the server.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::collapse::{collapse, CollapsedOperation, ReplayAction};
use crate::cache::EntityCache;
use crate::connectivity::ConnectivityMonitor;
use crate::entity::EntityId;
use crate::error::Result;
use crate::lock::{LockStatus, SyncLock};
use crate::oplog::OperationLog;
use crate::remote::{Remote, RemoteError, Submission};
use crate::storage::{put_json, KeyValueStore, LAST_SYNC_KEY};

/// Result of one drain attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Offline; nothing was attempted.
    Offline,
    /// Another drain holds the lock.
    AlreadyRunning,
    /// The log was empty.
    Idle,
    /// Every collapsed operation succeeded.
    Synced { replayed: usize },
    /// Some operations failed and stay queued.
    Partial {
        replayed: usize,
        failed: usize,
        remaining: usize,
    },
}

pub struct SyncOrchestrator {
    store: Arc<dyn KeyValueStore>,
    cache: Arc<EntityCache>,
    log: Arc<OperationLog>,
    lock: SyncLock,
    monitor: ConnectivityMonitor,
    remote: Arc<dyn Remote>,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        cache: Arc<EntityCache>,
        log: Arc<OperationLog>,
        lock: SyncLock,
        monitor: ConnectivityMonitor,
        remote: Arc<dyn Remote>,
    ) -> Self {
        Self {
            store,
            cache,
            log,
            lock,
            monitor,
            remote,
        }
    }

    /// Replays every pending operation once.
    ///
    /// Remote failures are not errors: the affected operations stay queued
    /// and show up in [`DrainOutcome::Partial`]. Only storage failures are
    /// returned as `Err`, and the lock is released on every path.
    pub async fn drain(&self) -> Result<DrainOutcome> {
        if !self.monitor.is_online() {
            tracing::debug!("Offline, skipping drain");
            return Ok(DrainOutcome::Offline);
        }

        let Some(guard) = self.lock.try_acquire()? else {
            return Ok(DrainOutcome::AlreadyRunning);
        };

        let pending = self.log.list();
        if pending.is_empty() {
            self.stamp_last_sync()?;
            guard.release()?;
            return Ok(DrainOutcome::Idle);
        }

        let collapsed = collapse(pending);
        tracing::info!(groups = collapsed.len(), "Draining operation log");

        let mut replayed = 0;
        let mut failed = 0;
        for op in &collapsed {
            if self.replay(op).await? {
                replayed += 1;
            } else {
                failed += 1;
            }
        }

        let remaining = self.log.len();
        if remaining == 0 {
            self.stamp_last_sync()?;
        }
        guard.release()?;

        let outcome = if failed == 0 && remaining == 0 {
            DrainOutcome::Synced { replayed }
        } else {
            DrainOutcome::Partial {
                replayed,
                failed,
                remaining,
            }
        };
        tracing::info!(?outcome, "Drain finished");
        Ok(outcome)
    }

    /// True while some drain holds a live lock.
    pub fn is_draining(&self) -> bool {
        matches!(self.lock.status(), Ok(LockStatus::Held { .. }))
    }

    /// When a drain last finished with nothing left queued.
    pub fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        let contents = match self.store.get(LAST_SYNC_KEY) {
            Ok(contents) => contents?,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read last sync time");
                return None;
            }
        };
        serde_json::from_str(&contents).ok()
    }

    fn stamp_last_sync(&self) -> Result<()> {
        put_json(self.store.as_ref(), LAST_SYNC_KEY, &Utc::now())?;
        Ok(())
    }

    /// Replays one collapsed operation. Returns whether it succeeded.
    async fn replay(&self, op: &CollapsedOperation) -> Result<bool> {
        let submission = match &op.action {
            ReplayAction::Discard => {
                self.log.remove_many(&op.sources)?;
                tracing::debug!(group = %op.group_key, "Discarded local-only record");
                return Ok(true);
            }
            ReplayAction::Create { record } => {
                let mut fields = record.fields();
                fields.remove("id");
                Submission::from_parts(fields, record.attachments())
            }
            ReplayAction::Update { id, patch } => {
                let mut fields = patch.fields();
                fields.insert("id".to_string(), Value::String(id.to_string()));
                Submission::from_parts(fields, patch.attachments())
            }
            ReplayAction::Delete { id } => {
                Submission::Json(serde_json::json!({ "id": id.as_str() }))
            }
        };

        let data = match self.remote.submit(&op.endpoint, submission).await {
            Ok(data) => data,
            Err(e) => {
                self.report_failure(op, &e);
                return Ok(false);
            }
        };

        if let ReplayAction::Create { record } = &op.action {
            let Some(permanent) = data.get("id").and_then(EntityId::from_value) else {
                self.report_failure(
                    op,
                    &RemoteError::Rejected {
                        message: "create response carried no id".to_string(),
                    },
                );
                return Ok(false);
            };

            // The create stays queued until the cache and the rest of the
            // log point at the permanent id.
            self.cache
                .promote(op.entity_type, record.id(), &permanent)?;
            let rewritten = self
                .log
                .rewrite_record_id(op.entity_type, record.id(), &permanent)?;
            self.log.remove_many(&op.sources)?;
            tracing::info!(
                entity_type = %op.entity_type,
                temp_id = %record.id(),
                id = %permanent,
                rewritten,
                "Record created on server"
            );
            return Ok(true);
        }

        self.log.remove_many(&op.sources)?;
        tracing::debug!(group = %op.group_key, endpoint = %op.endpoint, "Operation replayed");
        Ok(true)
    }

    fn report_failure(&self, op: &CollapsedOperation, error: &RemoteError) {
        tracing::warn!(
            group = %op.group_key,
            endpoint = %op.endpoint,
            error = %error,
            "Replay failed, keeping operations queued"
        );
    }
}
