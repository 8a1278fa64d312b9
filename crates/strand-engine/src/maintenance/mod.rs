//! Background maintenance
//!
//! A single-tenant loop that reclaims stale instances from dead engines,
//! garbage-collects old event rows, compacts terminal instances, and emits
//! aggregate counters.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::events::{EventKind, EventRecord};
use crate::persistence::{InstancePatch, InstanceStatus, StoreError, WorkflowStore};

/// Reason recorded on instances reclaimed from a dead owner
pub const REASON_OWNER_LOST: &str = "owner_lost";

/// Periodic maintenance worker
///
/// # Example
///
/// ```ignore
/// let worker = MaintenanceWorker::new(store, config);
/// let handle = worker.start();
/// // ... on shutdown
/// worker.stop();
/// ```
pub struct MaintenanceWorker {
    store: Arc<dyn WorkflowStore>,
    config: EngineConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

/// Summary of one maintenance sweep
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reclaimed: u64,
    pub events_purged: u64,
    pub instances_compacted: u64,
}

impl MaintenanceWorker {
    pub fn new(store: Arc<dyn WorkflowStore>, config: EngineConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            store,
            config,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Start the periodic loop
    pub fn start(&self) -> JoinHandle<()> {
        let store = self.store.clone();
        let config = self.config.clone();
        let mut shutdown = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.maintenance_interval);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                    _ = ticker.tick() => {
                        match sweep(&store, &config).await {
                            Ok(report) => {
                                if report != SweepReport::default() {
                                    info!(
                                        reclaimed = report.reclaimed,
                                        events_purged = report.events_purged,
                                        instances_compacted = report.instances_compacted,
                                        "maintenance sweep"
                                    );
                                }
                            }
                            Err(e) => warn!(error = %e, "maintenance sweep failed"),
                        }
                    }
                }
            }
        })
    }

    /// Signal the loop to stop
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Run one maintenance sweep
///
/// Exposed so operators and tests can trigger maintenance on demand.
pub async fn sweep(
    store: &Arc<dyn WorkflowStore>,
    config: &EngineConfig,
) -> Result<SweepReport, StoreError> {
    let mut report = SweepReport::default();

    // Reclaim instances whose owner stopped heartbeating: back to paused,
    // acquirable again
    let stale = store.list_stale_instances(config.stale_threshold).await?;
    for instance in stale {
        match store
            .update_instance_status(
                instance.id,
                InstanceStatus::Paused,
                InstancePatch::reason(REASON_OWNER_LOST),
            )
            .await
        {
            Ok(_) => {
                report.reclaimed += 1;
                if let Some(owner) = &instance.lease_owner {
                    let _ = store.release_lease(instance.id, owner).await;
                }
                let _ = store
                    .append_event(EventRecord::instance(
                        instance.id,
                        EventKind::OwnerTimeout,
                        json!({"former_owner": instance.lease_owner}),
                    ))
                    .await;
                info!(instance_id = %instance.id, former_owner = ?instance.lease_owner, "reclaimed stale instance");
            }
            // The owner came back (or a peer reclaimed first); leave it be
            Err(StoreError::InvalidTransition { .. }) => {}
            Err(e) => return Err(e),
        }
    }

    // Event GC and terminal-row compaction share the retention window
    let cutoff = Utc::now()
        - chrono::Duration::from_std(config.retention)
            .map_err(|e| StoreError::Database(e.to_string()))?;
    report.events_purged = store.purge_events_before(cutoff).await?;
    report.instances_compacted = store.compact_terminal_instances(cutoff).await?;

    // Aggregate counters for dashboards
    let counts = store.status_counts().await?;
    info!(
        running = counts.running,
        paused = counts.paused,
        failed_last_24h = counts.failed_last_24h,
        "instance counters"
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::DefinitionRef;
    use crate::persistence::{CreateInstanceOptions, InMemoryStore};
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sweep_reclaims_stale_instance() {
        let store: Arc<dyn WorkflowStore> = Arc::new(InMemoryStore::new());
        let config = EngineConfig::default().with_stale_threshold(Duration::from_millis(1));

        let instance = store
            .create_instance(
                &DefinitionRef::new("wf", 1),
                json!({}),
                json!({"frames": []}),
                CreateInstanceOptions::default(),
            )
            .await
            .unwrap();

        store
            .acquire_lease(instance.id, "engine-dead", Duration::from_secs(60))
            .await
            .unwrap();
        store
            .update_instance_status(instance.id, InstanceStatus::Running, InstancePatch::default())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;

        let report = sweep(&store, &config).await.unwrap();
        assert_eq!(report.reclaimed, 1);

        let reclaimed = store.load_instance(instance.id).await.unwrap().unwrap();
        assert_eq!(reclaimed.status, InstanceStatus::Paused);
        assert_eq!(reclaimed.status_reason.as_deref(), Some(REASON_OWNER_LOST));

        // The lease is gone: another engine can acquire immediately
        let lease = store
            .acquire_lease(instance.id, "engine-b", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(lease.is_some());
    }

    #[tokio::test]
    async fn test_sweep_is_idempotent() {
        let store: Arc<dyn WorkflowStore> = Arc::new(InMemoryStore::new());
        let config = EngineConfig::default().with_stale_threshold(Duration::from_millis(1));

        let report = sweep(&store, &config).await.unwrap();
        assert_eq!(report, SweepReport::default());
    }
}
