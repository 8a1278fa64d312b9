//! Per-instance ownership leases
//!
//! At most one live engine drives any non-terminal instance. An engine
//! acquires the lease on pick-up, renews it on every heartbeat tick while
//! driving, and releases it on graceful stop. A failed renewal means
//! ownership was lost: the holder must stop dispatching new work and may
//! only persist the results of already-running units under an ownership
//! check. Stale instances are reclaimed by the maintenance worker.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::persistence::{Lease, StoreError, WorkflowStore};

/// Lease protocol driver for one engine process
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn WorkflowStore>,
    engine_id: String,
    ttl: Duration,
    heartbeat_interval: Duration,
}

/// Handle to a running heartbeat task
pub struct HeartbeatHandle {
    task: JoinHandle<()>,
    lost: watch::Receiver<bool>,
}

impl HeartbeatHandle {
    /// Receiver that flips to true when ownership is lost
    pub fn lost(&self) -> watch::Receiver<bool> {
        self.lost.clone()
    }

    /// Stop renewing
    pub fn stop(self) {
        self.task.abort();
    }
}

impl LeaseManager {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        engine_id: impl Into<String>,
        ttl: Duration,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            store,
            engine_id: engine_id.into(),
            ttl,
            heartbeat_interval,
        }
    }

    /// This engine's owner id
    pub fn engine_id(&self) -> &str {
        &self.engine_id
    }

    /// Try to acquire the lease; `None` means another engine holds it
    pub async fn acquire(&self, instance_id: Uuid) -> Result<Option<Lease>, StoreError> {
        let lease = self
            .store
            .acquire_lease(instance_id, &self.engine_id, self.ttl)
            .await?;

        if lease.is_some() {
            debug!(%instance_id, engine_id = %self.engine_id, "lease acquired");
        }
        Ok(lease)
    }

    /// Release the lease on graceful stop (best effort)
    pub async fn release(&self, instance_id: Uuid) -> Result<(), StoreError> {
        self.store
            .release_lease(instance_id, &self.engine_id)
            .await?;
        debug!(%instance_id, engine_id = %self.engine_id, "lease released");
        Ok(())
    }

    /// Spawn the renewal loop for one owned instance
    ///
    /// The returned handle exposes an ownership-lost signal. A lost
    /// renewal is final: the loop stops and the signal stays set.
    pub fn spawn_heartbeat(&self, instance_id: Uuid) -> HeartbeatHandle {
        let (lost_tx, lost_rx) = watch::channel(false);
        let store = self.store.clone();
        let engine_id = self.engine_id.clone();
        let ttl = self.ttl;
        let interval = self.heartbeat_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // Consume the immediate first tick; the lease was just acquired
            ticker.tick().await;
            let mut consecutive_errors: u32 = 0;

            loop {
                ticker.tick().await;

                match store.renew_lease(instance_id, &engine_id, ttl).await {
                    Ok(true) => {
                        consecutive_errors = 0;
                    }
                    Ok(false) => {
                        warn!(%instance_id, %engine_id, "lease renewal rejected, ownership lost");
                        let _ = lost_tx.send(true);
                        return;
                    }
                    Err(e) => {
                        consecutive_errors += 1;
                        warn!(%instance_id, %engine_id, error = %e, consecutive_errors, "lease renewal failed");
                        // Persistent store trouble: assume ownership is gone
                        // so the dispatcher suspends rather than split-brains
                        if consecutive_errors >= 3 {
                            let _ = lost_tx.send(true);
                            return;
                        }
                    }
                }
            }
        });

        info!(%instance_id, engine_id = %self.engine_id, "heartbeat started");
        HeartbeatHandle {
            task,
            lost: lost_rx,
        }
    }
}
