// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lease heartbeat for ticks that may outlive the lock timeout.
//!
//! The default tick path does not use it. Code holding a lease across long
//! work spawns a [`LeaseKeeper`], which extends the lock every heartbeat
//! interval until stopped or dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::keys::FlowKeys;
use crate::lock::LockBackend;
use crate::model::FlowLease;

/// Background task extending one lease.
#[derive(Debug)]
pub struct LeaseKeeper {
    cancel: CancellationToken,
    held: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl LeaseKeeper {
    /// Extend `lease` to `ttl` every `interval`, starting one interval from now.
    pub fn spawn(
        lock: Arc<dyn LockBackend>,
        keys: FlowKeys,
        lease: FlowLease,
        ttl: Duration,
        interval: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let held = Arc::new(AtomicBool::new(true));

        let task_cancel = cancel.clone();
        let task_held = held.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = task_cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match lock.extend(&keys, &lease, ttl).await {
                    Ok(true) => debug!(flow_id = %lease.flow_id, "Lease extended"),
                    Ok(false) => {
                        warn!(flow_id = %lease.flow_id, "Lease lost, heartbeat stopped");
                        task_held.store(false, Ordering::Release);
                        break;
                    }
                    // Keep trying until the lease expires.
                    Err(e) => warn!(
                        flow_id = %lease.flow_id,
                        error = %e,
                        "Lease heartbeat failed"
                    ),
                }
            }
        });

        Self {
            cancel,
            held,
            handle: Some(handle),
        }
    }

    /// False once an extension found the lock taken by someone else.
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    /// Stop the heartbeat and report whether the lease was held throughout.
    pub async fn stop(mut self) -> bool {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        self.is_held()
    }
}

impl Drop for LeaseKeeper {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
