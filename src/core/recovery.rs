// src/core/recovery.rs

//! Fire-and-forget entry point into object recovery. The membership core
//! kicks recovery at an epoch and never awaits completion; the recovery
//! work itself belongs to the data path.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Handle used by the event serializer to start recovery after a
/// membership change committed a new epoch.
#[derive(Debug, Clone)]
pub struct RecoveryHandle {
    latest: Arc<AtomicU32>,
    tx: mpsc::UnboundedSender<u32>,
}

impl RecoveryHandle {
    /// Creates the handle and its worker task. The worker is a seam: it
    /// serializes overlapping recovery requests so the data path only ever
    /// sees the most recent epoch.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<u32>();
        let latest = Arc::new(AtomicU32::new(0));
        let observed = latest.clone();
        tokio::spawn(async move {
            while let Some(epoch) = rx.recv().await {
                if epoch < observed.load(Ordering::Acquire) {
                    // Superseded before it started; recovery always runs
                    // against the newest epoch.
                    continue;
                }
                info!("Recovery running at epoch {}", epoch);
            }
        });
        Self { latest, tx }
    }

    /// Starts recovery at `epoch`. Fire-and-forget; the core does not
    /// observe completion.
    pub fn start_recovery(&self, epoch: u32) {
        self.latest.store(epoch, Ordering::Release);
        if self.tx.send(epoch).is_err() {
            warn!("Recovery worker is gone; epoch {} not recovered", epoch);
        }
    }

    /// The most recently requested recovery epoch, 0 if none yet.
    pub fn latest_epoch(&self) -> u32 {
        self.latest.load(Ordering::Acquire)
    }
}
