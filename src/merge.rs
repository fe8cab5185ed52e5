//! Background merge scheduler.
//!
//! Runs [`FactStore::merge_versions`] on a fixed interval in its own thread.
//! A failed merge is logged and left for the next tick; nothing is ever
//! reported back to writers or readers.
use crate::error::Result;
use crate::store::{FactStore, MergeOutcome};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Handle to the merge thread. Dropping it stops the thread, same as
/// [`MergeScheduler::stop`].
pub struct MergeScheduler {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl MergeScheduler {
    pub fn spawn(store: Arc<FactStore>, interval: Duration) -> Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name("merge".into())
            .spawn(move || {
                info!(interval_ms = interval.as_millis() as u64, "merge scheduler started");
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            merge_once(&store);
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("merge scheduler stopped");
            })?;
        Ok(Self {
            stop_tx,
            handle: Some(handle),
        })
    }

    /// Stop after the merge in progress, if any, finishes.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let _ = self.stop_tx.send(());
        if handle.join().is_err() {
            warn!("merge thread panicked");
        }
    }
}

impl Drop for MergeScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One merge attempt. Errors are logged, never returned.
pub fn merge_once(store: &FactStore) -> Option<MergeOutcome> {
    match store.merge_versions() {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            warn!(dir = %store.dir().display(), error = %e, "merge failed; retrying next cycle");
            None
        }
    }
}
