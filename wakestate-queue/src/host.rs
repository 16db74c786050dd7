//! Pump hosts.

use crate::queue::WorkQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Runs the pump on behalf of a [`WorkQueue`].
///
/// `request_pump` is called whenever work arrives and no pump is active. It
/// must arrange for [`WorkQueue::pump_once`] to run later on some execution
/// context and must not run it synchronously.
pub trait PumpHost: Send + Sync {
    fn request_pump(&self, queue: Arc<WorkQueue>);
}

/// Runs every pump cycle on a fresh OS thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadHost;

impl PumpHost for ThreadHost {
    fn request_pump(&self, queue: Arc<WorkQueue>) {
        let spawned = std::thread::Builder::new()
            .name("wakestate-pump".to_string())
            .spawn(move || {
                queue.pump_once();
            });
        if let Err(e) = spawned {
            tracing::error!("Failed to spawn pump thread: {}", e);
        }
    }
}

/// Records pump requests and leaves running the pump to the caller.
#[derive(Debug, Default)]
pub struct ManualHost {
    requests: AtomicUsize,
}

impl ManualHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pump requests received.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl PumpHost for ManualHost {
    fn request_pump(&self, _queue: Arc<WorkQueue>) {
        self.requests.fetch_add(1, Ordering::SeqCst);
    }
}
