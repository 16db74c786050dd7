//! Foreground tracking.
//!
//! A machine in a foreground state requires the runtime to keep pumping. The
//! tracker keeps one flag per machine and notifies listeners whenever the
//! aggregate (any machine foreground) flips.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Invoked with the new aggregate flag.
pub type ForegroundListener = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Default)]
pub struct ForegroundTracker {
    machines: Mutex<HashMap<String, bool>>,
    aggregate: AtomicBool,
    listeners: Mutex<Vec<ForegroundListener>>,
}

impl ForegroundTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if any machine is in a foreground state.
    pub fn is_foreground(&self) -> bool {
        self.aggregate.load(Ordering::SeqCst)
    }

    pub fn machine_foreground(&self, machine: &str) -> bool {
        self.machines.lock().get(machine).copied().unwrap_or(false)
    }

    pub fn add_listener(&self, listener: ForegroundListener) {
        self.listeners.lock().push(listener);
    }

    /// Records the foreground flag of one machine.
    pub fn set(&self, machine: &str, foreground: bool) {
        let changed = {
            let mut machines = self.machines.lock();
            machines.insert(machine.to_string(), foreground);
            let any = machines.values().any(|fg| *fg);
            self.aggregate.swap(any, Ordering::SeqCst) != any
        };
        if changed {
            self.notify();
        }
    }

    /// Forgets a machine.
    pub fn remove(&self, machine: &str) {
        let changed = {
            let mut machines = self.machines.lock();
            machines.remove(machine);
            let any = machines.values().any(|fg| *fg);
            self.aggregate.swap(any, Ordering::SeqCst) != any
        };
        if changed {
            self.notify();
        }
    }

    fn notify(&self) {
        let foreground = self.is_foreground();
        tracing::info!(
            "Runtime entered {}",
            if foreground { "foreground" } else { "background" }
        );
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener(foreground);
        }
    }
}
