//! Background workers.
//!
//! Each worker descriptor owns one slot. A slot runs at most one worker
//! thread at a time and moves through
//! `Idle -> Running -> {Stopping | Finished} -> Idle`. A body returning while
//! the slot is `Running` produces exactly one completion, stamped with the
//! slot generation; a body returning while `Stopping` only acknowledges the
//! stop.

use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Terminal outcome of a worker body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Success,
    /// Domain failure.
    Failed(String),
    /// Gave up because cancellation was requested.
    Aborted,
}

/// A unit of background work bound to one or more states.
///
/// `run` executes on its own thread and must return promptly once `cancel`
/// is triggered. `stop` is called when cancellation is requested, for bodies
/// blocked on something the token cannot interrupt.
pub trait Worker: Send + Sync {
    fn run(&self, cancel: &CancellationToken) -> WorkerOutcome;

    fn stop(&self) {}
}

/// A worker built from a closure.
pub struct FnWorker<F> {
    body: F,
}

impl<F> FnWorker<F>
where
    F: Fn(&CancellationToken) -> WorkerOutcome + Send + Sync,
{
    pub fn new(body: F) -> Self {
        Self { body }
    }
}

impl<F> Worker for FnWorker<F>
where
    F: Fn(&CancellationToken) -> WorkerOutcome + Send + Sync,
{
    fn run(&self, cancel: &CancellationToken) -> WorkerOutcome {
        (self.body)(cancel)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotPhase {
    Idle,
    Running,
    Stopping,
    Finished,
}

struct SlotState {
    phase: SlotPhase,
    generation: u64,
    exited: u64,
    cancel: Option<CancellationToken>,
    worker: Option<Arc<dyn Worker>>,
    thread: Option<JoinHandle<()>>,
}

/// Invoked on the worker thread with the generation and outcome when a
/// running body completes.
pub(crate) type CompletionFn = Box<dyn FnOnce(u64, WorkerOutcome) + Send>;

pub(crate) struct WorkerSlot {
    name: String,
    state: Arc<(Mutex<SlotState>, Condvar)>,
}

impl WorkerSlot {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new((
                Mutex::new(SlotState {
                    phase: SlotPhase::Idle,
                    generation: 0,
                    exited: 0,
                    cancel: None,
                    worker: None,
                    thread: None,
                }),
                Condvar::new(),
            )),
        }
    }

    pub(crate) fn phase(&self) -> SlotPhase {
        self.state.0.lock().phase
    }

    /// Spawns the worker if the slot is idle. Returns the new generation.
    pub(crate) fn start(&self, worker: Arc<dyn Worker>, on_complete: CompletionFn) -> Option<u64> {
        let (lock, _) = &*self.state;
        let mut state = lock.lock();
        if state.phase != SlotPhase::Idle {
            return None;
        }

        state.generation += 1;
        let generation = state.generation;
        let cancel = CancellationToken::new();
        state.phase = SlotPhase::Running;
        state.cancel = Some(cancel.clone());
        state.worker = Some(worker.clone());

        let shared = self.state.clone();
        let name = self.name.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("wakestate-worker-{}", self.name))
            .spawn(move || {
                tracing::info!("Worker {} running", name);
                let outcome = match catch_unwind(AssertUnwindSafe(|| worker.run(&cancel))) {
                    Ok(outcome) => outcome,
                    Err(_) => WorkerOutcome::Failed("worker panicked".to_string()),
                };
                drop(worker);

                let (lock, cond) = &*shared;
                let completed = {
                    let mut state = lock.lock();
                    state.exited = state.exited.max(generation);
                    let completed =
                        state.phase == SlotPhase::Running && state.generation == generation;
                    if completed {
                        state.phase = SlotPhase::Finished;
                    }
                    cond.notify_all();
                    completed
                };

                if completed {
                    tracing::info!("Worker {} finished: {:?}", name, outcome);
                    on_complete(generation, outcome);
                } else {
                    tracing::debug!("Worker {} acknowledged stop", name);
                }
            });

        match spawned {
            Ok(handle) => {
                state.thread = Some(handle);
                Some(generation)
            }
            Err(e) => {
                tracing::error!("Failed to spawn worker {}: {}", self.name, e);
                state.phase = SlotPhase::Idle;
                state.cancel = None;
                state.worker = None;
                None
            }
        }
    }

    /// Consumes the completion of `generation`. Returns false if the slot was
    /// stopped or restarted since.
    pub(crate) fn collect(&self, generation: u64) -> bool {
        let (lock, _) = &*self.state;
        let thread = {
            let mut state = lock.lock();
            if state.phase != SlotPhase::Finished || state.generation != generation {
                return false;
            }
            state.phase = SlotPhase::Idle;
            state.cancel = None;
            state.worker = None;
            state.thread.take()
        };
        if let Some(thread) = thread {
            let _ = thread.join();
        }
        true
    }

    /// Requests cancellation and blocks until the body has returned.
    /// Logs a warning every `warn_every` while waiting.
    pub(crate) fn stop(&self, warn_every: Duration) {
        let (lock, cond) = &*self.state;
        let (generation, signal) = {
            let mut state = lock.lock();
            let phase = state.phase;
            match phase {
                SlotPhase::Idle => return,
                SlotPhase::Finished => {
                    // Completed but not collected: the pending completion
                    // becomes stale.
                    state.phase = SlotPhase::Idle;
                    state.cancel = None;
                    state.worker = None;
                    let thread = state.thread.take();
                    drop(state);
                    if let Some(thread) = thread {
                        let _ = thread.join();
                    }
                    return;
                }
                SlotPhase::Running => {
                    state.phase = SlotPhase::Stopping;
                    let signal = (state.cancel.clone(), state.worker.clone());
                    (state.generation, Some(signal))
                }
                SlotPhase::Stopping => (state.generation, None),
            }
        };

        if let Some((cancel, worker)) = signal {
            tracing::info!("Stopping worker {}", self.name);
            if let Some(cancel) = cancel {
                cancel.cancel();
            }
            if let Some(worker) = worker {
                worker.stop();
            }
        }

        let started = Instant::now();
        let mut state = lock.lock();
        while state.exited < generation {
            if cond.wait_for(&mut state, warn_every).timed_out() && state.exited < generation {
                tracing::warn!(
                    "Worker {} has not acknowledged stop after {:?}",
                    self.name,
                    started.elapsed()
                );
            }
        }

        if state.phase == SlotPhase::Stopping && state.generation == generation {
            state.phase = SlotPhase::Idle;
            state.cancel = None;
            state.worker = None;
            let thread = state.thread.take();
            drop(state);
            if let Some(thread) = thread {
                let _ = thread.join();
            }
            cond.notify_all();
        }
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        let state = self.state.0.lock();
        if let Some(cancel) = &state.cancel {
            cancel.cancel();
        }
    }
}
