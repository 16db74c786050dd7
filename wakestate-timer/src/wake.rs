//! Wake primitives.
//!
//! A wake primitive holds at most one armed deadline and invokes a callback
//! once that deadline passes. Primitives never invoke the callback from
//! inside `arm`, so callers may arm while holding their own locks.

use crate::clock::Clock;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Callback invoked when a primitive's deadline passes.
pub type WakeCallback = Arc<dyn Fn() + Send + Sync>;

/// A single OS-level wake timer.
pub trait WakeTimer: Send + Sync {
    /// Requests a wake at `deadline` (unix millis). Each primitive applies
    /// its own policy to decide whether the request replaces the armed one.
    fn arm(&self, deadline: i64, on_wake: WakeCallback);

    /// Cancels the armed deadline if it equals `deadline`.
    fn disarm(&self, deadline: i64);

    /// Returns the currently armed deadline.
    fn armed(&self) -> Option<i64>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

struct ShortState {
    deadline: Option<i64>,
    callback: Option<WakeCallback>,
    shutdown: bool,
}

struct ShortShared {
    state: Mutex<ShortState>,
    cond: Condvar,
    clock: Arc<dyn Clock>,
}

/// Precise short-horizon timer.
///
/// A dedicated thread waits on a condition variable until the armed
/// deadline. Arming only takes effect when the new deadline is earlier than
/// the armed one.
pub struct ShortTimer {
    shared: Arc<ShortShared>,
    thread: Option<JoinHandle<()>>,
}

impl ShortTimer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let shared = Arc::new(ShortShared {
            state: Mutex::new(ShortState {
                deadline: None,
                callback: None,
                shutdown: false,
            }),
            cond: Condvar::new(),
            clock,
        });

        let worker = shared.clone();
        let thread = std::thread::Builder::new()
            .name("wakestate-short-timer".to_string())
            .spawn(move || Self::run(worker))
            .ok();
        if thread.is_none() {
            tracing::error!("Failed to spawn short timer thread");
        }

        Self { shared, thread }
    }

    fn run(shared: Arc<ShortShared>) {
        let mut state = shared.state.lock();
        loop {
            if state.shutdown {
                return;
            }
            let Some(deadline) = state.deadline else {
                shared.cond.wait(&mut state);
                continue;
            };
            let now = shared.clock.now_millis();
            if deadline > now {
                shared
                    .cond
                    .wait_for(&mut state, Duration::from_millis((deadline - now) as u64));
                continue;
            }

            state.deadline = None;
            let callback = state.callback.take();
            drop(state);
            if let Some(callback) = callback {
                callback();
            }
            state = shared.state.lock();
        }
    }
}

impl WakeTimer for ShortTimer {
    fn arm(&self, deadline: i64, on_wake: WakeCallback) {
        let mut state = self.shared.state.lock();
        if state.deadline.is_some_and(|current| deadline >= current) {
            return;
        }
        tracing::debug!(
            "Short timer armed in {}ms",
            deadline - self.shared.clock.now_millis()
        );
        state.deadline = Some(deadline);
        state.callback = Some(on_wake);
        self.shared.cond.notify_one();
    }

    fn disarm(&self, deadline: i64) {
        let mut state = self.shared.state.lock();
        if state.deadline != Some(deadline) {
            return;
        }
        state.deadline = None;
        state.callback = None;
        self.shared.cond.notify_one();
    }

    fn armed(&self) -> Option<i64> {
        self.shared.state.lock().deadline
    }

    fn name(&self) -> &'static str {
        "short"
    }
}

impl Drop for ShortTimer {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.cond.notify_one();
        if let Some(thread) = self.thread.take() {
            // The last owner may be dropped from inside a wake callback.
            if thread.thread().id() != std::thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

#[derive(Default)]
struct ManualState {
    deadline: Option<i64>,
    callback: Option<WakeCallback>,
    history: Vec<i64>,
}

/// A wake primitive that only fires when told to. Used in tests.
///
/// Re-arming with the already armed deadline is a no-op; any other deadline
/// replaces it and is appended to [`ManualTimer::history`].
#[derive(Default)]
pub struct ManualTimer {
    name: &'static str,
    state: Mutex<ManualState>,
}

impl ManualTimer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(ManualState::default()),
        }
    }

    /// Every distinct deadline this primitive was armed with, in order.
    pub fn history(&self) -> Vec<i64> {
        self.state.lock().history.clone()
    }

    /// Clears the armed deadline and runs its callback. Returns false if
    /// nothing was armed.
    pub fn fire(&self) -> bool {
        let callback = {
            let mut state = self.state.lock();
            state.deadline = None;
            state.callback.take()
        };
        match callback {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }
}

impl WakeTimer for ManualTimer {
    fn arm(&self, deadline: i64, on_wake: WakeCallback) {
        let mut state = self.state.lock();
        if state.deadline == Some(deadline) {
            return;
        }
        state.deadline = Some(deadline);
        state.callback = Some(on_wake);
        state.history.push(deadline);
    }

    fn disarm(&self, deadline: i64) {
        let mut state = self.state.lock();
        if state.deadline == Some(deadline) {
            state.deadline = None;
            state.callback = None;
        }
    }

    fn armed(&self) -> Option<i64> {
        self.state.lock().deadline
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use std::sync::mpsc;

    fn short() -> ShortTimer {
        ShortTimer::new(Arc::new(SystemClock))
    }

    fn sender_callback(tx: mpsc::Sender<i64>, tag: i64) -> WakeCallback {
        let tx = Mutex::new(tx);
        Arc::new(move || {
            let _ = tx.lock().send(tag);
        })
    }

    #[test]
    fn test_short_timer_fires() {
        let timer = short();
        let (tx, rx) = mpsc::channel();
        let deadline = SystemClock.now_millis() + 30;
        timer.arm(deadline, sender_callback(tx, 1));
        assert_eq!(timer.armed(), Some(deadline));

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);
        assert_eq!(timer.armed(), None);
    }

    #[test]
    fn test_short_timer_only_moves_earlier() {
        let timer = short();
        let (tx, rx) = mpsc::channel();
        let now = SystemClock.now_millis();

        timer.arm(now + 200, sender_callback(tx.clone(), 1));
        timer.arm(now + 5_000, sender_callback(tx.clone(), 2));
        assert_eq!(timer.armed(), Some(now + 200));

        timer.arm(now + 20, sender_callback(tx, 3));
        assert_eq!(timer.armed(), Some(now + 20));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 3);
    }

    #[test]
    fn test_short_timer_disarm() {
        let timer = short();
        let (tx, rx) = mpsc::channel();
        let deadline = SystemClock.now_millis() + 50;
        timer.arm(deadline, sender_callback(tx, 1));

        timer.disarm(deadline + 1);
        assert_eq!(timer.armed(), Some(deadline));

        timer.disarm(deadline);
        assert_eq!(timer.armed(), None);
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_manual_timer_history() {
        let timer = ManualTimer::new("manual");
        let (tx, rx) = mpsc::channel();
        timer.arm(10, sender_callback(tx.clone(), 1));
        timer.arm(10, sender_callback(tx.clone(), 2));
        timer.arm(20, sender_callback(tx, 3));
        assert_eq!(timer.history(), vec![10, 20]);

        assert!(timer.fire());
        assert_eq!(rx.try_recv().unwrap(), 3);
        assert!(!timer.fire());
    }
}
