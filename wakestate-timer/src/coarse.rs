//! Long-horizon coarse timer.
//!
//! Each arm spawns one tokio sleep task and aborts the previous one. The
//! timer trades precision for fewer re-arms:
//! - deadlines closer than the short horizon are ignored
//! - a deadline within the de-dup threshold of the armed one is a no-op
//! - sleeps are rounded up to the configured granularity

use crate::clock::Clock;
use crate::manager::TimerConfig;
use crate::wake::{WakeCallback, WakeTimer};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

#[derive(Default)]
struct CoarseState {
    deadline: Option<i64>,
    callback: Option<WakeCallback>,
    task: Option<JoinHandle<()>>,
}

/// Coarse wake timer driven by the tokio runtime.
pub struct CoarseTimer {
    handle: Handle,
    clock: Arc<dyn Clock>,
    min_delta_ms: i64,
    dedup_ms: i64,
    granularity_ms: i64,
    state: Arc<Mutex<CoarseState>>,
}

impl CoarseTimer {
    pub fn new(handle: Handle, clock: Arc<dyn Clock>, config: &TimerConfig) -> Self {
        Self {
            handle,
            clock,
            min_delta_ms: config.short_horizon_ms,
            dedup_ms: config.long_dedup_ms,
            granularity_ms: config.coarse_granularity_ms,
            state: Arc::new(Mutex::new(CoarseState::default())),
        }
    }

    fn round_up(&self, millis: i64) -> i64 {
        if millis <= 0 {
            return 0;
        }
        if self.granularity_ms <= 1 {
            return millis;
        }
        (millis + self.granularity_ms - 1) / self.granularity_ms * self.granularity_ms
    }
}

impl WakeTimer for CoarseTimer {
    fn arm(&self, deadline: i64, on_wake: WakeCallback) {
        let mut state = self.state.lock();
        let now = self.clock.now_millis();
        if deadline - now < self.min_delta_ms {
            return;
        }
        if let Some(current) = state.deadline {
            if (current - deadline).abs() < self.dedup_ms {
                return;
            }
        }

        if let Some(task) = state.task.take() {
            task.abort();
        }
        state.deadline = Some(deadline);
        state.callback = Some(on_wake);

        let sleep = self.round_up(deadline - now);
        tracing::debug!("Coarse timer armed in {}ms", sleep);

        let shared = self.state.clone();
        state.task = Some(self.handle.spawn(async move {
            tokio::time::sleep(Duration::from_millis(sleep as u64)).await;
            let callback = {
                let mut state = shared.lock();
                if state.deadline != Some(deadline) {
                    return;
                }
                state.deadline = None;
                state.task = None;
                state.callback.take()
            };
            if let Some(callback) = callback {
                callback();
            }
        }));
    }

    fn disarm(&self, deadline: i64) {
        let mut state = self.state.lock();
        if state.deadline != Some(deadline) {
            return;
        }
        state.deadline = None;
        state.callback = None;
        if let Some(task) = state.task.take() {
            task.abort();
        }
    }

    fn armed(&self) -> Option<i64> {
        self.state.lock().deadline
    }

    fn name(&self) -> &'static str {
        "coarse"
    }
}

impl Drop for CoarseTimer {
    fn drop(&mut self) {
        if let Some(task) = self.state.lock().task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use tokio::sync::mpsc;

    fn config(min_delta_ms: i64, dedup_ms: i64) -> TimerConfig {
        TimerConfig::default()
            .with_short_horizon_ms(min_delta_ms)
            .with_long_dedup_ms(dedup_ms)
            .with_coarse_granularity_ms(1)
    }

    fn channel_callback(tx: mpsc::UnboundedSender<u32>, tag: u32) -> WakeCallback {
        Arc::new(move || {
            let _ = tx.send(tag);
        })
    }

    #[tokio::test]
    async fn test_coarse_timer_fires() {
        let timer = CoarseTimer::new(Handle::current(), Arc::new(SystemClock), &config(0, 5));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let deadline = SystemClock.now_millis() + 20;
        timer.arm(deadline, channel_callback(tx, 7));
        assert_eq!(timer.armed(), Some(deadline));

        let tag = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timeout")
            .expect("channel closed");
        assert_eq!(tag, 7);
        assert_eq!(timer.armed(), None);
    }

    #[tokio::test]
    async fn test_coarse_timer_ignores_short_deadlines() {
        let timer = CoarseTimer::new(Handle::current(), Arc::new(SystemClock), &config(30_000, 30_000));
        let (tx, _rx) = mpsc::unbounded_channel();
        timer.arm(SystemClock.now_millis() + 1_000, channel_callback(tx, 1));
        assert_eq!(timer.armed(), None);
    }

    #[tokio::test]
    async fn test_coarse_timer_dedups_nearby_deadlines() {
        let timer = CoarseTimer::new(Handle::current(), Arc::new(SystemClock), &config(0, 30_000));
        let (tx, _rx) = mpsc::unbounded_channel();
        let now = SystemClock.now_millis();

        timer.arm(now + 60_000, channel_callback(tx.clone(), 1));
        timer.arm(now + 50_000, channel_callback(tx.clone(), 2));
        assert_eq!(timer.armed(), Some(now + 60_000));

        timer.arm(now + 100_000, channel_callback(tx, 3));
        assert_eq!(timer.armed(), Some(now + 100_000));
    }

    #[tokio::test]
    async fn test_coarse_timer_disarm() {
        let timer = CoarseTimer::new(Handle::current(), Arc::new(SystemClock), &config(0, 5));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let deadline = SystemClock.now_millis() + 30;
        timer.arm(deadline, channel_callback(tx.clone(), 1));
        timer.disarm(deadline);
        assert_eq!(timer.armed(), None);

        let result = tokio::time::timeout(Duration::from_millis(150), rx.recv()).await;
        assert!(result.is_err(), "disarmed timer should not fire");
        drop(tx);
    }

    #[test]
    fn test_round_up_to_granularity() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let timer = CoarseTimer::new(
            runtime.handle().clone(),
            Arc::new(SystemClock),
            &TimerConfig::default(),
        );
        assert_eq!(timer.round_up(0), 0);
        assert_eq!(timer.round_up(1), 1_000);
        assert_eq!(timer.round_up(1_000), 1_000);
        assert_eq!(timer.round_up(31_001), 32_000);
    }
}
