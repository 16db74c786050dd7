//! Two-priority work queue and pump.

use crate::foreground::ForegroundTracker;
use crate::host::PumpHost;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// A unit of work.
pub type Task = Box<dyn FnOnce() + Send>;

/// Task priority. Transition work always drains before events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    /// State entry/exit and worker completions.
    Transition = 0,
    /// External events, self-posted events and timer firings.
    Event = 1,
}

impl Priority {
    fn index(self) -> usize {
        self as usize
    }
}

/// Why [`WorkQueue::pump_once`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// The queue is empty and nothing requires foreground execution.
    Parked,
    /// The pump left with work or a foreground state pending, and has already
    /// asked the host for another cycle.
    Rescheduled,
    /// A stop request was acknowledged; the queue is halted until
    /// [`WorkQueue::start`].
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpState {
    /// Not started, or halted by a stop request.
    Halted,
    /// Started with no pump active.
    Parked,
    /// A pump cycle was requested from the host.
    Scheduled,
    /// A pump is running.
    Draining,
}

/// Acknowledgement latch for a stop request.
#[derive(Clone, Default)]
pub struct StopHandle {
    latch: Arc<(Mutex<bool>, Condvar)>,
}

impl StopHandle {
    fn acknowledged() -> Self {
        let handle = Self::default();
        handle.release();
        handle
    }

    fn release(&self) {
        let (done, cond) = &*self.latch;
        *done.lock() = true;
        cond.notify_all();
    }

    pub fn is_acknowledged(&self) -> bool {
        *self.latch.0.lock()
    }

    /// Blocks until the pump acknowledges the stop.
    pub fn wait(&self) {
        let (done, cond) = &*self.latch;
        let mut done = done.lock();
        while !*done {
            cond.wait(&mut done);
        }
    }

    /// Blocks up to `timeout`. Returns true if the stop was acknowledged.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (done, cond) = &*self.latch;
        let mut done = done.lock();
        if !*done {
            cond.wait_for(&mut done, timeout);
        }
        *done
    }
}

struct StopRequest {
    handle: StopHandle,
    callback: Option<Task>,
}

enum Entry {
    Run(Task),
    Stop(StopRequest),
}

struct Inner {
    queues: [VecDeque<Entry>; 2],
    state: PumpState,
}

impl Inner {
    fn is_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }

    fn pop(&mut self) -> Option<Entry> {
        self.queues.iter_mut().find_map(VecDeque::pop_front)
    }
}

/// Queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub executed: u64,
    pub panicked: u64,
    pub pump_cycles: u64,
    pub pending_transition: usize,
    pub pending_event: usize,
}

/// Single-consumer, two-priority work queue.
pub struct WorkQueue {
    inner: Mutex<Inner>,
    cond: Condvar,
    host: Arc<dyn PumpHost>,
    foreground: Arc<ForegroundTracker>,
    this: Weak<WorkQueue>,
    executed: AtomicU64,
    panicked: AtomicU64,
    pump_cycles: AtomicU64,
}

impl WorkQueue {
    pub fn new(host: Arc<dyn PumpHost>, foreground: Arc<ForegroundTracker>) -> Arc<Self> {
        let queue = Arc::new_cyclic(|this: &Weak<WorkQueue>| Self {
            inner: Mutex::new(Inner {
                queues: [VecDeque::new(), VecDeque::new()],
                state: PumpState::Halted,
            }),
            cond: Condvar::new(),
            host,
            foreground: foreground.clone(),
            this: this.clone(),
            executed: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
            pump_cycles: AtomicU64::new(0),
        });

        // A pump blocked on a foreground state must re-check once the
        // runtime drops to background.
        let weak = Arc::downgrade(&queue);
        foreground.add_listener(Arc::new(move |_| {
            if let Some(queue) = weak.upgrade() {
                queue.wake();
            }
        }));
        queue
    }

    pub fn foreground(&self) -> &Arc<ForegroundTracker> {
        &self.foreground
    }

    /// Starts (or restarts after a stop) accepting pump requests. Requests a
    /// pump if work is already queued.
    pub fn start(&self) {
        let request = {
            let mut inner = self.inner.lock();
            match inner.state {
                PumpState::Halted if !inner.is_empty() => {
                    inner.state = PumpState::Scheduled;
                    true
                }
                PumpState::Halted => {
                    inner.state = PumpState::Parked;
                    false
                }
                _ => false,
            }
        };
        tracing::debug!("Work queue started");
        if request {
            self.request_pump();
        }
    }

    /// Appends a task. Wakes an active pump or asks the host for one.
    pub fn push(&self, priority: Priority, task: Task) {
        self.enqueue(priority, Entry::Run(task));
    }

    fn enqueue(&self, priority: Priority, entry: Entry) {
        let request = {
            let mut inner = self.inner.lock();
            inner.queues[priority.index()].push_back(entry);
            match inner.state {
                PumpState::Parked => {
                    inner.state = PumpState::Scheduled;
                    true
                }
                PumpState::Draining => {
                    self.cond.notify_one();
                    false
                }
                PumpState::Halted | PumpState::Scheduled => false,
            }
        };
        if request {
            self.request_pump();
        }
    }

    /// Asks the pump to finish the transition work queued so far and halt.
    ///
    /// The stop marker is queued behind existing transition work. Event work
    /// still pending when it runs stays queued for the next
    /// [`WorkQueue::start`]. A halted queue acknowledges immediately.
    pub fn request_stop(&self) -> StopHandle {
        self.stop_with(None)
    }

    /// Like [`WorkQueue::request_stop`], also running `callback` once the stop
    /// is acknowledged.
    pub fn request_stop_with(&self, callback: Task) -> StopHandle {
        self.stop_with(Some(callback))
    }

    fn stop_with(&self, callback: Option<Task>) -> StopHandle {
        if self.inner.lock().state == PumpState::Halted {
            if let Some(callback) = callback {
                callback();
            }
            return StopHandle::acknowledged();
        }
        let handle = StopHandle::default();
        self.enqueue(
            Priority::Transition,
            Entry::Stop(StopRequest {
                handle: handle.clone(),
                callback,
            }),
        );
        handle
    }

    /// Wakes a pump blocked waiting for work.
    pub fn wake(&self) {
        let _inner = self.inner.lock();
        self.cond.notify_all();
    }

    /// Drains the queue on the calling thread.
    ///
    /// Returns when both queues are empty and no machine is foreground, or
    /// when a stop request is reached. While any machine is foreground, an
    /// empty queue blocks instead of returning.
    pub fn pump_once(&self) -> PumpExit {
        self.inner.lock().state = PumpState::Draining;
        self.pump_cycles.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("Pump cycle started");

        let mut stop = None;
        loop {
            let entry = {
                let mut inner = self.inner.lock();
                loop {
                    if let Some(entry) = inner.pop() {
                        break Some(entry);
                    }
                    if !self.foreground.is_foreground() {
                        break None;
                    }
                    self.cond.wait(&mut inner);
                }
            };

            match entry {
                Some(Entry::Run(task)) => self.run(task),
                Some(Entry::Stop(request)) => {
                    stop = Some(request);
                    break;
                }
                None => break,
            }
        }

        if let Some(request) = stop {
            self.inner.lock().state = PumpState::Halted;
            tracing::info!("Work queue stopped");
            if let Some(callback) = request.callback {
                self.run(callback);
            }
            request.handle.release();
            return PumpExit::Stopped;
        }

        let reschedule = {
            let mut inner = self.inner.lock();
            let reschedule = !inner.is_empty() || self.foreground.is_foreground();
            inner.state = if reschedule {
                PumpState::Scheduled
            } else {
                PumpState::Parked
            };
            reschedule
        };

        if reschedule {
            self.request_pump();
            PumpExit::Rescheduled
        } else {
            tracing::trace!("Pump parked");
            PumpExit::Parked
        }
    }

    fn run(&self, task: Task) {
        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            self.panicked.fetch_add(1, Ordering::Relaxed);
            tracing::error!("Queued task panicked");
        }
        self.executed.fetch_add(1, Ordering::Relaxed);
    }

    fn request_pump(&self) {
        if let Some(queue) = self.this.upgrade() {
            self.host.request_pump(queue);
        }
    }

    /// Returns the number of queued entries at a priority.
    pub fn len(&self, priority: Priority) -> usize {
        self.inner.lock().queues[priority.index()].len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        QueueStats {
            executed: self.executed.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
            pump_cycles: self.pump_cycles.load(Ordering::Relaxed),
            pending_transition: inner.queues[0].len(),
            pending_event: inner.queues[1].len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{ManualHost, ThreadHost};
    use proptest::prelude::*;

    fn manual_queue() -> (Arc<ManualHost>, Arc<ForegroundTracker>, Arc<WorkQueue>) {
        let host = Arc::new(ManualHost::new());
        let foreground = Arc::new(ForegroundTracker::new());
        let queue = WorkQueue::new(host.clone(), foreground.clone());
        (host, foreground, queue)
    }

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Task {
        let log = log.clone();
        Box::new(move || log.lock().push(name))
    }

    #[test]
    fn test_transition_work_drains_first() {
        let (_, _, queue) = manual_queue();
        queue.start();
        let log = Arc::new(Mutex::new(Vec::new()));

        queue.push(Priority::Event, recorder(&log, "A"));
        queue.push(Priority::Transition, recorder(&log, "B"));
        queue.push(Priority::Event, recorder(&log, "C"));

        assert_eq!(queue.pump_once(), PumpExit::Parked);
        assert_eq!(*log.lock(), vec!["B", "A", "C"]);
    }

    #[test]
    fn test_push_requests_host_once() {
        let (host, _, queue) = manual_queue();
        queue.push(Priority::Event, Box::new(|| {}));
        assert_eq!(host.requests(), 0, "halted queue must not request a pump");

        queue.start();
        assert_eq!(host.requests(), 1);

        queue.push(Priority::Event, Box::new(|| {}));
        assert_eq!(host.requests(), 1, "pump already scheduled");

        queue.pump_once();
        queue.push(Priority::Event, Box::new(|| {}));
        assert_eq!(host.requests(), 2);
    }

    #[test]
    fn test_work_pushed_during_pump_runs_in_same_cycle() {
        let (host, _, queue) = manual_queue();
        queue.start();
        let log = Arc::new(Mutex::new(Vec::new()));

        let inner_queue = queue.clone();
        let inner_log = log.clone();
        queue.push(
            Priority::Event,
            Box::new(move || {
                inner_log.lock().push("event");
                let log = inner_log.clone();
                inner_queue.push(Priority::Transition, Box::new(move || log.lock().push("nested")));
            }),
        );
        queue.push(Priority::Event, recorder(&log, "later"));

        queue.pump_once();
        assert_eq!(*log.lock(), vec!["event", "nested", "later"]);
        assert_eq!(host.requests(), 1);
    }

    #[test]
    fn test_panicking_task_does_not_stop_pump() {
        let (_, _, queue) = manual_queue();
        queue.start();
        let log = Arc::new(Mutex::new(Vec::new()));

        queue.push(Priority::Event, Box::new(|| panic!("boom")));
        queue.push(Priority::Event, recorder(&log, "after"));
        queue.pump_once();

        assert_eq!(*log.lock(), vec!["after"]);
        let stats = queue.stats();
        assert_eq!(stats.panicked, 1);
        assert_eq!(stats.executed, 2);
    }

    #[test]
    fn test_stop_retains_event_work() {
        let (host, _, queue) = manual_queue();
        queue.start();
        let log = Arc::new(Mutex::new(Vec::new()));

        queue.push(Priority::Transition, recorder(&log, "transition"));
        queue.push(Priority::Event, recorder(&log, "event"));
        let handle = queue.request_stop_with(recorder(&log, "stopped"));
        assert!(!handle.is_acknowledged());

        assert_eq!(queue.pump_once(), PumpExit::Stopped);
        assert!(handle.is_acknowledged());
        assert_eq!(*log.lock(), vec!["transition", "stopped"]);
        assert_eq!(queue.len(Priority::Event), 1);

        let requests = host.requests();
        queue.push(Priority::Event, recorder(&log, "ignored-until-start"));
        assert_eq!(host.requests(), requests);

        queue.start();
        assert_eq!(host.requests(), requests + 1);
        queue.pump_once();
        assert_eq!(
            *log.lock(),
            vec!["transition", "stopped", "event", "ignored-until-start"]
        );
    }

    #[test]
    fn test_stop_on_halted_queue_acknowledges() {
        let (_, _, queue) = manual_queue();
        assert!(queue.request_stop().wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_foreground_pump_waits_for_work() {
        let foreground = Arc::new(ForegroundTracker::new());
        let queue = WorkQueue::new(Arc::new(ThreadHost), foreground.clone());
        foreground.set("m", true);
        queue.start();

        let (tx, rx) = std::sync::mpsc::channel();
        queue.push(
            Priority::Event,
            Box::new(move || {
                let _ = tx.send(std::thread::current().id());
            }),
        );
        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::sleep(Duration::from_millis(20));
        queue.push(
            Priority::Event,
            Box::new(move || {
                let _ = tx.send(std::thread::current().id());
            }),
        );
        let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first, second, "foreground pump should stay on its thread");

        let handle = queue.request_stop();
        assert!(handle.wait_timeout(Duration::from_secs(2)));
    }

    #[test]
    fn test_background_flip_releases_blocked_pump() {
        let (_, foreground, queue) = manual_queue();
        foreground.set("m", true);
        queue.start();

        let pump = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.pump_once())
        };
        std::thread::sleep(Duration::from_millis(20));
        foreground.set("m", false);

        assert_eq!(pump.join().unwrap(), PumpExit::Parked);
    }

    proptest! {
        #[test]
        fn prop_priority_then_fifo(priorities in proptest::collection::vec(0u8..2, 0..64)) {
            let (_, _, queue) = manual_queue();
            queue.start();
            let log = Arc::new(Mutex::new(Vec::new()));

            for (seq, p) in priorities.iter().enumerate() {
                let priority = if *p == 0 { Priority::Transition } else { Priority::Event };
                let log = log.clone();
                queue.push(priority, Box::new(move || log.lock().push((priority.index(), seq))));
            }
            queue.pump_once();

            let mut expected: Vec<(usize, usize)> = priorities
                .iter()
                .enumerate()
                .map(|(seq, p)| (*p as usize, seq))
                .collect();
            expected.sort();
            prop_assert_eq!(log.lock().clone(), expected);
        }
    }
}
