//! # wakestate-queue
//!
//! Single-consumer, two-priority work queue that serializes every state
//! transition, event delivery and timer firing of the runtime.
//!
//! The consumer ("pump") does not own a thread. The host is asked to run
//! [`WorkQueue::pump_once`] whenever work arrives while no pump is active,
//! and the pump returns once the queue is empty and no machine requires
//! foreground execution.

pub mod foreground;
pub mod host;
pub mod queue;

pub use foreground::{ForegroundListener, ForegroundTracker};
pub use host::{ManualHost, PumpHost, ThreadHost};
pub use queue::{Priority, PumpExit, QueueStats, StopHandle, Task, WorkQueue};
