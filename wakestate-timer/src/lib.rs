//! # wakestate-timer
//!
//! Timer subsystem for wakestate.
//!
//! Any number of named, scoped timers owned by any number of handler groups
//! are multiplexed onto exactly two wake primitives:
//! - a short-horizon precise timer ([`ShortTimer`])
//! - a long-horizon coarse timer ([`CoarseTimer`])
//!
//! Every wake re-evaluates all registrations across all groups and re-arms
//! both primitives to the nearest remaining deadlines.

pub mod clock;
pub mod coarse;
pub mod manager;
pub mod wake;

pub use clock::{Clock, ManualClock, SystemClock};
pub use coarse::CoarseTimer;
pub use manager::{GroupCallback, Scope, TimerConfig, TimerManager};
pub use wake::{ManualTimer, ShortTimer, WakeCallback, WakeTimer};
