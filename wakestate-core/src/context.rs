//! Running context and the handler scope.

use crate::definition::{Event, StateId};
use crate::error::CoreError;
use crate::machine::Machine;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// The mutable state of one machine instance.
///
/// Only ever mutated by tasks executing on the pump.
#[derive(Debug)]
pub struct RunningContext<C> {
    pub(crate) state: StateId,
    pub(crate) timers: BTreeMap<String, i64>,
    pub(crate) data: C,
    pub(crate) foreground: bool,
}

impl<C> RunningContext<C> {
    pub(crate) fn new(data: C) -> Self {
        Self {
            state: StateId::UNINITIALIZED,
            timers: BTreeMap::new(),
            data,
            foreground: false,
        }
    }

    pub fn state(&self) -> StateId {
        self.state
    }

    /// Active timer deadlines (unix millis).
    pub fn timers(&self) -> &BTreeMap<String, i64> {
        &self.timers
    }

    pub fn data(&self) -> &C {
        &self.data
    }

    pub fn is_foreground(&self) -> bool {
        self.foreground
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            state: self.state,
            timers: self.timers.clone(),
            foreground: self.foreground,
        }
    }
}

/// Point-in-time copy of the engine-owned part of a context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextSnapshot {
    pub state: StateId,
    pub timers: BTreeMap<String, i64>,
    pub foreground: bool,
}

/// What a handler sees while it runs.
pub struct Scope<'a, C> {
    machine: &'a Machine<C>,
    ctx: &'a mut RunningContext<C>,
}

impl<'a, C: Send + 'static> Scope<'a, C> {
    pub(crate) fn new(machine: &'a Machine<C>, ctx: &'a mut RunningContext<C>) -> Self {
        Self { machine, ctx }
    }

    pub fn machine(&self) -> &str {
        self.machine.name()
    }

    pub fn state(&self) -> StateId {
        self.ctx.state
    }

    pub fn data(&self) -> &C {
        &self.ctx.data
    }

    pub fn data_mut(&mut self) -> &mut C {
        &mut self.ctx.data
    }

    pub fn now_millis(&self) -> i64 {
        self.machine.now_millis()
    }

    /// Deadline of an active timer.
    pub fn timer_deadline(&self, id: &str) -> Option<i64> {
        self.ctx.timers.get(id).copied()
    }

    /// Starts a declared timer that is active in the current state.
    /// Returns false if it was already pending.
    pub fn start_timer(&mut self, id: &str, timeout: Duration) -> Result<bool, CoreError> {
        let deadline = self.now_millis() + timeout.as_millis() as i64;
        self.machine.start_timer(self.ctx, id, deadline)
    }

    /// Stops a pending timer. Returns false if it was not pending.
    pub fn stop_timer(&mut self, id: &str) -> bool {
        self.machine.stop_timer(self.ctx, id)
    }

    /// Queues an event for this machine behind already queued events.
    pub fn post_event(&self, event: Event) {
        self.machine.post_event(event);
    }
}
