//! Running machines.
//!
//! A [`Machine`] pairs a validated definition with its running context. Every
//! method that touches the context runs as a task on the work queue pump, so
//! the context has a single writer. Workers and the timer subsystem only ever
//! push tasks.

use crate::context::{ContextSnapshot, RunningContext, Scope};
use crate::definition::{Event, MachineDefinition, Next, StateId, Subscriptions, TimerDescriptor};
use crate::error::{CoreError, HandlerError};
use crate::persist::Persister;
use crate::registry::Runtime;
use crate::worker::{WorkerOutcome, WorkerSlot};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use wakestate_queue::Priority;
use wakestate_timer::Scope as TimerScope;

/// Object-safe view of a registered machine, independent of its data type.
pub trait MachineControl: Send + Sync {
    fn name(&self) -> &str;

    /// Current state. Reads a mirror updated by the pump, so it may lag a
    /// transition in progress.
    fn state(&self) -> StateId;

    /// Queues an event at event priority.
    fn dispatch_event(&self, event: Event);

    fn subscriptions(&self) -> &Subscriptions;

    /// Stops every running worker and keeps workers from starting until
    /// [`MachineControl::resume_workers`]. Blocks until each worker returns.
    fn suspend_workers(&self);

    /// Queues a task starting the workers of the current state.
    fn resume_workers(&self);

    /// True once a transition targeted an undeclared state.
    fn is_halted(&self) -> bool;

    fn is_foreground(&self) -> bool;
}

pub(crate) struct Machine<C> {
    name: String,
    definition: MachineDefinition<C>,
    subscriptions: Subscriptions,
    runtime: Runtime,
    context: Mutex<RunningContext<C>>,
    /// Mirror of the current state read by timer validity scopes.
    state: Arc<AtomicI32>,
    workers: Vec<WorkerSlot>,
    persister: Mutex<Option<Persister>>,
    halted: AtomicBool,
    suspended: AtomicBool,
    this: Weak<Machine<C>>,
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl<C: Send + 'static> Machine<C> {
    /// Validates the definition, restores the durable context and queues
    /// entry into the starting state.
    pub(crate) fn spawn(
        mut definition: MachineDefinition<C>,
        data: C,
        runtime: Runtime,
    ) -> Result<Arc<Self>, CoreError> {
        definition.validate()?;

        let name = definition.name().to_string();
        let mut ctx = RunningContext::new(data);
        let mut start = definition
            .initial_state()
            .ok_or_else(|| CoreError::InvalidDefinition {
                machine: name.clone(),
                reason: "no initial state".to_string(),
            })?;

        let persister = match (&runtime.store, definition.is_store_enabled()) {
            (Some(store), true) => {
                let mut persister = Persister::new(name.clone(), store.clone());
                let restored = persister.load(&definition.fields, &mut ctx.data, |state| {
                    definition.get_state(state).is_some()
                });
                if let Some(restored) = restored {
                    start = definition.recovery_state().unwrap_or(restored.state);
                    ctx.timers = restored.timers;
                    ctx.timers.retain(|id, _| {
                        definition
                            .get_timer(id)
                            .map_or(false, |timer| timer.is_active(start))
                    });
                    tracing::info!(
                        "Machine {} recovering into state {} (persisted {})",
                        name,
                        start,
                        restored.state
                    );
                }
                Some(persister)
            }
            _ => None,
        };

        let workers = definition
            .workers
            .iter()
            .map(|worker| WorkerSlot::new(format!("{}.{}", name, worker.name())))
            .collect();
        let subscriptions = definition.subscriptions();

        let machine = Arc::new_cyclic(|this| Machine {
            name: name.clone(),
            definition,
            subscriptions,
            runtime: runtime.clone(),
            context: Mutex::new(ctx),
            state: Arc::new(AtomicI32::new(StateId::UNINITIALIZED.0)),
            workers,
            persister: Mutex::new(persister),
            halted: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            this: this.clone(),
        });

        let weak = Arc::downgrade(&machine);
        runtime.timers.register_group(
            &name,
            Arc::new(move |timer: &str| {
                if let Some(machine) = weak.upgrade() {
                    let timer = timer.to_string();
                    machine.push(Priority::Event, move |m| m.handle_timer(&timer));
                }
            }),
        );

        machine.push(Priority::Transition, move |m| {
            let mut ctx = m.context.lock();
            m.transition(&mut ctx, start, false);
        });

        tracing::info!("Registered machine {} (initial state {})", name, start);
        Ok(machine)
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn now_millis(&self) -> i64 {
        self.runtime.timers.clock().now_millis()
    }

    pub(crate) fn post_event(&self, event: Event) {
        self.push(Priority::Event, move |m| m.handle_event(event));
    }

    /// Queues a timer firing. A still pending registration is removed first
    /// so the firing is not treated as stale.
    pub(crate) fn fire_timer(&self, timer: &str) {
        self.runtime.timers.stop_timer(&self.name, timer);
        let timer = timer.to_string();
        self.push(Priority::Event, move |m| m.handle_timer(&timer));
    }

    pub(crate) fn start_timer(
        &self,
        ctx: &mut RunningContext<C>,
        id: &str,
        deadline: i64,
    ) -> Result<bool, CoreError> {
        let timer = self
            .definition
            .get_timer(id)
            .ok_or_else(|| CoreError::UndeclaredTimer {
                machine: self.name.clone(),
                timer: id.to_string(),
            })?;
        if !timer.is_active(ctx.state) {
            return Err(CoreError::TimerNotActive {
                machine: self.name.clone(),
                timer: id.to_string(),
                state: ctx.state.0,
            });
        }

        let started = self.runtime.timers.start_timer(
            &self.name,
            id,
            deadline,
            Some(self.timer_scope(timer)),
        );
        if started {
            ctx.timers.insert(id.to_string(), deadline);
        }
        Ok(started)
    }

    pub(crate) fn stop_timer(&self, ctx: &mut RunningContext<C>, id: &str) -> bool {
        let stopped = self.runtime.timers.stop_timer(&self.name, id);
        ctx.timers.remove(id).is_some() || stopped
    }

    pub(crate) fn snapshot(&self) -> ContextSnapshot {
        self.context.lock().snapshot()
    }

    pub(crate) fn with_data<R>(&self, f: impl FnOnce(&C) -> R) -> R {
        f(&self.context.lock().data)
    }

    fn push<F>(&self, priority: Priority, f: F)
    where
        F: FnOnce(&Machine<C>) + Send + 'static,
    {
        let Some(machine) = self.this.upgrade() else {
            return;
        };
        self.runtime
            .queue
            .push(priority, Box::new(move || f(&machine)));
    }

    fn timer_scope(&self, timer: &TimerDescriptor<C>) -> TimerScope {
        let state = self.state.clone();
        let owners = timer.states().to_vec();
        Arc::new(move || owners.contains(&StateId(state.load(Ordering::Acquire))))
    }

    /// Runs a handler with a scope over the context. Panics become errors.
    fn invoke<T>(
        &self,
        ctx: &mut RunningContext<C>,
        f: impl FnOnce(&mut Scope<'_, C>) -> Result<T, HandlerError>,
    ) -> Result<T, HandlerError> {
        match catch_unwind(AssertUnwindSafe(|| {
            let mut scope = Scope::new(self, ctx);
            f(&mut scope)
        })) {
            Ok(result) => result,
            Err(panic) => Err(CoreError::HandlerPanicked(panic_message(panic.as_ref())).into()),
        }
    }

    /// Runs the exit/enter protocol until an entry callback settles.
    fn transition(&self, ctx: &mut RunningContext<C>, target: StateId, crashing: bool) {
        let limit = self.runtime.config.max_transition_chain;
        let mut target = target;
        let mut hops = 0;

        loop {
            if self.definition.get_state(target).is_none() {
                self.halt(ctx, target);
                return;
            }

            hops += 1;
            if hops > limit {
                let error = CoreError::TransitionChainTooLong {
                    machine: self.name.clone(),
                    limit,
                };
                self.fail(ctx, "transition", &error, crashing);
                return;
            }

            if ctx.state.is_initialized() {
                let from = ctx.state;
                if let Err(e) = self.exit(ctx, target) {
                    if !crashing {
                        self.fail(ctx, "exit", &e, false);
                        if ctx.state == from {
                            self.resume_parked(ctx);
                        }
                        return;
                    }
                    tracing::error!(
                        "Machine {} exit from state {} failed while crashing: {}",
                        self.name,
                        from,
                        e
                    );
                }
                self.lapse_timers(ctx, from, target);
            }

            match self.enter(ctx, target) {
                Ok(Next::Stay) => {
                    self.settle(ctx);
                    return;
                }
                Ok(Next::To(next)) => target = next,
                Err(e) => {
                    self.fail(ctx, "entry", &e, crashing);
                    return;
                }
            }
        }
    }

    fn exit(&self, ctx: &mut RunningContext<C>, target: StateId) -> Result<(), HandlerError> {
        let from = ctx.state;
        tracing::debug!("Machine {} exiting state {}", self.name, from);

        let warn_every = self.runtime.config.worker_stop_warn;
        for (descriptor, slot) in self.definition.workers.iter().zip(&self.workers) {
            if !descriptor.is_active(target) {
                slot.stop(warn_every);
            }
        }

        match self.definition.get_state(from).and_then(|s| s.exit.as_ref()) {
            Some(exit) => self.invoke(ctx, |scope| exit(scope)),
            None => Ok(()),
        }
    }

    /// Drops timers scoped to the departed state. Timers also active in the
    /// target survive.
    fn lapse_timers(&self, ctx: &mut RunningContext<C>, from: StateId, target: StateId) {
        self.state.store(target.0, Ordering::Release);
        let dropped = self.runtime.timers.validate(&self.name);
        ctx.timers.retain(|id, _| {
            self.definition
                .get_timer(id)
                .map_or(false, |timer| timer.is_active(target))
        });
        if dropped > 0 {
            tracing::debug!(
                "Machine {} dropped {} timers leaving state {}",
                self.name,
                dropped,
                from
            );
        }
    }

    /// The state stays current after a failed exit. Its timers were never
    /// dropped, but its workers were stopped ahead of the exit callback.
    fn resume_parked(&self, ctx: &RunningContext<C>) {
        if !self.suspended.load(Ordering::Acquire) {
            self.start_workers(ctx);
        }
    }

    fn enter(&self, ctx: &mut RunningContext<C>, target: StateId) -> Result<Next, HandlerError> {
        let Some(descriptor) = self.definition.get_state(target) else {
            return Ok(Next::Stay);
        };
        tracing::debug!("Machine {} entering state {}", self.name, target);

        ctx.state = target;
        self.state.store(target.0, Ordering::Release);
        ctx.foreground = descriptor.is_foreground();
        self.runtime
            .queue
            .foreground()
            .set(&self.name, ctx.foreground);

        match descriptor.entry.as_ref() {
            Some(entry) => self.invoke(ctx, |scope| entry(scope)),
            None => Ok(Next::Stay),
        }
    }

    /// Arms the state's timers, starts its workers and saves.
    fn settle(&self, ctx: &mut RunningContext<C>) {
        let state = ctx.state;
        let now = self.now_millis();

        for timer in self.definition.timers.iter().filter(|t| t.is_active(state)) {
            let deadline = match (ctx.timers.get(timer.id()), timer.auto_timeout()) {
                (Some(deadline), _) => *deadline,
                (None, Some(timeout)) => now + timeout.as_millis() as i64,
                (None, None) => continue,
            };
            self.runtime.timers.start_timer(
                &self.name,
                timer.id(),
                deadline,
                Some(self.timer_scope(timer)),
            );
            ctx.timers.insert(timer.id().to_string(), deadline);
        }

        if !self.suspended.load(Ordering::Acquire) {
            self.start_workers(ctx);
        }

        self.save(ctx);
        tracing::info!("Machine {} settled in state {}", self.name, state);
    }

    fn start_workers(&self, ctx: &RunningContext<C>) {
        let descriptors = self.definition.workers.iter().zip(&self.workers);
        for (index, (descriptor, slot)) in descriptors.enumerate() {
            if !descriptor.is_active(ctx.state) {
                continue;
            }
            let worker = match catch_unwind(AssertUnwindSafe(|| (descriptor.factory)(&ctx.data))) {
                Ok(worker) => worker,
                Err(panic) => {
                    tracing::error!(
                        "Machine {} failed to build worker {}: {}",
                        self.name,
                        descriptor.name(),
                        panic_message(panic.as_ref())
                    );
                    continue;
                }
            };

            let weak = self.this.clone();
            let started = slot.start(
                worker,
                Box::new(move |generation, outcome| {
                    if let Some(machine) = weak.upgrade() {
                        machine.push(Priority::Transition, move |m| {
                            m.handle_worker_completion(index, generation, outcome)
                        });
                    }
                }),
            );
            if started.is_some() {
                tracing::debug!(
                    "Machine {} started worker {} in state {}",
                    self.name,
                    descriptor.name(),
                    ctx.state
                );
            }
        }
    }

    fn save(&self, ctx: &RunningContext<C>) {
        if !self.definition.is_store_enabled() {
            return;
        }
        let persists = self
            .definition
            .get_state(ctx.state)
            .map_or(false, |state| state.persists());
        if !persists {
            return;
        }
        if let Some(persister) = self.persister.lock().as_mut() {
            // Failures are logged and wiped by the persister.
            let _ = persister.save(ctx.state, &ctx.timers, &self.definition.fields, &ctx.data);
        }
    }

    fn fail(
        &self,
        ctx: &mut RunningContext<C>,
        what: &str,
        error: &dyn fmt::Display,
        crashing: bool,
    ) {
        tracing::error!(
            "Machine {} {} handler failed in state {}: {}",
            self.name,
            what,
            ctx.state,
            error
        );
        match self.definition.crash_state() {
            Some(crash) if !crashing && ctx.state != crash => {
                tracing::error!("Machine {} entering crash state {}", self.name, crash);
                self.transition(ctx, crash, true);
            }
            _ => {
                self.state.store(ctx.state.0, Ordering::Release);
                tracing::warn!("Machine {} parked in state {}", self.name, ctx.state);
            }
        }
    }

    fn halt(&self, ctx: &RunningContext<C>, target: StateId) {
        self.halted.store(true, Ordering::Release);
        tracing::error!(
            "Machine {} halted: state {} requested a transition to undeclared state {}",
            self.name,
            ctx.state,
            target
        );
    }

    fn after_handler(&self, ctx: &mut RunningContext<C>, what: &str, result: Result<Next, HandlerError>) {
        match result {
            Ok(Next::Stay) => self.save(ctx),
            Ok(Next::To(target)) => self.transition(ctx, target, false),
            Err(e) => self.fail(ctx, what, &e, false),
        }
    }

    fn handle_event(&self, event: Event) {
        let mut ctx = self.context.lock();
        if self.halted.load(Ordering::Acquire) {
            tracing::debug!("Machine {} halted, dropping event {}", self.name, event.id);
            return;
        }
        if !ctx.state.is_initialized() {
            tracing::warn!("Machine {} not started, dropping event {}", self.name, event.id);
            return;
        }

        let handler = self
            .definition
            .get_state(ctx.state)
            .and_then(|state| state.handler_for(&event.id));
        let Some(handler) = handler else {
            tracing::warn!(
                "Machine {} unhandled event {} in state {}",
                self.name,
                event.id,
                ctx.state
            );
            return;
        };

        tracing::debug!("Machine {} handling event {} in state {}", self.name, event.id, ctx.state);
        let result = self.invoke(&mut ctx, |scope| handler(scope, &event));
        self.after_handler(&mut ctx, "event", result);
    }

    fn handle_timer(&self, id: &str) {
        let mut ctx = self.context.lock();
        if self.halted.load(Ordering::Acquire) {
            return;
        }
        let Some(timer) = self.definition.get_timer(id) else {
            tracing::warn!("Machine {} fired undeclared timer {}", self.name, id);
            return;
        };
        if !timer.is_active(ctx.state) {
            tracing::debug!("Machine {} dropped timer {} outside its states", self.name, id);
            return;
        }
        // A registration still pending means this firing belongs to an
        // earlier one.
        if self.runtime.timers.pending(&self.name, id).is_some() {
            tracing::debug!("Machine {} dropped stale firing of timer {}", self.name, id);
            return;
        }
        if ctx.timers.remove(id).is_none() {
            tracing::debug!("Machine {} dropped timer {} that is not running", self.name, id);
            return;
        }
        let Some(handler) = timer.handler.as_ref() else {
            return;
        };

        tracing::debug!("Machine {} timer {} fired in state {}", self.name, id, ctx.state);
        let result = self.invoke(&mut ctx, |scope| handler(scope));
        self.after_handler(&mut ctx, "timer", result);
    }

    fn handle_worker_completion(&self, index: usize, generation: u64, outcome: WorkerOutcome) {
        let (Some(descriptor), Some(slot)) = (self.definition.workers.get(index), self.workers.get(index))
        else {
            return;
        };
        if !slot.collect(generation) {
            tracing::debug!("Machine {} dropped stale completion of worker {}", self.name, descriptor.name());
            return;
        }

        let mut ctx = self.context.lock();
        if self.halted.load(Ordering::Acquire) {
            return;
        }
        if !descriptor.is_active(ctx.state) {
            tracing::debug!(
                "Machine {} ignored worker {} outcome outside its states",
                self.name,
                descriptor.name()
            );
            return;
        }

        match descriptor.target_for(&outcome) {
            Some(target) => {
                tracing::info!(
                    "Machine {} worker {} {:?}, moving to state {}",
                    self.name,
                    descriptor.name(),
                    outcome,
                    target
                );
                self.transition(&mut ctx, target, false);
            }
            None => {
                tracing::info!(
                    "Machine {} worker {} {:?}, staying in state {}",
                    self.name,
                    descriptor.name(),
                    outcome,
                    ctx.state
                );
            }
        }
    }
}

impl<C: Send + 'static> MachineControl for Machine<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> StateId {
        StateId(self.state.load(Ordering::Acquire))
    }

    fn dispatch_event(&self, event: Event) {
        self.post_event(event);
    }

    fn subscriptions(&self) -> &Subscriptions {
        &self.subscriptions
    }

    fn suspend_workers(&self) {
        self.suspended.store(true, Ordering::Release);
        let warn_every = self.runtime.config.worker_stop_warn;
        for slot in &self.workers {
            slot.stop(warn_every);
        }
        tracing::info!("Machine {} suspended workers", self.name);
    }

    fn resume_workers(&self) {
        self.suspended.store(false, Ordering::Release);
        self.push(Priority::Transition, |m| {
            let ctx = m.context.lock();
            if m.halted.load(Ordering::Acquire) || !ctx.state.is_initialized() {
                return;
            }
            m.start_workers(&ctx);
        });
    }

    fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    fn is_foreground(&self) -> bool {
        self.runtime.queue.foreground().machine_foreground(&self.name)
    }
}

/// Typed handle to a registered machine.
pub struct MachineHandle<C> {
    machine: Arc<Machine<C>>,
}

impl<C> Clone for MachineHandle<C> {
    fn clone(&self) -> Self {
        Self {
            machine: self.machine.clone(),
        }
    }
}

impl<C: Send + 'static> fmt::Debug for MachineHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineHandle")
            .field("name", &self.machine.name)
            .field("state", &MachineControl::state(self.machine.as_ref()))
            .field("halted", &self.machine.is_halted())
            .finish()
    }
}

impl<C: Send + 'static> MachineHandle<C> {
    pub(crate) fn new(machine: Arc<Machine<C>>) -> Self {
        Self { machine }
    }

    pub fn name(&self) -> &str {
        self.machine.name()
    }

    pub fn state(&self) -> StateId {
        MachineControl::state(self.machine.as_ref())
    }

    pub fn dispatch_event(&self, event: Event) {
        self.machine.post_event(event);
    }

    /// Delivers a timer now, ahead of its deadline.
    pub fn fire_timer(&self, timer: &str) {
        self.machine.fire_timer(timer);
    }

    pub fn subscriptions(&self) -> &Subscriptions {
        MachineControl::subscriptions(self.machine.as_ref())
    }

    pub fn suspend_workers(&self) {
        self.machine.suspend_workers();
    }

    pub fn resume_workers(&self) {
        self.machine.resume_workers();
    }

    pub fn is_halted(&self) -> bool {
        self.machine.is_halted()
    }

    pub fn is_foreground(&self) -> bool {
        MachineControl::is_foreground(self.machine.as_ref())
    }

    /// Copies the engine-owned context. Blocks while a task of this machine
    /// runs, so it must not be called from the machine's own handlers.
    pub fn snapshot(&self) -> ContextSnapshot {
        self.machine.snapshot()
    }

    /// Reads the machine data. Same locking rule as [`MachineHandle::snapshot`].
    pub fn with_data<R>(&self, f: impl FnOnce(&C) -> R) -> R {
        self.machine.with_data(f)
    }
}
