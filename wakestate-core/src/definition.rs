//! Declarative machine definitions.
//!
//! A [`MachineDefinition`] is assembled once at startup from plain function
//! values and validated when the machine is registered.

use crate::context::Scope;
use crate::error::{CoreError, HandlerError};
use crate::worker::{Worker, WorkerOutcome};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Event id bound by a catch-all handler.
pub const WILDCARD_EVENT: &str = "*";

/// Opaque state identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateId(pub i32);

impl StateId {
    /// Current state of a machine that has not entered any state yet.
    pub const UNINITIALIZED: StateId = StateId(-1);

    pub fn is_initialized(self) -> bool {
        self != Self::UNINITIALIZED
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a handler asks the engine to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// Remain in the current state.
    Stay,
    /// Transition to another state.
    To(StateId),
}

/// An event delivered to a machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(default)]
    pub payload: Value,
}

impl Event {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: Value::Null,
        }
    }

    pub fn with_payload(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}

/// Result of an entry, event or timer handler.
pub type HandlerResult = Result<Next, HandlerError>;

pub(crate) type StepFn<C> = Box<dyn Fn(&mut Scope<'_, C>) -> HandlerResult + Send + Sync>;
pub(crate) type ExitFn<C> = Box<dyn Fn(&mut Scope<'_, C>) -> Result<(), HandlerError> + Send + Sync>;
pub(crate) type EventFn<C> = Box<dyn Fn(&mut Scope<'_, C>, &Event) -> HandlerResult + Send + Sync>;
pub(crate) type WorkerFactory<C> = Box<dyn Fn(&C) -> Arc<dyn Worker> + Send + Sync>;

pub(crate) struct EventBinding<C> {
    pub(crate) handler: EventFn<C>,
    pub(crate) external: bool,
}

/// Bindings of one state.
pub struct StateDescriptor<C> {
    id: StateId,
    pub(crate) entry: Option<StepFn<C>>,
    pub(crate) exit: Option<ExitFn<C>>,
    pub(crate) events: HashMap<String, EventBinding<C>>,
    foreground: bool,
    persist: bool,
}

impl<C> StateDescriptor<C> {
    /// A state with no callbacks that persists and runs in background.
    pub fn new(id: StateId) -> Self {
        Self {
            id,
            entry: None,
            exit: None,
            events: HashMap::new(),
            foreground: false,
            persist: true,
        }
    }

    pub fn on_entry<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Scope<'_, C>) -> HandlerResult + Send + Sync + 'static,
    {
        self.entry = Some(Box::new(f));
        self
    }

    pub fn on_exit<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Scope<'_, C>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.exit = Some(Box::new(f));
        self
    }

    /// Binds an in-process event. Use [`WILDCARD_EVENT`] for a catch-all.
    pub fn on_event<F>(self, event: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Scope<'_, C>, &Event) -> HandlerResult + Send + Sync + 'static,
    {
        self.bind(event.into(), false, Box::new(f))
    }

    /// Binds an event delivered over the system-wide channel.
    pub fn on_external_event<F>(self, event: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Scope<'_, C>, &Event) -> HandlerResult + Send + Sync + 'static,
    {
        self.bind(event.into(), true, Box::new(f))
    }

    fn bind(mut self, event: String, external: bool, handler: EventFn<C>) -> Self {
        self.events
            .insert(event, EventBinding { handler, external });
        self
    }

    /// Marks the state as requiring continuous execution.
    pub fn foreground(mut self, foreground: bool) -> Self {
        self.foreground = foreground;
        self
    }

    /// Whether entering this state saves the context.
    pub fn persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    pub fn id(&self) -> StateId {
        self.id
    }

    pub fn is_foreground(&self) -> bool {
        self.foreground
    }

    pub fn persists(&self) -> bool {
        self.persist
    }

    /// Exact binding first, then the wildcard.
    pub(crate) fn handler_for(&self, event: &str) -> Option<&EventFn<C>> {
        self.events
            .get(event)
            .or_else(|| self.events.get(WILDCARD_EVENT))
            .map(|binding| &binding.handler)
    }
}

/// A timer bound to a set of states.
pub struct TimerDescriptor<C> {
    id: String,
    states: Vec<StateId>,
    timeout: Option<Duration>,
    pub(crate) handler: Option<StepFn<C>>,
}

impl<C> TimerDescriptor<C> {
    /// A timer active in `states`. Without a timeout it is only started
    /// explicitly by a handler.
    pub fn new(id: impl Into<String>, states: impl IntoIterator<Item = StateId>) -> Self {
        Self {
            id: id.into(),
            states: states.into_iter().collect(),
            timeout: None,
            handler: None,
        }
    }

    /// Starts the timer automatically whenever an owning state settles.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn on_fire<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Scope<'_, C>) -> HandlerResult + Send + Sync + 'static,
    {
        self.handler = Some(Box::new(f));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn states(&self) -> &[StateId] {
        &self.states
    }

    pub fn auto_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn is_active(&self, state: StateId) -> bool {
        self.states.contains(&state)
    }
}

/// A background worker bound to a set of states.
pub struct WorkerDescriptor<C> {
    name: String,
    states: Vec<StateId>,
    pub(crate) factory: WorkerFactory<C>,
    on_success: Option<StateId>,
    on_error: Option<StateId>,
    on_abort: Option<StateId>,
}

impl<C> WorkerDescriptor<C> {
    /// `factory` builds a fresh worker from the machine data each time an
    /// owning state settles.
    pub fn new<F>(name: impl Into<String>, states: impl IntoIterator<Item = StateId>, factory: F) -> Self
    where
        F: Fn(&C) -> Arc<dyn Worker> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            states: states.into_iter().collect(),
            factory: Box::new(factory),
            on_success: None,
            on_error: None,
            on_abort: None,
        }
    }

    pub fn on_success(mut self, state: StateId) -> Self {
        self.on_success = Some(state);
        self
    }

    pub fn on_error(mut self, state: StateId) -> Self {
        self.on_error = Some(state);
        self
    }

    /// Without an abort target, aborts route to the error target.
    pub fn on_abort(mut self, state: StateId) -> Self {
        self.on_abort = Some(state);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_active(&self, state: StateId) -> bool {
        self.states.contains(&state)
    }

    /// Target state for an outcome; `None` means stay.
    pub fn target_for(&self, outcome: &WorkerOutcome) -> Option<StateId> {
        match outcome {
            WorkerOutcome::Success => self.on_success,
            WorkerOutcome::Failed(_) => self.on_error,
            WorkerOutcome::Aborted => self.on_abort.or(self.on_error),
        }
    }

    fn targets(&self) -> impl Iterator<Item = (&'static str, StateId)> {
        [
            ("success", self.on_success),
            ("error", self.on_error),
            ("abort", self.on_abort),
        ]
        .into_iter()
        .filter_map(|(kind, target)| target.map(|state| (kind, state)))
    }
}

type EncodeFn<C> = Box<dyn Fn(&C) -> Result<Value, serde_json::Error> + Send + Sync>;
type DecodeFn<C> = Box<dyn Fn(&str) -> Result<Assign<C>, serde_json::Error> + Send + Sync>;

/// A decoded field value waiting to be written into the machine data.
pub(crate) type Assign<C> = Box<dyn FnOnce(&mut C)>;

/// A named piece of machine data persisted as its own row.
pub struct FieldDescriptor<C> {
    name: String,
    encode: EncodeFn<C>,
    decode: DecodeFn<C>,
}

impl<C> FieldDescriptor<C> {
    /// A field read with `get` and restored with `set`. A value serializing
    /// to JSON `null` deletes the stored row.
    pub fn new<T, G, S>(name: impl Into<String>, get: G, set: S) -> Self
    where
        T: Serialize + DeserializeOwned + 'static,
        G: Fn(&C) -> T + Send + Sync + 'static,
        S: Fn(&mut C, T) + Send + Sync + 'static,
    {
        let set = Arc::new(set);
        Self {
            name: name.into(),
            encode: Box::new(move |data| serde_json::to_value(get(data))),
            decode: Box::new(move |raw| {
                let value: T = serde_json::from_str(raw)?;
                let set = set.clone();
                let assign: Assign<C> = Box::new(move |data: &mut C| set(data, value));
                Ok(assign)
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Serialized value, or `None` when the field is null.
    pub fn encode(&self, data: &C) -> Result<Option<String>, serde_json::Error> {
        let value = (self.encode)(data)?;
        if value.is_null() {
            return Ok(None);
        }
        serde_json::to_string(&value).map(Some)
    }

    pub fn decode(&self, data: &mut C, raw: &str) -> Result<(), serde_json::Error> {
        let assign = self.parse(raw)?;
        assign(data);
        Ok(())
    }

    /// Decodes `raw` without touching the machine data.
    pub(crate) fn parse(&self, raw: &str) -> Result<Assign<C>, serde_json::Error> {
        (self.decode)(raw)
    }
}

/// Event ids a machine wants delivered, split by channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subscriptions {
    /// Delivered over the system-wide channel.
    pub broadcast: BTreeSet<String>,
    /// Delivered in-process only.
    pub local: BTreeSet<String>,
}

impl Subscriptions {
    /// Returns true if an event with this id should be delivered.
    pub fn wants(&self, event: &str) -> bool {
        [&self.broadcast, &self.local]
            .iter()
            .any(|set| set.contains(event) || set.contains(WILDCARD_EVENT))
    }

    pub fn merge(&mut self, other: &Subscriptions) {
        self.broadcast.extend(other.broadcast.iter().cloned());
        self.local.extend(other.local.iter().cloned());
    }

    pub fn is_empty(&self) -> bool {
        self.broadcast.is_empty() && self.local.is_empty()
    }
}

/// The declarative table of one machine type.
pub struct MachineDefinition<C> {
    name: String,
    pub(crate) states: BTreeMap<StateId, StateDescriptor<C>>,
    pub(crate) timers: Vec<TimerDescriptor<C>>,
    pub(crate) workers: Vec<WorkerDescriptor<C>>,
    pub(crate) fields: Vec<FieldDescriptor<C>>,
    initial: Option<StateId>,
    recovery: Option<StateId>,
    crash: Option<StateId>,
    store_enabled: bool,
    deferred: Vec<CoreError>,
}

impl<C> MachineDefinition<C> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            states: BTreeMap::new(),
            timers: Vec::new(),
            workers: Vec::new(),
            fields: Vec::new(),
            initial: None,
            recovery: None,
            crash: None,
            store_enabled: true,
            deferred: Vec::new(),
        }
    }

    pub fn state(mut self, descriptor: StateDescriptor<C>) -> Self {
        let id = descriptor.id();
        if self.states.insert(id, descriptor).is_some() {
            self.deferred.push(CoreError::DuplicateState {
                machine: self.name.clone(),
                state: id.0,
            });
        }
        self
    }

    pub fn timer(mut self, descriptor: TimerDescriptor<C>) -> Self {
        if self.timers.iter().any(|t| t.id() == descriptor.id()) {
            self.deferred.push(CoreError::DuplicateTimer {
                machine: self.name.clone(),
                timer: descriptor.id().to_string(),
            });
        }
        self.timers.push(descriptor);
        self
    }

    pub fn worker(mut self, descriptor: WorkerDescriptor<C>) -> Self {
        self.workers.push(descriptor);
        self
    }

    pub fn field(mut self, descriptor: FieldDescriptor<C>) -> Self {
        self.fields.push(descriptor);
        self
    }

    pub fn initial(mut self, state: StateId) -> Self {
        self.initial = Some(state);
        self
    }

    /// State entered on cold start when a persisted context exists.
    pub fn recovery(mut self, state: StateId) -> Self {
        self.recovery = Some(state);
        self
    }

    /// State entered when a handler fails.
    pub fn crash(mut self, state: StateId) -> Self {
        self.crash = Some(state);
        self
    }

    pub fn store_enabled(mut self, enabled: bool) -> Self {
        self.store_enabled = enabled;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn initial_state(&self) -> Option<StateId> {
        self.initial
    }

    pub fn recovery_state(&self) -> Option<StateId> {
        self.recovery
    }

    pub fn crash_state(&self) -> Option<StateId> {
        self.crash
    }

    pub fn is_store_enabled(&self) -> bool {
        self.store_enabled
    }

    pub fn get_state(&self, id: StateId) -> Option<&StateDescriptor<C>> {
        self.states.get(&id)
    }

    pub fn get_timer(&self, id: &str) -> Option<&TimerDescriptor<C>> {
        self.timers.iter().find(|t| t.id() == id)
    }

    /// Event ids bound by any state, classified by declared visibility.
    pub fn subscriptions(&self) -> Subscriptions {
        let mut subscriptions = Subscriptions::default();
        for (event, binding) in self.states.values().flat_map(|s| s.events.iter()) {
            if binding.external {
                subscriptions.broadcast.insert(event.clone());
            } else {
                subscriptions.local.insert(event.clone());
            }
        }
        subscriptions
    }

    /// Checks that every referenced state id resolves to a descriptor.
    pub fn validate(&mut self) -> Result<(), CoreError> {
        if let Some(error) = self.deferred.drain(..).next() {
            return Err(error);
        }
        if self.states.is_empty() {
            return Err(self.invalid("no states declared"));
        }
        let Some(initial) = self.initial else {
            return Err(self.invalid("no initial state"));
        };

        self.check_state(initial, "initial")?;
        if let Some(recovery) = self.recovery {
            self.check_state(recovery, "recovery")?;
        }
        if let Some(crash) = self.crash {
            self.check_state(crash, "crash")?;
        }

        for timer in &self.timers {
            if timer.handler.is_none() {
                return Err(self.invalid(&format!("timer {} has no handler", timer.id())));
            }
            for state in timer.states() {
                self.check_state(*state, &format!("timer {}", timer.id()))?;
            }
        }

        for worker in &self.workers {
            for state in &worker.states {
                self.check_state(*state, &format!("worker {}", worker.name()))?;
            }
            for (kind, state) in worker.targets() {
                self.check_state(state, &format!("worker {} {} target", worker.name(), kind))?;
            }
        }

        Ok(())
    }

    fn check_state(&self, state: StateId, referenced_by: &str) -> Result<(), CoreError> {
        if self.states.contains_key(&state) {
            Ok(())
        } else {
            Err(CoreError::UnknownState {
                machine: self.name.clone(),
                state: state.0,
                referenced_by: referenced_by.to_string(),
            })
        }
    }

    fn invalid(&self, reason: &str) -> CoreError {
        CoreError::InvalidDefinition {
            machine: self.name.clone(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::FnWorker;

    const A: StateId = StateId(0);
    const B: StateId = StateId(1);
    const MISSING: StateId = StateId(42);

    fn two_states() -> MachineDefinition<()> {
        MachineDefinition::new("m")
            .state(StateDescriptor::new(A))
            .state(StateDescriptor::new(B))
            .initial(A)
    }

    #[test]
    fn test_valid_definition() {
        let mut def = two_states()
            .timer(TimerDescriptor::new("t", [A]).on_fire(|_| Ok(Next::Stay)))
            .crash(B);
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_missing_initial() {
        let mut def: MachineDefinition<()> =
            MachineDefinition::new("m").state(StateDescriptor::new(A));
        assert!(matches!(
            def.validate(),
            Err(CoreError::InvalidDefinition { .. })
        ));
    }

    #[test]
    fn test_unknown_references() {
        let mut def = two_states().crash(MISSING);
        let err = def.validate().unwrap_err();
        assert!(matches!(err, CoreError::UnknownState { state: 42, .. }));
        assert!(err.is_configuration());

        let mut def = two_states().timer(TimerDescriptor::new("t", [MISSING]).on_fire(|_| Ok(Next::Stay)));
        assert!(matches!(def.validate(), Err(CoreError::UnknownState { .. })));

        let mut def = two_states().worker(
            WorkerDescriptor::new("w", [A], |_| Arc::new(FnWorker::new(|_| WorkerOutcome::Success)))
                .on_success(MISSING),
        );
        assert!(matches!(def.validate(), Err(CoreError::UnknownState { .. })));
    }

    #[test]
    fn test_timer_without_handler() {
        let mut def = two_states().timer(TimerDescriptor::new("t", [A]));
        assert!(matches!(
            def.validate(),
            Err(CoreError::InvalidDefinition { .. })
        ));
    }

    #[test]
    fn test_duplicates_rejected() {
        let mut def = two_states().state(StateDescriptor::new(A));
        assert!(matches!(def.validate(), Err(CoreError::DuplicateState { state: 0, .. })));

        let mut def = two_states()
            .timer(TimerDescriptor::new("t", [A]).on_fire(|_| Ok(Next::Stay)))
            .timer(TimerDescriptor::new("t", [B]).on_fire(|_| Ok(Next::Stay)));
        assert!(matches!(def.validate(), Err(CoreError::DuplicateTimer { .. })));
    }

    #[test]
    fn test_subscriptions_split_by_visibility() {
        let def: MachineDefinition<()> = MachineDefinition::new("m")
            .state(
                StateDescriptor::new(A)
                    .on_event("local.ping", |_, _| Ok(Next::Stay))
                    .on_external_event("net.up", |_, _| Ok(Next::Stay)),
            )
            .state(StateDescriptor::new(B).on_event(WILDCARD_EVENT, |_, _| Ok(Next::Stay)))
            .initial(A);

        let subs = def.subscriptions();
        assert!(subs.broadcast.contains("net.up"));
        assert!(subs.local.contains("local.ping"));
        assert!(subs.wants("anything"), "wildcard subscribes to every event");
    }

    #[test]
    fn test_event_lookup_falls_back_to_wildcard() {
        let state: StateDescriptor<()> = StateDescriptor::new(A)
            .on_event("exact", |_, _| Ok(Next::To(B)))
            .on_event(WILDCARD_EVENT, |_, _| Ok(Next::Stay));
        assert!(state.handler_for("exact").is_some());
        assert!(state.handler_for("other").is_some());

        let strict: StateDescriptor<()> = StateDescriptor::new(A).on_event("exact", |_, _| Ok(Next::Stay));
        assert!(strict.handler_for("other").is_none());
    }

    #[test]
    fn test_abort_falls_back_to_error_target() {
        let worker: WorkerDescriptor<()> =
            WorkerDescriptor::new("w", [A], |_| Arc::new(FnWorker::new(|_| WorkerOutcome::Success)))
                .on_success(A)
                .on_error(B);
        assert_eq!(worker.target_for(&WorkerOutcome::Success), Some(A));
        assert_eq!(worker.target_for(&WorkerOutcome::Failed("x".into())), Some(B));
        assert_eq!(worker.target_for(&WorkerOutcome::Aborted), Some(B));

        let worker = worker.on_abort(A);
        assert_eq!(worker.target_for(&WorkerOutcome::Aborted), Some(A));
    }

    #[test]
    fn test_field_null_means_absent() {
        struct Data {
            name: Option<String>,
        }
        let field = FieldDescriptor::new(
            "name",
            |d: &Data| d.name.clone(),
            |d: &mut Data, v| d.name = v,
        );
        let mut data = Data { name: None };
        assert_eq!(field.encode(&data).unwrap(), None);

        data.name = Some("x".into());
        assert_eq!(field.encode(&data).unwrap().as_deref(), Some("\"x\""));

        field.decode(&mut data, "\"y\"").unwrap();
        assert_eq!(data.name.as_deref(), Some("y"));
        assert!(field.decode(&mut data, "{not json").is_err());
    }
}
