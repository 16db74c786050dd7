//! Machine registry - wires machines to the shared runtime services and fans
//! events out to subscribers.

use crate::config::EngineConfig;
use crate::definition::{Event, MachineDefinition, Subscriptions};
use crate::error::CoreError;
use crate::machine::{Machine, MachineControl, MachineHandle};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use wakestate_queue::WorkQueue;
use wakestate_store::ContextStore;
use wakestate_timer::TimerManager;

/// Services shared by every machine, constructed once at process start.
#[derive(Clone)]
pub struct Runtime {
    /// Work queue serializing every transition, event and timer firing.
    pub queue: Arc<WorkQueue>,

    /// Timer subsystem.
    pub timers: Arc<TimerManager>,

    /// Durable context store. `None` runs every machine without persistence.
    pub store: Option<Arc<ContextStore>>,

    pub config: EngineConfig,
}

impl Runtime {
    pub fn new(
        queue: Arc<WorkQueue>,
        timers: Arc<TimerManager>,
        store: Option<Arc<ContextStore>>,
        config: EngineConfig,
    ) -> Self {
        Self {
            queue,
            timers,
            store,
            config,
        }
    }
}

/// Registered machines, keyed by machine type name.
pub struct MachineRegistry {
    runtime: Runtime,
    machines: RwLock<BTreeMap<String, Arc<dyn MachineControl>>>,
}

impl MachineRegistry {
    pub fn new(runtime: Runtime) -> Self {
        Self {
            runtime,
            machines: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Validates and starts a machine. Entry into its starting state is
    /// queued at transition priority.
    pub fn register<C: Send + 'static>(
        &self,
        definition: MachineDefinition<C>,
        data: C,
    ) -> Result<MachineHandle<C>, CoreError> {
        let name = definition.name().to_string();
        let mut machines = self.machines.write();
        if machines.contains_key(&name) {
            return Err(CoreError::MachineExists { machine: name });
        }

        let machine = Machine::spawn(definition, data, self.runtime.clone())?;
        machines.insert(name, machine.clone());
        Ok(MachineHandle::new(machine))
    }

    /// Delivers an event to every machine subscribed to its id. Returns the
    /// number of machines it was queued for.
    pub fn dispatch(&self, event: Event) -> usize {
        let targets: Vec<Arc<dyn MachineControl>> = self
            .machines
            .read()
            .values()
            .filter(|machine| machine.subscriptions().wants(&event.id))
            .cloned()
            .collect();

        if targets.is_empty() {
            tracing::debug!("No machine subscribed to event {}", event.id);
        }
        for machine in &targets {
            machine.dispatch_event(event.clone());
        }
        targets.len()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn MachineControl>> {
        self.machines.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.machines.read().keys().cloned().collect()
    }

    /// Union of every machine's subscriptions, for the event transport.
    pub fn subscriptions(&self) -> Subscriptions {
        let mut all = Subscriptions::default();
        for machine in self.machines.read().values() {
            all.merge(machine.subscriptions());
        }
        all
    }

    /// Stops the workers of every machine. Blocks until all have returned.
    pub fn suspend_workers(&self) {
        let machines: Vec<_> = self.machines.read().values().cloned().collect();
        for machine in machines {
            machine.suspend_workers();
        }
    }

    pub fn resume_workers(&self) {
        for machine in self.machines.read().values() {
            machine.resume_workers();
        }
    }

    /// Returns true if any machine is in a foreground state.
    pub fn is_foreground(&self) -> bool {
        self.runtime.queue.foreground().is_foreground()
    }
}
