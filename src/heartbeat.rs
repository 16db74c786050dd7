//! Built-in heartbeat machine.
//!
//! Beats on a state timer so the runtime always has at least one coalesced
//! wake outstanding, and persists the beat count.

use std::time::Duration;
use wakestate_core::{
    FieldDescriptor, MachineDefinition, Next, Scope, StateDescriptor, StateId, TimerDescriptor,
};

pub const NAME: &str = "heartbeat";

pub const BEATING: StateId = StateId(0);
pub const PAUSED: StateId = StateId(1);

const BEAT_TIMER: &str = "beat";

#[derive(Debug, Default)]
pub struct Heartbeat {
    pub beats: u64,
}

pub fn definition(interval: Duration) -> MachineDefinition<Heartbeat> {
    MachineDefinition::new(NAME)
        .state(StateDescriptor::new(BEATING).on_event("heartbeat.pause", |_, _| Ok(Next::To(PAUSED))))
        .state(StateDescriptor::new(PAUSED).on_event("heartbeat.resume", |_, _| Ok(Next::To(BEATING))))
        .timer(
            TimerDescriptor::new(BEAT_TIMER, [BEATING])
                .timeout(interval)
                .on_fire(move |scope: &mut Scope<'_, Heartbeat>| {
                    scope.data_mut().beats += 1;
                    tracing::info!("Heartbeat {}", scope.data().beats);
                    scope.start_timer(BEAT_TIMER, interval)?;
                    Ok(Next::Stay)
                }),
        )
        .field(FieldDescriptor::new(
            "beats",
            |h: &Heartbeat| h.beats,
            |h: &mut Heartbeat, beats| h.beats = beats,
        ))
        .initial(BEATING)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;
    use wakestate_core::{EngineConfig, Event, MachineRegistry, Runtime};
    use wakestate_queue::{ForegroundTracker, ManualHost, WorkQueue};
    use wakestate_store::{ContextStore, StoreConfig};
    use wakestate_timer::{ManualClock, ManualTimer, TimerConfig, TimerManager};

    const START: i64 = 1_000_000;

    fn drain(queue: &WorkQueue) {
        while !queue.is_empty() {
            queue.pump_once();
        }
    }

    #[test]
    fn test_heartbeat_beats_and_pauses() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(START));
        let short = Arc::new(ManualTimer::new("short"));
        let timers = TimerManager::new(
            TimerConfig::default(),
            clock.clone(),
            short.clone(),
            Arc::new(ManualTimer::new("long")),
        );
        let queue = WorkQueue::new(Arc::new(ManualHost::new()), Arc::new(ForegroundTracker::new()));
        queue.start();
        let store = Arc::new(ContextStore::open(StoreConfig::new(dir.path())).unwrap());
        let registry = MachineRegistry::new(Runtime::new(
            queue.clone(),
            timers,
            Some(store.clone()),
            EngineConfig::default(),
        ));

        let machine = registry
            .register(definition(Duration::from_secs(1)), Heartbeat::default())
            .unwrap();
        drain(&queue);

        for expected in 1..=3 {
            clock.advance(1_000);
            assert!(short.fire());
            drain(&queue);
            assert_eq!(machine.with_data(|h| h.beats), expected);
        }
        assert_eq!(short.history(), vec![START + 1_000, START + 2_000, START + 3_000, START + 4_000]);
        let record = store.load(NAME).unwrap();
        assert_eq!(record.fields.get("beats").map(String::as_str), Some("3"));

        registry.dispatch(Event::new("heartbeat.pause"));
        drain(&queue);
        assert_eq!(machine.state(), PAUSED);
        assert!(machine.snapshot().timers.is_empty());
    }
}
