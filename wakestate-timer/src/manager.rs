//! Timer manager.
//!
//! Owns every logical timer registration, grouped by handler group, and keeps
//! the two wake primitives armed to the nearest short-horizon deadline and the
//! nearest deadline beyond it.

use crate::clock::Clock;
use crate::wake::{WakeCallback, WakeTimer};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Invoked with the timer id once a registration in the group is due.
pub type GroupCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Validity predicate of a registration. A registration whose scope returns
/// false is removed without being delivered.
pub type Scope = Arc<dyn Fn() -> bool + Send + Sync>;

/// Timer subsystem configuration.
#[derive(Debug, Clone, Copy)]
pub struct TimerConfig {
    /// Deadlines at most this far away go to the short-horizon primitive.
    pub short_horizon_ms: i64,
    /// The coarse primitive ignores re-arms within this distance of the
    /// armed deadline.
    pub long_dedup_ms: i64,
    /// The coarse primitive rounds its sleeps up to this granularity.
    pub coarse_granularity_ms: i64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            short_horizon_ms: 30_000,
            long_dedup_ms: 30_000,
            coarse_granularity_ms: 1_000,
        }
    }
}

impl TimerConfig {
    pub fn with_short_horizon_ms(mut self, millis: i64) -> Self {
        self.short_horizon_ms = millis;
        self
    }

    pub fn with_long_dedup_ms(mut self, millis: i64) -> Self {
        self.long_dedup_ms = millis;
        self
    }

    pub fn with_coarse_granularity_ms(mut self, millis: i64) -> Self {
        self.coarse_granularity_ms = millis;
        self
    }
}

struct Registration {
    deadline: i64,
    scope: Option<Scope>,
}

impl Registration {
    fn is_valid(&self) -> bool {
        self.scope.as_ref().map_or(true, |scope| scope())
    }
}

struct Group {
    callback: GroupCallback,
    timers: HashMap<String, Registration>,
}

/// Coalesces all logical timers onto two wake primitives.
pub struct TimerManager {
    config: TimerConfig,
    clock: Arc<dyn Clock>,
    short: Arc<dyn WakeTimer>,
    long: Arc<dyn WakeTimer>,
    groups: Mutex<HashMap<String, Group>>,
    this: Weak<TimerManager>,
}

impl TimerManager {
    pub fn new(
        config: TimerConfig,
        clock: Arc<dyn Clock>,
        short: Arc<dyn WakeTimer>,
        long: Arc<dyn WakeTimer>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            config,
            clock,
            short,
            long,
            groups: Mutex::new(HashMap::new()),
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &TimerConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Associates a handler group with its callback. Re-registering replaces
    /// the callback and drops the group's pending timers.
    pub fn register_group(&self, group: &str, callback: GroupCallback) {
        let mut groups = self.groups.lock();
        groups.insert(
            group.to_string(),
            Group {
                callback,
                timers: HashMap::new(),
            },
        );
        self.rearm(&groups);
    }

    pub fn unregister_group(&self, group: &str) {
        let mut groups = self.groups.lock();
        if let Some(removed) = groups.remove(group) {
            for registration in removed.timers.values() {
                self.cancel(registration.deadline);
            }
            self.rearm(&groups);
        }
    }

    /// Registers a timer. Starting a timer id that is already pending in the
    /// group is a no-op. Returns true if a registration was added.
    pub fn start_timer(&self, group: &str, id: &str, deadline: i64, scope: Option<Scope>) -> bool {
        let mut groups = self.groups.lock();
        let Some(entry) = groups.get_mut(group) else {
            tracing::warn!("Timer {} started for unknown group {}", id, group);
            return false;
        };
        if entry.timers.contains_key(id) {
            return false;
        }

        tracing::debug!(
            "Starting timer {}/{} in {}ms",
            group,
            id,
            deadline - self.clock.now_millis()
        );
        entry
            .timers
            .insert(id.to_string(), Registration { deadline, scope });
        self.rearm(&groups);
        true
    }

    /// Removes a registration. Returns true if it was pending.
    pub fn stop_timer(&self, group: &str, id: &str) -> bool {
        let mut groups = self.groups.lock();
        let removed = groups
            .get_mut(group)
            .and_then(|entry| entry.timers.remove(id));
        match removed {
            Some(registration) => {
                self.cancel(registration.deadline);
                self.rearm(&groups);
                true
            }
            None => false,
        }
    }

    /// Removes every registration in the group whose scope no longer holds.
    /// Returns the number removed.
    pub fn validate(&self, group: &str) -> usize {
        let mut groups = self.groups.lock();
        let Some(entry) = groups.get_mut(group) else {
            return 0;
        };

        let invalid: Vec<String> = entry
            .timers
            .iter()
            .filter(|(_, registration)| !registration.is_valid())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &invalid {
            if let Some(registration) = entry.timers.remove(id) {
                tracing::debug!("Timer {}/{} invalidated", group, id);
                self.cancel(registration.deadline);
            }
        }

        if !invalid.is_empty() {
            self.rearm(&groups);
        }
        invalid.len()
    }

    /// Returns the deadline of a pending registration.
    pub fn pending(&self, group: &str, id: &str) -> Option<i64> {
        self.groups
            .lock()
            .get(group)
            .and_then(|entry| entry.timers.get(id))
            .map(|registration| registration.deadline)
    }

    /// Returns the number of pending registrations across all groups.
    pub fn pending_count(&self) -> usize {
        self.groups
            .lock()
            .values()
            .map(|entry| entry.timers.len())
            .sum()
    }

    /// Returns the deadlines the short and long primitives are armed with.
    pub fn armed(&self) -> (Option<i64>, Option<i64>) {
        (self.short.armed(), self.long.armed())
    }

    /// Delivers every due registration across all groups, then re-arms.
    ///
    /// Called by either primitive when it fires. Group callbacks run after
    /// the registry lock is released.
    pub fn on_wake(&self) {
        let now = self.clock.now_millis();
        let mut fired: Vec<(GroupCallback, String)> = Vec::new();

        {
            let mut groups = self.groups.lock();
            for (name, entry) in groups.iter_mut() {
                let due: Vec<String> = entry
                    .timers
                    .iter()
                    .filter(|(_, registration)| registration.deadline <= now)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in due {
                    let Some(registration) = entry.timers.remove(&id) else {
                        continue;
                    };
                    self.cancel(registration.deadline);
                    if registration.is_valid() {
                        fired.push((entry.callback.clone(), id));
                    } else {
                        tracing::debug!("Dropping out-of-scope timer {}/{}", name, id);
                    }
                }
            }
            self.rearm(&groups);
        }

        for (callback, id) in fired {
            callback(&id);
        }
    }

    fn cancel(&self, deadline: i64) {
        self.short.disarm(deadline);
        self.long.disarm(deadline);
    }

    fn wake_callback(&self) -> WakeCallback {
        let this = self.this.clone();
        Arc::new(move || {
            if let Some(manager) = this.upgrade() {
                manager.on_wake();
            }
        })
    }

    fn rearm(&self, groups: &HashMap<String, Group>) {
        let now = self.clock.now_millis();
        let mut nearest_short: Option<i64> = None;
        let mut nearest_long: Option<i64> = None;

        for registration in groups.values().flat_map(|entry| entry.timers.values()) {
            let slot = if registration.deadline - now <= self.config.short_horizon_ms {
                &mut nearest_short
            } else {
                &mut nearest_long
            };
            if slot.map_or(true, |nearest| registration.deadline < nearest) {
                *slot = Some(registration.deadline);
            }
        }

        if let Some(deadline) = nearest_short {
            self.short.arm(deadline, self.wake_callback());
        }
        if let Some(deadline) = nearest_long {
            self.long.arm(deadline, self.wake_callback());
        }
        tracing::trace!(
            "Wake primitives: {}={:?} {}={:?}",
            self.short.name(),
            self.short.armed(),
            self.long.name(),
            self.long.armed()
        );
    }
}
