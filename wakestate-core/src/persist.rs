//! Context persistence with field-level diffing.
//!
//! The persister remembers what it last wrote for one machine type (state
//! id, timer deadlines, a CRC32C fingerprint per field) and only issues the
//! row writes needed to bring the store in sync. A failed save wipes the
//! machine's durable record, so the record is either consistent or absent.

use crate::definition::{FieldDescriptor, StateId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use wakestate_store::{ContextStore, StoreError};

/// Row writes issued by one save.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveReport {
    pub state_written: bool,
    pub timers_written: usize,
    pub timers_deleted: usize,
    pub fields_inserted: usize,
    pub fields_updated: usize,
    pub fields_deleted: usize,
}

impl SaveReport {
    /// Total number of row writes.
    pub fn writes(&self) -> usize {
        usize::from(self.state_written)
            + self.timers_written
            + self.timers_deleted
            + self.fields_inserted
            + self.fields_updated
            + self.fields_deleted
    }
}

#[derive(Debug, Default)]
struct Snapshot {
    state: Option<StateId>,
    timers: BTreeMap<String, i64>,
    fields: HashMap<String, u32>,
}

/// Context restored from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Restored {
    pub state: StateId,
    pub timers: BTreeMap<String, i64>,
}

pub struct Persister {
    machine: String,
    store: Arc<ContextStore>,
    snapshot: Snapshot,
}

fn fingerprint(value: &str) -> u32 {
    crc32c::crc32c(value.as_bytes())
}

impl Persister {
    pub fn new(machine: impl Into<String>, store: Arc<ContextStore>) -> Self {
        Self {
            machine: machine.into(),
            store,
            snapshot: Snapshot::default(),
        }
    }

    /// Restores the durable context into `data`.
    ///
    /// Returns `None` when no context row exists. A record whose state is
    /// rejected by `known`, or holding a field that cannot be decoded, is
    /// wiped and also yields `None`.
    pub fn load<C>(
        &mut self,
        fields: &[FieldDescriptor<C>],
        data: &mut C,
        known: impl Fn(StateId) -> bool,
    ) -> Option<Restored> {
        let record = self.store.load(&self.machine)?;
        let context = record.context?;
        let state = StateId(context.state);
        if !known(state) {
            tracing::warn!(
                "Discarding stored context of {}: state {} is not declared",
                self.machine,
                state
            );
            self.wipe();
            return None;
        }

        // Every field decodes before any is applied, so a discarded record
        // leaves `data` untouched.
        let mut fingerprints = HashMap::new();
        let mut decoded = Vec::with_capacity(fields.len());
        for field in fields {
            let Some(raw) = record.fields.get(field.name()) else {
                continue;
            };
            match field.parse(raw) {
                Ok(assign) => decoded.push(assign),
                Err(source) => {
                    let error = StoreError::Decode {
                        machine: self.machine.clone(),
                        field: field.name().to_string(),
                        source,
                    };
                    tracing::error!("Discarding stored context of {}: {}", self.machine, error);
                    self.wipe();
                    return None;
                }
            }
            fingerprints.insert(field.name().to_string(), fingerprint(raw));
        }
        for assign in decoded {
            assign(data);
        }

        self.snapshot = Snapshot {
            state: Some(state),
            timers: record.timers.clone(),
            fields: fingerprints,
        };

        tracing::info!(
            "Loaded context of {}: state {}, {} timers, {} fields",
            self.machine,
            state,
            record.timers.len(),
            self.snapshot.fields.len()
        );

        Some(Restored {
            state,
            timers: record.timers,
        })
    }

    /// Brings the durable record in sync with the given context.
    ///
    /// On any failure the durable record is wiped and the snapshot reset, so
    /// the next save rewrites every row.
    pub fn save<C>(
        &mut self,
        state: StateId,
        timers: &BTreeMap<String, i64>,
        fields: &[FieldDescriptor<C>],
        data: &C,
    ) -> Result<SaveReport, StoreError> {
        match self.write_diff(state, timers, fields, data) {
            Ok(report) => {
                tracing::debug!(
                    "Saved context of {} in state {}: {} row writes",
                    self.machine,
                    state,
                    report.writes()
                );
                Ok(report)
            }
            Err(e) => {
                tracing::error!("Failed to save context of {}: {}", self.machine, e);
                self.wipe();
                Err(e)
            }
        }
    }

    /// Removes every durable row of this machine type.
    pub fn wipe(&mut self) {
        self.snapshot = Snapshot::default();
        if let Err(e) = self.store.wipe(&self.machine) {
            tracing::error!("Failed to wipe context of {}: {}", self.machine, e);
        }
    }

    fn write_diff<C>(
        &mut self,
        state: StateId,
        timers: &BTreeMap<String, i64>,
        fields: &[FieldDescriptor<C>],
        data: &C,
    ) -> Result<SaveReport, StoreError> {
        let mut report = SaveReport::default();

        // Encode every field first so an unserializable one writes nothing.
        let mut encoded = Vec::with_capacity(fields.len());
        for field in fields {
            let value = field.encode(data).map_err(|source| StoreError::Encode {
                machine: self.machine.clone(),
                field: field.name().to_string(),
                source,
            })?;
            encoded.push((field.name(), value));
        }

        if self.snapshot.state != Some(state) {
            self.store.put_context(&self.machine, state.0)?;
            self.snapshot.state = Some(state);
            report.state_written = true;
        }

        for (id, deadline) in timers {
            if self.snapshot.timers.get(id) != Some(deadline) {
                self.store.put_timer(&self.machine, id, *deadline)?;
                self.snapshot.timers.insert(id.clone(), *deadline);
                report.timers_written += 1;
            }
        }
        let removed: Vec<String> = self
            .snapshot
            .timers
            .keys()
            .filter(|id| !timers.contains_key(*id))
            .cloned()
            .collect();
        for id in removed {
            self.store.delete_timer(&self.machine, &id)?;
            self.snapshot.timers.remove(&id);
            report.timers_deleted += 1;
        }

        for (name, value) in encoded {
            let previous = self.snapshot.fields.get(name).copied();
            match (value, previous) {
                (Some(value), None) => {
                    let print = fingerprint(&value);
                    self.store.put_field(&self.machine, name, value)?;
                    self.snapshot.fields.insert(name.to_string(), print);
                    report.fields_inserted += 1;
                }
                (Some(value), Some(previous)) => {
                    let print = fingerprint(&value);
                    if print != previous {
                        self.store.put_field(&self.machine, name, value)?;
                        self.snapshot.fields.insert(name.to_string(), print);
                        report.fields_updated += 1;
                    }
                }
                (None, Some(_)) => {
                    self.store.delete_field(&self.machine, name)?;
                    self.snapshot.fields.remove(name);
                    report.fields_deleted += 1;
                }
                (None, None) => {}
            }
        }

        Ok(report)
    }
}
