//! Logical row tables rebuilt from the journal.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use wakestate_journal::JournalEntry;

/// The singleton context row of a machine type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextRow {
    /// Current state id.
    pub state: i32,
    /// Reserved.
    pub timestamp: i64,
}

/// Every durable row belonging to one machine type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineRecord {
    /// Context row, if one was written.
    pub context: Option<ContextRow>,
    /// Timer id -> absolute deadline (unix millis).
    pub timers: BTreeMap<String, i64>,
    /// Field name -> serialized value.
    pub fields: BTreeMap<String, String>,
}

impl MachineRecord {
    /// Returns true if no row of any kind exists.
    pub fn is_empty(&self) -> bool {
        self.context.is_none() && self.timers.is_empty() && self.fields.is_empty()
    }

    /// Returns the number of rows held.
    pub fn row_count(&self) -> usize {
        self.context.iter().count() + self.timers.len() + self.fields.len()
    }

    /// Emits one journal entry per live row, used when compacting.
    pub fn to_entries(&self, machine: &str) -> Vec<JournalEntry> {
        let mut entries = Vec::with_capacity(self.row_count());
        if let Some(ctx) = self.context {
            entries.push(JournalEntry::PutContext {
                machine: machine.to_string(),
                state: ctx.state,
                timestamp: ctx.timestamp,
            });
        }
        for (timer, deadline) in &self.timers {
            entries.push(JournalEntry::PutTimer {
                machine: machine.to_string(),
                timer: timer.clone(),
                deadline: *deadline,
            });
        }
        for (field, value) in &self.fields {
            entries.push(JournalEntry::PutField {
                machine: machine.to_string(),
                field: field.clone(),
                value: value.clone(),
            });
        }
        entries
    }
}

/// In-memory image of every machine type's rows.
#[derive(Debug, Default)]
pub(crate) struct Tables {
    machines: HashMap<String, MachineRecord>,
}

impl Tables {
    /// Applies one row operation.
    pub(crate) fn apply(&mut self, entry: &JournalEntry) {
        match entry {
            JournalEntry::PutContext {
                machine,
                state,
                timestamp,
            } => {
                self.record_mut(machine).context = Some(ContextRow {
                    state: *state,
                    timestamp: *timestamp,
                });
            }
            JournalEntry::PutTimer {
                machine,
                timer,
                deadline,
            } => {
                self.record_mut(machine)
                    .timers
                    .insert(timer.clone(), *deadline);
            }
            JournalEntry::DeleteTimer { machine, timer } => {
                if let Some(record) = self.machines.get_mut(machine) {
                    record.timers.remove(timer);
                }
            }
            JournalEntry::PutField {
                machine,
                field,
                value,
            } => {
                self.record_mut(machine)
                    .fields
                    .insert(field.clone(), value.clone());
            }
            JournalEntry::DeleteField { machine, field } => {
                if let Some(record) = self.machines.get_mut(machine) {
                    record.fields.remove(field);
                }
            }
            JournalEntry::WipeMachine { machine } => {
                self.machines.remove(machine);
            }
        }
    }

    pub(crate) fn get(&self, machine: &str) -> Option<&MachineRecord> {
        self.machines.get(machine)
    }

    pub(crate) fn machines(&self) -> impl Iterator<Item = (&String, &MachineRecord)> {
        self.machines.iter()
    }

    pub(crate) fn row_count(&self) -> usize {
        self.machines.values().map(MachineRecord::row_count).sum()
    }

    fn record_mut(&mut self, machine: &str) -> &mut MachineRecord {
        self.machines.entry(machine.to_string()).or_default()
    }
}
