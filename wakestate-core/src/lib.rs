//! # wakestate-core
//!
//! State machine engine for wakestate.
//!
//! This crate provides:
//! - Declarative machine definitions (states, timers, workers, fields)
//! - The transition protocol, executed serially on the work queue pump
//! - Background workers with cooperative cancellation
//! - Field-level diffing persistence on top of the context store
//! - A registry that fans events out to subscribed machines

pub mod config;
pub mod context;
pub mod definition;
pub mod error;
pub mod machine;
pub mod persist;
pub mod registry;
pub mod worker;

pub use config::EngineConfig;
pub use context::{ContextSnapshot, RunningContext, Scope};
pub use definition::{
    Event, FieldDescriptor, HandlerResult, MachineDefinition, Next, StateDescriptor, StateId,
    Subscriptions, TimerDescriptor, WorkerDescriptor, WILDCARD_EVENT,
};
pub use error::{CoreError, HandlerError};
pub use machine::{MachineControl, MachineHandle};
pub use persist::{Persister, Restored, SaveReport};
pub use registry::{MachineRegistry, Runtime};
pub use worker::{FnWorker, Worker, WorkerOutcome};

pub use tokio_util::sync::CancellationToken;
