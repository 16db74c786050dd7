//! # wakestate-store
//!
//! Durable context store for wakestate.
//!
//! Every machine type owns three kinds of rows:
//! - a context row (state id + reserved timestamp)
//! - zero or more timer rows (timer id -> deadline)
//! - zero or more field rows (field name -> serialized value)
//!
//! Rows are updated individually through the journal, and all rows of a
//! machine type can be wiped in a single atomic record.

pub mod error;
pub mod rows;
pub mod store;

pub use error::StoreError;
pub use rows::{ContextRow, MachineRecord};
pub use store::{CompactionResult, ContextStore, StoreConfig, StoreStats};
