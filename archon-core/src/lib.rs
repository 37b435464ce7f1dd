//! archon-core — domain types, configuration, state-root layout, the State
//! Store and the task-list parser.
//!
//! - [`types`] — feature ids, records, task items
//! - [`store`] — [`StateStore`]: mappings and sync metadata
//! - [`tasks`] — checklist parsing and status rewriting
//! - [`config`] — `archon.yaml` + environment resolution into [`Settings`]
//! - [`paths`] — on-disk layout under the state root
//! - [`io`] — atomic writes and key escaping

pub mod config;
pub mod error;
pub mod io;
pub mod paths;
pub mod store;
pub mod tasks;
pub mod types;

pub use config::{ArchonConfig, EnvOverrides, Settings};
pub use error::CoreError;
pub use store::StateStore;
pub use types::{
    format_timestamp, timestamp_now, Concern, EntityKind, FeatureId, MappingRecord, SyncMetadata,
    SyncMode, TaskItem, TaskStatus, TIMESTAMP_FORMAT,
};
