//! Consumer daemon: drains the request queue into the Archon service.
//!
//! [`Processor::run_cycle`] is the unit of work. The runtime schedules it from
//! a poll timer, a watcher on the request directory and the control socket.

pub mod cycle;
mod error;
pub mod log_rotation;
pub mod protocol;
mod runtime;
pub mod service;

pub use cycle::{CycleReport, Processor};
pub use error::DaemonError;
pub use protocol::{
    request_poll, request_status, request_stop, send_request, DaemonRequest, DaemonResponse,
};
pub use runtime::{init_tracing, run, run_once, start_blocking, DaemonStats, DEBOUNCE_WINDOW};
pub use service::{ArchonService, HttpService, RemoteTaskStatus, ServiceError, TaskUpsert};
