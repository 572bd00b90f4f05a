//! Control plane: the HTTP API operators use to manage jobs.
//!
//! The master holds no scheduling state. Every operation is a read or write
//! against the coordination store (or the log store for log queries) and
//! workers pick changes up through their watches.

pub mod api;
pub mod jobs;
pub mod workers;

pub use api::{router, run_api, ApiResponse, ApiState};
pub use jobs::JobManager;
pub use workers::WorkerManager;
