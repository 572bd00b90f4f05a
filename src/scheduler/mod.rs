pub mod dispatcher;
pub mod job;
pub mod plan;
pub mod tracker;

pub use dispatcher::{Dispatcher, JobRunner, Step};
pub use job::{CancelHandle, ExecutionRecord, Job, JobEvent, JobExecuteResult, JobLogEntry};
pub use plan::{SchedulePlan, SchedulePlanTable};
pub use tracker::ExecutionTracker;
