use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cron::CronExpr;
use crate::error::{CronError, ExecuteError, Result};

/// A cron job definition as stored under the jobs namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub command: String,
    #[serde(rename = "cronExpr")]
    pub cron_expr: String,
}

impl Job {
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        cron_expr: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            cron_expr: cron_expr.into(),
        }
    }

    /// Check the job can be stored: a usable name and a parseable schedule.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(CronError::InvalidJob("name must not be empty".to_string()));
        }
        if self.name.contains('/') {
            return Err(CronError::InvalidJob(format!(
                "name '{}' must not contain '/'",
                self.name
            )));
        }
        CronExpr::parse(&self.cron_expr)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| CronError::InvalidJob(e.to_string()))
    }
}

/// A change to the job table, consumed once by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    /// Create or replace a job.
    Upsert(Job),
    /// Forget a job. Executions already in flight are unaffected.
    Delete { name: String },
    /// Cancel the running execution of a job, if any.
    Kill { name: String },
}

impl JobEvent {
    pub fn name(&self) -> &str {
        match self {
            JobEvent::Upsert(job) => &job.name,
            JobEvent::Delete { name } | JobEvent::Kill { name } => name,
        }
    }
}

/// Cancellation handle owned by one execution.
///
/// Cancelling terminates the bound subprocess and aborts a pending lock
/// acquisition. Cancelling after the execution finished does nothing.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// One in-flight execution of a job.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub job: Job,
    /// Tick the execution belongs to.
    pub plan_time: DateTime<Utc>,
    /// When the dispatcher actually handed it off. Later than `plan_time`
    /// when the dispatcher is backlogged.
    pub real_time: DateTime<Utc>,
    pub cancel: CancelHandle,
}

impl ExecutionRecord {
    pub fn new(job: Job, plan_time: DateTime<Utc>, real_time: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job,
            plan_time,
            real_time,
            cancel: CancelHandle::new(),
        }
    }
}

/// Outcome of one execution attempt.
#[derive(Debug, Clone)]
pub struct JobExecuteResult {
    pub record: ExecutionRecord,
    /// Captured stdout followed by stderr.
    pub output: String,
    pub error: Option<ExecuteError>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Durable log line for one execution. Times are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobLogEntry {
    pub job_name: String,
    pub command: String,
    pub output: String,
    /// Empty when the execution succeeded.
    pub err: String,
    pub plan_time: i64,
    pub schedule_time: i64,
    pub start_time: i64,
    pub end_time: i64,
}

impl From<&JobExecuteResult> for JobLogEntry {
    fn from(result: &JobExecuteResult) -> Self {
        Self {
            job_name: result.record.job.name.clone(),
            command: result.record.job.command.clone(),
            output: result.output.clone(),
            err: result
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_default(),
            plan_time: result.record.plan_time.timestamp_millis(),
            schedule_time: result.record.real_time.timestamp_millis(),
            start_time: result.start_time.timestamp_millis(),
            end_time: result.end_time.timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn sample_result(error: Option<ExecuteError>) -> JobExecuteResult {
        let plan = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 5).unwrap();
        let record = ExecutionRecord::new(
            Job::new("report", "echo hi", "*/5 * * * * *"),
            plan,
            plan + chrono::Duration::milliseconds(12),
        );
        JobExecuteResult {
            record,
            output: "hi\n".to_string(),
            error,
            start_time: plan + chrono::Duration::milliseconds(340),
            end_time: plan + chrono::Duration::milliseconds(355),
        }
    }

    #[test]
    fn job_wire_shape_uses_cron_expr_key() {
        let job = Job::new("j1", "echo hi", "* * * * * *");
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(
            value,
            json!({"name": "j1", "command": "echo hi", "cronExpr": "* * * * * *"})
        );
        assert_eq!(Job::from_bytes(&job.to_bytes().unwrap()).unwrap(), job);
    }

    #[test]
    fn job_from_bytes_rejects_garbage() {
        assert!(matches!(
            Job::from_bytes(b"{not json"),
            Err(CronError::InvalidJob(_))
        ));
    }

    #[test]
    fn job_validate() {
        assert!(Job::new("j1", "true", "*/10 * * * * *").validate().is_ok());
        assert!(Job::new("", "true", "* * * * *").validate().is_err());
        assert!(Job::new("a/b", "true", "* * * * *").validate().is_err());
        assert!(matches!(
            Job::new("j1", "true", "not a schedule").validate(),
            Err(CronError::InvalidCron(_))
        ));
    }

    #[test]
    fn log_entry_preserves_all_fields_through_wire_shape() {
        let result = sample_result(Some(ExecuteError::Exit("exit status 2".to_string())));
        let entry = JobLogEntry::from(&result);

        assert_eq!(entry.job_name, "report");
        assert_eq!(entry.command, "echo hi");
        assert_eq!(entry.output, "hi\n");
        assert_eq!(entry.err, "exit status 2");
        assert_eq!(entry.plan_time, result.record.plan_time.timestamp_millis());
        assert_eq!(entry.schedule_time, entry.plan_time + 12);
        assert_eq!(entry.start_time, entry.plan_time + 340);
        assert_eq!(entry.end_time, entry.plan_time + 355);

        let wire = serde_json::to_value(&entry).unwrap();
        let object = wire.as_object().unwrap();
        for key in [
            "jobName",
            "command",
            "output",
            "err",
            "planTime",
            "scheduleTime",
            "startTime",
            "endTime",
        ] {
            assert!(object.contains_key(key), "missing {key}");
        }
        assert_eq!(object.len(), 8);

        let decoded: JobLogEntry = serde_json::from_value(wire).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn log_entry_err_is_empty_on_success() {
        let entry = JobLogEntry::from(&sample_result(None));
        assert_eq!(entry.err, "");
    }

    #[test]
    fn cancel_handle_is_shared_between_clones() {
        let record = ExecutionRecord::new(
            Job::new("j1", "sleep 5", "* * * * * *"),
            Utc::now(),
            Utc::now(),
        );
        let copy = record.clone();
        assert!(!record.cancel.is_cancelled());
        copy.cancel.cancel();
        assert!(record.cancel.is_cancelled());
        // Second cancel is a no-op.
        record.cancel.cancel();
        assert!(copy.cancel.is_cancelled());
    }

    #[test]
    fn event_name() {
        let job = Job::new("j1", "true", "* * * * *");
        assert_eq!(JobEvent::Upsert(job).name(), "j1");
        assert_eq!(JobEvent::Delete { name: "j2".into() }.name(), "j2");
        assert_eq!(JobEvent::Kill { name: "j3".into() }.name(), "j3");
    }
}
