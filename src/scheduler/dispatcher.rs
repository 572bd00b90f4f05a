use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::{CronError, ExecuteError, Result};
use crate::scheduler::job::{ExecutionRecord, Job, JobEvent, JobExecuteResult, JobLogEntry};
use crate::scheduler::plan::{SchedulePlan, SchedulePlanTable};
use crate::scheduler::tracker::ExecutionTracker;
use crate::worker::log_sink::LogSink;

/// Starts executions on behalf of the dispatcher.
///
/// `launch` must return immediately and deliver exactly one
/// [`JobExecuteResult`] for the record on `results`, whatever happens.
pub trait JobRunner: Send + Sync {
    fn launch(&self, record: ExecutionRecord, results: mpsc::Sender<JobExecuteResult>);
}

/// What one iteration of the dispatcher loop processed.
#[derive(Debug)]
pub enum Step {
    Event,
    Tick,
    Result(Box<JobExecuteResult>),
    Shutdown,
}

enum Input {
    Event(Option<JobEvent>),
    Result(JobExecuteResult),
    Timer,
    Shutdown,
}

/// Single-task scheduling loop.
///
/// The dispatcher is the only owner of the plan table and the execution
/// tracker. Everything else reaches it through its two queues:
///
/// - **job events** from the registry watchers (upsert / delete / kill)
/// - **execution results** from the runner
///
/// After every input it re-evaluates the plan table, dispatches each due job
/// that is not already running and sleeps until the next fire time.
pub struct Dispatcher {
    plans: SchedulePlanTable,
    tracker: ExecutionTracker,
    runner: Arc<dyn JobRunner>,
    log_sink: Option<LogSink>,
    events_rx: mpsc::Receiver<JobEvent>,
    results_tx: mpsc::Sender<JobExecuteResult>,
    results_rx: mpsc::Receiver<JobExecuteResult>,
    idle_interval: Duration,
}

impl Dispatcher {
    /// Create a dispatcher and the sender side of its job event queue.
    pub fn new(
        runner: Arc<dyn JobRunner>,
        log_sink: Option<LogSink>,
        config: &WorkerConfig,
    ) -> (Self, mpsc::Sender<JobEvent>) {
        let (events_tx, events_rx) = mpsc::channel(config.event_queue_capacity.max(1));
        let (results_tx, results_rx) = mpsc::channel(config.result_queue_capacity.max(1));

        let dispatcher = Self {
            plans: SchedulePlanTable::new(),
            tracker: ExecutionTracker::new(),
            runner,
            log_sink,
            events_rx,
            results_tx,
            results_rx,
            idle_interval: Duration::from_millis(config.idle_interval_ms),
        };

        (dispatcher, events_tx)
    }

    pub fn plans(&self) -> &SchedulePlanTable {
        &self.plans
    }

    pub fn tracker(&self) -> &ExecutionTracker {
        &self.tracker
    }

    /// Run until `shutdown` fires. Returns an error if the job event queue
    /// closes, since the job table can no longer be kept current.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!("Dispatcher started");
        let mut wait = self.try_schedule(Utc::now());

        loop {
            if let Step::Shutdown = self.step(wait, &shutdown).await? {
                tracing::info!(running = self.tracker.len(), "Dispatcher stopped");
                return Ok(());
            }
            wait = self.try_schedule(Utc::now());
        }
    }

    /// Wait for one input (event, result, timer after `wait`, or shutdown)
    /// and apply it. Does not evaluate the plan table.
    pub async fn step(&mut self, wait: Duration, shutdown: &CancellationToken) -> Result<Step> {
        let input = tokio::select! {
            _ = shutdown.cancelled() => Input::Shutdown,
            event = self.events_rx.recv() => Input::Event(event),
            Some(result) = self.results_rx.recv() => Input::Result(result),
            _ = tokio::time::sleep(wait) => Input::Timer,
        };

        match input {
            Input::Shutdown => Ok(Step::Shutdown),
            Input::Event(Some(event)) => {
                self.handle_event(event, Utc::now());
                Ok(Step::Event)
            }
            Input::Event(None) => Err(CronError::EventQueueClosed),
            Input::Result(result) => {
                self.handle_result(&result);
                Ok(Step::Result(Box::new(result)))
            }
            Input::Timer => Ok(Step::Tick),
        }
    }

    /// Apply one job event to the plan table or the running executions.
    pub fn handle_event(&mut self, event: JobEvent, now: DateTime<Utc>) {
        match event {
            JobEvent::Upsert(job) => {
                let name = job.name.clone();
                match SchedulePlan::build(job, now) {
                    Ok(plan) => {
                        tracing::info!(
                            job = %name,
                            cron = %plan.expr,
                            next_fire = %plan.next_fire,
                            "Job scheduled"
                        );
                        self.plans.upsert(plan);
                    }
                    Err(e) => {
                        tracing::warn!(job = %name, error = %e, "Ignoring job with unusable schedule");
                    }
                }
            }
            JobEvent::Delete { name } => {
                if self.plans.remove(&name).is_some() {
                    tracing::info!(job = %name, "Job unscheduled");
                } else {
                    tracing::debug!(job = %name, "Delete for unknown job");
                }
            }
            JobEvent::Kill { name } => {
                if self.tracker.cancel(&name) {
                    tracing::info!(job = %name, "Killing running execution");
                } else {
                    tracing::debug!(job = %name, "Kill requested but job is not running");
                }
            }
        }
    }

    /// Retire a finished execution and forward it to the log sink.
    pub fn handle_result(&mut self, result: &JobExecuteResult) {
        let record = &result.record;
        let name = &record.job.name;

        if self.tracker.remove(name, record.id).is_none() {
            tracing::error!(
                job = %name,
                execution_id = %record.id,
                "Result does not match the tracked execution"
            );
        }

        match &result.error {
            Some(ExecuteError::LockHeld) => {
                tracing::debug!(job = %name, "Tick taken by another worker");
            }
            error => {
                let elapsed_ms = (result.end_time - result.start_time).num_milliseconds();
                match error {
                    None => tracing::info!(job = %name, elapsed_ms, "Job finished"),
                    Some(e) => tracing::warn!(job = %name, elapsed_ms, error = %e, "Job failed"),
                }
                if let Some(sink) = &self.log_sink {
                    sink.append(JobLogEntry::from(result));
                }
            }
        }
    }

    /// Dispatch every due job, advance its plan and return how long to sleep
    /// until the next fire time.
    pub fn try_schedule(&mut self, now: DateTime<Utc>) -> Duration {
        for name in self.plans.due(now) {
            let Some(plan) = self.plans.get_mut(&name) else {
                continue;
            };
            let job = plan.job.clone();
            let plan_time = plan.next_fire;

            if !plan.advance(now) {
                tracing::warn!(job = %name, "Schedule has no further occurrence, dropping job");
                self.plans.remove(&name);
            }

            self.try_start(job, plan_time, now);
        }

        match self.plans.earliest() {
            Some(next) => (next - now).to_std().unwrap_or(Duration::ZERO),
            None => self.idle_interval,
        }
    }

    fn try_start(&mut self, job: Job, plan_time: DateTime<Utc>, now: DateTime<Utc>) {
        if self.tracker.contains(&job.name) {
            tracing::debug!(job = %job.name, %plan_time, "Previous execution still running, skipping tick");
            return;
        }

        let record = ExecutionRecord::new(job, plan_time, now);
        tracing::debug!(
            job = %record.job.name,
            execution_id = %record.id,
            %plan_time,
            "Dispatching job"
        );
        self.tracker.insert(record.clone());
        self.runner.launch(record, self.results_tx.clone());
    }
}
