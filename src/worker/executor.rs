use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::config::WorkerConfig;
use crate::error::ExecuteError;
use crate::scheduler::{CancelHandle, ExecutionRecord, JobExecuteResult, JobRunner};
use crate::store::CoordinationClient;
use crate::worker::lock::DistributedLock;

const READ_CHUNK: usize = 8192;

/// How long a killed job's output is still read before giving up on it.
const KILL_DRAIN: Duration = Duration::from_millis(200);

/// Runs job commands under the job's distributed lock.
///
/// Each execution:
/// 1. Sleeps a random jitter so workers that fire the same tick do not all
///    hit the lock at once
/// 2. Takes the job lock; losing the race is reported as
///    [`ExecuteError::LockHeld`]
/// 3. Runs `<shell> -c <command>`, killed if the record is cancelled
/// 4. Releases the lock and reports the result
#[derive(Clone)]
pub struct JobExecutor {
    client: Arc<dyn CoordinationClient>,
    shell: String,
    jitter_max: Duration,
    lock_ttl_secs: i64,
}

impl JobExecutor {
    pub fn new(client: Arc<dyn CoordinationClient>, config: &WorkerConfig) -> Self {
        Self {
            client,
            shell: config.shell.clone(),
            jitter_max: Duration::from_millis(config.jitter_max_ms),
            lock_ttl_secs: config.lock_ttl_secs,
        }
    }

    /// Execute one record to completion.
    pub async fn execute(&self, record: ExecutionRecord) -> JobExecuteResult {
        let job_name = record.job.name.clone();

        let jitter_start = Utc::now();
        tokio::select! {
            _ = record.cancel.cancelled() => {
                return Self::failed(record, ExecuteError::Killed, jitter_start);
            }
            _ = tokio::time::sleep(self.jitter()) => {}
        }

        let attempt_start = Utc::now();
        let mut lock = DistributedLock::new(Arc::clone(&self.client), &job_name, self.lock_ttl_secs);
        let acquired = tokio::select! {
            r = lock.try_acquire() => r.map_err(ExecuteError::from),
            _ = record.cancel.cancelled() => Err(ExecuteError::Killed),
        };
        if let Err(error) = acquired {
            lock.release().await;
            return Self::failed(record, error, attempt_start);
        }

        tracing::info!(job = %job_name, command = %record.job.command, "Executing job");
        let start_time = Utc::now();
        let (output, error) = self.run_command(&record.job.command, &record.cancel).await;
        let end_time = Utc::now();
        lock.release().await;

        JobExecuteResult {
            record,
            output,
            error,
            start_time,
            end_time,
        }
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.jitter_max.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        let mut rng = rand::thread_rng();
        Duration::from_millis(rng.gen_range(0..max_ms))
    }

    fn failed(
        record: ExecutionRecord,
        error: ExecuteError,
        start_time: chrono::DateTime<Utc>,
    ) -> JobExecuteResult {
        JobExecuteResult {
            record,
            output: String::new(),
            error: Some(error),
            start_time,
            end_time: Utc::now(),
        }
    }

    /// Run the command with stdout and stderr on one pipe, so the captured
    /// output keeps the order the process wrote it in.
    ///
    /// A cancelled command is killed and whatever it wrote so far is kept.
    async fn run_command(
        &self,
        command: &str,
        cancel: &CancelHandle,
    ) -> (String, Option<ExecuteError>) {
        let (mut child, mut output) = match self.spawn(command) {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::error!(shell = %self.shell, error = %e, "Failed to spawn job");
                return (String::new(), Some(ExecuteError::Spawn(e.to_string())));
            }
        };

        let mut captured = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        let mut open = true;
        let mut exited = None;

        let error = loop {
            tokio::select! {
                read = output.read(&mut chunk), if open => match read {
                    Ok(0) => open = false,
                    Ok(n) => captured.extend_from_slice(&chunk[..n]),
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to read job output");
                        open = false;
                    }
                },
                status = child.wait(), if exited.is_none() => exited = Some(status),
                _ = cancel.cancelled() => {
                    if let Err(e) = child.start_kill() {
                        tracing::debug!(error = %e, "Job already exited when killed");
                    }
                    // Processes the shell started may keep the pipe open.
                    if open {
                        let _ = tokio::time::timeout(
                            KILL_DRAIN,
                            drain(&mut output, &mut captured),
                        )
                        .await;
                    }
                    break Some(ExecuteError::Killed);
                }
            }

            if !open {
                if let Some(status) = exited.take() {
                    break exit_error(status);
                }
            }
        };

        (String::from_utf8_lossy(&captured).into_owned(), error)
    }

    fn spawn(&self, command: &str) -> std::io::Result<(Child, pipe::Receiver)> {
        let (sender, receiver) = pipe::pipe()?;
        let stdout = sender.into_blocking_fd()?;
        let stderr = stdout.try_clone()?;

        // The temporary Command owns the parent's copies of the write end and
        // drops them here, so the reader sees EOF once the job closes its side.
        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()?;
        Ok((child, receiver))
    }
}

async fn drain(output: &mut pipe::Receiver, captured: &mut Vec<u8>) {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match output.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => captured.extend_from_slice(&chunk[..n]),
        }
    }
}

fn exit_error(status: std::io::Result<ExitStatus>) -> Option<ExecuteError> {
    match status {
        Ok(status) if status.success() => None,
        Ok(status) => Some(ExecuteError::Exit(match status.code() {
            Some(code) => format!("exit status {}", code),
            None => "terminated by signal".to_string(),
        })),
        Err(e) => Some(ExecuteError::Spawn(e.to_string())),
    }
}

impl JobRunner for JobExecutor {
    fn launch(&self, record: ExecutionRecord, results: mpsc::Sender<JobExecuteResult>) {
        let executor = self.clone();
        tokio::spawn(async move {
            let result = executor.execute(record).await;
            if results.send(result).await.is_err() {
                tracing::debug!("Dispatcher gone, dropping execution result");
            }
        });
    }
}
