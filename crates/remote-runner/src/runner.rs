use crate::exec_log::ExecutionLog;
use crate::transport::{build_command, is_connection_failure, DEFAULT_CONNECT_TIMEOUT_SECS};
use futures_util::stream::{self, StreamExt};
use protocol::{ExecutionRecord, ExecutionStatus, Operation, Target};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use system_utils::process::{run_command_with_timeout, Captured, ProcessOutcome};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 64 * 1024;

const TRUNCATED_MARKER: &str = "[output truncated]";

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub log_path: PathBuf,
    pub default_timeout: Duration,
    pub max_output_bytes: usize,
    pub connect_timeout_secs: u64,
    pub resolve_hosts: bool,
    /// Overrides the transport name as the record category.
    pub category: Option<String>,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from(crate::exec_log::DEFAULT_LOG_PATH),
            default_timeout: DEFAULT_TIMEOUT,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            resolve_hosts: true,
            category: None,
        }
    }
}

/// One unit of work for [`Runner::run_all`].
#[derive(Debug, Clone)]
pub struct Job {
    pub target: Target,
    pub operation: Operation,
    pub category: Option<String>,
    pub timeout: Option<Duration>,
}

impl Job {
    pub fn new(target: Target, operation: Operation) -> Self {
        Self {
            target,
            operation,
            category: None,
            timeout: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Runner {
    settings: RunnerSettings,
    log: ExecutionLog,
}

impl Runner {
    pub fn new(settings: RunnerSettings) -> Self {
        let log = ExecutionLog::new(settings.log_path.clone());
        Self { settings, log }
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    pub fn log(&self) -> &ExecutionLog {
        &self.log
    }

    /// Runs `operation` against `target` once and appends the outcome to the
    /// execution log. Never fails: every problem becomes a record status.
    pub async fn execute(
        &self,
        target: &Target,
        operation: &Operation,
        timeout: Duration,
    ) -> ExecutionRecord {
        let category = self.category_for(target, None);
        self.execute_as(&category, target, operation, timeout).await
    }

    pub async fn execute_as(
        &self,
        category: &str,
        target: &Target,
        operation: &Operation,
        timeout: Duration,
    ) -> ExecutionRecord {
        let timeout = if timeout.is_zero() {
            tracing::warn!(host = %target.host, "zero timeout requested, using default");
            self.settings.default_timeout
        } else {
            timeout
        };
        let started_at = Instant::now();
        let record = self.run_once(category, target, operation, timeout).await;
        tracing::info!(
            host = %record.host,
            category = %record.category,
            status = %record.status,
            duration_ms = started_at.elapsed().as_millis() as u64,
            "operation finished"
        );
        if let Err(err) = self.log.append(&record).await {
            tracing::warn!(error = %err, "failed to write execution record");
        }
        record
    }

    /// Executes every job, at most `concurrency` at a time. Records come back
    /// in job order; the log reflects completion order, so with concurrency
    /// above one, adjacent lines may carry timestamps out of order.
    pub async fn run_all(&self, jobs: Vec<Job>, concurrency: usize) -> Vec<ExecutionRecord> {
        let concurrency = concurrency.max(1);
        stream::iter(jobs)
            .map(|job| async move {
                let category = self.category_for(&job.target, job.category.as_deref());
                let timeout = job.timeout.unwrap_or(self.settings.default_timeout);
                self.execute_as(&category, &job.target, &job.operation, timeout)
                    .await
            })
            .buffered(concurrency)
            .collect()
            .await
    }

    fn category_for(&self, target: &Target, explicit: Option<&str>) -> String {
        explicit
            .or(self.settings.category.as_deref())
            .map(str::to_string)
            .unwrap_or_else(|| target.transport.label().to_string())
    }

    async fn run_once(
        &self,
        category: &str,
        target: &Target,
        operation: &Operation,
        timeout: Duration,
    ) -> ExecutionRecord {
        let started_at = Instant::now();
        let host = target.host.trim();
        if host.is_empty() {
            return ExecutionRecord::connection_failed(category, host, "target host is empty");
        }

        if self.settings.resolve_hosts && target.transport.is_remote() {
            if let Err(message) = resolve_host(host, target.effective_port(), timeout).await {
                tracing::debug!(host, error = %message, "host did not resolve");
                return ExecutionRecord::connection_failed(category, host, message);
            }
        }

        let Some(budget) = remaining_budget(timeout, started_at.elapsed()) else {
            return ExecutionRecord::timeout(category, host);
        };

        let spec = match build_command(target, operation, self.settings.connect_timeout_secs) {
            Ok(spec) => spec,
            Err(err) => {
                return ExecutionRecord::connection_failed(category, host, format!("{:#}", err))
            }
        };
        tracing::debug!(host, command = %spec.display(), "launching");

        let mut cmd = spec.to_command();
        let outcome = run_command_with_timeout(
            &mut cmd,
            budget,
            self.settings.max_output_bytes,
            &spec.program,
        )
        .await;

        match outcome {
            Ok(ProcessOutcome::Exited {
                status,
                stdout,
                stderr,
            }) => {
                if status.success() {
                    return ExecutionRecord::success(category, host, render(&stdout));
                }
                let stderr = render(&stderr);
                if is_connection_failure(&target.transport, status.code(), &stderr) {
                    ExecutionRecord::connection_failed(category, host, stderr)
                } else {
                    ExecutionRecord::new(category, host, ExecutionStatus::Failed, stderr)
                }
            }
            Ok(ProcessOutcome::TimedOut) => ExecutionRecord::timeout(category, host),
            Err(err) => ExecutionRecord::connection_failed(category, host, format!("{:#}", err)),
        }
    }
}

async fn resolve_host(host: &str, port: Option<u16>, timeout: Duration) -> Result<(), String> {
    let port = port.unwrap_or(protocol::DEFAULT_SSH_PORT);
    match tokio::time::timeout(timeout, tokio::net::lookup_host((host, port))).await {
        Ok(Ok(mut addrs)) => {
            if addrs.next().is_some() {
                Ok(())
            } else {
                Err(format!("{} resolved to no addresses", host))
            }
        }
        Ok(Err(err)) => Err(format!("failed to resolve {}: {}", host, err)),
        Err(_) => Err(format!("resolving {} timed out", host)),
    }
}

/// What is left of the caller's bound once `spent` has gone to resolution.
fn remaining_budget(timeout: Duration, spent: Duration) -> Option<Duration> {
    let left = timeout.saturating_sub(spent);
    (!left.is_zero()).then_some(left)
}

fn render(captured: &Captured) -> String {
    let mut text = String::from_utf8_lossy(&captured.bytes).trim().to_string();
    if captured.truncated {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(TRUNCATED_MARKER);
    }
    text
}
