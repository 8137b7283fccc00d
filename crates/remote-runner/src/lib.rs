//! Run one operation against a remote host with a bounded timeout and record
//! the outcome in an append-only execution log.

pub mod config;
pub mod exec_log;
pub mod jobs;
pub mod runner;
pub mod transport;

pub use exec_log::{ExecutionLog, LogError};
pub use jobs::{operation_from_words, plan_jobs, RunRequest};
pub use protocol::{ExecutionRecord, ExecutionStatus, Operation, Target, Transport};
pub use runner::{Job, Runner, RunnerSettings};
