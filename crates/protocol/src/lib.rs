use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};

pub mod config;

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DOCKER_PORT_PLAIN: u16 = 2375;
pub const DOCKER_PORT_TLS: u16 = 2376;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transport {
    #[default]
    Ssh,
    Docker {
        #[serde(default)]
        tls: bool,
    },
    Local,
}

impl Transport {
    pub fn label(&self) -> &'static str {
        match self {
            Transport::Ssh => "ssh",
            Transport::Docker { .. } => "docker",
            Transport::Local => "local",
        }
    }

    /// Remote transports need a resolvable host before a process is launched.
    pub fn is_remote(&self) -> bool {
        !matches!(self, Transport::Local)
    }

    pub fn default_port(&self) -> Option<u16> {
        match self {
            Transport::Ssh => Some(DEFAULT_SSH_PORT),
            Transport::Docker { tls: true } => Some(DOCKER_PORT_TLS),
            Transport::Docker { tls: false } => Some(DOCKER_PORT_PLAIN),
            Transport::Local => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub transport: Transport,
    #[serde(default)]
    pub ssh_args: Vec<String>,
}

impl Target {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: None,
            identity_file: None,
            port: None,
            transport: Transport::default(),
            ssh_args: Vec::new(),
        }
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// `user@host` when a login name is set, otherwise the bare host.
    pub fn destination(&self) -> String {
        match self.user.as_deref().map(str::trim) {
            Some(user) if !user.is_empty() => format!("{}@{}", user, self.host.trim()),
            _ => self.host.trim().to_string(),
        }
    }

    pub fn effective_port(&self) -> Option<u16> {
        self.port.or_else(|| self.transport.default_port())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum Operation {
    Shell(String),
    Argv(Vec<String>),
}

impl Operation {
    pub fn shell(command: impl Into<String>) -> Self {
        Operation::Shell(command.into())
    }

    pub fn argv<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Operation::Argv(args.into_iter().map(Into::into).collect())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Operation::Shell(command) => command.trim().is_empty(),
            Operation::Argv(args) => args.is_empty(),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Shell(command) => f.write_str(command),
            Operation::Argv(args) => f.write_str(&args.join(" ")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Success,
    Failed,
    Timeout,
    ConnectionFailed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "SUCCESS",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Timeout => "TIMEOUT",
            ExecutionStatus::ConnectionFailed => "CONNECTION_FAILED",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown execution status {:?}", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for ExecutionStatus {
    type Err = UnknownStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "SUCCESS" => Ok(ExecutionStatus::Success),
            "FAILED" => Ok(ExecutionStatus::Failed),
            "TIMEOUT" => Ok(ExecutionStatus::Timeout),
            "CONNECTION_FAILED" => Ok(ExecutionStatus::ConnectionFailed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionRecord {
    pub timestamp: DateTime<Utc>,
    pub category: String,
    pub host: String,
    pub status: ExecutionStatus,
    pub output: String,
}

impl ExecutionRecord {
    pub fn new(
        category: impl Into<String>,
        host: impl Into<String>,
        status: ExecutionStatus,
        output: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: monotonic_now(),
            category: category.into(),
            host: host.into(),
            status,
            output: output.into(),
        }
    }

    pub fn success(
        category: impl Into<String>,
        host: impl Into<String>,
        stdout: impl Into<String>,
    ) -> Self {
        Self::new(category, host, ExecutionStatus::Success, stdout)
    }

    pub fn failed(
        category: impl Into<String>,
        host: impl Into<String>,
        stderr: impl Into<String>,
    ) -> Self {
        Self::new(category, host, ExecutionStatus::Failed, stderr)
    }

    pub fn timeout(category: impl Into<String>, host: impl Into<String>) -> Self {
        Self::new(category, host, ExecutionStatus::Timeout, String::new())
    }

    pub fn connection_failed(
        category: impl Into<String>,
        host: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self::new(category, host, ExecutionStatus::ConnectionFailed, error)
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

static LAST_STAMP_MICROS: AtomicI64 = AtomicI64::new(i64::MIN);

/// Wall-clock time, clamped so that stamps issued by this process never go
/// backwards even if the system clock does.
pub fn monotonic_now() -> DateTime<Utc> {
    let now = Utc::now().timestamp_micros();
    let previous = LAST_STAMP_MICROS.fetch_max(now, Ordering::AcqRel);
    let stamp = previous.max(now);
    DateTime::<Utc>::from_timestamp_micros(stamp).unwrap_or_else(Utc::now)
}
