//! Append-only execution log.
//!
//! One record per line, five `|`-delimited fields:
//!
//! ```text
//! 2026-10-19T08:15:02.123456Z | ssh | 10.0.0.5 | SUCCESS | ok
//! ```
//!
//! Backslash, `|`, newline and carriage return inside a field are escaped, so
//! a record never spans more than one line and never adds a field.

use chrono::{DateTime, SecondsFormat, Utc};
use protocol::{ExecutionRecord, ExecutionStatus};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_LOG_PATH: &str = ".remote_execution.log";

const FIELD_COUNT: usize = 5;
const SEPARATOR: &str = " | ";

#[derive(Debug, Error)]
pub enum LogError {
    #[error("failed to write execution log {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read execution log {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed log line: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone)]
pub struct ExecutionLog {
    path: PathBuf,
}

impl ExecutionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, record: &ExecutionRecord) -> Result<(), LogError> {
        let path = self.path.clone();
        let line = format_line(record);
        tokio::task::spawn_blocking(move || append_line(&path, &line))
            .await
            .map_err(|err| LogError::Write {
                path: self.path.clone(),
                source: io::Error::other(err),
            })?
    }

    pub async fn read_all(&self) -> Result<Vec<ExecutionRecord>, LogError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(LogError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_line)
            .collect()
    }

    /// The last `limit` records in file order.
    pub async fn tail(&self, limit: usize) -> Result<Vec<ExecutionRecord>, LogError> {
        let mut records = self.read_all().await?;
        if records.len() > limit {
            records.drain(..records.len() - limit);
        }
        Ok(records)
    }
}

/// Writes one complete line with a single `write_all` on an `O_APPEND`
/// handle that lives only for this call.
fn append_line(path: &Path, line: &str) -> Result<(), LogError> {
    let write_err = |source| LogError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(write_err)?;
    file.write_all(line.as_bytes()).map_err(write_err)
}

pub fn format_line(record: &ExecutionRecord) -> String {
    let fields = [
        record
            .timestamp
            .to_rfc3339_opts(SecondsFormat::Micros, true),
        escape_field(&record.category),
        escape_field(&record.host),
        record.status.to_string(),
        escape_field(&record.output),
    ];
    let mut line = fields.join(SEPARATOR);
    line.push('\n');
    line
}

pub fn parse_line(line: &str) -> Result<ExecutionRecord, LogError> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let line = line.strip_suffix('\r').unwrap_or(line);
    let raw = split_fields(line);
    if raw.len() != FIELD_COUNT {
        return Err(LogError::Malformed(format!(
            "expected {} fields, found {}",
            FIELD_COUNT,
            raw.len()
        )));
    }
    let last = raw.len() - 1;
    let mut fields = Vec::with_capacity(FIELD_COUNT);
    for (index, field) in raw.iter().enumerate() {
        let mut field = field.as_str();
        if index > 0 {
            field = field.strip_prefix(' ').ok_or_else(|| {
                LogError::Malformed(format!("field {} missing separator space", index))
            })?;
        }
        if index < last {
            field = field.strip_suffix(' ').ok_or_else(|| {
                LogError::Malformed(format!("field {} missing separator space", index))
            })?;
        }
        fields.push(unescape_field(field)?);
    }

    let timestamp = DateTime::parse_from_rfc3339(&fields[0])
        .map_err(|err| LogError::Malformed(format!("bad timestamp {:?}: {}", fields[0], err)))?
        .with_timezone(&Utc);
    let status = fields[3]
        .parse::<ExecutionStatus>()
        .map_err(|err| LogError::Malformed(err.to_string()))?;
    let output = fields.pop().unwrap_or_default();
    Ok(ExecutionRecord {
        timestamp,
        category: fields[1].clone(),
        host: fields[2].clone(),
        status,
        output,
    })
}

fn escape_field(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            '|' => escaped.push_str("\\|"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn unescape_field(value: &str) -> Result<String, LogError> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('|') => out.push('|'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => {
                return Err(LogError::Malformed(format!("unknown escape \\{}", other)))
            }
            None => return Err(LogError::Malformed("dangling escape".to_string())),
        }
    }
    Ok(out)
}

/// Splits on unescaped `|`, leaving escapes in place for `unescape_field`.
fn split_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                current.push(ch);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '|' => fields.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    fields.push(current);
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn record(status: ExecutionStatus, output: &str) -> ExecutionRecord {
        ExecutionRecord::new("ssh", "10.0.0.5", status, output)
    }

    #[test]
    fn line_has_five_fields_and_ends_with_newline() {
        let line = format_line(&record(ExecutionStatus::Success, "ok"));
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        let fields: Vec<&str> = line.trim_end().split(" | ").collect();
        assert_eq!(fields.len(), 5);
        assert_eq!(fields[1], "ssh");
        assert_eq!(fields[2], "10.0.0.5");
        assert_eq!(fields[3], "SUCCESS");
        assert_eq!(fields[4], "ok");
        assert!(fields[0].ends_with('Z'));
    }

    #[test]
    fn hostile_output_stays_on_one_line() {
        let nasty = "line one\nline two | FAILED | x\r\nback\\slash";
        let original = record(ExecutionStatus::Failed, nasty);
        let line = format_line(&original);
        assert_eq!(line.matches('\n').count(), 1);
        let parsed = parse_line(&line).expect("parse");
        assert_eq!(parsed, original);
    }

    #[test]
    fn empty_output_is_preserved() {
        let original = ExecutionRecord::timeout("docker", "10.0.0.6");
        let parsed = parse_line(&format_line(&original)).expect("parse");
        assert_eq!(parsed.output, "");
        assert_eq!(parsed.status, ExecutionStatus::Timeout);
    }

    #[test]
    fn parse_rejects_wrong_field_count_and_status() {
        assert!(matches!(
            parse_line("2026-01-01T00:00:00Z | ssh | host | SUCCESS"),
            Err(LogError::Malformed(_))
        ));
        assert!(matches!(
            parse_line("2026-01-01T00:00:00Z | ssh | host | COMPOSE_ERROR | x"),
            Err(LogError::Malformed(_))
        ));
        assert!(matches!(
            parse_line("yesterday | ssh | host | SUCCESS | x"),
            Err(LogError::Malformed(_))
        ));
        assert!(matches!(
            parse_line("2026-01-01T00:00:00Z | ssh | host | SUCCESS | bad \\q"),
            Err(LogError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn append_creates_file_and_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let log = ExecutionLog::new(dir.path().join("nested").join("exec.log"));
        assert!(log.read_all().await.unwrap().is_empty());

        log.append(&record(ExecutionStatus::Success, "one")).await.unwrap();
        log.append(&record(ExecutionStatus::Failed, "two")).await.unwrap();

        let records = log.read_all().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].output, "one");
        assert_eq!(records[1].status, ExecutionStatus::Failed);
        assert!(records[0].timestamp <= records[1].timestamp);
    }

    #[tokio::test]
    async fn append_into_a_directory_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let log = ExecutionLog::new(dir.path());
        let err = log
            .append(&record(ExecutionStatus::Success, ""))
            .await
            .unwrap_err();
        assert!(matches!(err, LogError::Write { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_never_split_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(ExecutionLog::new(dir.path().join("exec.log")));
        let writers = 64;
        let mut handles = Vec::new();
        for index in 0..writers {
            let log = Arc::clone(&log);
            handles.push(tokio::spawn(async move {
                let output = format!("writer {index}\n").repeat(200);
                log.append(&record(ExecutionStatus::Success, &output))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let raw = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(raw.lines().count(), writers);
        for line in raw.lines() {
            let parsed = parse_line(line).expect("every line parses");
            assert_eq!(parsed.output.lines().count(), 200);
        }
    }

    #[tokio::test]
    async fn tail_returns_latest_records() {
        let dir = tempfile::tempdir().unwrap();
        let log = ExecutionLog::new(dir.path().join("exec.log"));
        for index in 0..5 {
            log.append(&record(ExecutionStatus::Success, &index.to_string()))
                .await
                .unwrap();
        }
        let tail = log.tail(2).await.unwrap();
        let outputs: Vec<&str> = tail.iter().map(|r| r.output.as_str()).collect();
        assert_eq!(outputs, vec!["3", "4"]);
        assert_eq!(log.tail(10).await.unwrap().len(), 5);
    }
}
