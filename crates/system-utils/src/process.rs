use std::process::{ExitStatus, Stdio};

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::time::{sleep_until, timeout, Duration, Instant};

const KILL_GRACE: Duration = Duration::from_millis(500);
const OUTPUT_GRACE: Duration = Duration::from_millis(250);

/// Captured stream, capped at the caller's byte limit.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Captured {
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

#[derive(Debug)]
pub enum ProcessOutcome {
    Exited {
        status: ExitStatus,
        stdout: Captured,
        stderr: Captured,
    },
    TimedOut,
}

/// Runs `cmd` until it exits or `command_timeout` expires, in which case the
/// whole process group is terminated. The exit status decides the outcome:
/// once the child has exited, output still held open by leftover background
/// processes is drained for `OUTPUT_GRACE`, then the group is killed. An `Err`
/// means the process could not be launched or waited on.
pub async fn run_command_with_timeout(
    cmd: &mut Command,
    command_timeout: Duration,
    max_output_bytes: usize,
    label: &str,
) -> anyhow::Result<ProcessOutcome> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    apply_process_group(cmd);
    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to launch {label}"))?;
    // `Child::id` is gone once the child is reaped; the group outlives it.
    let pid = child.id();
    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();

    let mut output = Box::pin(async move {
        tokio::join!(
            read_capped(stdout_pipe, max_output_bytes),
            read_capped(stderr_pipe, max_output_bytes),
        )
    });
    let mut captured: Option<(Captured, Captured)> = None;
    let deadline = Instant::now() + command_timeout;

    let waited = loop {
        tokio::select! {
            status = child.wait() => break Some(status),
            streams = &mut output, if captured.is_none() => captured = Some(streams),
            _ = sleep_until(deadline) => break None,
        }
    };

    let status = match waited {
        Some(Ok(status)) => status,
        Some(Err(err)) => {
            terminate_group(&mut child, pid).await;
            return Err(err).with_context(|| format!("{label} failed"));
        }
        None => {
            tracing::debug!(
                label,
                timeout_ms = command_timeout.as_millis() as u64,
                "terminating timed out process"
            );
            terminate_group(&mut child, pid).await;
            return Ok(ProcessOutcome::TimedOut);
        }
    };

    let (stdout, stderr) = match captured {
        Some(streams) => streams,
        None => match timeout(OUTPUT_GRACE, &mut output).await {
            Ok(streams) => streams,
            Err(_) => {
                tracing::debug!(label, "killing processes left holding output");
                signal_group(pid, SIGKILL);
                timeout(OUTPUT_GRACE, &mut output)
                    .await
                    .unwrap_or_default()
            }
        },
    };
    Ok(ProcessOutcome::Exited {
        status,
        stdout,
        stderr,
    })
}

async fn read_capped<R: AsyncRead + Unpin>(pipe: Option<R>, max_bytes: usize) -> Captured {
    let Some(mut reader) = pipe else {
        return Captured::default();
    };
    let mut captured = Captured::default();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                tracing::debug!(error = %err, "stopped reading child output");
                break;
            }
        };
        if captured.bytes.len() < max_bytes {
            let remaining = max_bytes - captured.bytes.len();
            let to_copy = remaining.min(n);
            captured.bytes.extend_from_slice(&chunk[..to_copy]);
            if to_copy < n {
                captured.truncated = true;
            }
        } else {
            captured.truncated = true;
        }
    }
    captured
}

#[cfg(unix)]
fn apply_process_group(cmd: &mut Command) {
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn apply_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: i32) {
    if let Some(pid) = pid {
        unsafe {
            libc::kill(-(pid as i32), signal);
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: i32) {}

#[cfg(unix)]
const SIGTERM: i32 = libc::SIGTERM;
#[cfg(unix)]
const SIGKILL: i32 = libc::SIGKILL;
#[cfg(not(unix))]
const SIGTERM: i32 = 15;
#[cfg(not(unix))]
const SIGKILL: i32 = 9;

async fn terminate_group(child: &mut Child, pid: Option<u32>) {
    signal_group(pid, SIGTERM);
    if timeout(KILL_GRACE, child.wait()).await.is_ok() {
        // The leader is gone; make sure nothing else in its group survives.
        signal_group(pid, SIGKILL);
        return;
    }
    signal_group(pid, SIGKILL);
    let _ = child.kill().await;
    let _ = timeout(KILL_GRACE, child.wait()).await;
}
