use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use anyhow::Context;
use tracing_subscriber::EnvFilter;

/// Stderr is the operator channel; the JSON file layer is only attached when a
/// diagnostics directory is given.
pub(crate) fn init_tracing(
    diagnostics_dir: Option<&Path>,
    log_level: Option<&str>,
    quiet: bool,
) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = build_filter(log_level, quiet)?;

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false);

    let registry = tracing_subscriber::registry().with(filter).with(stderr_layer);

    match diagnostics_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_appender = tracing_appender::rolling::daily(dir, "remote-runner.log");
            let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_target(false)
                .json();
            registry.with(file_layer).init();
            Ok(Some(file_guard))
        }
        None => {
            registry.init();
            Ok(None)
        }
    }
}

/// `--log-level` wins over `RUST_LOG`, which wins over the quiet/info default.
fn build_filter(log_level: Option<&str>, quiet: bool) -> anyhow::Result<EnvFilter> {
    if let Some(directives) = log_level.map(str::trim).filter(|value| !value.is_empty()) {
        return EnvFilter::try_new(directives)
            .with_context(|| format!("invalid --log-level {:?}", directives));
    }
    let default_level = if quiet { "warn" } else { "info" };
    Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
}
