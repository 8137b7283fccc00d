mod cli;
mod logging;

use crate::cli::{Cli, Command, RunArgs, TailArgs};
use crate::logging::init_tracing;
use clap::Parser;
use remote_runner::config::{load_config, parse_timeout, LoadedConfig};
use remote_runner::{
    operation_from_words, plan_jobs, ExecutionLog, ExecutionRecord, RunRequest, Runner,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _file_guard = init_tracing(
        cli.diagnostics_dir.as_deref(),
        cli.log_level.as_deref(),
        cli.quiet,
    )?;

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => LoadedConfig::default(),
    };
    if let Some(path) = &cli.log_path {
        config.settings.log_path = path.clone();
    }

    match cli.command {
        Command::Run(args) => run(config, args).await,
        Command::Tail(args) => tail(&config, args).await,
    }
}

async fn run(mut config: LoadedConfig, args: RunArgs) -> anyhow::Result<()> {
    let timeout = args
        .timeout
        .as_deref()
        .map(|raw| parse_timeout(raw, "--timeout"))
        .transpose()?;
    if let Some(timeout) = timeout {
        config.settings.default_timeout = timeout;
    }
    let concurrency = match args.concurrency {
        Some(0) => anyhow::bail!("--concurrency must be at least 1"),
        Some(value) => value,
        None => config.concurrency,
    };
    let operation = operation_from_words(&args.command, args.argv);
    let json = args.json;
    let request = RunRequest {
        host: args.host,
        targets: args.target,
        all: args.all,
        user: args.user,
        identity_file: args.key,
        port: args.port,
        transport: Some(args.transport),
        tls: args.tls,
        timeout,
        category: args.category,
    };
    let jobs = plan_jobs(&config, &request, &operation)?;

    let log_path = config.settings.log_path.clone();
    let runner = Runner::new(config.settings);
    tracing::info!(
        jobs = jobs.len(),
        concurrency,
        log = %log_path.display(),
        "executing"
    );
    let records = runner.run_all(jobs, concurrency).await;
    for record in &records {
        print_record(record, json)?;
    }
    if !json {
        let succeeded = records.iter().filter(|record| record.is_success()).count();
        println!(
            "{}/{} succeeded; records appended to {}",
            succeeded,
            records.len(),
            log_path.display()
        );
    }
    Ok(())
}

async fn tail(config: &LoadedConfig, args: TailArgs) -> anyhow::Result<()> {
    let log = ExecutionLog::new(config.settings.log_path.clone());
    let records = log.tail(args.lines).await?;
    if records.is_empty() && !args.json {
        println!("no records in {}", log.path().display());
    }
    for record in &records {
        print_record(record, args.json)?;
    }
    Ok(())
}

fn print_record(record: &ExecutionRecord, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(record)?);
        return Ok(());
    }
    println!(
        "[{}] {} {} ({})",
        record.status,
        record.timestamp.format("%Y-%m-%d %H:%M:%S"),
        record.host,
        record.category
    );
    for line in record.output.lines() {
        println!("    {}", line);
    }
    Ok(())
}
