use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "remote-runner",
    version,
    about = "Run an operation on a remote host and record the outcome"
)]
pub(crate) struct Cli {
    /// TOML file with defaults and named targets
    #[arg(long, global = true)]
    pub(crate) config: Option<PathBuf>,
    /// Execution log path; overrides the config file
    #[arg(long, global = true)]
    pub(crate) log_path: Option<PathBuf>,
    /// Directory for daily JSON diagnostics logs
    #[arg(long, global = true)]
    pub(crate) diagnostics_dir: Option<PathBuf>,
    /// Diagnostics filter, e.g. `debug` or `remote_runner=trace`; overrides RUST_LOG
    #[arg(long, global = true)]
    pub(crate) log_level: Option<String>,
    #[arg(long, global = true, default_value_t = false)]
    pub(crate) quiet: bool,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Execute an operation against one host or configured targets
    Run(RunArgs),
    /// Print the most recent execution records
    Tail(TailArgs),
}

#[derive(Args, Debug)]
pub(crate) struct RunArgs {
    /// Host, or user@host, to run against
    #[arg(conflicts_with_all = ["target", "all"])]
    pub(crate) host: Option<String>,
    /// Named target from the config file (repeatable)
    #[arg(long = "target", short = 't')]
    pub(crate) target: Vec<String>,
    /// Run against every configured target
    #[arg(long, conflicts_with = "target")]
    pub(crate) all: bool,
    #[arg(long, short = 'u')]
    pub(crate) user: Option<String>,
    /// SSH private key path
    #[arg(long, short = 'k')]
    pub(crate) key: Option<PathBuf>,
    #[arg(long, short = 'p')]
    pub(crate) port: Option<u16>,
    /// ssh, docker or local
    #[arg(long, default_value = "ssh")]
    pub(crate) transport: String,
    /// Talk to the Docker daemon over TLS
    #[arg(long, default_value_t = false)]
    pub(crate) tls: bool,
    /// e.g. 30s, 2m
    #[arg(long)]
    pub(crate) timeout: Option<String>,
    /// Category label written to the execution log
    #[arg(long)]
    pub(crate) category: Option<String>,
    /// Pass the command words as an argument vector instead of one shell line
    #[arg(long, default_value_t = false)]
    pub(crate) argv: bool,
    #[arg(long)]
    pub(crate) concurrency: Option<usize>,
    /// Print records as JSON lines
    #[arg(long, default_value_t = false)]
    pub(crate) json: bool,
    #[arg(last = true, required = true, num_args = 1..)]
    pub(crate) command: Vec<String>,
}

#[derive(Args, Debug)]
pub(crate) struct TailArgs {
    #[arg(short = 'n', long, default_value_t = 20)]
    pub(crate) lines: usize,
    #[arg(long, default_value_t = false)]
    pub(crate) json: bool,
}
