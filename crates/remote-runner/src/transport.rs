use anyhow::Context;
use protocol::{Operation, Target, Transport};
use tokio::process::Command;

pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Exit status `ssh` uses for its own failures (resolve, connect, auth).
const SSH_CONNECTION_EXIT: i32 = 255;

const DOCKER_CONNECT_ERRORS: &[&str] = &[
    "Cannot connect to the Docker daemon",
    "error during connect",
];

/// Program and arguments for one invocation, kept separate from
/// `tokio::process::Command` so it can be inspected and logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    fn arg(&mut self, value: impl Into<String>) -> &mut Self {
        self.args.push(value.into());
        self
    }

    fn option(&mut self, value: impl Into<String>) -> &mut Self {
        self.arg("-o").arg(value)
    }

    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }

    pub fn display(&self) -> String {
        let mut words = Vec::with_capacity(self.args.len() + 1);
        words.push(self.program.as_str());
        words.extend(self.args.iter().map(String::as_str));
        shell_words::join(words)
    }
}

pub fn build_command(
    target: &Target,
    operation: &Operation,
    connect_timeout_secs: u64,
) -> anyhow::Result<CommandSpec> {
    if operation.is_empty() {
        anyhow::bail!("operation is empty");
    }
    match &target.transport {
        Transport::Ssh => Ok(build_ssh(target, operation, connect_timeout_secs)),
        Transport::Docker { tls } => build_docker(target, operation, *tls),
        Transport::Local => Ok(build_local(operation)),
    }
}

fn build_ssh(target: &Target, operation: &Operation, connect_timeout_secs: u64) -> CommandSpec {
    let mut spec = CommandSpec::new("ssh");
    spec.option("BatchMode=yes")
        .option("StrictHostKeyChecking=accept-new")
        .option(format!("ConnectTimeout={}", connect_timeout_secs));
    if let Some(key) = &target.identity_file {
        spec.arg("-i").arg(key.to_string_lossy());
    }
    if let Some(port) = target.port {
        spec.arg("-p").arg(port.to_string());
    }
    for extra in &target.ssh_args {
        spec.arg(extra.as_str());
    }
    spec.arg(target.destination());
    let remote = match operation {
        Operation::Shell(command) => command.clone(),
        Operation::Argv(args) => shell_words::join(args),
    };
    spec.arg(remote);
    spec
}

fn build_docker(target: &Target, operation: &Operation, tls: bool) -> anyhow::Result<CommandSpec> {
    let mut spec = CommandSpec::new("docker");
    let port = target
        .effective_port()
        .unwrap_or(protocol::DOCKER_PORT_PLAIN);
    spec.arg("-H").arg(daemon_url(target.host.trim(), port));
    if tls {
        spec.arg("--tlsverify");
    }
    let args = match operation {
        Operation::Shell(command) => shell_words::split(command)
            .with_context(|| format!("failed to split docker arguments {:?}", command))?,
        Operation::Argv(args) => args.clone(),
    };
    for arg in args {
        spec.arg(arg);
    }
    Ok(spec)
}

fn build_local(operation: &Operation) -> CommandSpec {
    match operation {
        Operation::Shell(command) => {
            let mut spec = CommandSpec::new("sh");
            spec.arg("-c").arg(command.as_str());
            spec
        }
        Operation::Argv(args) => {
            let mut spec = CommandSpec::new(args[0].as_str());
            for arg in &args[1..] {
                spec.arg(arg.as_str());
            }
            spec
        }
    }
}

fn daemon_url(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("tcp://[{}]:{}", host, port)
    } else {
        format!("tcp://{}:{}", host, port)
    }
}

/// Whether a non-zero exit came from the client failing to reach the target
/// rather than from the operation itself.
pub fn is_connection_failure(transport: &Transport, exit_code: Option<i32>, stderr: &str) -> bool {
    match transport {
        Transport::Ssh => exit_code == Some(SSH_CONNECTION_EXIT),
        Transport::Docker { .. } => DOCKER_CONNECT_ERRORS
            .iter()
            .any(|needle| stderr.contains(needle)),
        Transport::Local => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn ssh_command_carries_credentials_and_port() {
        let target = Target::new("10.0.0.5")
            .with_user("deploy")
            .with_identity_file("/home/deploy/.ssh/id_ed25519")
            .with_port(2222);
        let spec = build_command(&target, &Operation::shell("uptime"), 7).unwrap();
        assert_eq!(spec.program, "ssh");
        assert_eq!(
            spec.args,
            strings(&[
                "-o",
                "BatchMode=yes",
                "-o",
                "StrictHostKeyChecking=accept-new",
                "-o",
                "ConnectTimeout=7",
                "-i",
                "/home/deploy/.ssh/id_ed25519",
                "-p",
                "2222",
                "deploy@10.0.0.5",
                "uptime",
            ])
        );
    }

    #[test]
    fn ssh_argv_operation_is_quoted_into_one_remote_command() {
        let target = Target::new("db1");
        let spec =
            build_command(&target, &Operation::argv(["echo", "two words"]), 10).unwrap();
        assert_eq!(spec.args.last().map(String::as_str), Some("echo 'two words'"));
        assert_eq!(spec.args[spec.args.len() - 2], "db1");
    }

    #[test]
    fn docker_command_targets_daemon_url() {
        let target = Target::new("10.0.0.7").with_transport(Transport::Docker { tls: true });
        let spec = build_command(&target, &Operation::shell("ps --format '{{.ID}}'"), 10).unwrap();
        assert_eq!(spec.program, "docker");
        assert_eq!(
            spec.args,
            strings(&["-H", "tcp://10.0.0.7:2376", "--tlsverify", "ps", "--format", "{{.ID}}"])
        );

        let plain = Target::new("fd00::7").with_transport(Transport::Docker { tls: false });
        let spec = build_command(&plain, &Operation::argv(["version"]), 10).unwrap();
        assert_eq!(spec.args, strings(&["-H", "tcp://[fd00::7]:2375", "version"]));
    }

    #[test]
    fn docker_rejects_unbalanced_quotes() {
        let target = Target::new("h").with_transport(Transport::Docker { tls: false });
        assert!(build_command(&target, &Operation::shell("ps 'oops"), 10).is_err());
    }

    #[test]
    fn local_shell_runs_under_sh() {
        let target = Target::new("10.0.0.5").with_transport(Transport::Local);
        let spec = build_command(&target, &Operation::shell("true"), 10).unwrap();
        assert_eq!(spec.program, "sh");
        assert_eq!(spec.args, strings(&["-c", "true"]));
        let spec = build_command(&target, &Operation::argv(["ls", "-l"]), 10).unwrap();
        assert_eq!(spec.program, "ls");
        assert_eq!(spec.args, strings(&["-l"]));
    }

    #[test]
    fn empty_operation_is_rejected() {
        let target = Target::new("h").with_transport(Transport::Local);
        assert!(build_command(&target, &Operation::shell("  "), 10).is_err());
        assert!(build_command(&target, &Operation::Argv(Vec::new()), 10).is_err());
    }

    #[test]
    fn connection_failures_are_recognised_per_transport() {
        assert!(is_connection_failure(&Transport::Ssh, Some(255), ""));
        assert!(!is_connection_failure(&Transport::Ssh, Some(1), ""));
        assert!(is_connection_failure(
            &Transport::Docker { tls: false },
            Some(1),
            "Cannot connect to the Docker daemon at tcp://h:2375. Is the docker daemon running?"
        ));
        assert!(!is_connection_failure(&Transport::Docker { tls: false }, Some(1), "no such image"));
        assert!(!is_connection_failure(&Transport::Local, Some(255), ""));
    }

    #[test]
    fn display_quotes_arguments() {
        let target = Target::new("h").with_transport(Transport::Local);
        let spec = build_command(&target, &Operation::shell("echo hi"), 10).unwrap();
        assert_eq!(spec.display(), "sh -c 'echo hi'");
    }
}
