use crate::config::{parse_transport, LoadedConfig};
use crate::runner::Job;
use anyhow::Context;
use protocol::config::parse_ssh_destination;
use protocol::{Operation, Target};
use std::path::PathBuf;
use std::time::Duration;

/// Which targets to run against and the command-line overrides that apply to
/// every resulting job.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Ad-hoc `host` or `user@host`, used when no configured target is named.
    pub host: Option<String>,
    pub targets: Vec<String>,
    pub all: bool,
    pub user: Option<String>,
    pub identity_file: Option<PathBuf>,
    pub port: Option<u16>,
    pub transport: Option<String>,
    pub tls: bool,
    /// Wins over per-target timeouts.
    pub timeout: Option<Duration>,
    /// Wins over per-target and default categories.
    pub category: Option<String>,
}

/// Builds the operation from command-line words. Shell words are re-quoted so
/// `run h -- echo "a b"` reaches the remote shell as `echo 'a b'`.
pub fn operation_from_words(words: &[String], argv: bool) -> Operation {
    if argv {
        Operation::Argv(words.to_vec())
    } else if let [single] = words {
        Operation::Shell(single.clone())
    } else {
        Operation::Shell(shell_words::join(words))
    }
}

pub fn plan_jobs(
    config: &LoadedConfig,
    request: &RunRequest,
    operation: &Operation,
) -> anyhow::Result<Vec<Job>> {
    let mut jobs = select_jobs(config, request, operation)?;
    let category = request
        .category
        .as_deref()
        .map(str::trim)
        .filter(|category| !category.is_empty());
    for job in &mut jobs {
        if let Some(category) = category {
            job.category = Some(category.to_string());
        }
        if let Some(timeout) = request.timeout {
            job.timeout = Some(timeout);
        }
    }
    Ok(jobs)
}

fn select_jobs(
    config: &LoadedConfig,
    request: &RunRequest,
    operation: &Operation,
) -> anyhow::Result<Vec<Job>> {
    if request.all {
        if config.targets.is_empty() {
            anyhow::bail!("--all needs a config file with at least one target");
        }
        return Ok(config
            .targets
            .iter()
            .map(|target| target.job(operation.clone()))
            .collect());
    }
    if !request.targets.is_empty() {
        return request
            .targets
            .iter()
            .map(|name| {
                config
                    .find_target(name)
                    .map(|target| target.job(operation.clone()))
                    .with_context(|| format!("no target named {} in config", name))
            })
            .collect();
    }
    let Some(raw_host) = request.host.as_deref() else {
        anyhow::bail!("give a host, --target NAME or --all");
    };
    let (user_in_host, host) = parse_ssh_destination(raw_host)
        .with_context(|| format!("invalid host {:?}", raw_host))?;
    let transport =
        parse_transport(request.transport.as_deref(), request.tls).map_err(anyhow::Error::msg)?;
    let target = Target {
        host: host.to_string(),
        user: request
            .user
            .clone()
            .or_else(|| user_in_host.map(str::to_string))
            .or_else(|| config.default_user.clone()),
        identity_file: request
            .identity_file
            .clone()
            .or_else(|| config.default_identity_file.clone()),
        port: request.port,
        transport,
        ssh_args: config.default_ssh_args.clone(),
    };
    Ok(vec![Job::new(target, operation.clone())])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::resolve_config;
    use protocol::config::RunnerConfig;
    use protocol::Transport;

    fn config(input: &str) -> LoadedConfig {
        let parsed: RunnerConfig = toml::from_str(input).unwrap();
        resolve_config(parsed).unwrap()
    }

    fn fleet() -> LoadedConfig {
        config(
            r#"
[defaults]
user = "ops"
identity_file = "/etc/runner/id_ed25519"
category = "fleet"

[[targets]]
name = "web"
host = "10.0.0.5"
timeout = "5s"
category = "frontend"

[[targets]]
name = "db"
host = "10.0.0.6"
timeout = "2m"
"#,
        )
    }

    fn uptime() -> Operation {
        Operation::shell("uptime")
    }

    #[test]
    fn timeout_override_replaces_every_per_target_timeout() {
        let request = RunRequest {
            all: true,
            timeout: Some(Duration::from_secs(7)),
            ..RunRequest::default()
        };
        let jobs = plan_jobs(&fleet(), &request, &uptime()).unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs
            .iter()
            .all(|job| job.timeout == Some(Duration::from_secs(7))));
    }

    #[test]
    fn per_target_timeouts_survive_without_override() {
        let request = RunRequest {
            all: true,
            ..RunRequest::default()
        };
        let jobs = plan_jobs(&fleet(), &request, &uptime()).unwrap();
        assert_eq!(jobs[0].timeout, Some(Duration::from_secs(5)));
        assert_eq!(jobs[1].timeout, Some(Duration::from_secs(120)));
    }

    #[test]
    fn category_override_replaces_every_job_category() {
        let request = RunRequest {
            targets: vec!["web".to_string(), "db".to_string()],
            category: Some(" nightly ".to_string()),
            ..RunRequest::default()
        };
        let jobs = plan_jobs(&fleet(), &request, &uptime()).unwrap();
        assert!(jobs
            .iter()
            .all(|job| job.category.as_deref() == Some("nightly")));

        let blank = RunRequest {
            targets: vec!["web".to_string()],
            category: Some("  ".to_string()),
            ..RunRequest::default()
        };
        let jobs = plan_jobs(&fleet(), &blank, &uptime()).unwrap();
        assert_eq!(jobs[0].category.as_deref(), Some("frontend"));
    }

    #[test]
    fn user_flag_beats_host_prefix_beats_config_default() {
        let fleet = fleet();
        let plain = RunRequest {
            host: Some("10.0.0.9".to_string()),
            ..RunRequest::default()
        };
        let jobs = plan_jobs(&fleet, &plain, &uptime()).unwrap();
        assert_eq!(jobs[0].target.destination(), "ops@10.0.0.9");
        assert_eq!(
            jobs[0].target.identity_file.as_deref(),
            Some(std::path::Path::new("/etc/runner/id_ed25519"))
        );

        let prefixed = RunRequest {
            host: Some("admin@10.0.0.9".to_string()),
            ..RunRequest::default()
        };
        let jobs = plan_jobs(&fleet, &prefixed, &uptime()).unwrap();
        assert_eq!(jobs[0].target.host, "10.0.0.9");
        assert_eq!(jobs[0].target.destination(), "admin@10.0.0.9");

        let flagged = RunRequest {
            user: Some("root".to_string()),
            ..prefixed
        };
        let jobs = plan_jobs(&fleet, &flagged, &uptime()).unwrap();
        assert_eq!(jobs[0].target.destination(), "root@10.0.0.9");
    }

    #[test]
    fn ad_hoc_host_takes_transport_port_and_key_from_request() {
        let request = RunRequest {
            host: Some("10.0.0.9".to_string()),
            transport: Some("docker".to_string()),
            tls: true,
            port: Some(12376),
            identity_file: Some(PathBuf::from("/tmp/key")),
            ..RunRequest::default()
        };
        let jobs = plan_jobs(&LoadedConfig::default(), &request, &uptime()).unwrap();
        let target = &jobs[0].target;
        assert_eq!(target.transport, Transport::Docker { tls: true });
        assert_eq!(target.effective_port(), Some(12376));
        assert_eq!(target.identity_file.as_deref(), Some(std::path::Path::new("/tmp/key")));
        assert_eq!(jobs[0].category, None);
        assert_eq!(jobs[0].timeout, None);
    }

    #[test]
    fn selection_errors_are_reported() {
        let empty = LoadedConfig::default();
        let all = RunRequest {
            all: true,
            ..RunRequest::default()
        };
        assert!(plan_jobs(&empty, &all, &uptime()).is_err());

        let unknown = RunRequest {
            targets: vec!["cache".to_string()],
            ..RunRequest::default()
        };
        let err = plan_jobs(&fleet(), &unknown, &uptime()).unwrap_err();
        assert!(err.to_string().contains("no target named cache"));

        assert!(plan_jobs(&empty, &RunRequest::default(), &uptime()).is_err());

        let bad_transport = RunRequest {
            host: Some("h".to_string()),
            transport: Some("telnet".to_string()),
            ..RunRequest::default()
        };
        assert!(plan_jobs(&empty, &bad_transport, &uptime()).is_err());
    }

    #[test]
    fn shell_words_keep_their_quoting() {
        let words = vec!["echo".to_string(), "a b".to_string(), "it's".to_string()];
        assert_eq!(
            operation_from_words(&words, false),
            Operation::shell("echo 'a b' 'it'\\''s'")
        );
        assert_eq!(
            operation_from_words(&words, true),
            Operation::argv(["echo", "a b", "it's"])
        );
    }

    #[test]
    fn single_word_is_passed_to_the_shell_verbatim() {
        let words = vec!["ls -l | wc -l".to_string()];
        assert_eq!(
            operation_from_words(&words, false),
            Operation::shell("ls -l | wc -l")
        );
    }
}
