use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    #[serde(default)]
    pub defaults: RunnerDefaults,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunnerDefaults {
    pub log_path: Option<PathBuf>,
    /// Humantime duration such as `30s` or `2m`.
    pub timeout: Option<String>,
    pub max_output_bytes: Option<u64>,
    pub category: Option<String>,
    pub concurrency: Option<usize>,
    pub user: Option<String>,
    pub identity_file: Option<PathBuf>,
    pub ssh_args: Option<Vec<String>>,
    pub connect_timeout_secs: Option<u64>,
    /// Resolve remote host names before launching; disable for ssh config aliases.
    pub resolve_hosts: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    pub name: String,
    pub host: String,
    pub transport: Option<String>,
    pub user: Option<String>,
    pub identity_file: Option<PathBuf>,
    pub port: Option<u16>,
    pub tls: Option<bool>,
    pub ssh_args: Option<Vec<String>>,
    pub category: Option<String>,
    pub timeout: Option<String>,
}

/// Splits `user@host` into its parts; a bare host yields no user.
pub fn parse_ssh_destination(value: &str) -> Option<(Option<&str>, &str)> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    match value.rsplit_once('@') {
        Some((user, host)) => {
            let user = user.trim();
            let host = host.trim();
            if user.is_empty() || host.is_empty() {
                None
            } else {
                Some((Some(user), host))
            }
        }
        None => Some((None, value)),
    }
}
