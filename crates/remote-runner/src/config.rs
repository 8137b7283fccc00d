use crate::runner::{Job, RunnerSettings, DEFAULT_MAX_OUTPUT_BYTES};
use protocol::config::{parse_ssh_destination, RunnerConfig, RunnerDefaults, TargetConfig};
use protocol::{Target, Transport};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONCURRENCY: usize = 1;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("{0}")]
    Invalid(String),
}

/// A configured target with its per-target overrides resolved.
#[derive(Debug, Clone)]
pub struct NamedTarget {
    pub name: String,
    pub target: Target,
    pub category: Option<String>,
    pub timeout: Option<Duration>,
}

impl NamedTarget {
    pub fn job(&self, operation: protocol::Operation) -> Job {
        Job {
            target: self.target.clone(),
            operation,
            category: self.category.clone(),
            timeout: self.timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub settings: RunnerSettings,
    pub concurrency: usize,
    pub default_user: Option<String>,
    pub default_identity_file: Option<PathBuf>,
    pub default_ssh_args: Vec<String>,
    pub targets: Vec<NamedTarget>,
}

impl Default for LoadedConfig {
    fn default() -> Self {
        Self {
            settings: RunnerSettings::default(),
            concurrency: DEFAULT_CONCURRENCY,
            default_user: None,
            default_identity_file: None,
            default_ssh_args: Vec::new(),
            targets: Vec::new(),
        }
    }
}

impl LoadedConfig {
    pub fn find_target(&self, name: &str) -> Option<&NamedTarget> {
        self.targets.iter().find(|target| target.name == name)
    }
}

pub fn load_config(path: &Path) -> Result<LoadedConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config: RunnerConfig = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    resolve_config(config)
}

pub fn resolve_config(config: RunnerConfig) -> Result<LoadedConfig, ConfigError> {
    let settings = resolve_settings(&config.defaults)?;
    let concurrency = match config.defaults.concurrency {
        Some(0) => {
            return Err(ConfigError::Invalid(
                "defaults.concurrency must be at least 1".to_string(),
            ))
        }
        Some(value) => value,
        None => DEFAULT_CONCURRENCY,
    };

    let mut targets: Vec<NamedTarget> = Vec::with_capacity(config.targets.len());
    for (index, entry) in config.targets.iter().enumerate() {
        let resolved = resolve_target(index, entry, &config.defaults)?;
        if targets.iter().any(|existing| existing.name == resolved.name) {
            return Err(ConfigError::Invalid(format!(
                "target {} is defined more than once",
                resolved.name
            )));
        }
        targets.push(resolved);
    }

    Ok(LoadedConfig {
        settings,
        concurrency,
        default_user: config.defaults.user.clone(),
        default_identity_file: config.defaults.identity_file.clone(),
        default_ssh_args: config.defaults.ssh_args.clone().unwrap_or_default(),
        targets,
    })
}

fn resolve_settings(defaults: &RunnerDefaults) -> Result<RunnerSettings, ConfigError> {
    let mut settings = RunnerSettings::default();
    if let Some(path) = &defaults.log_path {
        settings.log_path = path.clone();
    }
    if let Some(raw) = &defaults.timeout {
        settings.default_timeout = parse_timeout(raw, "defaults.timeout")?;
    }
    settings.max_output_bytes = match defaults.max_output_bytes {
        Some(0) => {
            return Err(ConfigError::Invalid(
                "defaults.max_output_bytes must be positive".to_string(),
            ))
        }
        Some(value) => usize::try_from(value).unwrap_or(usize::MAX),
        None => DEFAULT_MAX_OUTPUT_BYTES,
    };
    if let Some(secs) = defaults.connect_timeout_secs {
        settings.connect_timeout_secs = secs;
    }
    if let Some(resolve) = defaults.resolve_hosts {
        settings.resolve_hosts = resolve;
    }
    settings.category = non_empty(defaults.category.as_deref());
    Ok(settings)
}

fn resolve_target(
    index: usize,
    entry: &TargetConfig,
    defaults: &RunnerDefaults,
) -> Result<NamedTarget, ConfigError> {
    let name = entry.name.trim();
    if name.is_empty() {
        return Err(ConfigError::Invalid(format!("target[{}] must set name", index)));
    }
    let label = format!("target {}", name);

    let (user_in_host, host) = parse_ssh_destination(&entry.host)
        .ok_or_else(|| ConfigError::Invalid(format!("{} must set host (host or user@host)", label)))?;

    let transport = parse_transport(entry.transport.as_deref(), entry.tls.unwrap_or(false))
        .map_err(|message| ConfigError::Invalid(format!("{}: {}", label, message)))?;

    let user = entry
        .user
        .clone()
        .or_else(|| user_in_host.map(str::to_string))
        .or_else(|| defaults.user.clone());
    let timeout = entry
        .timeout
        .as_deref()
        .map(|raw| parse_timeout(raw, &format!("{}.timeout", label)))
        .transpose()?;

    let target = Target {
        host: host.to_string(),
        user,
        identity_file: entry
            .identity_file
            .clone()
            .or_else(|| defaults.identity_file.clone()),
        port: entry.port,
        transport,
        ssh_args: entry
            .ssh_args
            .clone()
            .or_else(|| defaults.ssh_args.clone())
            .unwrap_or_default(),
    };

    Ok(NamedTarget {
        name: name.to_string(),
        target,
        category: non_empty(entry.category.as_deref()),
        timeout,
    })
}

pub fn parse_transport(value: Option<&str>, tls: bool) -> Result<Transport, String> {
    match value.map(str::trim).unwrap_or("ssh") {
        "ssh" => Ok(Transport::Ssh),
        "docker" => Ok(Transport::Docker { tls }),
        "local" => Ok(Transport::Local),
        other => Err(format!(
            "unknown transport {:?} (expected ssh, docker or local)",
            other
        )),
    }
}

pub fn parse_timeout(raw: &str, field: &str) -> Result<Duration, ConfigError> {
    let duration = humantime::parse_duration(raw.trim())
        .map_err(|err| ConfigError::Invalid(format!("{} {:?} is not a duration: {}", field, raw, err)))?;
    if duration.is_zero() {
        return Err(ConfigError::Invalid(format!("{} must be positive", field)));
    }
    Ok(duration)
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
