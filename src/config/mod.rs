//! Composition files
//!
//! Turns a parsed composition file into a validated [`ServiceGraph`] and
//! [`OrchestratorOptions`]. Settings merge in three layers, later wins:
//! built-in defaults, the `[Defaults]` section, the `[Service <id>]` section.

mod parser;

pub use parser::{
    parse_bool, parse_command, parse_composition_file, parse_environment, parse_file, ParseError,
    ParsedFile, ParsedSection,
};

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::manager::{GraphError, OrchestratorOptions, ServiceGraph};
use crate::ready::HTTP_OK;
use crate::service::{BoxError, ForceKillTimeout, ServiceSpec};

const SERVICE_SECTION_PREFIX: &str = "[Service ";

const LOG_LEVELS: &[&str] = &["off", "error", "warn", "info", "debug", "trace"];

/// How a service signals that it is ready
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyCheck {
    /// An output line equal to the text
    OutputLine(String),
    /// An output line containing the text
    OutputIncludes(String),
    /// A TCP port accepting connections
    TcpPort { host: String, port: u16 },
    /// An HTTP GET answering with the given status
    HttpOk { url: String, status: u16 },
    /// A fixed delay after spawning
    Delay(Duration),
}

/// What to do when a service crashes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CrashPolicy {
    /// Always restart
    Restart,
    /// Restart, unless the crashed process never became ready
    #[default]
    FailIfNotReady,
    /// Shut the composite down
    Fail,
}

impl CrashPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "restart" => Some(Self::Restart),
            "fail-if-not-ready" => Some(Self::FailIfNotReady),
            "fail" => Some(Self::Fail),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Restart => "restart",
            Self::FailIfNotReady => "fail-if-not-ready",
            Self::Fail => "fail",
        }
    }
}

/// Per-service settings as written; `None` means "not set at this layer"
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceSettings {
    pub command: Option<Vec<String>>,
    pub dependencies: Option<Vec<String>>,
    pub working_directory: Option<PathBuf>,
    pub environment: Option<Vec<(String, String)>>,
    pub inherit_environment: Option<bool>,
    pub ready: Option<ReadyCheck>,
    pub force_kill_timeout: Option<ForceKillTimeout>,
    pub minimum_restart_delay: Option<Duration>,
    pub crashes_length: Option<usize>,
    pub log_tail_length: Option<usize>,
    pub on_crash: Option<CrashPolicy>,
}

impl ServiceSettings {
    /// Overlay `other` on top of `self`
    pub fn merged(self, other: ServiceSettings) -> ServiceSettings {
        ServiceSettings {
            command: other.command.or(self.command),
            dependencies: other.dependencies.or(self.dependencies),
            working_directory: other.working_directory.or(self.working_directory),
            environment: other.environment.or(self.environment),
            inherit_environment: other.inherit_environment.or(self.inherit_environment),
            ready: other.ready.or(self.ready),
            force_kill_timeout: other.force_kill_timeout.or(self.force_kill_timeout),
            minimum_restart_delay: other.minimum_restart_delay.or(self.minimum_restart_delay),
            crashes_length: other.crashes_length.or(self.crashes_length),
            log_tail_length: other.log_tail_length.or(self.log_tail_length),
            on_crash: other.on_crash.or(self.on_crash),
        }
    }

    fn parse(section_name: &str, section: &ParsedSection) -> Result<Self, ConfigError> {
        let mut settings = ServiceSettings::default();
        let mut ready_keys = Vec::new();

        for (key, values) in section {
            let Some(value) = values.last() else {
                continue;
            };
            let invalid = || ConfigError::InvalidValue {
                section: section_name.to_string(),
                key: key.clone(),
                value: value.clone(),
            };

            match key.as_str() {
                "COMMAND" => settings.command = Some(parse_command(value)?),
                "DEPENDENCIES" => settings.dependencies = Some(values.clone()),
                "WORKINGDIRECTORY" => settings.working_directory = Some(PathBuf::from(value)),
                "ENVIRONMENT" => {
                    let mut vars = Vec::new();
                    for line in values {
                        vars.extend(parse_environment(line)?);
                    }
                    settings.environment = Some(vars);
                }
                "INHERITENVIRONMENT" => {
                    settings.inherit_environment = Some(parse_bool(value).ok_or_else(invalid)?)
                }
                "READYOUTPUTLINE" => {
                    ready_keys.push(key.clone());
                    settings.ready = Some(ReadyCheck::OutputLine(value.clone()));
                }
                "READYOUTPUTINCLUDES" => {
                    ready_keys.push(key.clone());
                    settings.ready = Some(ReadyCheck::OutputIncludes(value.clone()));
                }
                "READYTCPPORT" => {
                    ready_keys.push(key.clone());
                    settings.ready = Some(parse_tcp_target(value).ok_or_else(invalid)?);
                }
                "READYHTTPOK" => {
                    ready_keys.push(key.clone());
                    settings.ready = Some(parse_http_target(value).ok_or_else(invalid)?);
                }
                "READYDELAY" => {
                    ready_keys.push(key.clone());
                    settings.ready = Some(ReadyCheck::Delay(parse_duration(value).ok_or_else(invalid)?));
                }
                "FORCEKILLTIMEOUT" => {
                    settings.force_kill_timeout = Some(parse_force_kill_timeout(value).ok_or_else(invalid)?)
                }
                "MINIMUMRESTARTDELAY" => {
                    settings.minimum_restart_delay = Some(parse_duration(value).ok_or_else(invalid)?)
                }
                "CRASHESLENGTH" => {
                    settings.crashes_length = Some(value.parse().map_err(|_| invalid())?)
                }
                "LOGTAILLENGTH" => {
                    settings.log_tail_length = Some(value.parse().map_err(|_| invalid())?)
                }
                "ONCRASH" => settings.on_crash = Some(CrashPolicy::parse(value).ok_or_else(invalid)?),
                _ => {
                    return Err(ConfigError::UnknownSetting {
                        section: section_name.to_string(),
                        key: key.clone(),
                    })
                }
            }
        }

        if ready_keys.len() > 1 {
            ready_keys.sort();
            return Err(ConfigError::ConflictingReadyChecks {
                section: section_name.to_string(),
                keys: ready_keys,
            });
        }

        Ok(settings)
    }
}

/// A parsed, not yet validated composition
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompositeConfig {
    pub graceful_shutdown: bool,
    pub windows_ctrl_c_shutdown: bool,
    pub log_level: Option<String>,
    pub defaults: ServiceSettings,
    /// Services in file order
    pub services: Vec<(String, ServiceSettings)>,
}

impl CompositeConfig {
    /// Load a composition file from disk
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let parsed = parse_composition_file(path).await?;
        Self::from_parsed(&parsed)
    }

    pub fn from_parsed(parsed: &ParsedFile) -> Result<Self, ConfigError> {
        let mut config = CompositeConfig::default();

        for (name, section) in parsed {
            if name == "[Composite]" {
                config.parse_composite(name, section)?;
            } else if name == "[Defaults]" {
                config.defaults = ServiceSettings::parse(name, section)?;
            } else if let Some(id) = name
                .strip_prefix(SERVICE_SECTION_PREFIX)
                .and_then(|rest| rest.strip_suffix(']'))
            {
                config
                    .services
                    .push((id.to_string(), ServiceSettings::parse(name, section)?));
            } else {
                return Err(ConfigError::UnknownSection(name.clone()));
            }
        }

        Ok(config)
    }

    fn parse_composite(&mut self, name: &str, section: &ParsedSection) -> Result<(), ConfigError> {
        for (key, values) in section {
            let Some(value) = values.last() else {
                continue;
            };
            let invalid = || ConfigError::InvalidValue {
                section: name.to_string(),
                key: key.clone(),
                value: value.clone(),
            };
            match key.as_str() {
                "GRACEFULSHUTDOWN" => self.graceful_shutdown = parse_bool(value).ok_or_else(invalid)?,
                "WINDOWSCTRLCSHUTDOWN" => {
                    self.windows_ctrl_c_shutdown = parse_bool(value).ok_or_else(invalid)?
                }
                "LOGLEVEL" => {
                    let level = value.to_lowercase();
                    if !LOG_LEVELS.contains(&level.as_str()) {
                        return Err(invalid());
                    }
                    self.log_level = Some(level);
                }
                _ => {
                    return Err(ConfigError::UnknownSetting {
                        section: name.to_string(),
                        key: key.clone(),
                    })
                }
            }
        }
        Ok(())
    }

    /// Composite options after platform normalisation
    pub fn options(&self) -> OrchestratorOptions {
        let windows_ctrl_c_shutdown = cfg!(windows) && self.windows_ctrl_c_shutdown;
        OrchestratorOptions {
            graceful_shutdown: !windows_ctrl_c_shutdown && self.graceful_shutdown,
            windows_ctrl_c_shutdown,
        }
    }

    /// Merge every service with the defaults, in file order
    pub fn resolved_services(&self) -> Vec<(String, ServiceSettings)> {
        self.services
            .iter()
            .map(|(id, settings)| (id.clone(), self.defaults.clone().merged(settings.clone())))
            .collect()
    }

    /// Validate and build the service graph
    pub fn into_graph(self) -> Result<(ServiceGraph, OrchestratorOptions), ConfigError> {
        if self.services.is_empty() {
            return Err(ConfigError::NoServices);
        }

        let resolved = self.resolved_services();

        for (id, settings) in &resolved {
            for dep in settings.dependencies.iter().flatten() {
                let Some((_, dep_settings)) = resolved.iter().find(|(other, _)| other == dep) else {
                    // Reported by the graph as an unknown dependency
                    continue;
                };
                if dep_settings.ready.is_none() {
                    return Err(ConfigError::DependencyWithoutReadyCheck {
                        service: id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let specs = resolved
            .into_iter()
            .map(|(id, settings)| build_spec(id, settings))
            .collect::<Result<Vec<_>, _>>()?;

        let graph = ServiceGraph::build(specs)?;
        Ok((graph, self.options()))
    }
}

fn build_spec(id: String, settings: ServiceSettings) -> Result<ServiceSpec, ConfigError> {
    let command = settings
        .command
        .ok_or_else(|| ConfigError::MissingCommand(id.clone()))?;
    if command.first().map_or(true, |binary| binary.trim().is_empty()) {
        return Err(ConfigError::NoBinary(id));
    }

    let mut spec = ServiceSpec::new(id, command);

    for dep in settings.dependencies.unwrap_or_default() {
        spec = spec.dependency(dep);
    }
    if let Some(dir) = settings.working_directory {
        spec = spec.working_directory(dir);
    }
    if settings.inherit_environment.unwrap_or(true) {
        spec = spec.envs(std::env::vars());
    }
    if let Some(vars) = settings.environment {
        spec = spec.envs(vars);
    }
    if let Some(timeout) = settings.force_kill_timeout {
        spec = spec.force_kill_timeout(timeout);
    }
    if let Some(delay) = settings.minimum_restart_delay {
        spec = spec.minimum_restart_delay(delay);
    }
    if let Some(len) = settings.crashes_length {
        spec = spec.crashes_length(len);
    }
    if let Some(len) = settings.log_tail_length {
        spec = spec.log_tail_length(len);
    }

    spec = match settings.ready {
        None => spec,
        Some(ReadyCheck::OutputLine(text)) => spec.ready(move |mut ctx| {
            let text = text.clone();
            async move { ctx.once_output_line_is(&text).await }
        }),
        Some(ReadyCheck::OutputIncludes(text)) => spec.ready(move |mut ctx| {
            let text = text.clone();
            async move { ctx.once_output_line_includes(&text).await }
        }),
        Some(ReadyCheck::TcpPort { host, port }) => spec.ready(move |ctx| {
            let host = host.clone();
            async move { ctx.once_tcp_port_used(port, &host).await }
        }),
        Some(ReadyCheck::HttpOk { url, status }) => spec.ready(move |ctx| {
            let url = url.clone();
            async move { ctx.once_http_ok(&url, status).await }
        }),
        Some(ReadyCheck::Delay(delay)) => spec.ready(move |ctx| async move { ctx.once_delay(delay).await }),
    };

    spec = match settings.on_crash.unwrap_or_default() {
        CrashPolicy::FailIfNotReady => spec,
        CrashPolicy::Restart => spec.on_crash(|_ctx| async { Ok::<(), BoxError>(()) }),
        CrashPolicy::Fail => spec.on_crash(|ctx| async move {
            Err::<(), BoxError>(format!("Service {} crashed", ctx.service_id).into())
        }),
    };

    Ok(spec)
}

/// Parse `host:port` or a bare port (host defaults to localhost)
fn parse_tcp_target(s: &str) -> Option<ReadyCheck> {
    let s = s.trim();
    let (host, port) = match s.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => (host.to_string(), port),
        Some(_) => return None,
        None => ("localhost".to_string(), s),
    };
    Some(ReadyCheck::TcpPort {
        host,
        port: port.parse().ok()?,
    })
}

/// Parse `url` or `url status` (status defaults to 200)
fn parse_http_target(s: &str) -> Option<ReadyCheck> {
    let mut parts = s.split_whitespace();
    let url = parts.next()?;
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return None;
    }
    let status = match parts.next() {
        Some(status) => status.parse().ok().filter(|s| (100..=599).contains(s))?,
        None => HTTP_OK,
    };
    if parts.next().is_some() {
        return None;
    }
    Some(ReadyCheck::HttpOk {
        url: url.to_string(),
        status,
    })
}

/// Parse a duration string (e.g., "500ms", "5s", "2min", "1h", "30")
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();

    if let Some(n) = s.strip_suffix("ms") {
        n.trim().parse().ok().map(Duration::from_millis)
    } else if let Some(n) = s.strip_suffix("min") {
        let minutes = n.trim().parse::<u64>().ok()?;
        minutes.checked_mul(60).map(Duration::from_secs)
    } else if let Some(n) = s.strip_suffix('s') {
        n.trim().parse().ok().map(Duration::from_secs)
    } else if let Some(n) = s.strip_suffix('h') {
        let hours = n.trim().parse::<u64>().ok()?;
        hours.checked_mul(3600).map(Duration::from_secs)
    } else {
        // Bare number = seconds
        s.parse().ok().map(Duration::from_secs)
    }
}

/// Parse a force-kill timeout: a duration, or `infinity` to never force kill
pub fn parse_force_kill_timeout(s: &str) -> Option<ForceKillTimeout> {
    match s.trim().to_lowercase().as_str() {
        "infinity" | "never" => Some(ForceKillTimeout::Never),
        other => parse_duration(other).map(ForceKillTimeout::After),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Unknown section: {0}")]
    UnknownSection(String),

    #[error("Unknown setting {key} in {section}")]
    UnknownSetting { section: String, key: String },

    #[error("Invalid value for {key} in {section}: '{value}'")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
    },

    #[error("Conflicting readiness checks in {section}: {}", .keys.join(", "))]
    ConflictingReadyChecks { section: String, keys: Vec<String> },

    #[error("No services defined")]
    NoServices,

    #[error("Service {0} has no Command=")]
    MissingCommand(String),

    #[error("Command of service {0} has no binary part")]
    NoBinary(String),

    #[error("Service {service} depends on service {dependency} which has no readiness check")]
    DependencyWithoutReadyCheck { service: String, dependency: String },

    #[error(transparent)]
    Graph(#[from] GraphError),
}
