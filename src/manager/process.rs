//! Process spawning

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};

use crate::service::ServiceSpec;

#[cfg(windows)]
const PATH_SEPARATOR: &str = ";";
#[cfg(not(windows))]
const PATH_SEPARATOR: &str = ":";

/// Extensions Windows tries for a bare program name when PATHEXT is unset
pub const DEFAULT_PATHEXT: &str = ".COM;.EXE;.BAT;.CMD;.VBS;.VBE;.JS;.JSE;.WSF;.WSH";

/// Spawn the child process for a service
///
/// Output is piped for line splitting, stdin is closed, and the child gets
/// exactly `spec.env`, nothing inherited.
pub fn spawn_service(spec: &ServiceSpec) -> Result<Child, SpawnError> {
    let (program, args) = spec
        .command
        .split_first()
        .ok_or_else(|| SpawnError::NoCommand(spec.id.clone()))?;

    if program.trim().is_empty() {
        return Err(SpawnError::NoCommand(spec.id.clone()));
    }

    let mut env = normalize_path_env(&spec.env);
    if cfg!(windows) {
        env = with_default_pathext(env);
    }

    let mut cmd = Command::new(resolve_program(program, &env, &spec.working_directory));
    cmd.args(args);
    cmd.current_dir(&spec.working_directory);

    cmd.env_clear();
    cmd.envs(env);

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    cmd.spawn().map_err(|e| SpawnError::Spawn(e.to_string()))
}

/// Rewrite the PATH variable under its upper-case key with blank entries removed
///
/// The key is matched case-insensitively; when several spellings exist the
/// last one (in sorted key order) wins.
pub fn normalize_path_env(env: &HashMap<String, String>) -> HashMap<String, String> {
    let mut keys: Vec<&String> = env
        .keys()
        .filter(|k| k.eq_ignore_ascii_case("PATH"))
        .collect();
    keys.sort();

    let Some(path) = keys.last().map(|k| env[*k].clone()) else {
        return env.clone();
    };

    let mut normalized: HashMap<String, String> = env
        .iter()
        .filter(|(k, _)| !k.eq_ignore_ascii_case("PATH"))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let path = path
        .split(PATH_SEPARATOR)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(PATH_SEPARATOR);
    normalized.insert("PATH".to_string(), path);
    normalized
}

/// Add PATHEXT with the stock Windows value unless some spelling of it is set
pub fn with_default_pathext(mut env: HashMap<String, String>) -> HashMap<String, String> {
    if !env.keys().any(|k| k.eq_ignore_ascii_case("PATHEXT")) {
        env.insert("PATHEXT".to_string(), DEFAULT_PATHEXT.to_string());
    }
    env
}

/// Look the program up in the child's PATH, not ours
///
/// Windows resolves a bare name against the parent's PATH, so `env_clear`
/// alone would ignore the service's own PATH. Falls back to the name as
/// given so the spawn error names the missing program.
#[cfg(windows)]
fn resolve_program(program: &str, env: &HashMap<String, String>, cwd: &Path) -> PathBuf {
    which::which_in(program, env.get("PATH"), cwd).unwrap_or_else(|e| {
        log::debug!("Could not resolve '{}' in service PATH: {}", program, e);
        PathBuf::from(program)
    })
}

#[cfg(not(windows))]
fn resolve_program(program: &str, _env: &HashMap<String, String>, _cwd: &Path) -> PathBuf {
    PathBuf::from(program)
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SpawnError {
    #[error("Service {0} has no command")]
    NoCommand(String),

    #[error("Failed to spawn process: {0}")]
    Spawn(String),
}
