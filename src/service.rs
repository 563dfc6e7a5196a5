//! Typed service definitions
//!
//! A [`ServiceSpec`] is the immutable description of one composed service:
//! what to run, what it depends on, how to tell it is ready and what to do
//! when it crashes. Specs are collected into a
//! [`ServiceGraph`](crate::manager::ServiceGraph) before any process exists.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::ready::ReadyContext;

/// Error type returned by caller-supplied readiness predicates and crash handlers
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Readiness predicate, evaluated once per process generation
pub type ReadyFn =
    Arc<dyn Fn(ReadyContext) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Crash handler, invoked once per crash. Returning an error shuts the
/// whole composite down.
pub type CrashHandler =
    Arc<dyn Fn(CrashContext) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Default time to wait for a signalled process before force killing it
pub const DEFAULT_FORCE_KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait after the graceful signal before force killing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceKillTimeout {
    After(Duration),
    Never,
}

impl Default for ForceKillTimeout {
    fn default() -> Self {
        Self::After(DEFAULT_FORCE_KILL_TIMEOUT)
    }
}

/// A service process exiting on its own after it had started
#[derive(Debug, Clone, PartialEq)]
pub struct Crash {
    /// When the crash was detected
    pub date: DateTime<Local>,
    /// Tail of the process output at the time of the crash
    pub log_tail: Vec<String>,
}

/// Argument passed to a [`CrashHandler`]
#[derive(Debug, Clone)]
pub struct CrashContext {
    pub service_id: String,
    /// Whether the crashed process generation had passed its readiness check
    pub is_service_ready: bool,
    pub crash: Crash,
    /// Latest crashes, oldest first, bounded by [`ServiceSpec::crashes_length`]
    pub crashes: Vec<Crash>,
}

/// Validated description of one service
#[derive(Clone)]
pub struct ServiceSpec {
    pub id: String,
    /// Ids of services that must be ready before this one starts
    pub dependencies: Vec<String>,
    /// Binary followed by its arguments
    pub command: Vec<String>,
    /// Complete child environment (nothing is inherited implicitly)
    pub env: HashMap<String, String>,
    pub working_directory: PathBuf,
    pub ready: ReadyFn,
    pub on_crash: CrashHandler,
    pub minimum_restart_delay: Duration,
    pub force_kill_timeout: ForceKillTimeout,
    /// Number of crash records retained for the crash handler
    pub crashes_length: usize,
    /// Number of output lines retained per process (0 disables the tail)
    pub log_tail_length: usize,
}

impl ServiceSpec {
    pub fn new<I, S>(id: impl Into<String>, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            dependencies: Vec::new(),
            command: command.into_iter().map(Into::into).collect(),
            env: HashMap::new(),
            working_directory: PathBuf::from("."),
            ready: ready_immediately(),
            on_crash: default_crash_handler(),
            minimum_restart_delay: Duration::ZERO,
            force_kill_timeout: ForceKillTimeout::default(),
            crashes_length: 0,
            log_tail_length: 0,
        }
    }

    pub fn dependency(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        if !self.dependencies.contains(&id) {
            self.dependencies.push(id);
        }
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = dir.into();
        self
    }

    /// Set the readiness predicate
    pub fn ready<F, Fut>(mut self, predicate: F) -> Self
    where
        F: Fn(ReadyContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.ready = Arc::new(move |ctx| predicate(ctx).boxed());
        self
    }

    /// Set the crash handler
    pub fn on_crash<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(CrashContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.on_crash = Arc::new(move |ctx| handler(ctx).boxed());
        self
    }

    pub fn minimum_restart_delay(mut self, delay: Duration) -> Self {
        self.minimum_restart_delay = delay;
        self
    }

    pub fn force_kill_timeout(mut self, timeout: ForceKillTimeout) -> Self {
        self.force_kill_timeout = timeout;
        self
    }

    pub fn crashes_length(mut self, len: usize) -> Self {
        self.crashes_length = len;
        self
    }

    pub fn log_tail_length(mut self, len: usize) -> Self {
        self.log_tail_length = len;
        self
    }
}

impl fmt::Debug for ServiceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceSpec")
            .field("id", &self.id)
            .field("dependencies", &self.dependencies)
            .field("command", &self.command)
            .field("env", &self.env.len())
            .field("working_directory", &self.working_directory)
            .field("minimum_restart_delay", &self.minimum_restart_delay)
            .field("force_kill_timeout", &self.force_kill_timeout)
            .field("crashes_length", &self.crashes_length)
            .field("log_tail_length", &self.log_tail_length)
            .finish_non_exhaustive()
    }
}

/// Readiness predicate that succeeds as soon as the process has spawned
pub fn ready_immediately() -> ReadyFn {
    Arc::new(|_ctx: ReadyContext| async { Ok::<(), BoxError>(()) }.boxed())
}

/// Crash handler used when none is configured: restart, unless the
/// process never became ready
pub fn default_crash_handler() -> CrashHandler {
    Arc::new(|ctx: CrashContext| {
        async move {
            if !ctx.is_service_ready {
                return Err::<(), BoxError>("Crashed before becoming ready".into());
            }
            Ok(())
        }
        .boxed()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crash_context(is_service_ready: bool) -> CrashContext {
        let crash = Crash {
            date: Local::now(),
            log_tail: vec!["boom".to_string()],
        };
        CrashContext {
            service_id: "web".to_string(),
            is_service_ready,
            crash: crash.clone(),
            crashes: vec![crash],
        }
    }

    #[test]
    fn test_builder_defaults() {
        let spec = ServiceSpec::new("web", ["node", "server.js"]);
        assert_eq!(spec.id, "web");
        assert_eq!(spec.command, vec!["node", "server.js"]);
        assert!(spec.dependencies.is_empty());
        assert_eq!(spec.working_directory, PathBuf::from("."));
        assert_eq!(spec.force_kill_timeout, ForceKillTimeout::After(DEFAULT_FORCE_KILL_TIMEOUT));
        assert_eq!(spec.minimum_restart_delay, Duration::ZERO);
        assert_eq!(spec.crashes_length, 0);
        assert_eq!(spec.log_tail_length, 0);
    }

    #[test]
    fn test_dependency_dedup_keeps_order() {
        let spec = ServiceSpec::new("api", ["api"])
            .dependency("db")
            .dependency("cache")
            .dependency("db");
        assert_eq!(spec.dependencies, vec!["db", "cache"]);
    }

    #[test]
    fn test_env_overrides() {
        let spec = ServiceSpec::new("api", ["api"])
            .envs([("PORT", "3000"), ("HOST", "localhost")])
            .env("PORT", "4000");
        assert_eq!(spec.env.get("PORT").map(String::as_str), Some("4000"));
        assert_eq!(spec.env.get("HOST").map(String::as_str), Some("localhost"));
    }

    #[tokio::test]
    async fn test_default_crash_handler() {
        let handler = default_crash_handler();
        assert!(handler(crash_context(true)).await.is_ok());

        let err = handler(crash_context(false)).await.unwrap_err();
        assert_eq!(err.to_string(), "Crashed before becoming ready");
    }
}
