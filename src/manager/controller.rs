//! Per-service lifecycle
//!
//! A controller lives as long as the orchestrator and drives a sequence of
//! [`ProcessSupervisor`] generations for one service id:
//!
//! ```text
//!  start ─► spawn gen 1 ─► wait ready ─► Ready ─► ended on its own? ─► crash handler
//!                │              │                                     (+ restart delay)
//!                │ spawn error  │ exited / predicate error                  │
//!                ▼              ▼                                           ▼
//!              fatal          fatal                               spawn gen n+1 ─► ...
//!
//!  stop ─► cancel token ─► end current generation ─► Stopped
//! ```
//!
//! Start and stop are single shared tasks: every caller gets a clone of the
//! same future and the work runs once. Once stop has begun, every restart
//! step checks the stop token and bails out with [`ServiceError::Cancelled`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Local;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::lock;
use super::output::OutputSink;
use super::state::{ServiceState, ServiceStatus};
use super::supervisor::ProcessSupervisor;
use super::terminate::TerminationStrategy;
use crate::ready::{OutputLines, ReadyContext};
use crate::service::{Crash, CrashContext, ServiceSpec};
use crate::shutdown::ShutdownReason;

/// Shared outcome of starting a service
pub type StartTask = Shared<BoxFuture<'static, Result<(), ServiceError>>>;

/// Shared completion of stopping a service
pub type StopTask = Shared<BoxFuture<'static, ()>>;

struct Inner {
    process: Option<Arc<ProcessSupervisor>>,
    generation: u64,
    /// Whether the current generation passed its readiness check
    ready: bool,
    crashes: VecDeque<Crash>,
    state: ServiceState,
    start_task: Option<StartTask>,
    stop_task: Option<StopTask>,
}

/// Lifecycle driver for one service
pub struct ServiceController {
    spec: Arc<ServiceSpec>,
    sink: OutputSink,
    reasons: mpsc::UnboundedSender<ShutdownReason>,
    stop_token: CancellationToken,
    inner: Mutex<Inner>,
}

impl ServiceController {
    /// Create a controller; fatal errors are sent to `reasons`
    pub fn new(
        spec: Arc<ServiceSpec>,
        sink: OutputSink,
        reasons: mpsc::UnboundedSender<ShutdownReason>,
    ) -> Arc<Self> {
        Arc::new(Self {
            spec,
            sink,
            reasons,
            stop_token: CancellationToken::new(),
            inner: Mutex::new(Inner {
                process: None,
                generation: 0,
                ready: false,
                crashes: VecDeque::new(),
                state: ServiceState::new(),
                start_task: None,
                stop_task: None,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn spec(&self) -> &ServiceSpec {
        &self.spec
    }

    pub fn status(&self) -> ServiceStatus {
        self.lock().state.status
    }

    pub fn state(&self) -> ServiceState {
        self.lock().state.clone()
    }

    /// Whether the current process generation has passed its readiness check
    pub fn is_ready(&self) -> bool {
        self.lock().ready
    }

    /// Retained crash history, oldest first
    pub fn crashes(&self) -> Vec<Crash> {
        self.lock().crashes.iter().cloned().collect()
    }

    pub fn restart_count(&self) -> u32 {
        self.lock().state.restart_count
    }

    /// Current process generation, if one was spawned
    pub fn process(&self) -> Option<Arc<ProcessSupervisor>> {
        self.lock().process.clone()
    }

    /// Start the service, or join the start already in flight
    pub fn start(self: &Arc<Self>) -> StartTask {
        let mut inner = self.lock();

        if inner.stop_task.is_some() {
            log::error!(
                "{}",
                InternalError(format!("Cannot start service '{}' after stopping it", self.spec.id))
            );
            return inner
                .start_task
                .clone()
                .unwrap_or_else(|| futures::future::ready(Err(ServiceError::Cancelled)).boxed().shared());
        }

        if let Some(task) = &inner.start_task {
            return task.clone();
        }

        let this = self.clone();
        let task = async move { this.run_start().await }.boxed().shared();
        inner.start_task = Some(task.clone());
        tokio::spawn(task.clone());
        task
    }

    /// Stop the service, or join the stop already in flight
    pub fn stop(self: &Arc<Self>, strategy: TerminationStrategy) -> StopTask {
        let mut inner = self.lock();

        if let Some(task) = &inner.stop_task {
            return task.clone();
        }

        self.stop_token.cancel();
        inner.state.set_stopping();

        let task = match inner.process.clone() {
            Some(process) if process.is_running() => {
                log::info!("Stopping service '{}'...", self.spec.id);
                let ended = process.end(strategy);
                let this = self.clone();
                async move {
                    ended.await;
                    this.lock().state.set_stopped();
                    log::info!("Stopped service '{}'", this.spec.id);
                }
                .boxed()
                .shared()
            }
            _ => {
                inner.state.set_stopped();
                futures::future::ready(()).boxed().shared()
            }
        };

        inner.stop_task = Some(task.clone());
        tokio::spawn(task.clone());
        task
    }

    async fn run_start(self: Arc<Self>) -> Result<(), ServiceError> {
        log::info!("Starting service '{}'...", self.spec.id);

        let result = match self.spawn_generation(false) {
            Ok((process, lines, _)) => self.wait_ready(&process, lines).await.map(|()| process),
            Err(e) => Err(e),
        };

        match result {
            Ok(process) => {
                {
                    let mut inner = self.lock();
                    inner.ready = true;
                    inner.state.set_ready();
                }
                log::info!("Started service '{}'", self.spec.id);
                tokio::spawn(self.clone().supervise(process));
                Ok(())
            }
            Err(e) => {
                self.fail(e.clone());
                Err(e)
            }
        }
    }

    /// Spawn the next process generation and make it current
    fn spawn_generation(
        &self,
        restart: bool,
    ) -> Result<(Arc<ProcessSupervisor>, OutputLines, u64), ServiceError> {
        let mut inner = self.lock();
        if self.stop_token.is_cancelled() {
            return Err(ServiceError::Cancelled);
        }

        let (process, lines) = ProcessSupervisor::spawn(&self.spec, self.sink.clone());
        process.started().map_err(|e| ServiceError::Spawn {
            service: self.spec.id.clone(),
            message: e.to_string(),
        })?;

        if restart {
            inner.state.set_restarting(process.pid());
        } else {
            inner.state.set_starting(process.pid());
        }
        if let Some(pid) = process.pid() {
            log::debug!("Spawned service '{}' (PID {})", self.spec.id, pid);
        }

        let process = Arc::new(process);
        inner.process = Some(process.clone());
        inner.generation += 1;
        inner.ready = false;
        Ok((process, lines, inner.generation))
    }

    /// Race the readiness predicate against the process ending
    async fn wait_ready(
        &self,
        process: &ProcessSupervisor,
        lines: OutputLines,
    ) -> Result<(), ServiceError> {
        let ready = (self.spec.ready)(ReadyContext::new(self.spec.id.clone(), lines));

        tokio::select! {
            biased;
            _ = self.stop_token.cancelled() => Err(ServiceError::Cancelled),
            result = ready => result.map_err(|e| ServiceError::Ready {
                service: self.spec.id.clone(),
                message: e.to_string(),
            }),
            _ = process.ended() => Err(ServiceError::ExitedBeforeReady(self.spec.id.clone())),
        }
    }

    /// Watch process generations and restart them after crashes
    async fn supervise(self: Arc<Self>, mut process: Arc<ProcessSupervisor>) {
        loop {
            process.ended().await;

            if process.end_requested() || self.stop_token.is_cancelled() {
                return;
            }

            match self.handle_crash(&process).await {
                Ok(next) => process = next,
                Err(ServiceError::Cancelled) => return,
                Err(e) => {
                    self.fail(e);
                    return;
                }
            }
        }
    }

    async fn handle_crash(
        self: &Arc<Self>,
        process: &ProcessSupervisor,
    ) -> Result<Arc<ProcessSupervisor>, ServiceError> {
        match process.exit_code() {
            Some(code) => log::info!("Service '{}' crashed (exit code {})", self.spec.id, code),
            None => log::info!("Service '{}' crashed", self.spec.id),
        }

        // The restart delay counts from crash detection, not from the
        // handler returning.
        let delay = tokio::time::sleep(self.spec.minimum_restart_delay);
        tokio::pin!(delay);

        let ctx = self.record_crash(process);
        let handled = (self.spec.on_crash)(ctx);

        tokio::select! {
            biased;
            _ = self.stop_token.cancelled() => return Err(ServiceError::Cancelled),
            result = handled => result.map_err(|e| ServiceError::CrashHandler {
                service: self.spec.id.clone(),
                message: e.to_string(),
            })?,
        }

        tokio::select! {
            biased;
            _ = self.stop_token.cancelled() => return Err(ServiceError::Cancelled),
            _ = &mut delay => {}
        }

        log::info!("Restarting service '{}'", self.spec.id);
        let (next, lines, generation) = self.spawn_generation(true)?;

        let this = self.clone();
        let watched = next.clone();
        tokio::spawn(async move {
            match this.wait_ready(&watched, lines).await {
                Ok(()) => {
                    let mut inner = this.lock();
                    if inner.generation == generation {
                        inner.ready = true;
                        inner.state.set_ready();
                        drop(inner);
                        log::info!("Service '{}' is ready again", this.spec.id);
                    }
                }
                // Ending before ready is picked up by `supervise` as a crash
                Err(ServiceError::Cancelled) | Err(ServiceError::ExitedBeforeReady(_)) => {}
                Err(e) => this.fail(e),
            }
        });

        Ok(next)
    }

    fn record_crash(&self, process: &ProcessSupervisor) -> CrashContext {
        let mut inner = self.lock();
        inner.state.set_crashed();

        let crash = Crash {
            date: Local::now(),
            log_tail: process.log_tail(),
        };

        let limit = self.spec.crashes_length;
        if limit > 0 {
            while inner.crashes.len() >= limit {
                inner.crashes.pop_front();
            }
            inner.crashes.push_back(crash.clone());
        }

        CrashContext {
            service_id: self.spec.id.clone(),
            is_service_ready: inner.ready,
            crash,
            crashes: inner.crashes.iter().cloned().collect(),
        }
    }

    /// Mark the service failed and escalate to the orchestrator
    fn fail(&self, error: ServiceError) {
        if error == ServiceError::Cancelled {
            return;
        }
        self.lock().state.set_failed(error.to_string());
        let _ = self.reasons.send(ShutdownReason::Fatal(error));
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock(&self.inner)
    }
}

impl std::fmt::Debug for ServiceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceController")
            .field("id", &self.spec.id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Fatal per-service errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("Failed to spawn service '{service}': {message}")]
    Spawn { service: String, message: String },

    #[error("Readiness check of service '{service}' failed: {message}")]
    Ready { service: String, message: String },

    #[error("Service '{0}' exited before becoming ready")]
    ExitedBeforeReady(String),

    #[error("Crash handler of service '{service}' failed: {message}")]
    CrashHandler { service: String, message: String },

    #[error("Cancelled by shutdown")]
    Cancelled,
}

/// Orchestrator invariant violation (a bug, not a service failure)
#[derive(Debug, Clone, thiserror::Error)]
#[error("Internal error: {0}")]
pub struct InternalError(pub String);
