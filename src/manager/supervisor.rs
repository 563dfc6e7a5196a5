//! One OS process lifetime
//!
//! ```text
//!   spawn ──► owner task ── child.wait() ──────────────► exit code ─┐
//!                 ▲                                                  │
//!                 └── interrupt / kill requests                      │
//!                                                                    ▼
//!   stdout ─┐                                          pump task: output ended
//!           ├─► merge_lines ─► pump task ─► log tail        + exit code known
//!   stderr ─┘                          ├──► readiness view          │
//!                                      └──► output sink             ▼
//!                                                                 ended
//! ```
//!
//! Only the owner task signals the child, and only until `wait()` has
//! reaped it, so a recycled PID is never signalled. A force kill also stops
//! waiting for output: a grandchild holding the pipes open cannot keep
//! `ended` pending past the force-kill timeout.
//!
//! A supervisor is never reused: a restart creates a new one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::lock;
use super::output::{merge_lines, LogTail, OutputLine, OutputSink};
use super::process::{spawn_service, SpawnError};
use super::terminate::{self, TerminationStrategy};
use crate::ready::OutputLines;
use crate::service::{ForceKillTimeout, ServiceSpec};

/// Resolves once output has ended and the process has exited
pub type Ended = Shared<BoxFuture<'static, ()>>;

#[derive(Debug, Default)]
struct Flags {
    spawn_failed: AtomicBool,
    /// The child was reaped; output may still be open
    exited: AtomicBool,
    ended: AtomicBool,
    end_requested: AtomicBool,
}

/// Requests served by the task that owns the child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Interrupt,
    Kill,
}

/// Supervisor for a single child process
pub struct ProcessSupervisor {
    service_id: String,
    pid: Option<u32>,
    started: Result<(), SpawnError>,
    force_kill_timeout: ForceKillTimeout,
    flags: Arc<Flags>,
    log_tail: Arc<Mutex<LogTail>>,
    exit_code: Arc<Mutex<Option<i32>>>,
    control_tx: mpsc::UnboundedSender<Control>,
    /// Stop reading output and end as soon as the child is reaped
    abandon_output: CancellationToken,
    ended: Ended,
}

impl ProcessSupervisor {
    /// Spawn the process for `spec`
    ///
    /// Every output line goes to the log tail, to the returned readiness
    /// view and to `sink`. A spawn failure does not panic or return early:
    /// it is reported through [`started`](Self::started) and `ended`
    /// resolves immediately.
    pub fn spawn(spec: &ServiceSpec, sink: OutputSink) -> (Self, OutputLines) {
        let flags = Arc::new(Flags::default());
        let log_tail = Arc::new(Mutex::new(LogTail::new(spec.log_tail_length)));
        let exit_code = Arc::new(Mutex::new(None));
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let abandon_output = CancellationToken::new();
        let (ready_tx, lines) = OutputLines::channel();

        let mut child = match spawn_service(spec) {
            Ok(child) => child,
            Err(e) => {
                flags.spawn_failed.store(true, Ordering::SeqCst);
                flags.ended.store(true, Ordering::SeqCst);
                let supervisor = Self {
                    service_id: spec.id.clone(),
                    pid: None,
                    started: Err(e),
                    force_kill_timeout: spec.force_kill_timeout,
                    flags,
                    log_tail,
                    exit_code,
                    control_tx,
                    abandon_output,
                    ended: futures::future::ready(()).boxed().shared(),
                };
                return (supervisor, lines);
            }
        };

        let pid = child.id();
        let merged = merge_lines(child.stdout.take(), child.stderr.take());
        let (exit_tx, exit_rx) = oneshot::channel::<Option<i32>>();
        let (ended_tx, ended_rx) = oneshot::channel::<()>();

        let id = spec.id.clone();
        let owner_flags = flags.clone();
        tokio::spawn(async move {
            let status = loop {
                tokio::select! {
                    status = child.wait() => break status,
                    Some(request) = control_rx.recv() => match request {
                        // Not reaped yet while we are still in this loop
                        Control::Interrupt => {
                            if let Some(pid) = child.id() {
                                if let Err(e) = terminate::interrupt(pid) {
                                    log::warn!("Failed to interrupt service '{}': {}", id, e);
                                }
                            }
                        }
                        Control::Kill => {
                            if let Err(e) = child.start_kill() {
                                log::debug!("Kill of service '{}' failed: {}", id, e);
                            }
                        }
                    }
                }
            };
            owner_flags.exited.store(true, Ordering::SeqCst);
            let code = match status {
                Ok(status) => {
                    log::debug!("Service '{}' process exited: {}", id, status);
                    status.code()
                }
                Err(e) => {
                    log::warn!("Failed to wait for service '{}': {}", id, e);
                    None
                }
            };
            let _ = exit_tx.send(code);
        });

        let id = spec.id.clone();
        let pump_flags = flags.clone();
        let pump_tail = log_tail.clone();
        let pump_exit = exit_code.clone();
        let pump_abandon = abandon_output.clone();
        let mut merged = merged;
        tokio::spawn(async move {
            let mut ready_tx = Some(ready_tx);
            loop {
                let line = tokio::select! {
                    biased;
                    _ = pump_abandon.cancelled() => {
                        log::debug!("No longer waiting for output of service '{}'", id);
                        None
                    }
                    line = merged.recv() => line,
                };
                let Some(line) = line else {
                    break;
                };
                lock(&pump_tail).push(&line);
                if let Some(tx) = &ready_tx {
                    if tx.send(line.clone()).is_err() {
                        ready_tx = None;
                    }
                }
                let _ = sink.send(OutputLine {
                    service_id: id.clone(),
                    line,
                });
            }
            drop(ready_tx);

            let code = exit_rx.await.ok().flatten();
            *lock(&pump_exit) = code;
            pump_flags.ended.store(true, Ordering::SeqCst);
            let _ = ended_tx.send(());
        });

        let ended = async move {
            let _ = ended_rx.await;
        }
        .boxed()
        .shared();

        let supervisor = Self {
            service_id: spec.id.clone(),
            pid,
            started: Ok(()),
            force_kill_timeout: spec.force_kill_timeout,
            flags,
            log_tail,
            exit_code,
            control_tx,
            abandon_output,
            ended,
        };
        (supervisor, lines)
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Outcome of the spawn request
    pub fn started(&self) -> Result<(), SpawnError> {
        self.started.clone()
    }

    pub fn ended(&self) -> Ended {
        self.ended.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.flags.spawn_failed.load(Ordering::SeqCst) && !self.flags.ended.load(Ordering::SeqCst)
    }

    /// Whether the child process itself has exited and been reaped
    ///
    /// Output can outlive the child when a descendant inherited its pipes,
    /// so this may be true while [`is_running`](Self::is_running) still is.
    pub fn has_exited(&self) -> bool {
        self.flags.exited.load(Ordering::SeqCst)
    }

    /// Whether this process was told to stop (as opposed to exiting on its own)
    pub fn end_requested(&self) -> bool {
        self.flags.end_requested.load(Ordering::SeqCst)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit code, once ended (`None` when killed by a signal)
    pub fn exit_code(&self) -> Option<i32> {
        *lock(&self.exit_code)
    }

    pub fn log_tail(&self) -> Vec<String> {
        lock(&self.log_tail).snapshot()
    }

    /// Ask the process to exit
    ///
    /// Only the first call on a running process acts; every call returns
    /// the same `ended` future.
    pub fn end(&self, strategy: TerminationStrategy) -> Ended {
        if !self.is_running() || self.flags.end_requested.swap(true, Ordering::SeqCst) {
            return self.ended.clone();
        }

        log::debug!(
            "Ending service '{}' ({})",
            self.service_id,
            strategy.as_str()
        );

        match strategy {
            TerminationStrategy::Interrupt => {
                if self.has_exited() || !self.request(Control::Interrupt) {
                    log::debug!("Service '{}' already exited, not interrupting", self.service_id);
                }
                self.force_kill_after_timeout();
            }
            TerminationStrategy::Terminate => {
                self.request(Control::Kill);
                self.force_kill_after_timeout();
            }
            TerminationStrategy::ConsoleBroadcast => self.force_kill_after_timeout(),
        }

        self.ended.clone()
    }

    /// Kill the process unconditionally and stop waiting for its output
    pub fn force_kill(&self) {
        self.flags.end_requested.store(true, Ordering::SeqCst);
        if self.is_running() {
            force_kill(&self.service_id, &self.control_tx, &self.abandon_output);
        }
    }

    /// Returns false once the child has been reaped
    fn request(&self, control: Control) -> bool {
        self.control_tx.send(control).is_ok()
    }

    fn force_kill_after_timeout(&self) {
        let ForceKillTimeout::After(timeout) = self.force_kill_timeout else {
            return;
        };

        let ended = self.ended.clone();
        let flags = self.flags.clone();
        let control_tx = self.control_tx.clone();
        let abandon_output = self.abandon_output.clone();
        let id = self.service_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = ended => {}
                _ = tokio::time::sleep(timeout) => {
                    if !flags.ended.load(Ordering::SeqCst) {
                        log::info!("Force killing service '{}'", id);
                        force_kill(&id, &control_tx, &abandon_output);
                    }
                }
            }
        });
    }
}

/// Kill the child if it is still around and stop waiting for its output
fn force_kill(
    service_id: &str,
    control_tx: &mpsc::UnboundedSender<Control>,
    abandon_output: &CancellationToken,
) {
    if control_tx.send(Control::Kill).is_err() {
        log::info!(
            "Service '{}' already exited; kill had no effect on processes still holding its output",
            service_id
        );
    }
    abandon_output.cancel();
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("service_id", &self.service_id)
            .field("pid", &self.pid)
            .field("started", &self.started)
            .field("flags", &self.flags)
            .field("force_kill_timeout", &self.force_kill_timeout)
            .finish_non_exhaustive()
    }
}
