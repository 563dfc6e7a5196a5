//! Composite service orchestration
//!
//! The [`Orchestrator`] owns one [`ServiceController`] per service in the
//! graph. Startup walks the graph recursively: a service starts once all of
//! its dependencies are ready, and unrelated branches start concurrently.
//! Shutdown is triggered once, by a signal or the first fatal error, and
//! either stops everything at once or (graceful mode) stops dependents
//! before their dependencies.

mod controller;
mod deps;
mod output;
mod process;
mod state;
mod supervisor;
mod terminate;

pub use controller::{InternalError, ServiceController, ServiceError, StartTask, StopTask};
pub use deps::{GraphError, ServiceGraph};
pub use output::{merge_lines, LogTail, OutputLine, OutputSink};
pub use process::{normalize_path_env, spawn_service, SpawnError};
pub use state::{ServiceState, ServiceStatus};
pub use supervisor::{Ended, ProcessSupervisor};
pub use terminate::TerminationStrategy;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{join_all, try_join_all, BoxFuture};
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::shutdown::{ConsoleSignaler, ShutdownReason, ShutdownSignal, ShutdownSignals, SystemConsole};

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Composite-wide behaviour
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrchestratorOptions {
    /// Stop dependents before the services they depend on
    pub graceful_shutdown: bool,
    /// Stop by broadcasting one Ctrl+C to the console instead of
    /// signalling each process. Disables `graceful_shutdown`.
    pub windows_ctrl_c_shutdown: bool,
}

impl OrchestratorOptions {
    fn normalized(self) -> Self {
        Self {
            graceful_shutdown: self.graceful_shutdown && !self.windows_ctrl_c_shutdown,
            windows_ctrl_c_shutdown: self.windows_ctrl_c_shutdown,
        }
    }
}

/// Runs a [`ServiceGraph`] as one supervised unit
pub struct Orchestrator {
    graph: ServiceGraph,
    options: OrchestratorOptions,
    strategy: TerminationStrategy,
    controllers: HashMap<String, Arc<ServiceController>>,
    console: Arc<dyn ConsoleSignaler>,
    stopping: CancellationToken,
    reasons_tx: mpsc::UnboundedSender<ShutdownReason>,
    reasons_rx: Mutex<Option<mpsc::UnboundedReceiver<ShutdownReason>>>,
    output_rx: Mutex<Option<mpsc::UnboundedReceiver<OutputLine>>>,
    stop_task: Mutex<Option<StopTask>>,
}

impl Orchestrator {
    pub fn new(graph: ServiceGraph, options: OrchestratorOptions) -> Arc<Self> {
        Self::with_console(graph, options, Arc::new(SystemConsole))
    }

    /// Create an orchestrator that broadcasts console interrupts through `console`
    pub fn with_console(
        graph: ServiceGraph,
        options: OrchestratorOptions,
        console: Arc<dyn ConsoleSignaler>,
    ) -> Arc<Self> {
        let options = options.normalized();
        let (reasons_tx, reasons_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();

        let controllers = graph
            .iter()
            .map(|spec| {
                let controller =
                    ServiceController::new(spec.clone(), output_tx.clone(), reasons_tx.clone());
                (spec.id.clone(), controller)
            })
            .collect();

        Arc::new(Self {
            graph,
            options,
            strategy: TerminationStrategy::for_platform(options.windows_ctrl_c_shutdown),
            controllers,
            console,
            stopping: CancellationToken::new(),
            reasons_tx,
            reasons_rx: Mutex::new(Some(reasons_rx)),
            output_rx: Mutex::new(Some(output_rx)),
            stop_task: Mutex::new(None),
        })
    }

    pub fn graph(&self) -> &ServiceGraph {
        &self.graph
    }

    pub fn options(&self) -> OrchestratorOptions {
        self.options
    }

    pub fn controller(&self, id: &str) -> Option<&Arc<ServiceController>> {
        self.controllers.get(id)
    }

    /// Whether shutdown has begun (permanent once set)
    pub fn is_stopping(&self) -> bool {
        self.stopping.is_cancelled()
    }

    /// Take the merged output of every service
    ///
    /// [`run_until`](Self::run_until) prints output itself unless the
    /// receiver was taken first.
    pub fn take_output(&self) -> Option<mpsc::UnboundedReceiver<OutputLine>> {
        lock(&self.output_rx).take()
    }

    /// Ask the running orchestrator to shut down
    pub fn request_shutdown(&self, reason: ShutdownReason) {
        let _ = self.reasons_tx.send(reason);
    }

    /// Start one service after all of its dependencies
    pub fn start_service(self: &Arc<Self>, id: &str) -> BoxFuture<'static, Result<(), ServiceError>> {
        let this = self.clone();
        let id = id.to_string();
        async move {
            let dependencies: Vec<_> = this
                .graph
                .dependencies(&id)
                .map(|dep| this.start_service(dep))
                .collect();
            try_join_all(dependencies).await?;

            if this.is_stopping() {
                return Err(ServiceError::Cancelled);
            }
            let Some(controller) = this.controllers.get(&id) else {
                log::error!("{}", InternalError(format!("No controller for service '{}'", id)));
                return Err(ServiceError::Cancelled);
            };
            controller.start().await?;

            if this.is_stopping() {
                return Err(ServiceError::Cancelled);
            }
            Ok(())
        }
        .boxed()
    }

    /// Start every service
    pub fn start_all(self: &Arc<Self>) -> BoxFuture<'static, Result<(), ServiceError>> {
        let this = self.clone();
        async move {
            log::debug!("Starting composite service...");
            let starts: Vec<_> = this.graph.ids().map(|id| this.start_service(id)).collect();
            try_join_all(starts).await?;
            log::debug!("Started composite service");
            Ok(())
        }
        .boxed()
    }

    /// Stop every service; repeated calls join the same shutdown
    pub fn stop_all(self: &Arc<Self>) -> StopTask {
        let mut stop_task = lock(&self.stop_task);
        if let Some(task) = &*stop_task {
            return task.clone();
        }

        self.stopping.cancel();
        log::debug!("Stopping composite service...");

        if self.options.windows_ctrl_c_shutdown {
            if let Err(e) = self.console.interrupt_console() {
                log::error!("Failed to send console interrupt: {}", e);
            }
        }

        let this = self.clone();
        let task = async move {
            let stops: Vec<_> = this.graph.ids().map(|id| this.stop_service(id)).collect();
            join_all(stops).await;
            log::debug!("Stopped composite service");
        }
        .boxed()
        .shared();

        *stop_task = Some(task.clone());
        tokio::spawn(task.clone());
        task
    }

    fn stop_service(self: &Arc<Self>, id: &str) -> BoxFuture<'static, ()> {
        let this = self.clone();
        let id = id.to_string();
        async move {
            if this.options.graceful_shutdown {
                let dependents: Vec<_> = this
                    .graph
                    .dependents(&id)
                    .map(|dependent| this.stop_service(dependent))
                    .collect();
                join_all(dependents).await;
            }
            if let Some(controller) = this.controllers.get(&id) {
                controller.stop(this.strategy).await;
            }
        }
        .boxed()
    }

    /// Run the composite until `signal` resolves or a service fails fatally
    ///
    /// Returns the exit code for the host process.
    pub async fn run_until<F>(self: &Arc<Self>, signal: F) -> i32
    where
        F: Future<Output = ShutdownSignal>,
    {
        let Some(mut reasons) = lock(&self.reasons_rx).take() else {
            log::error!("{}", InternalError("Orchestrator is already running".to_string()));
            return 1;
        };

        if let Some(output) = self.take_output() {
            tokio::spawn(print_output(output));
        }

        let starting = self.start_all();
        tokio::spawn(async move {
            if let Err(e) = starting.await {
                log::debug!("Startup interrupted: {}", e);
            }
        });

        let reason = tokio::select! {
            Some(reason) = reasons.recv() => reason,
            signal = signal => ShutdownReason::Signal(signal),
        };
        log_reason(&reason);

        let mut stopping = self.stop_all();
        loop {
            tokio::select! {
                _ = &mut stopping => break,
                Some(late) = reasons.recv() => {
                    if let ShutdownReason::Fatal(e) = late {
                        log::error!("Fatal error: {}", e);
                    }
                }
            }
        }

        // Let already buffered output reach the printer
        tokio::task::yield_now().await;
        reason.exit_code()
    }

    /// Run the composite until SIGINT/SIGTERM or a fatal error
    pub async fn run(self: &Arc<Self>) -> std::io::Result<i32> {
        let mut signals = ShutdownSignals::new()?;
        Ok(self.run_until(async move { signals.wait().await }).await)
    }
}

fn log_reason(reason: &ShutdownReason) {
    match reason {
        ShutdownReason::Fatal(e) => log::error!("Fatal error: {}", e),
        ShutdownReason::Signal(signal) => {
            log::info!("Received shutdown signal ({})", signal.description())
        }
    }
}

async fn print_output(mut output: mpsc::UnboundedReceiver<OutputLine>) {
    while let Some(OutputLine { service_id, line }) = output.recv().await {
        println!("{} | {}", service_id, line);
    }
}
