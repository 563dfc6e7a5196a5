//! composed - run a set of services as one supervised unit
//!
//! Child processes are started in dependency order, each one only after its
//! dependencies pass their readiness checks. Crashed services are restarted,
//! and everything is torn down together on a signal or a fatal error.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Orchestrator                      │
//! │   startup walk · shutdown walk · signals · output    │
//! ├─────────────────────────────────────────────────────┤
//! │  ServiceController  (one per service id)             │
//! │   readiness · crash handling · restart delay         │
//! ├─────────────────────────────────────────────────────┤
//! │  ProcessSupervisor  (one per process generation)     │
//! │   spawn · output lines · log tail · termination      │
//! └─────────────────────────────────────────────────────┘
//!          ▲
//!          │ ServiceGraph (validated ServiceSpecs)
//!   config: composition file ─► specs
//! ```
//!
//! # Example
//!
//! ```no_run
//! use composed::{Orchestrator, OrchestratorOptions, ServiceGraph, ServiceSpec};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let graph = ServiceGraph::build([
//!     ServiceSpec::new("db", ["postgres", "-D", "data"])
//!         .ready(|ctx| async move { ctx.once_tcp_port_used(5432, "localhost").await }),
//!     ServiceSpec::new("web", ["node", "server.js"]).dependency("db"),
//! ])?;
//!
//! let orchestrator = Orchestrator::new(graph, OrchestratorOptions::default());
//! let code = orchestrator.run().await?;
//! std::process::exit(code);
//! # }
//! ```

pub mod config;
pub mod manager;
pub mod ready;
pub mod service;
pub mod shutdown;

pub use manager::{
    GraphError, Orchestrator, OrchestratorOptions, ServiceController, ServiceError, ServiceGraph,
    ServiceStatus,
};
pub use ready::ReadyContext;
pub use service::{BoxError, Crash, CrashContext, ForceKillTimeout, ServiceSpec};
pub use shutdown::{ShutdownReason, ShutdownSignal};
