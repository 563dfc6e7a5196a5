//! Shutdown signal handling
//!
//! - SIGINT / Ctrl+C: shut down, exit 130
//! - SIGTERM: shut down, exit 143

#[cfg(unix)]
use tokio::signal::unix::{signal, Signal, SignalKind};

/// Signals that shut the composite down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Interrupt (SIGINT, Ctrl+C)
    Int,
    /// Shutdown request (SIGTERM)
    Term,
}

impl ShutdownSignal {
    /// Conventional 128 + signal number
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Int => 130,
            Self::Term => 143,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Int => "SIGINT",
            Self::Term => "SIGTERM",
        }
    }
}

/// Listener for shutdown signals
#[cfg(unix)]
pub struct ShutdownSignals {
    sigint: Signal,
    sigterm: Signal,
}

#[cfg(unix)]
impl ShutdownSignals {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the next signal
    pub async fn wait(&mut self) -> ShutdownSignal {
        tokio::select! {
            _ = self.sigint.recv() => ShutdownSignal::Int,
            _ = self.sigterm.recv() => ShutdownSignal::Term,
        }
    }
}

#[cfg(not(unix))]
pub struct ShutdownSignals {
    _private: (),
}

#[cfg(not(unix))]
impl ShutdownSignals {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self { _private: () })
    }

    pub async fn wait(&mut self) -> ShutdownSignal {
        loop {
            match tokio::signal::ctrl_c().await {
                Ok(()) => return ShutdownSignal::Int,
                Err(e) => {
                    log::error!("Failed to listen for Ctrl+C: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        }
    }
}
