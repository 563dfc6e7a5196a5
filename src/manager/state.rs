//! Service state machine
//!
//! ```text
//!     ┌────────────┐
//!     │ NotStarted │
//!     └─────┬──────┘
//!           │ start
//!     ┌─────▼──────┐  spawn/ready error  ┌────────┐
//!     │  Starting  │────────────────────►│ Failed │
//!     └─────┬──────┘                     └────────┘
//!           │ ready          ▲
//!     ┌─────▼──────┐         │ restart
//!     │   Ready    │──────►Crashed
//!     └─────┬──────┘  exit
//!           │ stop (from any state)
//!     ┌─────▼──────┐
//!     │  Stopping  │
//!     └─────┬──────┘
//!           │ ended
//!     ┌─────▼──────┐
//!     │  Stopped   │
//!     └────────────┘
//! ```

use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    NotStarted,
    Starting,
    Ready,
    Crashed,
    Stopping,
    Stopped,
    Failed,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not-started",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Crashed => "crashed",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }

    /// Stopping and stopped are terminal for a controller
    pub fn is_stopping(&self) -> bool {
        matches!(self, Self::Stopping | Self::Stopped)
    }
}

/// Runtime state of a service controller
#[derive(Debug, Clone)]
pub struct ServiceState {
    pub status: ServiceStatus,
    /// PID of the current process generation (if running)
    pub main_pid: Option<u32>,
    /// When the service entered the current status
    pub state_change_time: Instant,
    /// Number of restarts after crashes
    pub restart_count: u32,
    /// Error message if failed
    pub error: Option<String>,
}

impl Default for ServiceState {
    fn default() -> Self {
        Self {
            status: ServiceStatus::NotStarted,
            main_pid: None,
            state_change_time: Instant::now(),
            restart_count: 0,
            error: None,
        }
    }
}

impl ServiceState {
    pub fn new() -> Self {
        Self::default()
    }

    fn transition(&mut self, status: ServiceStatus) {
        self.status = status;
        self.state_change_time = Instant::now();
    }

    pub fn set_starting(&mut self, pid: Option<u32>) {
        if self.status.is_stopping() {
            return;
        }
        self.main_pid = pid;
        self.error = None;
        self.transition(ServiceStatus::Starting);
    }

    pub fn set_ready(&mut self) {
        if self.status.is_stopping() {
            return;
        }
        self.transition(ServiceStatus::Ready);
    }

    pub fn set_crashed(&mut self) {
        if self.status.is_stopping() {
            return;
        }
        self.main_pid = None;
        self.transition(ServiceStatus::Crashed);
    }

    /// Record a restart; the new generation is starting
    pub fn set_restarting(&mut self, pid: Option<u32>) {
        if self.status.is_stopping() {
            return;
        }
        self.restart_count += 1;
        self.set_starting(pid);
    }

    pub fn set_stopping(&mut self) {
        self.transition(ServiceStatus::Stopping);
    }

    pub fn set_stopped(&mut self) {
        self.main_pid = None;
        self.transition(ServiceStatus::Stopped);
    }

    pub fn set_failed(&mut self, error: impl Into<String>) {
        if self.status.is_stopping() {
            return;
        }
        self.main_pid = None;
        self.error = Some(error.into());
        self.transition(ServiceStatus::Failed);
    }
}
