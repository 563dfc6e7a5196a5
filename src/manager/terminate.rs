//! Platform termination strategies
//!
//! The way a service is asked to stop is picked once, when the orchestrator
//! is built, and handed to every supervisor:
//!
//! - `Interrupt` (POSIX): SIGINT, then SIGKILL once the force-kill timeout
//!   expires.
//! - `Terminate` (Windows): there is no per-process interrupt, so the
//!   process is terminated outright.
//! - `ConsoleBroadcast` (Windows, opt-in): the orchestrator has already sent
//!   one Ctrl+C to the whole console. Supervisors send nothing themselves
//!   and only arm the force-kill timer.

/// How a supervisor asks its process to exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationStrategy {
    Interrupt,
    Terminate,
    ConsoleBroadcast,
}

impl TerminationStrategy {
    /// Strategy for the current platform
    pub fn for_platform(console_broadcast: bool) -> Self {
        if console_broadcast {
            Self::ConsoleBroadcast
        } else if cfg!(windows) {
            Self::Terminate
        } else {
            Self::Interrupt
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interrupt => "interrupt",
            Self::Terminate => "terminate",
            Self::ConsoleBroadcast => "console-broadcast",
        }
    }
}

/// Send SIGINT to a single process
#[cfg(unix)]
pub fn interrupt(pid: u32) -> std::io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), Signal::SIGINT).map_err(std::io::Error::from)
}

#[cfg(not(unix))]
pub fn interrupt(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "per-process interrupt is not available on this platform",
    ))
}
