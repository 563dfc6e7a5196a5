//! Shutdown triggers
//!
//! The composite shuts down exactly once, for one of two reasons:
//! - an external signal (SIGINT, SIGTERM, Ctrl+C on Windows)
//! - the first fatal error reported by a service controller

mod console;
mod signals;

pub use console::{ConsoleSignaler, SystemConsole};
pub use signals::{ShutdownSignal, ShutdownSignals};

use crate::manager::ServiceError;

/// Exit code used for fatal errors
pub const FATAL_EXIT_CODE: i32 = 1;

/// Why the composite is shutting down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal(ShutdownSignal),
    Fatal(ServiceError),
}

impl ShutdownReason {
    /// Exit code for the host process
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Signal(signal) => signal.exit_code(),
            Self::Fatal(_) => FATAL_EXIT_CODE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ShutdownReason::Signal(ShutdownSignal::Int).exit_code(), 130);
        assert_eq!(ShutdownReason::Signal(ShutdownSignal::Term).exit_code(), 143);
        assert_eq!(
            ShutdownReason::Fatal(ServiceError::ExitedBeforeReady("web".into())).exit_code(),
            FATAL_EXIT_CODE
        );
    }
}
