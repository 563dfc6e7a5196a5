//! Console-wide interrupt
//!
//! In Windows Ctrl+C shutdown mode the orchestrator broadcasts a single
//! Ctrl+C event to every process attached to the console, instead of
//! signalling services one by one.

/// Sends one interrupt to the whole console
pub trait ConsoleSignaler: Send + Sync {
    fn interrupt_console(&self) -> std::io::Result<()>;
}

/// The real console of this process
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemConsole;

#[cfg(windows)]
impl ConsoleSignaler for SystemConsole {
    fn interrupt_console(&self) -> std::io::Result<()> {
        use windows::Win32::System::Console::{GenerateConsoleCtrlEvent, CTRL_C_EVENT};

        // Process group 0 is every process sharing this console
        unsafe { GenerateConsoleCtrlEvent(CTRL_C_EVENT, 0) }
            .map_err(|e| std::io::Error::other(e.to_string()))
    }
}

#[cfg(not(windows))]
impl ConsoleSignaler for SystemConsole {
    fn interrupt_console(&self) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "console interrupt broadcast is only available on Windows",
        ))
    }
}
