//! Diagnostics sink for transport probing.
//!
//! Transports never fail a fetch; they report what went wrong here and
//! yield nothing. The default sink forwards to `tracing` at debug level,
//! while [`RecordingDiagnostics`] keeps the events for inspection.

use std::cell::RefCell;
use std::fmt;
use std::path::PathBuf;

/// Something worth telling an operator about while probing transports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticEvent {
    /// A transport command failed to run or exited unsuccessfully.
    CommandFailed {
        /// The full command line.
        command: String,
        /// Error detail (exit status, stderr or OS error).
        detail: String,
    },
    /// A candidate resource could not be read.
    ReadFailed {
        /// The path that was tried.
        path: PathBuf,
        /// Error detail.
        detail: String,
    },
    /// A device could not be mounted for inspection.
    MountFailed {
        /// The block device.
        device: String,
        /// Error detail.
        detail: String,
    },
    /// A transport produced no content.
    TransportEmpty {
        /// Transport name.
        transport: String,
    },
    /// A transport produced the environment document.
    TransportSelected {
        /// Transport name.
        transport: String,
    },
}

impl fmt::Display for DiagnosticEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticEvent::CommandFailed { command, detail } => {
                write!(f, "Failed command: {}\n{}", command, detail)
            }
            DiagnosticEvent::ReadFailed { path, detail } => {
                write!(f, "Failed loading ovf file {}: {}", path.display(), detail)
            }
            DiagnosticEvent::MountFailed { device, detail } => {
                write!(f, "{} not mountable as iso9660: {}", device, detail)
            }
            DiagnosticEvent::TransportEmpty { transport } => {
                write!(f, "transport '{}' found no OVF environment", transport)
            }
            DiagnosticEvent::TransportSelected { transport } => {
                write!(f, "using OVF environment from transport '{}'", transport)
            }
        }
    }
}

/// Receiver for [`DiagnosticEvent`]s.
pub trait Diagnostics {
    /// Record one event.
    fn report(&self, event: DiagnosticEvent);
}

/// Forwards every event to `tracing` at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDiagnostics;

impl Diagnostics for TracingDiagnostics {
    fn report(&self, event: DiagnosticEvent) {
        tracing::debug!("{}", event);
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingDiagnostics {
    events: RefCell<Vec<DiagnosticEvent>>,
}

impl RecordingDiagnostics {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events recorded so far.
    pub fn events(&self) -> Vec<DiagnosticEvent> {
        self.events.borrow().clone()
    }

    /// Commands reported as failed, in order.
    pub fn failed_commands(&self) -> Vec<String> {
        self.events
            .borrow()
            .iter()
            .filter_map(|event| match event {
                DiagnosticEvent::CommandFailed { command, .. } => Some(command.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Diagnostics for RecordingDiagnostics {
    fn report(&self, event: DiagnosticEvent) {
        self.events.borrow_mut().push(event);
    }
}
