//! Error types for the ovfenv core library.

use std::path::PathBuf;

/// The main error type for ovfenv operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error with optional path context.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" at '{}'", p.display())).unwrap_or_default())]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// A transport's command could not be run or exited unsuccessfully.
    ///
    /// Transports recover from this locally; it never escapes a probe.
    #[error("Failed command: {command}: {message}")]
    TransportExecution { command: String, message: String },

    /// The fetched document is not a usable OVF environment.
    #[error("Malformed OVF environment: {message}")]
    MalformedDocument { message: String },

    /// No transport produced an OVF environment document.
    #[error("No OVF environment found")]
    NotFound,

    /// Invalid data source configuration.
    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// A specialized Result type for ovfenv operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an I/O error with path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    /// Create an I/O error without path context.
    pub fn io_simple(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }

    /// Create a transport execution error.
    pub fn transport_execution(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransportExecution {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create a malformed document error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedDocument {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether this error means the data source simply does not apply.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::io_simple(source)
    }
}

impl From<quick_xml::Error> for Error {
    fn from(source: quick_xml::Error) -> Self {
        Self::malformed(source.to_string())
    }
}

impl From<quick_xml::events::attributes::AttrError> for Error {
    fn from(source: quick_xml::events::attributes::AttrError) -> Self {
        Self::malformed(source.to_string())
    }
}
