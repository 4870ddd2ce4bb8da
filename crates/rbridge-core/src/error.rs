//! Error types for rbridge-core.

use thiserror::Error;

/// Result type for rbridge-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in rbridge-core.
#[derive(Debug, Error)]
pub enum Error {
    /// The engine was never initialized, failed validation, or needs a
    /// process restart before it can be used again.
    #[error("engine unavailable: {0}")]
    EngineUnavailable(String),

    /// The engine reported a parse or runtime fault.
    #[error("engine error: {0}")]
    Engine(String),

    /// The operation was interrupted at the caller's request.
    #[error("operation cancelled")]
    Cancelled,

    /// A value could not be decoded because it is not table-shaped.
    #[error("unsupported shape: {0}")]
    UnsupportedShape(String),

    /// A table violates the frame invariants.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// A caller-supplied name is not a syntactic engine symbol.
    #[error("invalid symbol name: {0:?}")]
    InvalidSymbol(String),

    /// Failed to load or bind the native bridge library.
    #[error("failed to load library: {0}")]
    LibraryLoad(#[from] libloading::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),

    /// Command queue misuse or shutdown.
    #[error("command queue error: {0}")]
    Queue(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error reports a user or timeout cancellation rather than
    /// a fault in the evaluated code.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
