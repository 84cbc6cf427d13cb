/// Flywheel Error Types
///
/// Shared error handling for the reactor and the transports built on it.
use std::io;
use thiserror::Error;

/// Main error type for reactor operations
#[derive(Error, Debug)]
pub enum Error {
    /// IO error from the backend or a socket operation
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The event loop was torn down
    #[error("event loop is closed")]
    LoopClosed,

    /// The event loop is already dispatching on this thread
    #[error("event loop is already dispatching")]
    Busy,

    /// The watcher was cancelled and is permanently dead
    #[error("watcher is cancelled")]
    WatcherCancelled,

    /// Error raised by a protocol implementation
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Result type alias for reactor operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a protocol error with a message
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Check if this error confines itself to a single connection
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            ),
            Self::WatcherCancelled => true,
            Self::LoopClosed | Self::Busy | Self::Protocol(_) => false,
        }
    }
}
