use std::path::PathBuf;

/// Errors that can occur while placing or dialing the display socket.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// `XDG_RUNTIME_DIR` is not set; required on the client path.
    #[error("XDG_RUNTIME_DIR is not set in the environment")]
    RuntimeDirUnset,

    /// The socket path plus terminator exceeds the platform limit.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    NameTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    /// `WAYLAND_SOCKET` did not hold a file descriptor number.
    #[error("WAYLAND_SOCKET is not a file descriptor number: {value:?}")]
    BadSocketVariable { value: String },

    /// Failed to bind the listening socket.
    #[error("failed to bind to {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to connect to the display socket.
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on the transport.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
