/// Errors that can occur on the wire layer.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The operation cannot make progress without blocking.
    #[error("operation would block")]
    WouldBlock,

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    Closed,

    /// An I/O error occurred on the socket.
    #[error("wire I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A message header is malformed (size too small, not a multiple of
    /// four, or larger than the wire buffer can ever hold).
    #[error("malformed message for object {id} (size {size})")]
    Framing { id: u32, size: usize },

    /// A message referenced an object id that is not live.
    #[error("unknown or dead object {id}")]
    InvalidObject { id: u32 },

    /// A message body violated its signature.
    #[error("malformed message payload: {reason}")]
    BadMessage { reason: &'static str },

    /// An argument vector does not match the message signature.
    #[error("invalid argument: {reason}")]
    BadArgument { reason: &'static str },

    /// A file descriptor argument was decoded but none was buffered.
    #[error("file descriptor argument but no descriptor buffered")]
    MissingFd,

    /// An object id is already occupied.
    #[error("object id {id} already in use")]
    IdInUse { id: u32 },

    /// No free ids remain on the requested side of the id space.
    #[error("object id space exhausted")]
    IdExhausted,

    /// Too many file descriptors queued in one direction.
    #[error("too many file descriptors in flight")]
    FdOverflow,

    /// The encoded message cannot fit the wire buffer.
    #[error("message too long ({size} bytes)")]
    MessageTooLong { size: usize },
}

pub type Result<T> = std::result::Result<T, WireError>;
