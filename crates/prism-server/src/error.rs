/// Errors that can occur on the server endpoint.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Socket placement or binding failed.
    #[error("transport error: {0}")]
    Transport(#[from] prism_transport::TransportError),

    /// Wire-level failure (I/O, framing, codec).
    #[error("wire error: {0}")]
    Wire(#[from] prism_wire::WireError),

    /// Poll-loop failure.
    #[error("event loop error: {0}")]
    Io(#[from] std::io::Error),

    /// The client id does not name a connected client.
    #[error("no such client: {0:?}")]
    UnknownClient(crate::resource::ClientId),

    /// The name does not refer to an advertised global.
    #[error("no such global: {name}")]
    UnknownGlobal { name: u32 },

    /// The resource already has an implementation attached.
    #[error("resource {id} already has an implementation")]
    ImplementationExists { id: u32 },

    /// The handler vector does not cover the interface's requests.
    #[error("{interface} expects {expected} request handlers, got {got}")]
    HandlerCount {
        interface: &'static str,
        expected: usize,
        got: usize,
    },

    /// The opcode does not name an event of the resource's interface.
    #[error("{interface} has no event opcode {opcode}")]
    UnknownOpcode {
        interface: &'static str,
        opcode: u16,
    },
}

pub type Result<T> = std::result::Result<T, ServerError>;
