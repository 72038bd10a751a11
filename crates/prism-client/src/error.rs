/// Errors that can occur on the client endpoint.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Socket placement or dialing failed.
    #[error("transport error: {0}")]
    Transport(#[from] prism_transport::TransportError),

    /// Wire-level failure (I/O, framing, codec).
    #[error("wire error: {0}")]
    Wire(#[from] prism_wire::WireError),

    /// A previous protocol error poisoned the endpoint; it must be
    /// dropped and a new connection established.
    #[error("display connection has a fatal protocol error")]
    Fatal,

    /// The proxy already has a listener attached.
    #[error("proxy {id} already has a listener")]
    ListenerExists { id: u32 },

    /// The handler vector does not cover the interface's events.
    #[error("{interface} expects {expected} event handlers, got {got}")]
    HandlerCount {
        interface: &'static str,
        expected: usize,
        got: usize,
    },

    /// The opcode does not name a request of the proxy's interface.
    #[error("{interface} has no request opcode {opcode}")]
    UnknownOpcode {
        interface: &'static str,
        opcode: u16,
    },
}

pub type Result<T> = std::result::Result<T, ClientError>;
