//! Socket placement for the prism display-protocol runtime.
//!
//! Resolves where the display socket lives from the environment, dials
//! it as a client, and owns the listening side for servers. All actual
//! message I/O happens one layer up, in `prism-wire`.

pub mod error;
pub mod socket;

pub use error::{Result, TransportError};
pub use socket::{
    connect, server_socket_path, socket_path, ListeningSocket, DEFAULT_SOCKET_NAME,
    MAX_SOCKET_PATH,
};
