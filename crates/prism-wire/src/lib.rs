//! Wire layer of the prism display-protocol runtime.
//!
//! Everything both endpoint roles share lives here:
//!
//! - [`ring`] — bounded byte buffers and descriptor queues
//! - [`map`] — the partitioned object/id registry
//! - [`args`] / [`interface`] — typed arguments and static interface
//!   descriptors
//! - [`codec`] — signature-driven marshalling with new-id lifecycle
//! - [`connection`] — non-blocking socket I/O with `SCM_RIGHTS`
//!   descriptor passing
//! - [`debug`] — the `WAYLAND_DEBUG` message tracer

pub mod args;
pub mod codec;
pub mod connection;
pub mod debug;
pub mod error;
pub mod interface;
pub mod map;
pub mod protocol;
pub mod ring;

pub use args::{Argument, ArgumentType, Fixed};
pub use codec::{MessageHeader, ObjectRegistry, ObjectStatus, HEADER_SIZE};
pub use connection::{Connection, ConnectionState, READABLE, WRITABLE};
pub use error::{Result, WireError};
pub use interface::{same_interface, Interface, MessageDesc};
pub use map::{Entry, Lookup, ObjectMap, Side, SERVER_ID_BASE};
pub use protocol::{CALLBACK_INTERFACE, DISPLAY_INTERFACE, DISPLAY_OBJECT_ID};
pub use ring::{InFdBuffer, OutFdBuffer, WireBuffer, MAX_FDS_IN_FLIGHT, WIRE_BUFFER_CAPACITY};
