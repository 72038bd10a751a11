//! Object-addressed wire protocol runtime for display servers.
//!
//! prism lets a client process and a server process exchange typed,
//! asynchronous messages about protocol objects over a local stream
//! socket, with file-descriptor passing, a strict object-id lifecycle,
//! and a mirrored global registry.
//!
//! # Crate structure
//!
//! - [`wire`] — buffers, codec, object map, connection
//! - [`transport`] — socket placement and environment resolution
//! - [`client`] — the client endpoint (proxies, roundtrip, globals)
//! - [`server`] — the server endpoint (display, resources, grants)

/// Re-export wire types.
pub mod wire {
    pub use prism_wire::*;
}

/// Re-export transport types.
pub mod transport {
    pub use prism_transport::*;
}

/// Re-export client types.
pub mod client {
    pub use prism_client::*;
}

/// Re-export server types.
pub mod server {
    pub use prism_server::*;
}
