//! Client endpoint of the prism display-protocol runtime.
//!
//! A [`Client`] connects to a display server, mints proxies for
//! protocol objects, marshals requests, and dispatches incoming events
//! to per-proxy handler vectors on the calling thread. The global
//! registry advertised by the server is mirrored locally and replayed
//! to late listeners.

pub mod client;
pub mod error;
pub mod proxy;

pub use client::Client;
pub use error::{ClientError, Result};
pub use proxy::{EventHandler, Global, GlobalListener, Proxy};
