//! Server endpoint of the prism display-protocol runtime.
//!
//! A [`Display`] accepts clients over listening sockets, tracks each
//! client's resources and id-range budget, advertises globals, and
//! dispatches incoming requests to registered handler vectors on a
//! single-threaded `poll(2)` loop.

mod client;
pub mod display;
pub mod error;
mod event_loop;
pub mod resource;

pub use display::Display;
pub use error::{Result, ServerError};
pub use resource::{BindHook, ClientId, DestroyHook, RequestHandler, Resource};
