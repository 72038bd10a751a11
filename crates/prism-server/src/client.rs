//! Per-client state held by the display.

use prism_wire::{Connection, ObjectMap};

use crate::resource::ResourceRecord;

/// Everything the display tracks for one connected client: its
/// connection, its own view of the object map (client-allocated ids
/// plus mirrors of the display record and every global), the ordered
/// list of resources it owns, and the remaining budget of its current
/// id-range grant.
pub(crate) struct ClientState {
    pub(crate) connection: Connection,
    pub(crate) objects: ObjectMap<ResourceRecord>,
    /// Client-owned resources in registration order; teardown walks
    /// this in reverse.
    pub(crate) resources: Vec<u32>,
    /// Ids left in the ranges granted so far; a fresh grant goes out
    /// when this sits below the low watermark at registration time.
    pub(crate) id_count: u32,
    /// Marked when the connection can no longer be trusted; the client
    /// is swept after the current dispatch pass.
    pub(crate) dead: bool,
}

impl ClientState {
    pub(crate) fn new(connection: Connection) -> Self {
        ClientState {
            connection,
            objects: ObjectMap::new(),
            resources: Vec::new(),
            id_count: 0,
            dead: false,
        }
    }
}
