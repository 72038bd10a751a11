use std::any::Any;
use std::rc::Rc;

use prism_wire::{Argument, Interface};

use crate::client::Client;

/// Client-side handle for a protocol object.
///
/// A proxy is a value, not a reference: it names an id and carries the
/// static interface descriptor. Liveness is resolved against the
/// endpoint's object map on every use, so a stale handle fails cleanly
/// instead of dangling.
#[derive(Debug, Clone, Copy)]
pub struct Proxy {
    pub id: u32,
    pub interface: &'static Interface,
}

impl PartialEq for Proxy {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && prism_wire::same_interface(self.interface, other.interface)
    }
}

impl Eq for Proxy {}

/// One event handler. Invoked with the endpoint, the receiving proxy,
/// the user data attached alongside the handler vector, and the
/// decoded arguments.
pub type EventHandler = Rc<dyn Fn(&mut Client, Proxy, &Rc<dyn Any>, &[Argument])>;

/// A handler vector plus its user data, attached to a proxy exactly
/// once. One handler per event opcode, in interface table order.
#[derive(Clone)]
pub(crate) struct ProxyListener {
    pub(crate) handlers: Rc<Vec<EventHandler>>,
    pub(crate) data: Rc<dyn Any>,
}

/// One advertised global as mirrored by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Global {
    pub name: u32,
    pub interface: String,
    pub version: u32,
}

/// Observer for global advertisements. A listener registered late is
/// replayed the full current set first.
pub type GlobalListener = Rc<dyn Fn(&mut Client, &Global)>;
