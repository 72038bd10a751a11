use std::any::Any;
use std::fmt;
use std::rc::Rc;

use prism_wire::{Argument, Interface};

use crate::display::Display;

/// Opaque handle for a connected client.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub(crate) usize);

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Server-side handle for a protocol object owned by one client.
///
/// Like the ids it wraps, a resource handle is weak: every operation
/// revalidates it against the owning client's object map.
#[derive(Debug, Clone, Copy)]
pub struct Resource {
    pub id: u32,
    pub client: ClientId,
    pub interface: &'static Interface,
}

impl PartialEq for Resource {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.client == other.client
            && prism_wire::same_interface(self.interface, other.interface)
    }
}

impl Eq for Resource {}

/// One request handler. Invoked with the endpoint, the receiving
/// resource, the user data attached alongside the handler vector, and
/// the decoded arguments.
pub type RequestHandler = Rc<dyn Fn(&mut Display, Resource, &Rc<dyn Any>, &[Argument])>;

/// Cleanup hook run when a resource is destroyed, including during
/// client teardown (reverse registration order).
pub type DestroyHook = Rc<dyn Fn(&mut Display, Resource)>;

/// Hook attached to a global. Runs once per global when a client
/// connects (with the global's own resource) and again when a client
/// binds the global (with the freshly created resource, the moment an
/// implementation can be attached).
pub type BindHook = Rc<dyn Fn(&mut Display, Resource)>;

/// A handler vector plus user data, attached to a resource exactly
/// once. One handler per request opcode, in interface table order.
#[derive(Clone)]
pub(crate) struct ResourceImpl {
    pub(crate) handlers: Rc<Vec<RequestHandler>>,
    pub(crate) data: Rc<dyn Any>,
}

pub(crate) struct ResourceRecord {
    pub(crate) interface: &'static Interface,
    pub(crate) implementation: Option<ResourceImpl>,
    pub(crate) destroy: Option<DestroyHook>,
}

impl ResourceRecord {
    pub(crate) fn bare(interface: &'static Interface) -> Self {
        ResourceRecord {
            interface,
            implementation: None,
            destroy: None,
        }
    }
}
