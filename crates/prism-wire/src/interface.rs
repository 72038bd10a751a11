use std::fmt;

/// Static description of a protocol interface: its name, version, and
/// the messages flowing in each direction.
///
/// Descriptors are compile-time tables; the runtime never parses a
/// definition language. Requests travel client to server, events the
/// other way.
pub struct Interface {
    pub name: &'static str,
    pub version: u32,
    pub requests: &'static [MessageDesc],
    pub events: &'static [MessageDesc],
}

/// One message of an interface.
pub struct MessageDesc {
    pub name: &'static str,
    /// Wire signature, one code per argument (see
    /// [`ArgumentType`](crate::ArgumentType)).
    pub signature: &'static str,
    /// Interface of the object a `n` argument creates. `None` leaves
    /// the new id untyped; the receiver must resolve the interface
    /// from message context before registering the object.
    pub child_interface: Option<&'static Interface>,
}

impl MessageDesc {
    /// Number of arguments in the signature.
    pub fn arg_count(&self) -> usize {
        self.signature.len()
    }
}

/// Two descriptors are the same interface when they are the same table.
pub fn same_interface(a: &'static Interface, b: &'static Interface) -> bool {
    std::ptr::eq(a, b) || a.name == b.name
}

impl fmt::Debug for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interface")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("requests", &self.requests.len())
            .field("events", &self.events.len())
            .finish()
    }
}

impl fmt::Debug for MessageDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageDesc")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .field("child_interface", &self.child_interface.map(|i| i.name))
            .finish()
    }
}
