//! The client endpoint.
//!
//! One [`Client`] owns one connection to a display server, the proxy
//! map, and the mirrored global registry. All dispatch is synchronous
//! and single-threaded: handlers run to completion on the calling
//! thread, in strict arrival order, and may re-enter the endpoint to
//! create or destroy proxies or send further requests.

use std::any::Any;
use std::cell::Cell;
use std::ffi::CString;
use std::os::fd::OwnedFd;
use std::rc::Rc;

use tracing::{debug, error, warn};

use prism_wire::codec::{self, ObjectStatus};
use prism_wire::debug as wire_debug;
use prism_wire::debug::Direction;
use prism_wire::protocol::display;
use prism_wire::{
    Argument, Connection, Interface, Lookup, ObjectMap, ObjectRegistry, Side, WireError,
    DISPLAY_INTERFACE, DISPLAY_OBJECT_ID, READABLE, WRITABLE,
};

use crate::error::{ClientError, Result};
use crate::proxy::{EventHandler, Global, GlobalListener, Proxy, ProxyListener};

struct ProxyRecord {
    interface: &'static Interface,
    listener: Option<ProxyListener>,
}

/// The codec's view of the proxy map. The client allocates from the
/// client side of the id space.
struct ProxyRegistry<'a> {
    objects: &'a mut ObjectMap<ProxyRecord>,
}

impl ObjectRegistry for ProxyRegistry<'_> {
    fn status(&self, id: u32) -> ObjectStatus {
        match self.objects.lookup(id) {
            Lookup::Vacant => ObjectStatus::Vacant,
            Lookup::Live(record) => ObjectStatus::Live(record.interface),
            Lookup::Zombie => ObjectStatus::Zombie,
        }
    }

    fn allocate(&mut self, interface: &'static Interface) -> prism_wire::Result<u32> {
        self.objects.insert_new(
            Side::Client,
            ProxyRecord {
                interface,
                listener: None,
            },
        )
    }

    fn register(&mut self, id: u32, interface: &'static Interface) -> prism_wire::Result<()> {
        self.objects.insert_at(
            id,
            ProxyRecord {
                interface,
                listener: None,
            },
        )
    }

    fn unregister(&mut self, id: u32) {
        self.objects.remove(id);
    }
}

/// Client endpoint: connection, proxy map, globals mirror.
pub struct Client {
    connection: Connection,
    objects: ObjectMap<ProxyRecord>,
    globals: Vec<Global>,
    global_listeners: Vec<GlobalListener>,
    /// Base of the most recent server-side id grant.
    granted_base: Option<u32>,
    fatal: bool,
    trace: bool,
}

impl Client {
    /// Connect to the display socket (or adopt the descriptor named by
    /// `WAYLAND_SOCKET`) and set up the display singleton.
    pub fn connect(name: Option<&str>) -> Result<Self> {
        let fd = prism_transport::connect(name)?;
        Self::connect_to_fd(fd)
    }

    /// Build an endpoint over an already-connected stream socket.
    pub fn connect_to_fd(fd: OwnedFd) -> Result<Self> {
        let connection = Connection::new(fd)?;
        let mut client = Client {
            connection,
            objects: ObjectMap::new(),
            globals: Vec::new(),
            global_listeners: Vec::new(),
            granted_base: None,
            fatal: false,
            trace: wire_debug::debug_enabled(),
        };

        let id = client.objects.insert_new(
            Side::Client,
            ProxyRecord {
                interface: &DISPLAY_INTERFACE,
                listener: None,
            },
        )?;
        debug_assert_eq!(id, DISPLAY_OBJECT_ID);
        client.add_listener(client.display(), display_handlers(), Rc::new(()))?;

        debug!("client endpoint ready");
        Ok(client)
    }

    /// Handle for the display singleton.
    pub fn display(&self) -> Proxy {
        Proxy {
            id: DISPLAY_OBJECT_ID,
            interface: &DISPLAY_INTERFACE,
        }
    }

    /// Whether a fatal protocol error poisoned this endpoint.
    pub fn has_protocol_error(&self) -> bool {
        self.fatal
    }

    /// Base of the latest server-side id range grant, once received.
    pub fn granted_range_base(&self) -> Option<u32> {
        self.granted_base
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.fatal {
            return Err(ClientError::Fatal);
        }
        Ok(())
    }

    /// Allocate a fresh client-side id and register a proxy for it.
    pub fn create(&mut self, interface: &'static Interface) -> Result<Proxy> {
        self.ensure_usable()?;
        let id = self.objects.insert_new(
            Side::Client,
            ProxyRecord {
                interface,
                listener: None,
            },
        )?;
        Ok(Proxy { id, interface })
    }

    /// Register a proxy at a peer-nominated id.
    pub fn create_for_id(&mut self, id: u32, interface: &'static Interface) -> Result<Proxy> {
        self.ensure_usable()?;
        self.objects.insert_at(
            id,
            ProxyRecord {
                interface,
                listener: None,
            },
        )?;
        Ok(Proxy { id, interface })
    }

    /// Destroy a proxy. A client-allocated id turns into a zombie that
    /// keeps absorbing queued events until the server acknowledges with
    /// `delete_id`; a server-allocated id frees immediately.
    pub fn destroy(&mut self, proxy: Proxy) -> Result<()> {
        if proxy.id == DISPLAY_OBJECT_ID {
            return Err(ClientError::Wire(WireError::BadArgument {
                reason: "the display singleton cannot be destroyed",
            }));
        }
        match Side::of(proxy.id) {
            Side::Client => {
                self.objects.make_zombie(proxy.id)?;
            }
            Side::Server => {
                if self.objects.remove(proxy.id).is_none() {
                    return Err(ClientError::Wire(WireError::InvalidObject { id: proxy.id }));
                }
            }
        }
        Ok(())
    }

    /// Attach the handler vector and user data; exactly once per proxy.
    pub fn add_listener(
        &mut self,
        proxy: Proxy,
        handlers: Vec<EventHandler>,
        data: Rc<dyn Any>,
    ) -> Result<()> {
        if handlers.len() != proxy.interface.events.len() {
            return Err(ClientError::HandlerCount {
                interface: proxy.interface.name,
                expected: proxy.interface.events.len(),
                got: handlers.len(),
            });
        }
        let record = self
            .objects
            .get_mut(proxy.id)
            .ok_or(WireError::InvalidObject { id: proxy.id })?;
        if record.listener.is_some() {
            return Err(ClientError::ListenerExists { id: proxy.id });
        }
        record.listener = Some(ProxyListener {
            handlers: Rc::new(handlers),
            data,
        });
        Ok(())
    }

    /// User data attached with the proxy's listener.
    pub fn user_data(&self, proxy: Proxy) -> Option<Rc<dyn Any>> {
        self.objects
            .get(proxy.id)
            .and_then(|record| record.listener.as_ref())
            .map(|listener| Rc::clone(&listener.data))
    }

    /// Marshal a request. A `NewId(0)` argument allocates a proxy for
    /// the message's child interface; the created proxy, if any, is
    /// returned.
    pub fn send_request(
        &mut self,
        proxy: Proxy,
        opcode: u16,
        mut args: Vec<Argument>,
    ) -> Result<Option<Proxy>> {
        self.ensure_usable()?;
        let desc = proxy
            .interface
            .requests
            .get(opcode as usize)
            .ok_or(ClientError::UnknownOpcode {
                interface: proxy.interface.name,
                opcode,
            })?;

        let allocated = {
            let mut registry = ProxyRegistry {
                objects: &mut self.objects,
            };
            codec::prepare_message(&mut registry, desc, &mut args)?
        };
        if self.trace {
            wire_debug::emit(&wire_debug::message_trace(
                Direction::Send,
                proxy.interface.name,
                proxy.id,
                desc,
                &args,
            ));
        }
        let (bytes, fds) = codec::encode_message(proxy.id, opcode, args)?;
        self.connection.send(&bytes, fds)?;

        Ok(allocated.and_then(|id| {
            desc.child_interface
                .map(|interface| Proxy { id, interface })
        }))
    }

    /// Issue `sync` and return the callback proxy whose `done` event
    /// marks everything before it as processed.
    pub fn sync(&mut self) -> Result<Proxy> {
        let created =
            self.send_request(self.display(), display::REQ_SYNC, vec![Argument::NewId(0)])?;
        created.ok_or(ClientError::Wire(WireError::BadArgument {
            reason: "sync did not create a callback",
        }))
    }

    /// Ask for a callback fired on the next frame publication.
    pub fn frame(&mut self) -> Result<Proxy> {
        let created =
            self.send_request(self.display(), display::REQ_FRAME, vec![Argument::NewId(0)])?;
        created.ok_or(ClientError::Wire(WireError::BadArgument {
            reason: "frame did not create a callback",
        }))
    }

    /// Bind an advertised global, creating the local proxy for it.
    pub fn bind(&mut self, name: u32, interface: &'static Interface) -> Result<Proxy> {
        let proxy = self.create(interface)?;
        let interface_name =
            CString::new(interface.name).map_err(|_| WireError::BadArgument {
                reason: "interface name contains an interior nul",
            })?;
        self.send_request(
            self.display(),
            display::REQ_BIND,
            vec![
                Argument::Uint(name),
                Argument::Str(Some(interface_name)),
                Argument::Uint(interface.version),
                Argument::NewId(proxy.id),
            ],
        )?;
        Ok(proxy)
    }

    /// Globals currently advertised, in advertisement order.
    pub fn globals(&self) -> &[Global] {
        &self.globals
    }

    /// Name of a global implementing `interface` at `min_version` or
    /// newer.
    pub fn get_global(&self, interface: &str, min_version: u32) -> Option<u32> {
        self.globals
            .iter()
            .find(|global| global.interface == interface && min_version <= global.version)
            .map(|global| global.name)
    }

    /// Register a global observer and replay the current set to it.
    pub fn add_global_listener(&mut self, listener: GlobalListener) {
        self.global_listeners.push(Rc::clone(&listener));
        let snapshot = self.globals.clone();
        for global in &snapshot {
            listener(self, global);
        }
    }

    /// Drain the socket per `mask` and dispatch every complete
    /// buffered message. Returns how many handlers ran.
    pub fn iterate(&mut self, mask: u32) -> Result<usize> {
        self.ensure_usable()?;
        self.connection.drain(mask)?;
        self.dispatch_pending()
    }

    /// Push buffered requests out to the socket.
    pub fn flush(&mut self) -> Result<()> {
        match self.connection.flush() {
            Ok(()) | Err(WireError::WouldBlock) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Block until at least one handler has been dispatched.
    pub fn dispatch(&mut self) -> Result<usize> {
        self.ensure_usable()?;
        loop {
            self.flush()?;
            let dispatched = self.iterate(READABLE | WRITABLE)?;
            if dispatched > 0 {
                return Ok(dispatched);
            }
            self.connection.wait(READABLE, -1)?;
        }
    }

    /// Send `sync`, then dispatch until its callback fires. On return
    /// every request sent before the call has been processed by the
    /// server.
    pub fn roundtrip(&mut self) -> Result<usize> {
        let done = Rc::new(Cell::new(false));
        let callback = self.sync()?;
        let fired = Rc::clone(&done);
        let handlers: Vec<EventHandler> =
            vec![Rc::new(move |client, proxy, _data, _args| {
                fired.set(true);
                if let Err(err) = client.destroy(proxy) {
                    warn!(id = proxy.id, %err, "could not retire sync callback");
                }
            })];
        self.add_listener(callback, handlers, Rc::new(()))?;
        self.flush()?;

        let mut dispatched = 0;
        while !done.get() {
            dispatched += self.dispatch()?;
        }
        Ok(dispatched)
    }

    fn dispatch_pending(&mut self) -> Result<usize> {
        let mut dispatched = 0;
        loop {
            let header = match self.connection.peek_header()? {
                Some(header) => header,
                None => break,
            };
            if !self.connection.has_complete(header.size) {
                break;
            }

            let (interface, listener) = match self.objects.lookup(header.receiver) {
                Lookup::Zombie => {
                    self.connection.discard_message(header.size)?;
                    continue;
                }
                Lookup::Vacant => {
                    warn!(id = header.receiver, "event for unknown object, discarding");
                    self.connection.discard_message(header.size)?;
                    continue;
                }
                Lookup::Live(record) => (record.interface, record.listener.clone()),
            };

            let desc = match interface.events.get(header.opcode as usize) {
                Some(desc) => desc,
                None => {
                    error!(
                        id = header.receiver,
                        opcode = header.opcode,
                        interface = interface.name,
                        "event opcode out of range"
                    );
                    self.fatal = true;
                    return Err(ClientError::Wire(WireError::BadMessage {
                        reason: "event opcode out of range",
                    }));
                }
            };

            let Some(listener) = listener else {
                self.connection.discard_message(header.size)?;
                continue;
            };

            let payload = self.connection.take_message(header.size)?;
            let args = {
                let Client {
                    ref mut objects,
                    ref mut connection,
                    ..
                } = *self;
                let mut registry = ProxyRegistry { objects };
                codec::decode_message(&mut registry, desc, &payload, connection.incoming_fds())
            };
            let args = match args {
                Ok(args) => args,
                Err(WireError::InvalidObject { id }) => {
                    warn!(
                        id,
                        message = desc.name,
                        "event referenced a dead object, skipping"
                    );
                    continue;
                }
                Err(err) => {
                    error!(%err, message = desc.name, "event failed to decode");
                    self.fatal = true;
                    return Err(err.into());
                }
            };

            if self.trace {
                wire_debug::emit(&wire_debug::message_trace(
                    Direction::Receive,
                    interface.name,
                    header.receiver,
                    desc,
                    &args,
                ));
            }

            let proxy = Proxy {
                id: header.receiver,
                interface,
            };
            let handler = Rc::clone(&listener.handlers[header.opcode as usize]);
            handler(self, proxy, &listener.data, &args);
            dispatched += 1;
        }
        Ok(dispatched)
    }

    fn handle_display_error(&mut self, args: &[Argument]) {
        let object = args[0].as_object().unwrap_or(0);
        let code = args[1].as_uint().unwrap_or(0);
        let message = args[2].as_str().unwrap_or("<garbled>");
        error!(object, code, message, "display error");
        self.fatal = true;
    }

    fn handle_global(&mut self, args: &[Argument]) {
        let global = Global {
            name: args[0].as_uint().unwrap_or(0),
            interface: args[1].as_str().unwrap_or("").to_string(),
            version: args[2].as_uint().unwrap_or(0),
        };
        debug!(
            name = global.name,
            interface = %global.interface,
            version = global.version,
            "global advertised"
        );
        self.globals.push(global.clone());
        let listeners = self.global_listeners.clone();
        for listener in listeners {
            listener(self, &global);
        }
    }

    fn handle_global_remove(&mut self, args: &[Argument]) {
        let name = args[0].as_uint().unwrap_or(0);
        debug!(name, "global removed");
        self.globals.retain(|global| global.name != name);
    }

    fn handle_delete_id(&mut self, args: &[Argument]) {
        let id = args[0].as_uint().unwrap_or(0);
        match self.objects.lookup(id) {
            Lookup::Zombie => {
                self.objects.remove(id);
            }
            Lookup::Live(_) | Lookup::Vacant => warn!(id, "delete_id for live object"),
        }
    }

    fn handle_range(&mut self, args: &[Argument]) {
        let base = args[0].as_uint().unwrap_or(0);
        debug!(base, "server id range granted");
        self.granted_base = Some(base);
    }
}

/// Handler vector for the display singleton, one entry per event in
/// table order.
fn display_handlers() -> Vec<EventHandler> {
    vec![
        // error
        Rc::new(|client, _proxy, _data, args| client.handle_display_error(args)),
        // global
        Rc::new(|client, _proxy, _data, args| client.handle_global(args)),
        // global_remove
        Rc::new(|client, _proxy, _data, args| client.handle_global_remove(args)),
        // delete_id
        Rc::new(|client, _proxy, _data, args| client.handle_delete_id(args)),
        // range
        Rc::new(|client, _proxy, _data, args| client.handle_range(args)),
        // invalid_object
        Rc::new(|client, _proxy, _data, args| {
            error!(
                id = args[0].as_uint().unwrap_or(0),
                "server reported a request against an invalid object"
            );
            client.fatal = true;
        }),
        // invalid_method
        Rc::new(|client, _proxy, _data, args| {
            error!(
                id = args[0].as_uint().unwrap_or(0),
                opcode = args[1].as_uint().unwrap_or(0),
                "server rejected a request opcode"
            );
            client.fatal = true;
        }),
        // no_memory
        Rc::new(|_client, _proxy, _data, _args| {
            warn!("server is out of memory");
        }),
    ]
}
