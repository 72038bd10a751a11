//! The server endpoint.
//!
//! One [`Display`] owns the listening sockets, every connected client,
//! the advertised globals, and the frame-listener list. Dispatch is
//! single-threaded and strictly ordered per connection: the poll loop
//! drains one client, runs its handlers to completion, and only then
//! moves on.

use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, info, warn};

use prism_wire::codec::{self, ObjectStatus};
use prism_wire::debug as wire_debug;
use prism_wire::debug::Direction;
use prism_wire::protocol::{callback, display};
use prism_wire::{
    Argument, Connection, Entry, Interface, Lookup, ObjectMap, ObjectRegistry, Side, WireError,
    CALLBACK_INTERFACE, DISPLAY_INTERFACE, DISPLAY_OBJECT_ID, READABLE, SERVER_ID_BASE,
};

use prism_transport::ListeningSocket;

use crate::client::ClientState;
use crate::error::{Result, ServerError};
use crate::event_loop::{self, PollEntry};
use crate::resource::{
    BindHook, ClientId, DestroyHook, RequestHandler, Resource, ResourceImpl, ResourceRecord,
};

/// Ids granted per range.
const ID_RANGE_SIZE: u32 = 256;
/// A fresh range goes out when a client's remaining budget sits below
/// this at registration time.
const ID_RANGE_LOW_WATERMARK: u32 = 64;

#[derive(Clone)]
struct GlobalEntry {
    name: u32,
    interface: &'static Interface,
    version: u32,
    bind: Option<BindHook>,
}

struct FrameListener {
    client: ClientId,
    callback: u32,
}

/// The codec's view of one client's object map. New ids registered
/// during decode are remembered so the display can finish their
/// client-side bookkeeping (or roll them back) afterwards.
struct ResourceRegistry<'a> {
    objects: &'a mut ObjectMap<ResourceRecord>,
    created: Vec<u32>,
}

impl ObjectRegistry for ResourceRegistry<'_> {
    fn status(&self, id: u32) -> ObjectStatus {
        match self.objects.lookup(id) {
            Lookup::Vacant => ObjectStatus::Vacant,
            Lookup::Live(record) => ObjectStatus::Live(record.interface),
            Lookup::Zombie => ObjectStatus::Zombie,
        }
    }

    fn allocate(&mut self, _interface: &'static Interface) -> prism_wire::Result<u32> {
        Err(WireError::BadArgument {
            reason: "server events carry pre-created resource ids",
        })
    }

    fn register(&mut self, id: u32, interface: &'static Interface) -> prism_wire::Result<()> {
        self.objects.insert_at(id, ResourceRecord::bare(interface))?;
        self.created.push(id);
        Ok(())
    }

    fn unregister(&mut self, id: u32) {
        self.objects.remove(id);
    }
}

/// Server endpoint: sockets, clients, globals, frame listeners.
pub struct Display {
    sockets: Vec<ListeningSocket>,
    clients: Vec<Option<ClientState>>,
    globals: Vec<GlobalEntry>,
    frame_listeners: Vec<FrameListener>,
    /// Cursor over the server-allocated id space; range grants and
    /// global ids are carved from it so they can never collide.
    next_server_id: u32,
    serial: u32,
    running: bool,
    trace: bool,
}

impl Display {
    /// Build a display and advertise its singleton as the first global.
    pub fn create() -> Result<Self> {
        let mut display = Display {
            sockets: Vec::new(),
            clients: Vec::new(),
            globals: Vec::new(),
            frame_listeners: Vec::new(),
            next_server_id: SERVER_ID_BASE,
            serial: 0,
            running: false,
            trace: wire_debug::debug_enabled(),
        };
        display.globals.push(GlobalEntry {
            name: DISPLAY_OBJECT_ID,
            interface: &DISPLAY_INTERFACE,
            version: DISPLAY_INTERFACE.version,
            bind: None,
        });
        debug!("display created");
        Ok(display)
    }

    /// Bind a listening socket under the runtime directory.
    pub fn add_socket(&mut self, name: Option<&str>) -> Result<()> {
        let socket = ListeningSocket::bind(name)?;
        info!(path = ?socket.path(), "display socket added");
        self.sockets.push(socket);
        Ok(())
    }

    fn alloc_server_ids(&mut self, count: u32) -> Result<u32> {
        let base = self.next_server_id;
        self.next_server_id = base
            .checked_add(count)
            .ok_or(WireError::IdExhausted)
            .map_err(ServerError::Wire)?;
        Ok(base)
    }

    fn next_serial(&mut self) -> u32 {
        self.serial = self.serial.wrapping_add(1);
        self.serial
    }

    fn state(&self, client: ClientId) -> Option<&ClientState> {
        self.clients.get(client.0).and_then(Option::as_ref)
    }

    fn state_mut(&mut self, client: ClientId) -> Option<&mut ClientState> {
        self.clients.get_mut(client.0).and_then(Option::as_mut)
    }

    fn require_state_mut(&mut self, client: ClientId) -> Result<&mut ClientState> {
        self.clients
            .get_mut(client.0)
            .and_then(Option::as_mut)
            .ok_or(ServerError::UnknownClient(client))
    }

    /// Connected clients, in slot order.
    pub fn client_ids(&self) -> Vec<ClientId> {
        self.clients
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(index, _)| ClientId(index))
            .collect()
    }

    /// Remaining id-range budget of a client.
    pub fn client_id_budget(&self, client: ClientId) -> Option<u32> {
        self.state(client).map(|state| state.id_count)
    }

    /// Wrap an accepted connection in a client record: build its
    /// object map (display singleton plus global mirrors), grant the
    /// initial id range, replay the globals, and run the bind hooks.
    pub fn client_create(&mut self, fd: OwnedFd) -> Result<ClientId> {
        let connection = Connection::new(fd).map_err(ServerError::Wire)?;
        let mut state = ClientState::new(connection);

        let display_id = state.objects.insert_new(
            Side::Client,
            ResourceRecord {
                interface: &DISPLAY_INTERFACE,
                implementation: Some(display_implementation()),
                destroy: None,
            },
        )?;
        debug_assert_eq!(display_id, DISPLAY_OBJECT_ID);

        for global in &self.globals {
            if global.name == DISPLAY_OBJECT_ID {
                continue;
            }
            state
                .objects
                .insert_at(global.name, ResourceRecord::bare(global.interface))?;
        }

        let slot = match self.clients.iter().position(Option::is_none) {
            Some(slot) => slot,
            None => {
                self.clients.push(None);
                self.clients.len() - 1
            }
        };
        self.clients[slot] = Some(state);
        let client = ClientId(slot);
        debug!(?client, "client connected");

        self.post_range(client)?;

        let globals = self.globals.clone();
        for global in &globals {
            self.advertise_to(client, global)?;
        }
        for global in &globals {
            if let Some(bind) = &global.bind {
                bind(
                    self,
                    Resource {
                        id: global.name,
                        client,
                        interface: global.interface,
                    },
                );
            }
        }

        Ok(client)
    }

    fn post_range(&mut self, client: ClientId) -> Result<()> {
        let base = self.alloc_server_ids(ID_RANGE_SIZE)?;
        self.post_display_event(client, display::EVT_RANGE, vec![Argument::Uint(base)])?;
        let state = self.require_state_mut(client)?;
        state.id_count += ID_RANGE_SIZE;
        Ok(())
    }

    fn advertise_to(&mut self, client: ClientId, global: &GlobalEntry) -> Result<()> {
        let interface_name =
            CString::new(global.interface.name).map_err(|_| WireError::BadArgument {
                reason: "interface name contains an interior nul",
            })?;
        self.post_display_event(
            client,
            display::EVT_GLOBAL,
            vec![
                Argument::Uint(global.name),
                Argument::Str(Some(interface_name)),
                Argument::Uint(global.version),
            ],
        )
    }

    /// Advertise a new global to every connected client. Returns the
    /// global's name, which doubles as its object id in the
    /// server-allocated range. The bind hook is optional; a global
    /// without one is advertised but never called back.
    pub fn add_global(
        &mut self,
        interface: &'static Interface,
        version: u32,
        bind: Option<BindHook>,
    ) -> Result<u32> {
        let name = self.alloc_server_ids(1)?;
        let entry = GlobalEntry {
            name,
            interface,
            version,
            bind,
        };

        for client in self.client_ids() {
            if let Some(state) = self.state_mut(client) {
                state
                    .objects
                    .insert_at(name, ResourceRecord::bare(interface))?;
            }
            if let Err(err) = self.advertise_to(client, &entry) {
                warn!(?client, %err, "could not advertise global");
            }
        }

        info!(name, interface = interface.name, version, "global added");
        self.globals.push(entry);
        Ok(name)
    }

    /// Withdraw a global and notify every client.
    pub fn remove_global(&mut self, name: u32) -> Result<()> {
        let position = self
            .globals
            .iter()
            .position(|global| global.name == name)
            .ok_or(ServerError::UnknownGlobal { name })?;
        self.globals.remove(position);

        for client in self.client_ids() {
            if let Some(state) = self.state_mut(client) {
                state.objects.remove(name);
            }
            if let Err(err) = self.post_display_event(
                client,
                display::EVT_GLOBAL_REMOVE,
                vec![Argument::Uint(name)],
            ) {
                warn!(?client, %err, "could not announce global removal");
            }
        }
        Ok(())
    }

    /// Register a resource for a client at a nominated id. Counts
    /// against the client's id-range budget and triggers a refill
    /// grant when the budget runs low.
    pub fn create_resource(
        &mut self,
        client: ClientId,
        id: u32,
        interface: &'static Interface,
    ) -> Result<Resource> {
        self.register_resource(client, id, ResourceRecord::bare(interface))?;
        Ok(Resource {
            id,
            client,
            interface,
        })
    }

    fn register_resource(
        &mut self,
        client: ClientId,
        id: u32,
        record: ResourceRecord,
    ) -> Result<()> {
        let state = self.require_state_mut(client)?;
        state.objects.insert_at(id, record)?;
        state.resources.push(id);

        let refill = state.id_count < ID_RANGE_LOW_WATERMARK;
        state.id_count = state.id_count.saturating_sub(1);
        if refill {
            self.post_range(client)?;
        }
        Ok(())
    }

    /// Finish bookkeeping for ids the codec registered during decode.
    fn finish_decode_registration(&mut self, client: ClientId, id: u32) -> Result<()> {
        let state = self.require_state_mut(client)?;
        state.resources.push(id);
        let refill = state.id_count < ID_RANGE_LOW_WATERMARK;
        state.id_count = state.id_count.saturating_sub(1);
        if refill {
            self.post_range(client)?;
        }
        Ok(())
    }

    /// Attach the handler vector and user data; exactly once per
    /// resource.
    pub fn set_implementation(
        &mut self,
        resource: Resource,
        handlers: Vec<RequestHandler>,
        data: Rc<dyn std::any::Any>,
    ) -> Result<()> {
        if handlers.len() != resource.interface.requests.len() {
            return Err(ServerError::HandlerCount {
                interface: resource.interface.name,
                expected: resource.interface.requests.len(),
                got: handlers.len(),
            });
        }
        let state = self.require_state_mut(resource.client)?;
        let record = state
            .objects
            .get_mut(resource.id)
            .ok_or(WireError::InvalidObject { id: resource.id })
            .map_err(ServerError::Wire)?;
        if record.implementation.is_some() {
            return Err(ServerError::ImplementationExists { id: resource.id });
        }
        record.implementation = Some(ResourceImpl {
            handlers: Rc::new(handlers),
            data,
        });
        Ok(())
    }

    /// Install the cleanup hook run when the resource dies.
    pub fn set_destroy_hook(&mut self, resource: Resource, hook: DestroyHook) -> Result<()> {
        let state = self.require_state_mut(resource.client)?;
        let record = state
            .objects
            .get_mut(resource.id)
            .ok_or(WireError::InvalidObject { id: resource.id })
            .map_err(ServerError::Wire)?;
        record.destroy = Some(hook);
        Ok(())
    }

    /// Queue an event on a client's connection.
    pub fn post_event(
        &mut self,
        resource: Resource,
        opcode: u16,
        mut args: Vec<Argument>,
    ) -> Result<()> {
        let desc = resource
            .interface
            .events
            .get(opcode as usize)
            .ok_or(ServerError::UnknownOpcode {
                interface: resource.interface.name,
                opcode,
            })?;
        let trace = self.trace;
        let state = self.require_state_mut(resource.client)?;
        if state.dead {
            return Err(ServerError::Wire(WireError::Closed));
        }

        let prepared = {
            let mut registry = ResourceRegistry {
                objects: &mut state.objects,
                created: Vec::new(),
            };
            codec::prepare_message(&mut registry, desc, &mut args)
        };
        prepared.map_err(ServerError::Wire)?;

        if trace {
            wire_debug::emit(&wire_debug::message_trace(
                Direction::Send,
                resource.interface.name,
                resource.id,
                desc,
                &args,
            ));
        }

        let (bytes, fds) = codec::encode_message(resource.id, opcode, args)?;
        match state.connection.send(&bytes, fds) {
            Ok(()) => Ok(()),
            Err(err) => {
                // A client that cannot take protocol-critical events
                // (grants, delete_id) has inconsistent state; drop it.
                warn!(client = ?resource.client, %err, "event send failed, marking client dead");
                state.dead = true;
                Err(ServerError::Wire(err))
            }
        }
    }

    fn post_display_event(
        &mut self,
        client: ClientId,
        opcode: u16,
        args: Vec<Argument>,
    ) -> Result<()> {
        self.post_event(
            Resource {
                id: DISPLAY_OBJECT_ID,
                client,
                interface: &DISPLAY_INTERFACE,
            },
            opcode,
            args,
        )
    }

    /// Report a terminal protocol error on a resource to its client.
    pub fn post_error(&mut self, resource: Resource, code: u32, message: &str) -> Result<()> {
        let message = CString::new(message).map_err(|_| WireError::BadArgument {
            reason: "error message contains an interior nul",
        })?;
        self.post_display_event(
            resource.client,
            display::EVT_ERROR,
            vec![
                Argument::Object(resource.id),
                Argument::Uint(code),
                Argument::Str(Some(message)),
            ],
        )
    }

    /// Tell a client an allocation on its behalf failed.
    pub fn post_no_memory(&mut self, client: ClientId) -> Result<()> {
        self.post_display_event(client, display::EVT_NO_MEMORY, Vec::new())
    }

    /// Destroy a resource: drop it from the map and the owning
    /// client's list, run its destroy hook, and acknowledge with
    /// `delete_id` so the client can reuse the slot.
    pub fn destroy_resource(&mut self, resource: Resource) -> Result<()> {
        let hook = {
            let state = self.require_state_mut(resource.client)?;
            let record = match state.objects.remove(resource.id) {
                Some(Entry::Live(record)) => record,
                _ => {
                    return Err(ServerError::Wire(WireError::InvalidObject {
                        id: resource.id,
                    }))
                }
            };
            state.resources.retain(|&id| id != resource.id);
            record.destroy
        };
        self.frame_listeners
            .retain(|listener| !(listener.client == resource.client && listener.callback == resource.id));

        if let Some(hook) = hook {
            hook(self, resource);
        }

        if let Err(err) = self.post_display_event(
            resource.client,
            display::EVT_DELETE_ID,
            vec![Argument::Uint(resource.id)],
        ) {
            debug!(client = ?resource.client, id = resource.id, %err, "delete_id not delivered");
        }
        Ok(())
    }

    /// Tear a client down: destroy its resources in reverse
    /// registration order (running destroy hooks), drop its frame
    /// listeners, and close the connection.
    pub fn destroy_client(&mut self, client: ClientId) {
        let Some(state) = self.state_mut(client) else {
            return;
        };
        state.dead = true;
        debug!(?client, "client disconnecting");

        loop {
            let popped = self.state_mut(client).and_then(|state| state.resources.pop());
            let Some(id) = popped else { break };
            let removed = self
                .state_mut(client)
                .and_then(|state| state.objects.remove(id));
            if let Some(Entry::Live(record)) = removed {
                if let Some(hook) = record.destroy {
                    hook(
                        self,
                        Resource {
                            id,
                            client,
                            interface: record.interface,
                        },
                    );
                }
            }
        }

        self.frame_listeners.retain(|listener| listener.client != client);
        if let Some(slot) = self.clients.get_mut(client.0) {
            *slot = None;
        }
    }

    /// Fire every parked frame callback with `time`, in registration
    /// order, destroying each callback afterwards.
    pub fn post_frame(&mut self, time: u32) -> Result<()> {
        let listeners = std::mem::take(&mut self.frame_listeners);
        for listener in listeners {
            let resource = Resource {
                id: listener.callback,
                client: listener.client,
                interface: &CALLBACK_INTERFACE,
            };
            if let Err(err) =
                self.post_event(resource, callback::EVT_DONE, vec![Argument::Uint(time)])
            {
                debug!(client = ?listener.client, %err, "frame callback not delivered");
            }
            if let Err(err) = self.destroy_resource(resource) {
                debug!(client = ?listener.client, %err, "frame callback not destroyed");
            }
        }
        Ok(())
    }

    /// Parked frame callbacks awaiting the next `post_frame`.
    pub fn frame_listener_count(&self) -> usize {
        self.frame_listeners.len()
    }

    fn handle_sync(&mut self, client: ClientId, args: &[Argument]) {
        let Some(id) = args[0].as_new_id().filter(|&id| id != 0) else {
            return;
        };
        let serial = self.next_serial();
        let resource = Resource {
            id,
            client,
            interface: &CALLBACK_INTERFACE,
        };
        if let Err(err) = self.post_event(resource, callback::EVT_DONE, vec![Argument::Uint(serial)])
        {
            debug!(?client, %err, "sync reply not delivered");
            return;
        }
        if let Err(err) = self.destroy_resource(resource) {
            debug!(?client, %err, "sync callback not destroyed");
        }
    }

    fn handle_frame(&mut self, client: ClientId, args: &[Argument]) {
        let Some(id) = args[0].as_new_id().filter(|&id| id != 0) else {
            return;
        };
        self.frame_listeners.push(FrameListener {
            client,
            callback: id,
        });
    }

    fn handle_bind(&mut self, client: ClientId, args: &[Argument]) {
        let name = args[0].as_uint().unwrap_or(0);
        let wanted_interface = args[1].as_str().unwrap_or("").to_string();
        let version = args[2].as_uint().unwrap_or(0);
        let Some(id) = args[3].as_new_id().filter(|&id| id != 0) else {
            return;
        };

        let Some(global) = self
            .globals
            .iter()
            .find(|global| global.name == name)
            .cloned()
        else {
            warn!(?client, name, "bind names an unknown global");
            let _ = self.post_display_event(
                client,
                display::EVT_INVALID_OBJECT,
                vec![Argument::Uint(name)],
            );
            return;
        };

        if global.interface.name != wanted_interface || version > global.version {
            warn!(
                ?client,
                name,
                wanted = %wanted_interface,
                version,
                "bind does not match the advertised global"
            );
            let _ = self.post_display_event(
                client,
                display::EVT_INVALID_OBJECT,
                vec![Argument::Uint(name)],
            );
            return;
        }

        if let Err(err) = self.register_resource(client, id, ResourceRecord::bare(global.interface))
        {
            warn!(?client, id, %err, "bind target id rejected");
            let _ = self.post_display_event(
                client,
                display::EVT_INVALID_OBJECT,
                vec![Argument::Uint(id)],
            );
            return;
        }

        if let Some(bind) = &global.bind {
            bind(
                self,
                Resource {
                    id,
                    client,
                    interface: global.interface,
                },
            );
        }
    }

    fn handle_client_io(&mut self, client: ClientId, mask: u32) {
        {
            let Some(state) = self.state_mut(client) else {
                return;
            };
            if state.dead {
                return;
            }
            if let Err(err) = state.connection.drain(mask) {
                debug!(?client, %err, "connection failed");
                self.destroy_client(client);
                return;
            }
        }

        loop {
            let header = {
                let Some(state) = self.state_mut(client) else {
                    return;
                };
                if state.dead {
                    break;
                }
                match state.connection.peek_header() {
                    Ok(Some(header)) if state.connection.has_complete(header.size) => header,
                    Ok(_) => break,
                    Err(err) => {
                        warn!(?client, %err, "framing violation");
                        self.destroy_client(client);
                        return;
                    }
                }
            };

            // Resolve the receiver and its request descriptor.
            let resolved = {
                let Some(state) = self.state_mut(client) else {
                    return;
                };
                match state.objects.lookup(header.receiver) {
                    Lookup::Live(record) => {
                        Some((record.interface, record.implementation.clone()))
                    }
                    Lookup::Vacant | Lookup::Zombie => None,
                }
            };
            let Some((interface, implementation)) = resolved else {
                self.discard_and_report(
                    client,
                    header.size,
                    display::EVT_INVALID_OBJECT,
                    vec![Argument::Uint(header.receiver)],
                );
                continue;
            };

            let Some(desc) = interface.requests.get(header.opcode as usize) else {
                self.discard_and_report(
                    client,
                    header.size,
                    display::EVT_INVALID_METHOD,
                    vec![
                        Argument::Uint(header.receiver),
                        Argument::Uint(u32::from(header.opcode)),
                    ],
                );
                continue;
            };

            // Consume and decode.
            let decoded = {
                let Some(state) = self.state_mut(client) else {
                    return;
                };
                let payload = match state.connection.take_message(header.size) {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(?client, %err, "message consumption failed");
                        self.destroy_client(client);
                        return;
                    }
                };
                let ClientState {
                    ref mut objects,
                    ref mut connection,
                    ..
                } = *state;
                let mut registry = ResourceRegistry {
                    objects,
                    created: Vec::new(),
                };
                let result =
                    codec::decode_message(&mut registry, desc, &payload, connection.incoming_fds());
                (result, registry.created)
            };

            let args = match decoded {
                (Ok(args), created) => {
                    let mut registration_failed = false;
                    for id in created {
                        if let Err(err) = self.finish_decode_registration(client, id) {
                            warn!(?client, id, %err, "new-id bookkeeping failed");
                            registration_failed = true;
                        }
                    }
                    if registration_failed {
                        continue;
                    }
                    args
                }
                (Err(WireError::InvalidObject { id }), _) => {
                    warn!(?client, id, message = desc.name, "request referenced a dead object");
                    let _ = self.post_display_event(
                        client,
                        display::EVT_INVALID_OBJECT,
                        vec![Argument::Uint(id)],
                    );
                    continue;
                }
                (Err(WireError::IdExhausted), _) => {
                    let _ = self.post_no_memory(client);
                    continue;
                }
                (Err(err @ (WireError::BadMessage { .. } | WireError::MissingFd | WireError::IdInUse { .. })), _) => {
                    warn!(?client, %err, message = desc.name, "request failed to decode");
                    let _ = self.post_display_event(
                        client,
                        display::EVT_INVALID_METHOD,
                        vec![
                            Argument::Uint(header.receiver),
                            Argument::Uint(u32::from(header.opcode)),
                        ],
                    );
                    continue;
                }
                (Err(err), _) => {
                    warn!(?client, %err, "connection failed during decode");
                    self.destroy_client(client);
                    return;
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

            if let Some(implementation) = implementation {
                let resource = Resource {
                    id: header.receiver,
                    client,
                    interface,
                };
                let handler = Rc::clone(&implementation.handlers[header.opcode as usize]);
                handler(self, resource, &implementation.data, &args);
            }
        }

        // Push out whatever the handlers queued; sweep if the client
        // went bad along the way.
        let dead = {
            match self.state_mut(client) {
                Some(state) => {
                    if !state.dead {
                        match state.connection.flush() {
                            Ok(()) | Err(WireError::WouldBlock) => {}
                            Err(err) => {
                                debug!(?client, %err, "flush failed");
                                state.dead = true;
                            }
                        }
                    }
                    state.dead
                }
                None => return,
            }
        };
        if dead {
            self.destroy_client(client);
        }
    }

    fn discard_and_report(
        &mut self,
        client: ClientId,
        size: usize,
        opcode: u16,
        args: Vec<Argument>,
    ) {
        {
            let Some(state) = self.state_mut(client) else {
                return;
            };
            if state.connection.discard_message(size).is_err() {
                state.dead = true;
                return;
            }
        }
        let _ = self.post_display_event(client, opcode, args);
    }

    /// One poll turn: accept pending clients, dispatch every readable
    /// connection, flush writers, sweep the dead.
    pub fn dispatch(&mut self, timeout: Option<Duration>) -> Result<()> {
        let client_ids = self.client_ids();

        let mut entries = Vec::new();
        for socket in &self.sockets {
            entries.push(PollEntry {
                fd: socket.as_raw_fd(),
                mask: READABLE,
            });
        }
        for &client in &client_ids {
            // Dead clients keep a placeholder entry so indices align.
            let mask = match self.state(client) {
                Some(state) if !state.dead => READABLE | state.connection.interest(),
                _ => 0,
            };
            entries.push(PollEntry {
                fd: self
                    .state(client)
                    .map(|state| state.connection.as_raw_fd())
                    .unwrap_or(-1),
                mask,
            });
        }

        let timeout_ms = timeout
            .map(|timeout| i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX))
            .unwrap_or(-1);
        let ready = event_loop::poll(&entries, timeout_ms)?;

        let socket_count = self.sockets.len();
        let mut accepted = Vec::new();
        for (index, socket) in self.sockets.iter().enumerate() {
            if ready[index] & READABLE == 0 {
                continue;
            }
            loop {
                match socket.accept() {
                    Ok(Some(fd)) => accepted.push(fd),
                    Ok(None) => break,
                    Err(err) => {
                        warn!(%err, "accept failed");
                        break;
                    }
                }
            }
        }
        for fd in accepted {
            if let Err(err) = self.client_create(fd) {
                warn!(%err, "client setup failed");
            }
        }

        for (offset, &client) in client_ids.iter().enumerate() {
            let mask = ready[socket_count + offset];
            if mask != 0 {
                self.handle_client_io(client, mask);
            }
        }

        for client in self.client_ids() {
            if self.state(client).is_some_and(|state| state.dead) {
                self.destroy_client(client);
            }
        }

        Ok(())
    }

    /// Dispatch until [`terminate`](Self::terminate) is called.
    pub fn run(&mut self) -> Result<()> {
        self.running = true;
        while self.running {
            self.dispatch(None)?;
        }
        Ok(())
    }

    /// Make [`run`](Self::run) return after the current turn.
    pub fn terminate(&mut self) {
        self.running = false;
    }
}

/// Built-in handler vector for the display singleton.
fn display_implementation() -> ResourceImpl {
    let handlers: Vec<RequestHandler> = vec![
        // sync
        Rc::new(|display, resource, _data, args| display.handle_sync(resource.client, args)),
        // frame
        Rc::new(|display, resource, _data, args| display.handle_frame(resource.client, args)),
        // bind
        Rc::new(|display, resource, _data, args| display.handle_bind(resource.client, args)),
    ];
    ResourceImpl {
        handlers: Rc::new(handlers),
        data: Rc::new(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_wire::codec::encode_message;
    use prism_wire::MessageHeader;
    use std::cell::{Cell, RefCell};
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    static PANEL_INTERFACE: Interface = Interface {
        name: "panel",
        version: 2,
        requests: &[prism_wire::MessageDesc {
            name: "raise",
            signature: "",
            child_interface: None,
        }],
        events: &[],
    };

    fn server_with_client() -> (Display, ClientId, UnixStream) {
        let mut display = Display::create().unwrap();
        let (server_end, client_end) = UnixStream::pair().unwrap();
        let client = display.client_create(server_end.into()).unwrap();
        (display, client, client_end)
    }

    fn pump(display: &mut Display) {
        display.dispatch(Some(Duration::ZERO)).unwrap();
    }

    /// Read every complete message currently in the peer socket.
    fn read_messages(peer: &mut UnixStream) -> Vec<(MessageHeader, Vec<u8>)> {
        peer.set_nonblocking(true).unwrap();
        let mut buffered = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match peer.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => buffered.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => panic!("peer read failed: {err}"),
            }
        }
        peer.set_nonblocking(false).unwrap();

        let mut messages = Vec::new();
        let mut offset = 0;
        while buffered.len() - offset >= prism_wire::HEADER_SIZE {
            let header =
                MessageHeader::parse(buffered[offset..offset + 8].try_into().unwrap());
            assert!(buffered.len() - offset >= header.size, "truncated message");
            messages.push((
                header,
                buffered[offset + 8..offset + header.size].to_vec(),
            ));
            offset += header.size;
        }
        assert_eq!(offset, buffered.len());
        messages
    }

    fn payload_u32(payload: &[u8], index: usize) -> u32 {
        u32::from_ne_bytes(payload[index * 4..index * 4 + 4].try_into().unwrap())
    }

    #[test]
    fn connect_grants_range_then_replays_globals() {
        let mut display = Display::create().unwrap();
        let panel_name = display.add_global(&PANEL_INTERFACE, 2, None).unwrap();
        assert_eq!(panel_name, SERVER_ID_BASE);

        let (server_end, mut peer) = UnixStream::pair().unwrap();
        let client = display.client_create(server_end.into()).unwrap();
        assert_eq!(display.client_id_budget(client), Some(ID_RANGE_SIZE));
        pump(&mut display);

        let messages = read_messages(&mut peer);
        assert_eq!(messages.len(), 3);

        let (range, range_payload) = &messages[0];
        assert_eq!(range.receiver, DISPLAY_OBJECT_ID);
        assert_eq!(range.opcode, display::EVT_RANGE);
        assert_eq!(payload_u32(range_payload, 0), SERVER_ID_BASE + 1);

        let (first_global, _) = &messages[1];
        assert_eq!(first_global.opcode, display::EVT_GLOBAL);
        let (second_global, second_payload) = &messages[2];
        assert_eq!(second_global.opcode, display::EVT_GLOBAL);
        assert_eq!(payload_u32(second_payload, 0), panel_name);
    }

    #[test]
    fn sync_answers_done_then_delete_id() {
        let (mut display, client, mut peer) = server_with_client();
        pump(&mut display);
        read_messages(&mut peer); // connection preamble

        let (request, _) =
            encode_message(DISPLAY_OBJECT_ID, display::REQ_SYNC, vec![Argument::NewId(2)])
                .unwrap();
        peer.write_all(&request).unwrap();
        pump(&mut display);

        let messages = read_messages(&mut peer);
        assert_eq!(messages.len(), 2);

        let (done, done_payload) = &messages[0];
        assert_eq!(done.receiver, 2);
        assert_eq!(done.opcode, callback::EVT_DONE);
        assert!(payload_u32(done_payload, 0) > 0);

        let (delete, delete_payload) = &messages[1];
        assert_eq!(delete.receiver, DISPLAY_OBJECT_ID);
        assert_eq!(delete.opcode, display::EVT_DELETE_ID);
        assert_eq!(payload_u32(delete_payload, 0), 2);

        // The callback was registered and destroyed again.
        assert_eq!(
            display.client_id_budget(client),
            Some(ID_RANGE_SIZE - 1)
        );
    }

    #[test]
    fn unknown_receiver_reports_and_continues() {
        let (mut display, _client, mut peer) = server_with_client();
        pump(&mut display);
        read_messages(&mut peer);

        let (bad, _) = encode_message(99, 0, Vec::new()).unwrap();
        let (sync, _) =
            encode_message(DISPLAY_OBJECT_ID, display::REQ_SYNC, vec![Argument::NewId(2)])
                .unwrap();
        peer.write_all(&bad).unwrap();
        peer.write_all(&sync).unwrap();
        pump(&mut display);

        let messages = read_messages(&mut peer);
        assert_eq!(messages[0].0.opcode, display::EVT_INVALID_OBJECT);
        assert_eq!(payload_u32(&messages[0].1, 0), 99);
        // The sync after the bad message was still processed.
        assert_eq!(messages[1].0.opcode, callback::EVT_DONE);
        assert_eq!(messages[2].0.opcode, display::EVT_DELETE_ID);
    }

    #[test]
    fn out_of_range_opcode_reports_invalid_method() {
        let (mut display, _client, mut peer) = server_with_client();
        pump(&mut display);
        read_messages(&mut peer);

        let (bad, _) = encode_message(DISPLAY_OBJECT_ID, 77, Vec::new()).unwrap();
        peer.write_all(&bad).unwrap();
        pump(&mut display);

        let messages = read_messages(&mut peer);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0.opcode, display::EVT_INVALID_METHOD);
        assert_eq!(payload_u32(&messages[0].1, 0), DISPLAY_OBJECT_ID);
        assert_eq!(payload_u32(&messages[0].1, 1), 77);
    }

    #[test]
    fn bind_creates_resource_and_runs_hook() {
        let mut display = Display::create().unwrap();
        let bound = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&bound);
        let name = display
            .add_global(
                &PANEL_INTERFACE,
                2,
                Some(Rc::new(move |_display, resource| {
                    sink.borrow_mut().push(resource.id);
                })),
            )
            .unwrap();

        let (server_end, mut peer) = UnixStream::pair().unwrap();
        let client = display.client_create(server_end.into()).unwrap();
        // The hook ran once at connect, with the global's own id.
        assert_eq!(*bound.borrow(), vec![name]);
        pump(&mut display);
        read_messages(&mut peer);

        let (request, _) = encode_message(
            DISPLAY_OBJECT_ID,
            display::REQ_BIND,
            vec![
                Argument::Uint(name),
                Argument::Str(Some(CString::new("panel").unwrap())),
                Argument::Uint(1),
                Argument::NewId(3),
            ],
        )
        .unwrap();
        peer.write_all(&request).unwrap();
        pump(&mut display);

        assert_eq!(*bound.borrow(), vec![name, 3]);
        // The bound resource counts against the id budget.
        assert_eq!(
            display.client_id_budget(client),
            Some(ID_RANGE_SIZE - 1)
        );
        display
            .set_implementation(
                Resource {
                    id: 3,
                    client,
                    interface: &PANEL_INTERFACE,
                },
                vec![Rc::new(|_, _, _, _| {})],
                Rc::new(()),
            )
            .unwrap();
    }

    #[test]
    fn bind_of_unknown_global_reports_invalid_object() {
        let (mut display, _client, mut peer) = server_with_client();
        pump(&mut display);
        read_messages(&mut peer);

        let (request, _) = encode_message(
            DISPLAY_OBJECT_ID,
            display::REQ_BIND,
            vec![
                Argument::Uint(4242),
                Argument::Str(Some(CString::new("panel").unwrap())),
                Argument::Uint(1),
                Argument::NewId(3),
            ],
        )
        .unwrap();
        peer.write_all(&request).unwrap();
        pump(&mut display);

        let messages = read_messages(&mut peer);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0.opcode, display::EVT_INVALID_OBJECT);
        assert_eq!(payload_u32(&messages[0].1, 0), 4242);
    }

    #[test]
    fn budget_refills_below_the_watermark() {
        let (mut display, client, mut peer) = server_with_client();
        pump(&mut display);
        read_messages(&mut peer);

        // Registrations 1..=193 leave the budget at 63; the 194th sees
        // it below the watermark and triggers the second grant.
        for offset in 0..194u32 {
            display
                .create_resource(client, 10 + offset, &PANEL_INTERFACE)
                .unwrap();
            pump(&mut display);
        }

        assert_eq!(
            display.client_id_budget(client),
            Some(2 * ID_RANGE_SIZE - 194)
        );

        let range_events: Vec<u32> = read_messages(&mut peer)
            .into_iter()
            .filter(|(header, _)| header.opcode == display::EVT_RANGE)
            .map(|(_, payload)| payload_u32(&payload, 0))
            .collect();
        assert_eq!(range_events.len(), 1, "exactly one refill grant");
    }

    #[test]
    fn frame_callbacks_drain_on_post_frame() {
        let (mut display, client, mut peer) = server_with_client();
        pump(&mut display);
        read_messages(&mut peer);

        let (request, _) =
            encode_message(DISPLAY_OBJECT_ID, display::REQ_FRAME, vec![Argument::NewId(5)])
                .unwrap();
        peer.write_all(&request).unwrap();
        pump(&mut display);
        assert_eq!(display.frame_listener_count(), 1);
        assert!(read_messages(&mut peer).is_empty(), "no reply until a frame");

        display.post_frame(77_000).unwrap();
        pump(&mut display);
        assert_eq!(display.frame_listener_count(), 0);

        let messages = read_messages(&mut peer);
        assert_eq!(messages[0].0.receiver, 5);
        assert_eq!(messages[0].0.opcode, callback::EVT_DONE);
        assert_eq!(payload_u32(&messages[0].1, 0), 77_000);
        assert_eq!(messages[1].0.opcode, display::EVT_DELETE_ID);
        assert_eq!(payload_u32(&messages[1].1, 0), 5);

        let _ = client;
    }

    #[test]
    fn teardown_runs_destroy_hooks_in_reverse_order() {
        let (mut display, client, peer) = server_with_client();

        let order = Rc::new(RefCell::new(Vec::new()));
        for id in [10u32, 11, 12] {
            let resource = display
                .create_resource(client, id, &PANEL_INTERFACE)
                .unwrap();
            let sink = Rc::clone(&order);
            display
                .set_destroy_hook(
                    resource,
                    Rc::new(move |_display, resource| {
                        sink.borrow_mut().push(resource.id);
                    }),
                )
                .unwrap();
        }

        drop(peer);
        pump(&mut display); // observes the hangup and tears down

        assert_eq!(*order.borrow(), vec![12, 11, 10]);
        assert!(display.client_ids().is_empty());
    }

    #[test]
    fn destroy_resource_frees_id_and_acknowledges() {
        let (mut display, client, mut peer) = server_with_client();
        pump(&mut display);
        read_messages(&mut peer);

        let resource = display
            .create_resource(client, 9, &PANEL_INTERFACE)
            .unwrap();
        display.destroy_resource(resource).unwrap();
        pump(&mut display);

        let messages = read_messages(&mut peer);
        let delete = messages
            .iter()
            .find(|(header, _)| header.opcode == display::EVT_DELETE_ID)
            .expect("delete_id should be sent");
        assert_eq!(payload_u32(&delete.1, 0), 9);

        // The id can be nominated again.
        display.create_resource(client, 9, &PANEL_INTERFACE).unwrap();
    }

    #[test]
    fn implementation_attaches_exactly_once() {
        let (mut display, client, _peer) = server_with_client();
        let resource = display
            .create_resource(client, 6, &PANEL_INTERFACE)
            .unwrap();

        let handlers = || -> Vec<RequestHandler> { vec![Rc::new(|_, _, _, _| {})] };
        display
            .set_implementation(resource, handlers(), Rc::new(()))
            .unwrap();
        assert!(matches!(
            display.set_implementation(resource, handlers(), Rc::new(())),
            Err(ServerError::ImplementationExists { id: 6 })
        ));
    }

    #[test]
    fn requests_reach_attached_handlers() {
        let (mut display, client, mut peer) = server_with_client();
        pump(&mut display);
        read_messages(&mut peer);

        let resource = display
            .create_resource(client, 6, &PANEL_INTERFACE)
            .unwrap();
        let raised = Rc::new(Cell::new(0u32));
        let counter = Rc::clone(&raised);
        display
            .set_implementation(
                resource,
                vec![Rc::new(move |_display, _resource, _data, _args| {
                    counter.set(counter.get() + 1);
                })],
                Rc::new(()),
            )
            .unwrap();

        let (request, _) = encode_message(6, 0, Vec::new()).unwrap();
        peer.write_all(&request).unwrap();
        peer.write_all(&request).unwrap();
        pump(&mut display);

        assert_eq!(raised.get(), 2);
    }
}
