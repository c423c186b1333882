//! The client root.
//!
//! A [`Remote`] is one connection to the daemon. The core proxy is
//! implicit at id 0; further proxies are created by binding globals
//! or by factory methods. Events are delivered to a single
//! [`RemoteHandler`].
//!
//! Destroyed proxy ids are *zombies* until the server acknowledges
//! with `remove_id`; only then may the id be reused.

use {
    crate::{
        connection::{Connection, FdQueue, ReceiveError},
        error::ErrorCode,
        event_loop::{ERROR, EventLoop, LoopError, READABLE, SourceId},
        mem::MemPool,
        node_impl::{
            Direction, IoHandle, NodeImpl, NodeImplEvents, PROCESS_HAVE_DATA,
        },
        pod::INVALID_ID,
        props::Properties,
        protocol::{
            ProtocolError,
            client::ClientEvent,
            client_node::{
                ClientNodeEvent, ClientNodeMethod, PORT_UPDATE_INFO, PORT_UPDATE_PARAMS,
                PORT_UPDATE_POSSIBLE_FORMATS, UPDATE_MAX_INPUTS, UPDATE_MAX_OUTPUTS, UPDATE_PROPS,
            },
            core::{CoreEvent, CoreInfo, CoreMethod},
            link::{LinkEvent, LinkInfo},
            node::{NodeEvent, NodeInfo},
            registry::{RegistryEvent, RegistryMethod},
        },
        transport::{STATUS_HAVE_DATA, Transport, TransportEvent, TransportInfo},
        types::{PeerTypes, TypeMap, translate_pod},
        utils::{
            env::{DEFAULT_CORE_NAME, PIPEGRAPH_CORE, XDG_RUNTIME_DIR},
            free_list::FreeList,
        },
    },
    error_reporter::Report,
    std::{
        cell::{Cell, RefCell},
        collections::{HashMap, HashSet},
        env, io,
        os::fd::{AsFd, AsRawFd, OwnedFd},
        rc::{Rc, Weak},
        sync::Arc,
    },
    thiserror::Error,
    uapi::c,
};

#[cfg(test)]
mod tests;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("{XDG_RUNTIME_DIR} is not set")]
    XrdNotSet,
    #[error("the socket path is too long")]
    SocketPathTooLong,
    #[error("could not create a socket")]
    CreateSocket(#[source] io::Error),
    #[error("could not connect to {0}")]
    Connect(String, #[source] io::Error),
    #[error(transparent)]
    EventLoop(LoopError),
    #[error("the connection is dead")]
    Dead,
}

/// Events delivered by a [`Remote`].
pub trait RemoteHandler: 'static {
    fn core_info(&mut self, info: &CoreInfo) {
        let _ = info;
    }

    /// A `sync` barrier completed.
    fn done(&mut self, seq: u32) {
        let _ = seq;
    }

    /// The server surfaced an error on a proxy.
    fn error(&mut self, id: u32, res: i32, message: &str) {
        let _ = (id, res, message);
    }

    fn global(&mut self, registry_id: u32, id: u32, type_name: &str, version: u32) {
        let _ = (registry_id, id, type_name, version);
    }

    fn global_remove(&mut self, registry_id: u32, id: u32) {
        let _ = (registry_id, id);
    }

    fn node_info(&mut self, proxy_id: u32, info: &NodeInfo) {
        let _ = (proxy_id, info);
    }

    fn client_info(&mut self, proxy_id: u32, info: &crate::protocol::client::ClientInfo) {
        let _ = (proxy_id, info);
    }

    fn link_info(&mut self, proxy_id: u32, info: &LinkInfo) {
        let _ = (proxy_id, info);
    }

    /// A destroyed id was acknowledged and may be reused.
    fn removed_id(&mut self, id: u32) {
        let _ = id;
    }
}

enum ProxyKind {
    Registry,
    /// A binding to the core global; receives core info events.
    CoreBound,
    /// A binding to a client global; receives client info events.
    ClientBound,
    Node,
    Link,
    ClientNode(Rc<RemoteClientNode>),
    /// A binding whose interface has no events (factories).
    Passive,
}

pub struct Remote {
    weak: Weak<Remote>,
    event_loop: Rc<EventLoop>,
    connection: Connection,
    source: Cell<Option<SourceId>>,
    types: RefCell<TypeMap>,
    peer_types: RefCell<PeerTypes>,
    types_sent: Cell<u32>,
    proxies: RefCell<HashMap<u32, ProxyKind>>,
    ids: FreeList,
    zombies: RefCell<HashSet<u32>>,
    /// Blocks announced by the server with `add_mem`.
    pub(crate) pool: MemPool,
    handler: RefCell<Option<Box<dyn RemoteHandler>>>,
    info: RefCell<Option<CoreInfo>>,
    dead: Cell<bool>,
}

impl Remote {
    /// Connects to the daemon's well-known socket.
    pub fn connect(event_loop: &Rc<EventLoop>) -> Result<Rc<Remote>, RemoteError> {
        let name = env::var(PIPEGRAPH_CORE).unwrap_or_else(|_| DEFAULT_CORE_NAME.to_string());
        let xrd = env::var(XDG_RUNTIME_DIR).map_err(|_| RemoteError::XrdNotSet)?;
        let path = format!("{xrd}/{name}");
        let socket = uapi::socket(
            c::AF_UNIX,
            c::SOCK_STREAM | c::SOCK_CLOEXEC | c::SOCK_NONBLOCK,
            0,
        )
        .map_err(|e| RemoteError::CreateSocket(e.into()))?;
        let mut addr: c::sockaddr_un = uapi::pod_zeroed();
        addr.sun_family = c::AF_UNIX as _;
        if path.len() + 1 > addr.sun_path.len() {
            return Err(RemoteError::SocketPathTooLong);
        }
        let sun_path = uapi::as_bytes_mut(&mut addr.sun_path[..]);
        sun_path[..path.len()].copy_from_slice(path.as_bytes());
        sun_path[path.len()] = 0;
        uapi::connect(socket.raw(), &addr)
            .map_err(|e| RemoteError::Connect(path, io::Error::from(e)))?;
        Self::connect_fd(event_loop, socket.into())
    }

    /// Wraps an already-connected socket, e.g. one end of a
    /// socketpair.
    pub fn connect_fd(
        event_loop: &Rc<EventLoop>,
        socket: OwnedFd,
    ) -> Result<Rc<Remote>, RemoteError> {
        let remote = Rc::new_cyclic(|weak| Remote {
            weak: weak.clone(),
            event_loop: event_loop.clone(),
            connection: Connection::new(Rc::new(socket)),
            source: Cell::new(None),
            types: RefCell::new(TypeMap::new()),
            peer_types: RefCell::new(PeerTypes::new()),
            types_sent: Cell::new(crate::types::first_dynamic_id()),
            proxies: RefCell::new(HashMap::new()),
            ids: FreeList::starting_at(1),
            zombies: RefCell::new(HashSet::new()),
            pool: MemPool::new(),
            handler: RefCell::new(None),
            info: RefCell::new(None),
            dead: Cell::new(false),
        });
        {
            let weak = remote.weak.clone();
            let source = event_loop
                .add_fd(
                    remote.connection.socket().as_fd(),
                    READABLE,
                    Rc::new(move |events| {
                        let Some(remote) = weak.upgrade() else {
                            return;
                        };
                        if events & ERROR != 0 {
                            remote.mark_dead();
                            return;
                        }
                        remote.dispatch();
                    }),
                )
                .map_err(RemoteError::EventLoop)?;
            remote.source.set(Some(source));
        }
        {
            let weak = remote.weak.clone();
            event_loop.add_before_iterate(Rc::new(move || {
                if let Some(remote) = weak.upgrade() {
                    remote.flush();
                }
            }));
        }
        Ok(remote)
    }

    pub fn set_handler(&self, handler: impl RemoteHandler) {
        *self.handler.borrow_mut() = Some(Box::new(handler));
    }

    pub fn is_dead(&self) -> bool {
        self.dead.get()
    }

    /// The last received core info.
    pub fn core_info(&self) -> Option<CoreInfo> {
        self.info.borrow().clone()
    }

    fn mark_dead(&self) {
        if self.dead.replace(true) {
            return;
        }
        self.connection.mark_dead();
        if let Some(source) = self.source.take() {
            self.event_loop.remove(source);
        }
    }

    pub fn flush(&self) {
        if self.dead.get() || !self.connection.needs_flush() {
            return;
        }
        if let Err(e) = self.connection.flush() {
            log::warn!("could not flush the connection: {}", Report::new(e));
            self.mark_dead();
        }
    }

    fn with_handler(&self, f: impl FnOnce(&mut dyn RemoteHandler)) {
        if let Some(handler) = &mut *self.handler.borrow_mut() {
            f(&mut **handler);
        }
    }

    /// Announces own type ids the server has not seen yet.
    fn sync_types(&self) {
        let types = self.types.borrow();
        let first_id = self.types_sent.get();
        let names = types.names_from(first_id);
        if names.is_empty() {
            return;
        }
        let method = CoreMethod::UpdateTypes {
            first_id,
            types: names.to_vec(),
        };
        drop(types);
        self.types_sent.set(self.types.borrow().next_id());
        self.send_raw(0, method.opcode(), &method.marshal());
    }

    fn send_raw(&self, dest_id: u32, opcode: u8, payload: &[u8]) {
        if self.dead.get() {
            return;
        }
        if let Err(e) = self.connection.send(dest_id, opcode, payload, &[]) {
            log::warn!("could not queue a message: {}", Report::new(e));
            self.mark_dead();
        }
    }

    fn send_message(&self, dest_id: u32, opcode: u8, payload: &[u8]) {
        self.sync_types();
        self.send_raw(dest_id, opcode, payload);
    }

    fn send_core(&self, method: &CoreMethod) {
        self.send_message(0, method.opcode(), &method.marshal());
    }

    fn alloc_proxy(&self, kind: ProxyKind) -> u32 {
        let mut id = self.ids.acquire();
        while self.zombies.borrow().contains(&id) || self.proxies.borrow().contains_key(&id) {
            id = self.ids.acquire();
        }
        self.proxies.borrow_mut().insert(id, kind);
        id
    }
}

/// Core methods.
impl Remote {
    /// Schedules a `done(seq)` barrier after all outstanding work.
    pub fn sync(&self, seq: u32) {
        self.send_core(&CoreMethod::Sync { seq });
    }

    /// Asks for a registry and returns its proxy id.
    pub fn get_registry(&self) -> u32 {
        let new_id = self.alloc_proxy(ProxyKind::Registry);
        self.send_core(&CoreMethod::GetRegistry { new_id });
        new_id
    }

    /// Replaces/merges this client's properties on the server.
    pub fn client_update(&self, props: Properties) {
        self.send_core(&CoreMethod::ClientUpdate { props });
    }

    /// Binds a global seen on `registry_id`, returning the proxy id.
    pub fn bind(&self, registry_id: u32, global_id: u32, type_name: &str, version: u32) -> u32 {
        let kind = match type_name {
            crate::global::TYPE_NODE => ProxyKind::Node,
            crate::global::TYPE_LINK => ProxyKind::Link,
            crate::global::TYPE_CORE => ProxyKind::CoreBound,
            crate::global::TYPE_CLIENT => ProxyKind::ClientBound,
            _ => ProxyKind::Passive,
        };
        let new_id = self.alloc_proxy(kind);
        let method = RegistryMethod::Bind {
            id: global_id,
            version,
            new_id,
        };
        self.send_message(registry_id, method.opcode(), &method.marshal());
        new_id
    }

    /// Creates a link between two node globals and returns the link
    /// proxy id.
    pub fn create_link(
        &self,
        output_node: u32,
        output_port: u32,
        input_node: u32,
        input_port: u32,
        filter: Option<Vec<u8>>,
        props: Properties,
    ) -> u32 {
        let new_id = self.alloc_proxy(ProxyKind::Link);
        self.send_core(&CoreMethod::CreateLink {
            output_node,
            output_port,
            input_node,
            input_port,
            filter,
            props,
            new_id,
        });
        new_id
    }

    /// Destroys a proxy. The id stays reserved until the server
    /// acknowledges with `remove_id`.
    pub fn destroy(&self, id: u32) {
        if self.proxies.borrow().contains_key(&id) {
            self.zombies.borrow_mut().insert(id);
            self.send_core(&CoreMethod::Destroy { id });
        }
    }

    /// Publishes a node whose processing runs in this client.
    pub fn create_client_node(
        &self,
        name: &str,
        props: Properties,
        implementation: Rc<dyn NodeImpl>,
    ) -> Rc<RemoteClientNode> {
        let node = Rc::new(RemoteClientNode {
            remote: self.weak.clone(),
            proxy_id: Cell::new(INVALID_ID),
            implementation,
            transport: RefCell::new(None),
            transport_source: Cell::new(None),
        });
        let new_id = self.alloc_proxy(ProxyKind::ClientNode(node.clone()));
        node.proxy_id.set(new_id);
        self.send_core(&CoreMethod::CreateNode {
            factory: "client-node".to_string(),
            name: name.to_string(),
            props,
            new_id,
        });
        node.implementation.set_events(Rc::new(ClientEventsBridge {
            node: Rc::downgrade(&node),
        }));
        node.send_full_update();
        node
    }
}

/// Event dispatch.
impl Remote {
    fn dispatch(self: &Rc<Self>) {
        let res = self.connection.receive(|dest_id, opcode, payload, fds| {
            self.dispatch_event(dest_id, opcode, payload, fds)
        });
        match res {
            Ok(()) => {}
            Err(ReceiveError::Transport(e)) => {
                log::debug!("server connection failed: {}", Report::new(e));
                self.mark_dead();
            }
            Err(ReceiveError::Dispatch(e)) => {
                log::error!("could not dispatch a server event: {}", Report::new(e));
                self.mark_dead();
            }
        }
        self.flush();
    }

    fn dispatch_event(
        self: &Rc<Self>,
        dest_id: u32,
        opcode: u8,
        payload: &[u8],
        fds: &FdQueue,
    ) -> Result<(), DispatchError> {
        let payload = {
            let peer = self.peer_types.borrow();
            translate_pod(payload, &|id| peer.translate(id)).map_err(DispatchError::Types)?
        };
        if dest_id == 0 {
            let event =
                CoreEvent::demarshal(opcode, &payload, fds).map_err(DispatchError::Protocol)?;
            self.handle_core_event(event);
            return Ok(());
        }
        enum Kind {
            Registry,
            CoreBound,
            ClientBound,
            Node,
            Link,
            ClientNode(Rc<RemoteClientNode>),
            Passive,
        }
        let kind = {
            let proxies = self.proxies.borrow();
            match proxies.get(&dest_id) {
                Some(ProxyKind::Registry) => Kind::Registry,
                Some(ProxyKind::CoreBound) => Kind::CoreBound,
                Some(ProxyKind::ClientBound) => Kind::ClientBound,
                Some(ProxyKind::Node) => Kind::Node,
                Some(ProxyKind::Link) => Kind::Link,
                Some(ProxyKind::ClientNode(n)) => Kind::ClientNode(n.clone()),
                Some(ProxyKind::Passive) => Kind::Passive,
                None => {
                    // Events may still be in flight for an id we
                    // destroyed.
                    if self.zombies.borrow().contains(&dest_id) {
                        return Ok(());
                    }
                    return Err(DispatchError::NoReceiver(dest_id));
                }
            }
        };
        match kind {
            Kind::Registry => {
                let event =
                    RegistryEvent::demarshal(opcode, &payload).map_err(DispatchError::Protocol)?;
                match event {
                    RegistryEvent::Global {
                        id,
                        type_name,
                        version,
                    } => self.with_handler(|h| h.global(dest_id, id, &type_name, version)),
                    RegistryEvent::GlobalRemove { id } => {
                        self.with_handler(|h| h.global_remove(dest_id, id));
                    }
                }
            }
            Kind::CoreBound => {
                let event =
                    CoreEvent::demarshal(opcode, &payload, fds).map_err(DispatchError::Protocol)?;
                if let CoreEvent::Info(info) = event {
                    self.with_handler(|h| h.core_info(&info));
                }
            }
            Kind::ClientBound => {
                let ClientEvent::Info(info) =
                    ClientEvent::demarshal(opcode, &payload).map_err(DispatchError::Protocol)?;
                self.with_handler(|h| h.client_info(dest_id, &info));
            }
            Kind::Passive => {}
            Kind::Node => {
                let NodeEvent::Info(info) =
                    NodeEvent::demarshal(opcode, &payload).map_err(DispatchError::Protocol)?;
                self.with_handler(|h| h.node_info(dest_id, &info));
            }
            Kind::Link => {
                let LinkEvent::Info(info) =
                    LinkEvent::demarshal(opcode, &payload).map_err(DispatchError::Protocol)?;
                self.with_handler(|h| h.link_info(dest_id, &info));
            }
            Kind::ClientNode(node) => {
                let event = ClientNodeEvent::demarshal(opcode, &payload, fds, &self.pool)
                    .map_err(DispatchError::Protocol)?;
                node.handle_event(self, event);
            }
        }
        Ok(())
    }

    fn handle_core_event(self: &Rc<Self>, event: CoreEvent) {
        match event {
            CoreEvent::UpdateTypes { first_id, types } => {
                let mut own = self.types.borrow_mut();
                let res = self
                    .peer_types
                    .borrow_mut()
                    .update(first_id, &types, &mut own);
                if let Err(e) = res {
                    log::error!("invalid type update from the server: {}", Report::new(e));
                    drop(own);
                    self.mark_dead();
                }
            }
            CoreEvent::Done { seq } => self.with_handler(|h| h.done(seq)),
            CoreEvent::Error { id, res, message } => {
                log::debug!("server error on object {id}: {message}");
                self.with_handler(|h| h.error(id, res, &message));
            }
            CoreEvent::RemoveId { id } => {
                self.proxies.borrow_mut().remove(&id);
                if self.zombies.borrow_mut().remove(&id) {
                    self.ids.release(id);
                }
                self.with_handler(|h| h.removed_id(id));
            }
            CoreEvent::Info(info) => {
                *self.info.borrow_mut() = Some(info.clone());
                self.with_handler(|h| h.core_info(&info));
            }
            CoreEvent::AddMem {
                mem_id,
                mem_type,
                fd,
                flags,
                offset,
                size,
            } => {
                self.pool.wrap_with_id(
                    mem_id,
                    mem_type,
                    fd,
                    flags,
                    offset as usize,
                    size as usize,
                );
            }
            CoreEvent::RemoveMem { mem_id } => {
                self.pool.remove(mem_id);
            }
        }
    }
}

#[derive(Debug, Error)]
enum DispatchError {
    #[error("event for the unknown proxy {0}")]
    NoReceiver(u32),
    #[error(transparent)]
    Protocol(ProtocolError),
    #[error("could not translate type ids: {0}")]
    Types(crate::types::TypeError),
}

/// The client side of a published client node: serves the node
/// interface locally and runs the data plane against the mapped
/// transport.
pub struct RemoteClientNode {
    remote: Weak<Remote>,
    proxy_id: Cell<u32>,
    implementation: Rc<dyn NodeImpl>,
    transport: RefCell<Option<Arc<Transport>>>,
    transport_source: Cell<Option<SourceId>>,
}

struct ClientEventsBridge {
    node: Weak<RemoteClientNode>,
}

impl NodeImplEvents for ClientEventsBridge {
    fn have_output(&self) {
        if let Some(node) = self.node.upgrade() {
            node.flush_outputs();
        }
    }
}

impl RemoteClientNode {
    pub fn proxy_id(&self) -> u32 {
        self.proxy_id.get()
    }

    pub fn implementation(&self) -> &Rc<dyn NodeImpl> {
        &self.implementation
    }

    /// Asks the server to destroy this node. The proxy id is
    /// reserved until `remove_id` arrives.
    pub fn destroy(&self) {
        let Some(remote) = self.remote.upgrade() else {
            return;
        };
        let method = ClientNodeMethod::Destroy;
        remote
            .zombies
            .borrow_mut()
            .insert(self.proxy_id.get());
        remote.send_message(self.proxy_id.get(), method.opcode(), &method.marshal());
    }

    /// Declares the node's ports and properties to the server.
    fn send_full_update(&self) {
        let Some(remote) = self.remote.upgrade() else {
            return;
        };
        let counts = self.implementation.get_n_ports();
        let update = ClientNodeMethod::Update {
            change_mask: UPDATE_MAX_INPUTS | UPDATE_MAX_OUTPUTS | UPDATE_PROPS,
            max_inputs: counts.max_inputs,
            max_outputs: counts.max_outputs,
            props: Properties::new(),
        };
        remote.send_message(self.proxy_id.get(), update.opcode(), &update.marshal());
        for direction in [Direction::Input, Direction::Output] {
            for port_id in self.implementation.get_port_ids(direction) {
                self.send_port_update(&remote, direction, port_id);
            }
        }
    }

    fn send_port_update(&self, remote: &Remote, direction: Direction, port_id: u32) {
        let mut possible_formats = Vec::new();
        let mut index = 0;
        while let Ok(Some(format)) =
            self.implementation
                .port_enum_formats(direction, port_id, index, None)
        {
            possible_formats.push(format);
            index += 1;
        }
        let mut params = Vec::new();
        for param_id in [
            crate::types::PARAM_BUFFERS,
            crate::types::PARAM_META_ENABLE,
            crate::types::PARAM_VIDEO_PADDING,
        ] {
            let mut index = 0;
            while let Ok(Some(param)) =
                self.implementation
                    .port_enum_params(direction, port_id, param_id, index, None)
            {
                params.push(param);
                index += 1;
            }
        }
        let info = self.implementation.port_get_info(direction, port_id).ok();
        let update = ClientNodeMethod::PortUpdate {
            direction,
            port_id,
            change_mask: PORT_UPDATE_POSSIBLE_FORMATS | PORT_UPDATE_PARAMS | PORT_UPDATE_INFO,
            possible_formats,
            format: None,
            params,
            info,
        };
        remote.send_message(self.proxy_id.get(), update.opcode(), &update.marshal());
    }

    fn done(&self, remote: &Remote, seq: u32, res: i32) {
        let method = ClientNodeMethod::Done { seq, res };
        remote.send_message(self.proxy_id.get(), method.opcode(), &method.marshal());
    }

    fn handle_event(self: &Rc<Self>, remote: &Rc<Remote>, event: ClientNodeEvent) {
        match event {
            ClientNodeEvent::AddPort {
                seq,
                direction,
                port_id,
            } => {
                let res = self.implementation.add_port(direction, port_id);
                self.done(remote, seq, result_code(res.map(|_| ())));
            }
            ClientNodeEvent::RemovePort {
                seq,
                direction,
                port_id,
            } => {
                let res = self.implementation.remove_port(direction, port_id);
                self.done(remote, seq, result_code(res.map(|_| ())));
            }
            ClientNodeEvent::SetFormat {
                seq,
                direction,
                port_id,
                flags,
                format,
            } => {
                let res = self.implementation.port_set_format(
                    direction,
                    port_id,
                    flags,
                    format.as_deref(),
                );
                self.done(remote, seq, result_code(res.map(|_| ())));
            }
            ClientNodeEvent::SetParam {
                seq,
                direction,
                port_id,
                param,
            } => {
                let res = self
                    .implementation
                    .port_set_param(direction, port_id, &param);
                self.done(remote, seq, result_code(res.map(|_| ())));
            }
            ClientNodeEvent::UseBuffers {
                seq,
                direction,
                port_id,
                buffers,
            } => {
                let res = self
                    .implementation
                    .port_use_buffers(direction, port_id, buffers);
                self.done(remote, seq, result_code(res.map(|_| ())));
            }
            ClientNodeEvent::NodeCommand { seq, command } => {
                let res = self.implementation.send_command(&command);
                self.done(remote, seq, result_code(res.map(|_| ())));
            }
            ClientNodeEvent::PortCommand {
                direction,
                port_id,
                command,
            } => {
                log::debug!(
                    "port command {command:?} on {direction}:{port_id}"
                );
            }
            ClientNodeEvent::Transport {
                read_fd,
                write_fd,
                mem_fd,
                offset,
                size,
            } => {
                if let Err(e) = self.setup_transport(remote, read_fd, write_fd, mem_fd, offset, size)
                {
                    log::error!("could not map the transport: {}", Report::new(e));
                }
            }
        }
    }

    fn setup_transport(
        self: &Rc<Self>,
        remote: &Rc<Remote>,
        read_fd: Rc<OwnedFd>,
        write_fd: Rc<OwnedFd>,
        mem_fd: Rc<OwnedFd>,
        offset: u32,
        size: u32,
    ) -> Result<(), io::Error> {
        let info = TransportInfo {
            mem_fd: Arc::new(mem_fd.try_clone()?),
            offset,
            size,
            read_fd: Arc::new(read_fd.try_clone()?),
            write_fd: Arc::new(write_fd.try_clone()?),
        };
        let counts = self.implementation.get_n_ports();
        let transport = Transport::from_info(&info, counts.max_inputs, counts.max_outputs)
            .map_err(io::Error::other)?;
        // Wire the shared slots into the local implementation.
        for direction in [Direction::Input, Direction::Output] {
            for port_id in self.implementation.get_port_ids(direction) {
                let _ = self.implementation.port_set_io(
                    direction,
                    port_id,
                    Some(IoHandle::Area {
                        transport: transport.clone(),
                        direction,
                        index: port_id,
                    }),
                );
            }
        }
        if let Some(source) = self.transport_source.take() {
            remote.event_loop.remove(source);
        }
        *self.transport.borrow_mut() = Some(transport.clone());
        let weak = Rc::downgrade(self);
        let source = remote
            .event_loop
            .add_fd(
                transport.wait_fd().as_fd(),
                READABLE,
                Rc::new(move |_| {
                    if let Some(node) = weak.upgrade() {
                        node.service_transport();
                    }
                }),
            )
            .map_err(io::Error::other)?;
        self.transport_source.set(Some(source));
        Ok(())
    }

    /// Drains the event ring and runs the local node.
    fn service_transport(self: &Rc<Self>) {
        let Some(transport) = self.transport.borrow().clone() else {
            return;
        };
        transport.consume_signal();
        let mut signal = false;
        loop {
            let event = match transport.next_event() {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(e) => {
                    log::error!("transport failure: {}", Report::new(e));
                    break;
                }
            };
            match event {
                TransportEvent::NeedInput { port_id } => {
                    // The server pulls: produce into the output slot.
                    match self.implementation.process_output() {
                        Ok(status) => {
                            if status & PROCESS_HAVE_DATA != 0
                                || transport
                                    .output_io(port_id)
                                    .map(|io| io.status() == STATUS_HAVE_DATA)
                                    .unwrap_or(false)
                            {
                                let _ = transport
                                    .send_event(TransportEvent::HaveOutput { port_id });
                                signal = true;
                            }
                        }
                        Err(e) => log::debug!("process_output failed: {e}"),
                    }
                }
                TransportEvent::HaveOutput { port_id } => {
                    // The server pushed data into the input slot.
                    match self.implementation.process_input() {
                        Ok(_) => {
                            let _ = transport.send_event(TransportEvent::NeedInput { port_id });
                            signal = true;
                        }
                        Err(e) => log::debug!("process_input failed: {e}"),
                    }
                }
                TransportEvent::ReuseBuffer { port_id, buffer_id } => {
                    let _ = self.implementation.port_reuse_buffer(port_id, buffer_id);
                }
            }
        }
        if signal {
            transport.signal();
        }
    }

    /// Pushes `have-output` for every output slot holding data; used
    /// when the implementation produces spontaneously.
    fn flush_outputs(&self) {
        let Some(transport) = self.transport.borrow().clone() else {
            return;
        };
        let mut signal = false;
        for port_id in self.implementation.get_port_ids(Direction::Output) {
            if let Ok(io) = transport.output_io(port_id)
                && io.status() == STATUS_HAVE_DATA
                && io.buffer_id() != INVALID_ID
                && transport
                    .send_event(TransportEvent::HaveOutput { port_id })
                    .is_ok()
            {
                signal = true;
            }
        }
        if signal {
            transport.signal();
        }
    }
}

fn result_code(res: Result<(), ErrorCode>) -> i32 {
    match res {
        Ok(()) => 0,
        Err(code) => code.to_raw(),
    }
}

#[cfg(test)]
impl Remote {
    /// Sends an empty-payload message with an arbitrary opcode.
    pub(crate) fn send_raw_opcode(&self, dest_id: u32, opcode: u8) {
        let mut b = crate::pod::PodBuilder::new();
        b.push_struct(|_| {});
        self.send_raw(dest_id, opcode, b.as_slice());
    }

    /// Sends a core method without any client-side bookkeeping.
    pub(crate) fn send_core_method(&self, method: &CoreMethod) {
        self.send_raw(0, method.opcode(), &method.marshal());
    }
}
