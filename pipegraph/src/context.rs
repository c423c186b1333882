//! The daemon root.
//!
//! The context owns the listening socket, the connected clients, the
//! table of globals, the factories, the shared memory pool, the work
//! queue and both loops. All control-plane dispatch happens here on
//! the main loop; the data loop only drains transport rings and
//! forwards their events back via an eventfd.

use {
    crate::{
        client::Client,
        client_node::ClientNode,
        connection::ReceiveError,
        error::ErrorCode,
        event_loop::{DataLoop, ERROR, EventLoop, LoopError, READABLE, SourceId},
        global::{
            Global, GlobalObject, PERM_READ, TYPE_CLIENT, TYPE_CORE, TYPE_FACTORY, TYPE_LINK,
            TYPE_NODE,
        },
        link::Link,
        mem::MemPool,
        node::{Node, NodeState},
        node_impl::{Direction, IoHandle, NodeImpl},
        pod::INVALID_ID,
        port::Port,
        props::Properties,
        protocol::{
            ProtocolError,
            client::{CLIENT_CHANGE_ALL, ClientEvent, ClientInfo},
            client_node::ClientNodeMethod,
            core::{CORE_CHANGE_ALL, CoreEvent, CoreInfo, CoreMethod},
            link::{LINK_CHANGE_ALL, LinkEvent},
            node::{NODE_CHANGE_ALL, NodeEvent},
            registry::{RegistryEvent, RegistryMethod},
        },
        resource::{Resource, ResourceKind},
        transport::{STATUS_HAVE_DATA, STATUS_NEED_DATA, Transport, TransportEvent, TransportError},
        types::TypeMap,
        utils::env::{DEFAULT_CORE_NAME, PIPEGRAPH_CORE, XDG_RUNTIME_DIR},
        work_queue::WorkQueue,
    },
    error_reporter::Report,
    parking_lot::Mutex,
    std::{
        cell::{Cell, RefCell},
        collections::{BTreeMap, HashMap},
        env, io,
        os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd},
        rc::{Rc, Weak},
        sync::Arc,
    },
    thiserror::Error,
    uapi::{Errno, c},
};

#[cfg(test)]
mod tests;

/// The interface version the daemon publishes for its globals.
pub const GLOBAL_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    EventLoop(LoopError),
    #[error("could not create an eventfd")]
    CreateEventfd(#[source] io::Error),
    #[error("{XDG_RUNTIME_DIR} is not set")]
    XrdNotSet,
    #[error("the socket path is too long")]
    SocketPathTooLong,
    #[error("could not create a socket")]
    CreateSocket(#[source] io::Error),
    #[error("could not open the lock file")]
    OpenLockFile(#[source] io::Error),
    #[error("another daemon owns the socket lock")]
    LockLockFile(#[source] io::Error),
    #[error("could not stat the existing socket")]
    SocketStat(#[source] io::Error),
    #[error("could not bind the socket")]
    Bind(#[source] io::Error),
    #[error("could not listen on the socket")]
    Listen(#[source] io::Error),
}

/// Instantiates an object requested through `create_node`.
pub type Factory =
    Rc<dyn Fn(&Rc<Context>, &Rc<Client>, &str, Properties, u32) -> Result<(), ErrorCode>>;

enum DataMsg {
    Event(TransportEvent),
    Violation(u32),
}

struct DataPending {
    msgs: Mutex<Vec<(u64, DataMsg)>>,
    notify: Arc<OwnedFd>,
}

impl DataPending {
    fn push(&self, entity: u64, msg: DataMsg) {
        self.msgs.lock().push((entity, msg));
    }

    fn notify(&self) {
        let one = 1u64.to_ne_bytes();
        let _ = uapi::write(self.notify.as_raw_fd(), &one);
    }
}

struct Listener {
    path: String,
    lock_path: String,
    _lock: OwnedFd,
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = uapi::unlink(&*self.path);
        let _ = uapi::unlink(&*self.lock_path);
    }
}

/// A protocol violation that closes the offending client.
#[derive(Debug, Error)]
enum Violation {
    #[error("message for the unknown object {0}")]
    NoReceiver(u32),
    #[error("malformed message: {0}")]
    Malformed(ProtocolError),
    #[error("could not translate type ids: {0}")]
    Types(crate::types::TypeError),
    #[error("the resource id {0} is already in use")]
    IdInUse(u32),
}

pub struct Context {
    weak: Weak<Context>,
    main_loop: Rc<EventLoop>,
    data_loop: DataLoop,
    data_pending: Arc<DataPending>,
    data_sources: Arc<Mutex<HashMap<u64, SourceId>>>,
    pub(crate) types: RefCell<TypeMap>,
    pub(crate) pool: MemPool,
    pub(crate) work: WorkQueue,
    properties: RefCell<Properties>,
    core_base: CoreInfo,
    globals: RefCell<BTreeMap<u32, Rc<Global>>>,
    next_global_id: Cell<u32>,
    generation: Cell<u64>,
    clients: RefCell<Vec<Rc<Client>>>,
    factories: RefCell<BTreeMap<String, Factory>>,
    nodes: RefCell<Vec<Rc<Node>>>,
    links: RefCell<Vec<Rc<Link>>>,
    /// Client nodes by graph entity, for transport routing.
    client_nodes: RefCell<HashMap<u64, Weak<Node>>>,
    next_entity: Cell<u64>,
    listener: RefCell<Option<Listener>>,
}

impl Context {
    pub fn new(main_loop: &Rc<EventLoop>, properties: Properties) -> Result<Rc<Context>, ContextError> {
        let data_loop = DataLoop::spawn("pipegraph-data").map_err(ContextError::EventLoop)?;
        let notify = eventfd().map_err(ContextError::CreateEventfd)?;
        let data_pending = Arc::new(DataPending {
            msgs: Mutex::new(Vec::new()),
            notify: Arc::new(notify),
        });
        let core_base = CoreInfo {
            change_mask: 0,
            user_name: env::var("USER").unwrap_or_default(),
            host_name: host_name(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            name: properties
                .get("core.name")
                .unwrap_or(DEFAULT_CORE_NAME)
                .to_string(),
            // SAFETY: getpid cannot fail.
            cookie: unsafe { c::getpid() } as u32,
            generation: 0,
            props: Properties::new(),
        };
        let context = Rc::new_cyclic(|weak| Context {
            weak: weak.clone(),
            main_loop: main_loop.clone(),
            data_loop,
            data_pending,
            data_sources: Arc::new(Mutex::new(HashMap::new())),
            types: RefCell::new(TypeMap::new()),
            pool: MemPool::new(),
            work: WorkQueue::new(),
            properties: RefCell::new(properties),
            core_base,
            globals: RefCell::new(BTreeMap::new()),
            next_global_id: Cell::new(0),
            generation: Cell::new(0),
            clients: RefCell::new(Vec::new()),
            factories: RefCell::new(BTreeMap::new()),
            nodes: RefCell::new(Vec::new()),
            links: RefCell::new(Vec::new()),
            client_nodes: RefCell::new(HashMap::new()),
            next_entity: Cell::new(1),
            listener: RefCell::new(None),
        });
        context.register_global(GlobalObject::Core, TYPE_CORE, Properties::new());
        context.add_factory("client-node", Rc::new(client_node_factory));
        {
            let weak = context.weak.clone();
            main_loop
                .add_fd(
                    context.data_pending.notify.as_fd(),
                    READABLE,
                    Rc::new(move |_| {
                        if let Some(context) = weak.upgrade() {
                            context.drain_data_events();
                        }
                    }),
                )
                .map_err(ContextError::EventLoop)?;
        }
        {
            let weak = context.weak.clone();
            main_loop.add_before_iterate(Rc::new(move || {
                if let Some(context) = weak.upgrade() {
                    context.flush_clients();
                }
            }));
        }
        Ok(context)
    }

    pub fn main_loop(&self) -> &Rc<EventLoop> {
        &self.main_loop
    }

    pub(crate) fn alloc_entity(&self) -> u64 {
        let id = self.next_entity.get();
        self.next_entity.set(id + 1);
        id
    }

    pub fn properties(&self) -> Properties {
        self.properties.borrow().clone()
    }

    fn core_info(&self) -> CoreInfo {
        let mut info = self.core_base.clone();
        info.change_mask = CORE_CHANGE_ALL;
        info.generation = self.generation.get();
        info.props = self.properties.borrow().clone();
        info
    }

    fn flush_clients(&self) {
        let clients = self.clients.borrow().clone();
        for client in clients {
            if client.is_destroyed() || !client.connection.needs_flush() {
                continue;
            }
            if let Err(e) = client.connection.flush() {
                log::warn!("could not flush a client: {}", Report::new(e));
                self.defer_kill_client(&client);
            }
        }
    }
}

/// Socket management.
impl Context {
    /// Binds the well-known socket and starts accepting clients. The
    /// name defaults to `PIPEGRAPH_CORE` or `pipegraph-0`.
    pub fn listen(self: &Rc<Self>, name: Option<&str>) -> Result<String, ContextError> {
        let name = match name {
            Some(n) => n.to_string(),
            None => env::var(PIPEGRAPH_CORE).unwrap_or_else(|_| DEFAULT_CORE_NAME.to_string()),
        };
        let xrd = env::var(XDG_RUNTIME_DIR).map_err(|_| ContextError::XrdNotSet)?;
        let path = format!("{xrd}/{name}");
        let lock_path = format!("{path}.lock");
        let lock = uapi::open(&*lock_path, c::O_CREAT | c::O_CLOEXEC | c::O_RDWR, 0o644)
            .map_err(|e| ContextError::OpenLockFile(e.into()))?;
        uapi::flock(lock.raw(), c::LOCK_EX | c::LOCK_NB)
            .map_err(|e| ContextError::LockLockFile(e.into()))?;
        match uapi::lstat(&*path) {
            Ok(stat) => {
                // A leftover socket from a dead daemon; the lock
                // protects us from a live one.
                if stat.st_mode & c::S_IFMT == c::S_IFSOCK {
                    let _ = uapi::unlink(&*path);
                }
            }
            Err(Errno(c::ENOENT)) => {}
            Err(e) => return Err(ContextError::SocketStat(e.into())),
        }
        let socket = uapi::socket(
            c::AF_UNIX,
            c::SOCK_STREAM | c::SOCK_CLOEXEC | c::SOCK_NONBLOCK,
            0,
        )
        .map_err(|e| ContextError::CreateSocket(e.into()))?;
        let mut addr: c::sockaddr_un = uapi::pod_zeroed();
        addr.sun_family = c::AF_UNIX as _;
        if path.len() + 1 > addr.sun_path.len() {
            return Err(ContextError::SocketPathTooLong);
        }
        let sun_path = uapi::as_bytes_mut(&mut addr.sun_path[..]);
        sun_path[..path.len()].copy_from_slice(path.as_bytes());
        sun_path[path.len()] = 0;
        uapi::bind(socket.raw(), &addr).map_err(|e| ContextError::Bind(e.into()))?;
        uapi::listen(socket.raw(), 128).map_err(|e| ContextError::Listen(e.into()))?;
        let socket: Rc<OwnedFd> = Rc::new(socket.into());
        {
            let weak = self.weak.clone();
            let accept_socket = socket.clone();
            self.main_loop
                .add_fd(
                    socket.as_fd(),
                    READABLE,
                    Rc::new(move |_| {
                        let Some(context) = weak.upgrade() else {
                            return;
                        };
                        context.accept_clients(&accept_socket);
                    }),
                )
                .map_err(ContextError::EventLoop)?;
        }
        *self.listener.borrow_mut() = Some(Listener {
            path: path.clone(),
            lock_path,
            _lock: lock.into(),
        });
        log::info!("listening on {path}");
        Ok(path)
    }

    fn accept_clients(self: &Rc<Self>, socket: &Rc<OwnedFd>) {
        loop {
            let res = uapi::accept4(
                socket.as_raw_fd(),
                uapi::sockaddr_none_mut(),
                c::SOCK_CLOEXEC | c::SOCK_NONBLOCK,
            );
            match res {
                Ok((fd, _)) => {
                    if let Err(e) = self.add_client(fd.into()) {
                        log::warn!("could not add a client: {}", Report::new(e));
                    }
                }
                Err(Errno(c::EAGAIN)) => return,
                Err(Errno(c::EINTR)) => {}
                Err(e) => {
                    log::warn!("accept failed: {}", Report::new(io::Error::from(e)));
                    return;
                }
            }
        }
    }

    /// Adds a connected socket as a client.
    pub fn add_client(self: &Rc<Self>, socket: OwnedFd) -> Result<Rc<Client>, ContextError> {
        let client = Client::new(self.weak.clone(), self.alloc_entity(), Rc::new(socket));
        client.add_resource(Rc::new(Resource {
            id: 0,
            version: GLOBAL_VERSION,
            global_id: Some(0),
            kind: ResourceKind::Core,
        }));
        {
            let weak_context = self.weak.clone();
            let weak_client = Rc::downgrade(&client);
            let source = self
                .main_loop
                .add_fd(
                    client.connection.socket().as_fd(),
                    READABLE,
                    Rc::new(move |events| {
                        let Some(context) = weak_context.upgrade() else {
                            return;
                        };
                        let Some(client) = weak_client.upgrade() else {
                            return;
                        };
                        if events & ERROR != 0 {
                            context.kill_client(&client);
                            return;
                        }
                        context.dispatch_client(&client);
                    }),
                )
                .map_err(ContextError::EventLoop)?;
            client.source.set(Some(source));
        }
        self.clients.borrow_mut().push(client.clone());
        // The initial hello.
        client.send_core_event(&CoreEvent::Info(self.core_info()));
        Ok(client)
    }

    fn dispatch_client(self: &Rc<Self>, client: &Rc<Client>) {
        let res = client.connection.receive(|dest_id, opcode, payload, fds| {
            let _ = fds;
            self.dispatch_message(client, dest_id, opcode, payload)
        });
        match res {
            Ok(()) => {}
            Err(ReceiveError::Transport(e)) => {
                log::debug!("client transport failed: {}", Report::new(e));
                self.kill_client(client);
            }
            Err(ReceiveError::Dispatch(violation)) => {
                log::warn!(
                    "protocol violation from a client: {}",
                    Report::new(violation)
                );
                self.kill_client(client);
            }
        }
        self.flush_clients();
    }

    fn dispatch_message(
        self: &Rc<Self>,
        client: &Rc<Client>,
        dest_id: u32,
        opcode: u8,
        payload: &[u8],
    ) -> Result<(), Violation> {
        // Rewrite every type-valued field into the server's id space
        // before looking at the payload.
        let payload = {
            let peer = client.peer_types.borrow();
            crate::types::translate_pod(payload, &|id| peer.translate(id))
                .map_err(Violation::Types)?
        };
        if dest_id == 0 {
            let method = match CoreMethod::demarshal(opcode, &payload) {
                Ok(m) => m,
                Err(ProtocolError::UnknownOpcode { .. }) => {
                    client.post_error(
                        dest_id,
                        ErrorCode::InvalidArgument,
                        format!("unknown core method {opcode}"),
                    );
                    return Ok(());
                }
                Err(e) => return Err(Violation::Malformed(e)),
            };
            return self.handle_core_method(client, method);
        }
        let resource = client
            .resource(dest_id)
            .ok_or(Violation::NoReceiver(dest_id))?;
        match &resource.kind {
            ResourceKind::Registry => {
                let method = match RegistryMethod::demarshal(opcode, &payload) {
                    Ok(m) => m,
                    Err(ProtocolError::UnknownOpcode { .. }) => {
                        client.post_error(
                            dest_id,
                            ErrorCode::InvalidArgument,
                            format!("unknown registry method {opcode}"),
                        );
                        return Ok(());
                    }
                    Err(e) => return Err(Violation::Malformed(e)),
                };
                let RegistryMethod::Bind {
                    id,
                    version,
                    new_id,
                } = method;
                self.handle_bind(client, dest_id, id, version, new_id)
            }
            ResourceKind::ClientNode(client_node) => {
                let method = match ClientNodeMethod::demarshal(opcode, &payload) {
                    Ok(m) => m,
                    Err(ProtocolError::UnknownOpcode { .. }) => {
                        client.post_error(
                            dest_id,
                            ErrorCode::InvalidArgument,
                            format!("unknown client-node method {opcode}"),
                        );
                        return Ok(());
                    }
                    Err(e) => return Err(Violation::Malformed(e)),
                };
                if matches!(method, ClientNodeMethod::Destroy) {
                    self.destroy_resource(client, &resource);
                    return Ok(());
                }
                let client_node = client_node.clone();
                if let Err(code) = client_node.handle_method(method) {
                    client.post_error(dest_id, code, "client-node method failed");
                }
                Ok(())
            }
            ResourceKind::Core
            | ResourceKind::Client(_)
            | ResourceKind::Node(_)
            | ResourceKind::Link(_) => {
                // These interfaces have no methods; anything here is
                // an opcode beyond the interface's range.
                client.post_error(
                    dest_id,
                    ErrorCode::InvalidArgument,
                    format!(
                        "the {} interface has no method {opcode}",
                        resource.interface_name()
                    ),
                );
                Ok(())
            }
        }
    }

    fn handle_core_method(
        self: &Rc<Self>,
        client: &Rc<Client>,
        method: CoreMethod,
    ) -> Result<(), Violation> {
        match method {
            CoreMethod::UpdateTypes { first_id, types } => {
                let mut own = self.types.borrow_mut();
                client
                    .peer_types
                    .borrow_mut()
                    .update(first_id, &types, &mut own)
                    .map_err(Violation::Types)?;
            }
            CoreMethod::Sync { seq } => {
                client.send_core_event(&CoreEvent::Done { seq });
            }
            CoreMethod::GetRegistry { new_id } => {
                let added = client.add_resource(Rc::new(Resource {
                    id: new_id,
                    version: GLOBAL_VERSION,
                    global_id: None,
                    kind: ResourceKind::Registry,
                }));
                if !added {
                    return Err(Violation::IdInUse(new_id));
                }
                client.registries.borrow_mut().push(new_id);
                self.send_registry_snapshot(client, new_id);
            }
            CoreMethod::ClientUpdate { props } => {
                client.props.borrow_mut().update(&props);
                if client.global.borrow().is_none() {
                    let global = self.register_global(
                        GlobalObject::Client(Rc::downgrade(client)),
                        TYPE_CLIENT,
                        client.props.borrow().clone(),
                    );
                    *client.global.borrow_mut() = Some(global);
                }
                self.emit_client_info(client);
            }
            CoreMethod::CreateNode {
                factory,
                name,
                props,
                new_id,
            } => {
                let f = self.factories.borrow().get(&factory).cloned();
                match f {
                    Some(f) => {
                        if let Err(code) = f(self, client, &name, props, new_id) {
                            client.post_error(0, code, format!("could not create {name:?}"));
                        }
                    }
                    None => {
                        client.post_error(
                            0,
                            ErrorCode::InvalidArgument,
                            format!("unknown factory {factory:?}"),
                        );
                    }
                }
            }
            CoreMethod::CreateLink {
                output_node,
                output_port,
                input_node,
                input_port,
                filter,
                props,
                new_id,
            } => {
                self.handle_create_link(
                    client,
                    output_node,
                    output_port,
                    input_node,
                    input_port,
                    filter,
                    props,
                    new_id,
                );
            }
            CoreMethod::Destroy { id } => match client.resource(id) {
                Some(resource) => self.destroy_resource(client, &resource),
                None => {
                    client.post_error(
                        0,
                        ErrorCode::InvalidArgument,
                        format!("no resource with id {id}"),
                    );
                }
            },
        }
        Ok(())
    }

    #[expect(clippy::too_many_arguments)]
    fn handle_create_link(
        self: &Rc<Self>,
        client: &Rc<Client>,
        output_node: u32,
        output_port: u32,
        input_node: u32,
        input_port: u32,
        filter: Option<Vec<u8>>,
        props: Properties,
        new_id: u32,
    ) {
        let resolve_port = |global_id: u32, direction: Direction, port_id: u32| {
            let global = self.lookup_global(client, global_id)?;
            let GlobalObject::Node(node) = &global.object else {
                return Err((ErrorCode::InvalidArgument, "not a node".to_string()));
            };
            let node = node
                .upgrade()
                .ok_or((ErrorCode::Stale, "the node is gone".to_string()))?;
            let port = node.port(direction, port_id).ok_or((
                ErrorCode::InvalidArgument,
                format!("node {global_id} has no {direction} port {port_id}"),
            ))?;
            Ok::<Rc<Port>, (ErrorCode, String)>(port)
        };
        let ports = resolve_port(output_node, Direction::Output, output_port).and_then(|out| {
            resolve_port(input_node, Direction::Input, input_port).map(|inp| (out, inp))
        });
        let (output, input) = match ports {
            Ok(p) => p,
            Err((code, message)) => {
                client.post_error(0, code, message);
                return;
            }
        };
        let link = Link::new(self, output, input, filter, props);
        let global = self.register_global(
            GlobalObject::Link(Rc::downgrade(&link)),
            TYPE_LINK,
            link.props.clone(),
        );
        *link.global.borrow_mut() = Some(global);
        self.links.borrow_mut().push(link.clone());
        let added = client.add_resource(Rc::new(Resource {
            id: new_id,
            version: GLOBAL_VERSION,
            global_id: Some(link.global.borrow().as_ref().map(|g| g.id).unwrap_or(0)),
            kind: ResourceKind::Link(Rc::downgrade(&link)),
        }));
        if !added {
            client.post_error(0, ErrorCode::InvalidArgument, "resource id in use");
            return;
        }
        self.send_link_info(client, new_id, &link);
        link.activate();
    }

    /// Resolves a global reference from a client, distinguishing
    /// dead or not-yet-announced globals from ids that never
    /// existed.
    fn lookup_global(
        &self,
        client: &Client,
        id: u32,
    ) -> Result<Rc<Global>, (ErrorCode, String)> {
        if let Some(global) = self.globals.borrow().get(&id) {
            if !global.is_alive() {
                return Err((ErrorCode::Stale, format!("global {id} is defunct")));
            }
            if global.generation > client.recv_generation.get() {
                return Err((
                    ErrorCode::Stale,
                    format!("global {id} is from a newer generation"),
                ));
            }
            if client.permissions(global) & PERM_READ == 0 {
                return Err((ErrorCode::NoPermission, format!("no access to global {id}")));
            }
            return Ok(global.clone());
        }
        if id < self.next_global_id.get() {
            Err((ErrorCode::Stale, format!("global {id} is gone")))
        } else {
            Err((
                ErrorCode::InvalidArgument,
                format!("global {id} does not exist"),
            ))
        }
    }
}

/// Globals and the registry.
impl Context {
    fn bump_generation(&self) -> u64 {
        let generation = self.generation.get() + 1;
        self.generation.set(generation);
        generation
    }

    pub(crate) fn register_global(
        &self,
        object: GlobalObject,
        type_name: &'static str,
        props: Properties,
    ) -> Rc<Global> {
        let id = self.next_global_id.get();
        self.next_global_id.set(id + 1);
        let global = Rc::new(Global {
            id,
            generation: self.bump_generation(),
            type_name,
            version: GLOBAL_VERSION,
            object,
            props,
        });
        self.globals.borrow_mut().insert(id, global.clone());
        let clients = self.clients.borrow().clone();
        for client in clients {
            self.announce_global(&client, &global);
        }
        global
    }

    fn announce_global(&self, client: &Rc<Client>, global: &Rc<Global>) {
        if client.permissions(global) & PERM_READ == 0 {
            return;
        }
        let event = RegistryEvent::Global {
            id: global.id,
            type_name: global.type_name.to_string(),
            version: global.version,
        };
        let payload = event.marshal();
        let registries = client.registries.borrow().clone();
        for registry_id in &registries {
            client.send_event(*registry_id, event.opcode(), &payload, &[]);
        }
        if !registries.is_empty() {
            client.recv_generation.set(global.generation);
        }
    }

    pub(crate) fn unregister_global(&self, id: u32) {
        let Some(global) = self.globals.borrow_mut().remove(&id) else {
            return;
        };
        self.bump_generation();
        let event = RegistryEvent::GlobalRemove { id };
        let payload = event.marshal();
        let clients = self.clients.borrow().clone();
        for client in clients {
            if client.permissions(&global) & PERM_READ == 0 {
                continue;
            }
            for registry_id in client.registries.borrow().iter() {
                client.send_event(*registry_id, event.opcode(), &payload, &[]);
            }
        }
    }

    fn send_registry_snapshot(&self, client: &Rc<Client>, registry_id: u32) {
        let globals: Vec<_> = self.globals.borrow().values().cloned().collect();
        for global in globals {
            if !global.is_alive() || client.permissions(&global) & PERM_READ == 0 {
                continue;
            }
            let event = RegistryEvent::Global {
                id: global.id,
                type_name: global.type_name.to_string(),
                version: global.version,
            };
            client.send_event(registry_id, event.opcode(), &event.marshal(), &[]);
            client.recv_generation.set(
                client
                    .recv_generation
                    .get()
                    .max(global.generation),
            );
        }
    }

    /// Changes the permissions a client has on one global,
    /// synthesizing the matching registry event.
    pub fn set_permission(&self, client: &Rc<Client>, global_id: u32, mask: u32) {
        let old = {
            let globals = self.globals.borrow();
            let Some(global) = globals.get(&global_id) else {
                return;
            };
            let old = client.permissions(global);
            client
                .permission_overrides
                .borrow_mut()
                .insert(global_id, mask);
            old
        };
        let global = self.globals.borrow().get(&global_id).cloned();
        let Some(global) = global else {
            return;
        };
        if old & PERM_READ != 0 && mask & PERM_READ == 0 {
            let event = RegistryEvent::GlobalRemove { id: global_id };
            for registry_id in client.registries.borrow().iter() {
                client.send_event(*registry_id, event.opcode(), &event.marshal(), &[]);
            }
        } else if old & PERM_READ == 0 && mask & PERM_READ != 0 {
            self.announce_global(client, &global);
        }
    }

    fn handle_bind(
        self: &Rc<Self>,
        client: &Rc<Client>,
        registry_id: u32,
        id: u32,
        version: u32,
        new_id: u32,
    ) -> Result<(), Violation> {
        let global = match self.lookup_global(client, id) {
            Ok(g) => g,
            Err((code, message)) => {
                client.post_error(registry_id, code, message);
                return Ok(());
            }
        };
        let version = version.min(global.version);
        let kind = match &global.object {
            GlobalObject::Core => ResourceKind::Core,
            GlobalObject::Client(c) => ResourceKind::Client(c.clone()),
            GlobalObject::Node(n) => ResourceKind::Node(n.clone()),
            GlobalObject::Link(l) => ResourceKind::Link(l.clone()),
            GlobalObject::Factory(_) => ResourceKind::Core,
        };
        let resource = Rc::new(Resource {
            id: new_id,
            version,
            global_id: Some(global.id),
            kind,
        });
        if !client.add_resource(resource.clone()) {
            return Err(Violation::IdInUse(new_id));
        }
        // The just-bound event.
        match &global.object {
            GlobalObject::Core => {
                let event = CoreEvent::Info(self.core_info());
                let payload = event.marshal(&mut Vec::new());
                client.send_event(new_id, event.opcode(), &payload, &[]);
            }
            GlobalObject::Client(target) => {
                if let Some(target) = target.upgrade() {
                    let event = ClientEvent::Info(ClientInfo {
                        id: global.id,
                        change_mask: CLIENT_CHANGE_ALL,
                        props: target.props.borrow().clone(),
                    });
                    client.send_event(new_id, event.opcode(), &event.marshal(), &[]);
                }
            }
            GlobalObject::Node(node) => {
                if let Some(node) = node.upgrade() {
                    let mut info = node.info();
                    info.change_mask = NODE_CHANGE_ALL;
                    let event = NodeEvent::Info(info);
                    client.send_event(new_id, event.opcode(), &event.marshal(), &[]);
                }
            }
            GlobalObject::Link(link) => {
                if let Some(link) = link.upgrade() {
                    self.send_link_info(client, new_id, &link);
                }
            }
            GlobalObject::Factory(_) => {}
        }
        Ok(())
    }

    fn send_link_info(&self, client: &Rc<Client>, resource_id: u32, link: &Rc<Link>) {
        let mut info = link.info();
        info.change_mask = LINK_CHANGE_ALL;
        let event = LinkEvent::Info(info);
        client.send_event(resource_id, event.opcode(), &event.marshal(), &[]);
    }

    /// Sends updated node info to every resource bound to the node.
    pub(crate) fn emit_node_info(&self, node: &Node, change_mask: u32) {
        let clients = self.clients.borrow().clone();
        for client in clients {
            let resources: Vec<Rc<Resource>> =
                client.resources.borrow().values().cloned().collect();
            for resource in resources {
                let ResourceKind::Node(weak) = &resource.kind else {
                    continue;
                };
                let Some(bound) = weak.upgrade() else {
                    continue;
                };
                if !std::ptr::eq(&*bound, node) {
                    continue;
                }
                let mut info = node.info();
                info.change_mask = change_mask;
                let event = NodeEvent::Info(info);
                client.send_event(resource.id, event.opcode(), &event.marshal(), &[]);
            }
        }
    }

    pub(crate) fn emit_link_info(&self, link: &Link, change_mask: u32) {
        let clients = self.clients.borrow().clone();
        for client in clients {
            let resources: Vec<Rc<Resource>> =
                client.resources.borrow().values().cloned().collect();
            for resource in resources {
                let ResourceKind::Link(weak) = &resource.kind else {
                    continue;
                };
                let Some(bound) = weak.upgrade() else {
                    continue;
                };
                if !std::ptr::eq(&*bound, link) {
                    continue;
                }
                let mut info = link.info();
                info.change_mask = change_mask;
                let event = LinkEvent::Info(info);
                client.send_event(resource.id, event.opcode(), &event.marshal(), &[]);
            }
        }
    }

    pub(crate) fn surface_link_error(&self, link: &Link, message: &str) {
        let clients = self.clients.borrow().clone();
        for client in clients {
            let resources: Vec<Rc<Resource>> =
                client.resources.borrow().values().cloned().collect();
            for resource in resources {
                let ResourceKind::Link(weak) = &resource.kind else {
                    continue;
                };
                let Some(bound) = weak.upgrade() else {
                    continue;
                };
                if std::ptr::eq(&*bound, link) {
                    client.post_error(resource.id, ErrorCode::Format, message);
                }
            }
        }
        self.emit_link_info(link, LINK_CHANGE_ALL);
    }

    fn emit_client_info(&self, target: &Rc<Client>) {
        let Some(global) = target.global.borrow().clone() else {
            return;
        };
        let clients = self.clients.borrow().clone();
        for client in clients {
            let resources: Vec<Rc<Resource>> =
                client.resources.borrow().values().cloned().collect();
            for resource in resources {
                let ResourceKind::Client(weak) = &resource.kind else {
                    continue;
                };
                let Some(bound) = weak.upgrade() else {
                    continue;
                };
                if !Rc::ptr_eq(&bound, target) {
                    continue;
                }
                let event = ClientEvent::Info(ClientInfo {
                    id: global.id,
                    change_mask: CLIENT_CHANGE_ALL,
                    props: target.props.borrow().clone(),
                });
                client.send_event(resource.id, event.opcode(), &event.marshal(), &[]);
            }
        }
    }
}

/// Factories, nodes and links.
impl Context {
    pub fn add_factory(&self, name: &str, factory: Factory) {
        self.factories.borrow_mut().insert(name.to_string(), factory);
        self.register_global(
            GlobalObject::Factory(name.to_string()),
            TYPE_FACTORY,
            Properties::from([("factory.name", name)]),
        );
    }

    /// Adds an in-process node to the graph and publishes it.
    pub fn add_node(
        self: &Rc<Self>,
        name: &str,
        implementation: Rc<dyn NodeImpl>,
        props: Properties,
    ) -> Rc<Node> {
        let node = Node::new(self, name, implementation, props);
        let global = self.register_global(
            GlobalObject::Node(Rc::downgrade(&node)),
            TYPE_NODE,
            node.props.borrow().clone(),
        );
        *node.global.borrow_mut() = Some(global);
        self.nodes.borrow_mut().push(node.clone());
        node
    }

    /// Links two ports of in-process nodes directly.
    pub fn link_ports(self: &Rc<Self>, output: Rc<Port>, input: Rc<Port>) -> Rc<Link> {
        let link = Link::new(self, output, input, None, Properties::new());
        let global = self.register_global(
            GlobalObject::Link(Rc::downgrade(&link)),
            TYPE_LINK,
            Properties::new(),
        );
        *link.global.borrow_mut() = Some(global);
        self.links.borrow_mut().push(link.clone());
        link.activate();
        link
    }

    fn destroy_resource(self: &Rc<Self>, client: &Rc<Client>, resource: &Rc<Resource>) {
        client.resources.borrow_mut().remove(&resource.id);
        match &resource.kind {
            ResourceKind::Registry => {
                client.registries.borrow_mut().retain(|r| *r != resource.id);
            }
            ResourceKind::ClientNode(client_node) => {
                self.destroy_client_node(client_node);
            }
            _ => {}
        }
        // The ack that lets the client reuse the id.
        client.send_core_event(&CoreEvent::RemoveId { id: resource.id });
    }

    fn destroy_client_node(self: &Rc<Self>, client_node: &Rc<ClientNode>) {
        let Some(node) = client_node.node.borrow_mut().take() else {
            return;
        };
        for link in node.links() {
            link.unlink();
            self.remove_link(&link);
        }
        self.work.cancel(node.entity);
        self.client_nodes.borrow_mut().remove(&node.entity);
        self.unregister_transport(node.entity);
        if let Some(global) = node.global.borrow_mut().take() {
            self.unregister_global(global.id);
        }
        self.nodes.borrow_mut().retain(|n| !Rc::ptr_eq(n, &node));
    }

    fn remove_link(&self, link: &Rc<Link>) {
        if let Some(global) = link.global.borrow_mut().take() {
            self.unregister_global(global.id);
        }
        self.links.borrow_mut().retain(|l| !Rc::ptr_eq(l, link));
    }

    pub(crate) fn defer_kill_client(&self, client: &Client) {
        let found = self
            .clients
            .borrow()
            .iter()
            .find(|c| std::ptr::eq(&***c, client))
            .cloned();
        if let (Some(client), Some(context)) = (found, self.weak.upgrade()) {
            self.main_loop.add_idle(move || {
                context.kill_client(&client);
            });
        }
    }

    /// Tears a client down: resources leaf-first, then the global,
    /// then the socket.
    pub fn kill_client(self: &Rc<Self>, client: &Rc<Client>) {
        if client.destroyed.replace(true) {
            return;
        }
        client.connection.mark_dead();
        if let Some(source) = client.source.take() {
            self.main_loop.remove(source);
        }
        // Client nodes first; they cascade into links.
        let resources: Vec<Rc<Resource>> = client.resources.borrow().values().cloned().collect();
        for resource in &resources {
            if let ResourceKind::ClientNode(client_node) = &resource.kind {
                self.destroy_client_node(client_node);
            }
        }
        client.resources.borrow_mut().clear();
        client.registries.borrow_mut().clear();
        if let Some(global) = client.global.borrow_mut().take() {
            self.unregister_global(global.id);
        }
        self.work.cancel(client.entity);
        self.clients.borrow_mut().retain(|c| !Rc::ptr_eq(c, client));
        log::info!("client disconnected");
    }
}

/// The data plane.
impl Context {
    /// Registers a transport's wait-fd on the data loop. Ring events
    /// are forwarded to the main loop through an eventfd.
    pub(crate) fn register_transport(&self, entity: u64, transport: Arc<Transport>) {
        self.unregister_transport(entity);
        let pending = self.data_pending.clone();
        let sources = self.data_sources.clone();
        self.data_loop.handle().invoke(move || {
            let cb_transport = transport.clone();
            let cb_pending = pending.clone();
            let callback = Rc::new(move |_events: u32| {
                cb_transport.consume_signal();
                let mut any = false;
                loop {
                    match cb_transport.next_event() {
                        Ok(Some(event)) => {
                            cb_pending.push(entity, DataMsg::Event(event));
                            any = true;
                        }
                        Ok(None) => break,
                        Err(TransportError::BadEvent(kind)) => {
                            cb_pending.push(entity, DataMsg::Violation(kind));
                            any = true;
                            break;
                        }
                        Err(_) => break,
                    }
                }
                if any {
                    cb_pending.notify();
                }
            });
            EventLoop::with_current(|el| {
                match el.add_fd(transport.wait_fd().as_fd(), READABLE, callback.clone()) {
                    Ok(source) => {
                        sources.lock().insert(entity, source);
                    }
                    Err(e) => {
                        log::warn!(
                            "could not watch a transport: {}",
                            Report::new(e)
                        );
                    }
                }
            });
        });
    }

    pub(crate) fn unregister_transport(&self, entity: u64) {
        let sources = self.data_sources.clone();
        self.data_loop.handle().invoke(move || {
            let source = sources.lock().remove(&entity);
            if let Some(source) = source {
                EventLoop::with_current(|el| el.remove(source));
            }
        });
    }

    fn drain_data_events(self: &Rc<Self>) {
        let mut buf = [0u8; 8];
        let _ = uapi::read(self.data_pending.notify.as_raw_fd(), &mut buf[..]);
        let msgs = std::mem::take(&mut *self.data_pending.msgs.lock());
        for (entity, msg) in msgs {
            self.handle_transport_msg(entity, msg);
        }
        self.flush_clients();
    }

    fn handle_transport_msg(self: &Rc<Self>, entity: u64, msg: DataMsg) {
        let node = self
            .client_nodes
            .borrow()
            .get(&entity)
            .and_then(|w| w.upgrade());
        let Some(node) = node else {
            return;
        };
        match msg {
            DataMsg::Violation(kind) => {
                log::warn!("a client sent the invalid transport event {kind}");
                let owner = node.owner.borrow().clone();
                if let Some(owner) = owner.and_then(|w| w.upgrade()) {
                    self.kill_client(&owner);
                }
            }
            DataMsg::Event(TransportEvent::HaveOutput { port_id }) => {
                self.pull_from_output(&node, port_id);
            }
            DataMsg::Event(TransportEvent::NeedInput { port_id }) => {
                self.request_input(&node, port_id);
            }
            DataMsg::Event(TransportEvent::ReuseBuffer { port_id, buffer_id }) => {
                node.return_input_buffer(port_id, buffer_id);
            }
        }
    }

    /// An output port of `node` produced a buffer: tee it to every
    /// active link and push it into the peer input ports.
    fn pull_from_output(self: &Rc<Self>, node: &Rc<Node>, port_id: u32) {
        let Some(port) = node.port(Direction::Output, port_id) else {
            return;
        };
        port.mix_process_output();
        let mixes = port.mixes.borrow().clone();
        for mix in mixes {
            if !mix.active.get() {
                continue;
            }
            let Some(link) = mix.link() else {
                continue;
            };
            let buffer_id = mix.io.buffer_id();
            if mix.io.status() != STATUS_HAVE_DATA || buffer_id == INVALID_ID {
                continue;
            }
            mix.io.set_status(STATUS_NEED_DATA);
            self.deliver_to_input(&link, buffer_id);
        }
    }

    fn deliver_to_input(self: &Rc<Self>, link: &Rc<Link>, buffer_id: u32) {
        let input = link.input_port();
        let Some(io) = input.io() else {
            return;
        };
        io.set(STATUS_HAVE_DATA, buffer_id);
        match &io {
            IoHandle::Area { transport, .. } => {
                // The consumer is another client node; wake it.
                let _ = transport.send_event(TransportEvent::HaveOutput { port_id: input.id });
                transport.signal();
            }
            _ => {
                let Some(in_node) = input.node.upgrade() else {
                    return;
                };
                match in_node.implementation.process_input() {
                    Ok(_) => {
                        input.mix_process_input();
                        link.return_output_buffer(buffer_id);
                    }
                    Err(code) => {
                        log::warn!("a sink failed to process input: {code}");
                    }
                }
            }
        }
    }

    /// An input port of `node` ran dry: ask the producing side of
    /// every active link for more data.
    fn request_input(self: &Rc<Self>, node: &Rc<Node>, port_id: u32) {
        let Some(port) = node.port(Direction::Input, port_id) else {
            return;
        };
        let mixes = port.mixes.borrow().clone();
        for mix in mixes {
            if !mix.active.get() {
                continue;
            }
            let Some(link) = mix.link() else {
                continue;
            };
            let output = link.output_port();
            let Some(out_io) = output.io() else {
                continue;
            };
            match &out_io {
                IoHandle::Area { transport, .. } => {
                    let _ =
                        transport.send_event(TransportEvent::NeedInput { port_id: output.id });
                    transport.signal();
                }
                _ => {
                    let Some(out_node) = output.node.upgrade() else {
                        continue;
                    };
                    if out_node.implementation.process_output().is_ok() {
                        let buffer_id = out_io.buffer_id();
                        if out_io.status() == STATUS_HAVE_DATA && buffer_id != INVALID_ID {
                            output.mix_process_output();
                            self.deliver_to_input(&link, buffer_id);
                        }
                    }
                }
            }
        }
    }

    /// Drives the whole graph to `RUNNING`, used by the daemon once
    /// setup is done.
    pub fn start_all(self: &Rc<Self>) {
        let nodes = self.nodes.borrow().clone();
        for node in nodes {
            node.set_state(NodeState::Running);
        }
    }
}

/// The built-in factory that instantiates client nodes.
fn client_node_factory(
    context: &Rc<Context>,
    client: &Rc<Client>,
    name: &str,
    props: Properties,
    new_id: u32,
) -> Result<(), ErrorCode> {
    let client_node = ClientNode::new(client, new_id);
    let added = client.add_resource(Rc::new(Resource {
        id: new_id,
        version: GLOBAL_VERSION,
        global_id: None,
        kind: ResourceKind::ClientNode(client_node.clone()),
    }));
    if !added {
        return Err(ErrorCode::InvalidArgument);
    }
    let node = Node::new(context, name, client_node.proxy.clone(), props);
    client_node.proxy.entity.set(node.entity);
    *node.owner.borrow_mut() = Some(Rc::downgrade(client));
    *client_node.node.borrow_mut() = Some(node.clone());
    let global = context.register_global(
        GlobalObject::Node(Rc::downgrade(&node)),
        TYPE_NODE,
        node.props.borrow().clone(),
    );
    *node.global.borrow_mut() = Some(global);
    context.nodes.borrow_mut().push(node.clone());
    context
        .client_nodes
        .borrow_mut()
        .insert(node.entity, Rc::downgrade(&node));
    Ok(())
}

fn eventfd() -> Result<OwnedFd, io::Error> {
    // SAFETY: plain syscall, result checked below.
    let raw = unsafe { c::eventfd(0, c::EFD_CLOEXEC | c::EFD_NONBLOCK) };
    if raw == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: eventfd returned a fresh fd.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

fn host_name() -> String {
    // SAFETY: all-zero bytes are a valid bit pattern for this C struct.
    let mut buf: c::utsname = unsafe { std::mem::zeroed() };
    // SAFETY: uname fills the struct or fails.
    if unsafe { c::uname(&mut buf) } == -1 {
        return String::new();
    }
    let bytes: Vec<u8> = buf
        .nodename
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| b as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}
