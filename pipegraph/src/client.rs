//! Daemon-side client records.

use {
    crate::{
        connection::Connection,
        error::ErrorCode,
        event_loop::SourceId,
        global::{Global, PERM_ALL},
        mem::MemBlock,
        props::Properties,
        protocol::core::CoreEvent,
        resource::Resource,
        types::PeerTypes,
    },
    error_reporter::Report,
    std::{
        cell::{Cell, RefCell},
        collections::HashMap,
        os::fd::{AsRawFd, OwnedFd},
        rc::{Rc, Weak},
    },
    uapi::c,
};

/// The peer credentials read from the socket at accept time, kept
/// for access policies.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PeerCredentials {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

pub(crate) fn peer_credentials(socket: &OwnedFd) -> Option<PeerCredentials> {
    let mut ucred = c::ucred {
        pid: 0,
        uid: 0,
        gid: 0,
    };
    let mut len = size_of::<c::ucred>() as c::socklen_t;
    // SAFETY: the buffer is a properly sized ucred.
    let res = unsafe {
        c::getsockopt(
            socket.as_raw_fd(),
            c::SOL_SOCKET,
            c::SO_PEERCRED,
            (&raw mut ucred).cast(),
            &mut len,
        )
    };
    if res == -1 {
        return None;
    }
    Some(PeerCredentials {
        pid: ucred.pid,
        uid: ucred.uid,
        gid: ucred.gid,
    })
}

/// A connected peer as seen by the daemon.
///
/// A client starts out unregistered; it becomes visible through the
/// registry once it announced itself with `client_update`.
pub struct Client {
    pub(crate) context: Weak<crate::context::Context>,
    /// The work-queue owner id of this client.
    pub(crate) entity: u64,
    pub(crate) connection: Connection,
    pub(crate) source: Cell<Option<SourceId>>,
    pub(crate) resources: RefCell<HashMap<u32, Rc<Resource>>>,
    pub(crate) peer_types: RefCell<PeerTypes>,
    /// High-water mark of own type ids announced to this client.
    pub(crate) types_sent: Cell<u32>,
    /// Memblock tag to the id this client knows the block under.
    pub(crate) mems: RefCell<HashMap<u64, u32>>,
    pub(crate) next_mem_id: Cell<u32>,
    pub(crate) props: RefCell<Properties>,
    pub(crate) creds: Option<PeerCredentials>,
    pub(crate) global: RefCell<Option<Rc<Global>>>,
    /// Resource ids of the registries this client subscribed.
    pub(crate) registries: RefCell<Vec<u32>>,
    /// The newest global generation announced to this client.
    pub(crate) recv_generation: Cell<u64>,
    pub(crate) default_permissions: Cell<u32>,
    pub(crate) permission_overrides: RefCell<HashMap<u32, u32>>,
    pub(crate) destroyed: Cell<bool>,
}

impl Client {
    pub(crate) fn new(
        context: Weak<crate::context::Context>,
        entity: u64,
        socket: Rc<OwnedFd>,
    ) -> Rc<Client> {
        let creds = peer_credentials(&socket);
        Rc::new(Client {
            context,
            entity,
            connection: Connection::new(socket),
            source: Cell::new(None),
            resources: Default::default(),
            peer_types: RefCell::new(PeerTypes::new()),
            types_sent: Cell::new(crate::types::first_dynamic_id()),
            mems: Default::default(),
            next_mem_id: Cell::new(0),
            props: Default::default(),
            creds,
            global: RefCell::new(None),
            registries: Default::default(),
            recv_generation: Cell::new(0),
            default_permissions: Cell::new(PERM_ALL),
            permission_overrides: Default::default(),
            destroyed: Cell::new(false),
        })
    }

    pub fn creds(&self) -> Option<PeerCredentials> {
        self.creds
    }

    pub fn props(&self) -> Properties {
        self.props.borrow().clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.get()
    }

    /// The permissions this client has on `global`.
    pub fn permissions(&self, global: &Global) -> u32 {
        self.permission_overrides
            .borrow()
            .get(&global.id)
            .copied()
            .unwrap_or(self.default_permissions.get())
    }

    /// Announces own type ids the client has not seen yet. Must run
    /// before any message referencing them.
    pub(crate) fn sync_types(&self) {
        let Some(context) = self.context.upgrade() else {
            return;
        };
        let types = context.types.borrow();
        let first_id = self.types_sent.get();
        let names = types.names_from(first_id);
        if names.is_empty() {
            return;
        }
        let event = CoreEvent::UpdateTypes {
            first_id,
            types: names.to_vec(),
        };
        drop(types);
        self.types_sent
            .set(context.types.borrow().next_id());
        self.send_raw(0, event.opcode(), &event.marshal(&mut Vec::new()), &[]);
    }

    fn send_raw(&self, dest_id: u32, opcode: u8, payload: &[u8], fds: &[Rc<OwnedFd>]) {
        if self.destroyed.get() {
            return;
        }
        if let Err(e) = self.connection.send(dest_id, opcode, payload, fds) {
            log::warn!("Could not queue a message for a client: {}", Report::new(e));
            if let Some(context) = self.context.upgrade() {
                context.defer_kill_client(self);
            }
        }
    }

    /// Sends an event, announcing new type ids first.
    pub(crate) fn send_event(&self, dest_id: u32, opcode: u8, payload: &[u8], fds: &[Rc<OwnedFd>]) {
        self.sync_types();
        self.send_raw(dest_id, opcode, payload, fds);
    }

    pub(crate) fn send_core_event(&self, event: &CoreEvent) {
        let mut fds = Vec::new();
        let payload = event.marshal(&mut fds);
        self.send_event(0, event.opcode(), &payload, &fds);
    }

    /// Surfaces an error on `id` to this client.
    pub(crate) fn post_error(&self, id: u32, code: ErrorCode, message: impl Into<String>) {
        let message = message.into();
        log::debug!("client error on object {id}: {code}: {message}");
        self.send_core_event(&CoreEvent::Error {
            id,
            res: code.to_raw(),
            message,
        });
    }

    /// Returns the id this client knows `block` under, announcing the
    /// block with `add_mem` the first time.
    pub(crate) fn ensure_mem(&self, block: &Rc<MemBlock>) -> u32 {
        if let Some(id) = self.mems.borrow().get(&block.tag()) {
            return *id;
        }
        let id = self.next_mem_id.get();
        self.next_mem_id.set(id + 1);
        self.mems.borrow_mut().insert(block.tag(), id);
        self.send_core_event(&CoreEvent::AddMem {
            mem_id: id,
            mem_type: block.mem_type(),
            fd: block.fd().clone(),
            flags: block.flags(),
            offset: block.offset() as u32,
            size: block.size() as u32,
        });
        id
    }

    /// Withdraws a block from this client.
    pub(crate) fn remove_mem(&self, block: &MemBlock) {
        let id = self.mems.borrow_mut().remove(&block.tag());
        if let Some(mem_id) = id {
            self.send_core_event(&CoreEvent::RemoveMem { mem_id });
        }
    }

    pub(crate) fn add_resource(&self, resource: Rc<Resource>) -> bool {
        use std::collections::hash_map::Entry;
        match self.resources.borrow_mut().entry(resource.id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(e) => {
                e.insert(resource);
                true
            }
        }
    }

    pub(crate) fn resource(&self, id: u32) -> Option<Rc<Resource>> {
        self.resources.borrow().get(&id).cloned()
    }
}
