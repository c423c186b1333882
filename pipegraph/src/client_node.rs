//! Server-side client nodes.
//!
//! A client node is a graph node whose processing lives in a remote
//! client. The [`ClientNodeImpl`] half implements [`NodeImpl`] by
//! marshalling every call over the protocol; completions arrive as
//! `done` methods and are routed through the node's event bridge.
//! The data plane bypasses the protocol entirely: a shared transport
//! area carries per-port I/O slots and event rings, signalled with
//! eventfds serviced by the data loop.

use {
    crate::{
        client::Client,
        error::ErrorCode,
        node::Node,
        node_impl::{
            Direction, IoHandle, NodeCommand, NodeImpl, NodeImplEvents, OpResult, PortCounts,
            PortImplInfo,
        },
        pod::Pod,
        props::Properties,
        protocol::client_node::{
            ClientNodeEvent, ClientNodeMethod, EVENT_USE_BUFFERS, PORT_UPDATE_FORMAT,
            PORT_UPDATE_INFO, PORT_UPDATE_PARAMS, PORT_UPDATE_POSSIBLE_FORMATS, UPDATE_MAX_INPUTS,
            UPDATE_MAX_OUTPUTS, UPDATE_PROPS, WireBuffer, marshal_use_buffers,
        },
        transport::{Transport, TransportEvent},
    },
    error_reporter::Report,
    std::{
        cell::{Cell, RefCell},
        collections::BTreeMap,
        os::fd::OwnedFd,
        rc::{Rc, Weak},
        sync::Arc,
    },
};

/// The server half of a client node: the resource bookkeeping plus
/// the proxied node implementation attached to the graph.
pub struct ClientNode {
    pub(crate) resource_id: u32,
    pub(crate) node: RefCell<Option<Rc<Node>>>,
    pub(crate) proxy: Rc<ClientNodeImpl>,
}

impl ClientNode {
    pub(crate) fn new(client: &Rc<Client>, resource_id: u32) -> Rc<ClientNode> {
        Rc::new(ClientNode {
            resource_id,
            node: RefCell::new(None),
            proxy: Rc::new(ClientNodeImpl {
                client: Rc::downgrade(client),
                entity: Cell::new(0),
                resource_id,
                next_seq: Cell::new(1),
                counts: Cell::new(PortCounts::default()),
                props: RefCell::new(Properties::new()),
                ports: RefCell::new([BTreeMap::new(), BTreeMap::new()]),
                transport: RefCell::new(None),
                events: RefCell::new(None),
            }),
        })
    }

    /// Dispatches a method from the owning client.
    pub(crate) fn handle_method(&self, method: ClientNodeMethod) -> Result<(), ErrorCode> {
        match method {
            ClientNodeMethod::Done { seq, res } => {
                self.proxy.complete(seq, res);
                Ok(())
            }
            ClientNodeMethod::Update {
                change_mask,
                max_inputs,
                max_outputs,
                props,
            } => {
                self.proxy
                    .handle_update(change_mask, max_inputs, max_outputs, props);
                Ok(())
            }
            ClientNodeMethod::PortUpdate {
                direction,
                port_id,
                change_mask,
                possible_formats,
                format,
                params,
                info,
            } => {
                self.proxy.handle_port_update(
                    direction,
                    port_id,
                    change_mask,
                    possible_formats,
                    format,
                    params,
                    info,
                );
                Ok(())
            }
            ClientNodeMethod::Destroy => Err(ErrorCode::InvalidArgument),
        }
    }
}

#[derive(Default)]
struct PortCache {
    possible_formats: Vec<Vec<u8>>,
    format: Option<Vec<u8>>,
    params: Vec<Vec<u8>>,
    info: PortImplInfo,
}

/// The [`NodeImpl`] that forwards to the remote client.
pub struct ClientNodeImpl {
    client: Weak<Client>,
    /// The graph entity of the owning node, set when the node is
    /// attached; used as the data-plane routing key.
    pub(crate) entity: Cell<u64>,
    resource_id: u32,
    next_seq: Cell<u32>,
    counts: Cell<PortCounts>,
    props: RefCell<Properties>,
    ports: RefCell<[BTreeMap<u32, PortCache>; 2]>,
    pub(crate) transport: RefCell<Option<Arc<Transport>>>,
    events: RefCell<Option<Rc<dyn NodeImplEvents>>>,
}

impl ClientNodeImpl {
    fn alloc_seq(&self) -> u32 {
        let seq = self.next_seq.get();
        self.next_seq.set(seq.wrapping_add(1));
        seq
    }

    fn dir_index(direction: Direction) -> usize {
        direction.to_raw() as usize
    }

    fn send_event(&self, event: &ClientNodeEvent) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        let mut fds = Vec::new();
        let payload = event.marshal(&mut fds);
        client.send_event(self.resource_id, event.opcode(), &payload, &fds);
    }

    fn complete(&self, seq: u32, res: i32) {
        if let Some(events) = self.events.borrow().clone() {
            events.async_complete(seq, res);
        }
    }

    fn ports_changed(&self) {
        if let Some(events) = self.events.borrow().clone() {
            events.ports_changed();
        }
    }

    fn handle_update(&self, change_mask: u32, max_inputs: u32, max_outputs: u32, props: Properties) {
        let mut counts = self.counts.get();
        if change_mask & UPDATE_MAX_INPUTS != 0 {
            counts.max_inputs = max_inputs;
        }
        if change_mask & UPDATE_MAX_OUTPUTS != 0 {
            counts.max_outputs = max_outputs;
        }
        self.counts.set(counts);
        if change_mask & UPDATE_PROPS != 0 {
            self.props.borrow_mut().update(&props);
        }
        if change_mask & (UPDATE_MAX_INPUTS | UPDATE_MAX_OUTPUTS) != 0 {
            self.renegotiate_transport();
        }
        self.ports_changed();
    }

    #[expect(clippy::too_many_arguments)]
    fn handle_port_update(
        &self,
        direction: Direction,
        port_id: u32,
        change_mask: u32,
        possible_formats: Vec<Vec<u8>>,
        format: Option<Vec<u8>>,
        params: Vec<Vec<u8>>,
        info: Option<PortImplInfo>,
    ) {
        {
            let mut ports = self.ports.borrow_mut();
            let cache = ports[Self::dir_index(direction)]
                .entry(port_id)
                .or_default();
            if change_mask & PORT_UPDATE_POSSIBLE_FORMATS != 0 {
                cache.possible_formats = possible_formats;
            }
            if change_mask & PORT_UPDATE_FORMAT != 0 {
                cache.format = format;
            }
            if change_mask & PORT_UPDATE_PARAMS != 0 {
                cache.params = params;
            }
            if change_mask & PORT_UPDATE_INFO != 0
                && let Some(info) = info
            {
                cache.info = info;
            }
            let mut counts = self.counts.get();
            counts.n_inputs = ports[0].len() as u32;
            counts.n_outputs = ports[1].len() as u32;
            self.counts.set(counts);
        }
        self.ports_changed();
    }

    /// (Re)allocates the transport area and announces it to the
    /// client. Runs on creation and whenever the maximum port counts
    /// change.
    fn renegotiate_transport(&self) {
        let counts = self.counts.get();
        let transport = match Transport::alloc(
            counts.max_inputs,
            counts.max_outputs,
            counts.n_inputs,
            counts.n_outputs,
        ) {
            Ok(t) => t,
            Err(e) => {
                log::warn!("could not allocate a transport: {}", Report::new(e));
                return;
            }
        };
        let info = transport.info();
        let (read_fd, write_fd, mem_fd) = match (
            dup_arc(&info.read_fd),
            dup_arc(&info.write_fd),
            dup_arc(&info.mem_fd),
        ) {
            (Ok(r), Ok(w), Ok(m)) => (r, w, m),
            _ => {
                log::warn!("could not duplicate transport fds");
                return;
            }
        };
        *self.transport.borrow_mut() = Some(transport.clone());
        self.send_event(&ClientNodeEvent::Transport {
            read_fd,
            write_fd,
            mem_fd,
            offset: info.offset,
            size: info.size,
        });
        if let Some(client) = self.client.upgrade()
            && let Some(context) = client.context.upgrade()
        {
            context.register_transport(self.entity.get(), transport);
        }
    }

    /// Sends the initial pull requests for the output ports once the
    /// node started.
    fn kick_outputs(&self) {
        let Some(transport) = self.transport.borrow().clone() else {
            return;
        };
        let ports = self.ports.borrow();
        let mut any = false;
        for port_id in ports[Self::dir_index(Direction::Output)].keys() {
            if transport
                .send_event(TransportEvent::NeedInput { port_id: *port_id })
                .is_ok()
            {
                any = true;
            }
        }
        if any {
            transport.signal();
        }
    }
}

fn dup_arc(fd: &Arc<OwnedFd>) -> Result<Rc<OwnedFd>, std::io::Error> {
    Ok(Rc::new(fd.try_clone()?))
}

impl NodeImpl for ClientNodeImpl {
    fn get_n_ports(&self) -> PortCounts {
        self.counts.get()
    }

    fn get_port_ids(&self, direction: Direction) -> Vec<u32> {
        self.ports.borrow()[Self::dir_index(direction)]
            .keys()
            .copied()
            .collect()
    }

    fn port_enum_formats(
        &self,
        direction: Direction,
        port_id: u32,
        index: u32,
        _filter: Option<Pod<'_>>,
    ) -> Result<Option<Vec<u8>>, ErrorCode> {
        let ports = self.ports.borrow();
        let cache = ports[Self::dir_index(direction)]
            .get(&port_id)
            .ok_or(ErrorCode::InvalidArgument)?;
        Ok(cache.possible_formats.get(index as usize).cloned())
    }

    fn port_set_format(
        &self,
        direction: Direction,
        port_id: u32,
        flags: u32,
        format: Option<&[u8]>,
    ) -> Result<OpResult, ErrorCode> {
        {
            let mut ports = self.ports.borrow_mut();
            let cache = ports[Self::dir_index(direction)]
                .get_mut(&port_id)
                .ok_or(ErrorCode::InvalidArgument)?;
            cache.format = format.map(|f| f.to_vec());
        }
        let seq = self.alloc_seq();
        self.send_event(&ClientNodeEvent::SetFormat {
            seq,
            direction,
            port_id,
            flags,
            format: format.map(|f| f.to_vec()),
        });
        Ok(OpResult::Async(seq))
    }

    fn port_get_format(
        &self,
        direction: Direction,
        port_id: u32,
    ) -> Result<Option<Vec<u8>>, ErrorCode> {
        let ports = self.ports.borrow();
        let cache = ports[Self::dir_index(direction)]
            .get(&port_id)
            .ok_or(ErrorCode::InvalidArgument)?;
        Ok(cache.format.clone())
    }

    fn port_get_info(
        &self,
        direction: Direction,
        port_id: u32,
    ) -> Result<PortImplInfo, ErrorCode> {
        let ports = self.ports.borrow();
        let cache = ports[Self::dir_index(direction)]
            .get(&port_id)
            .ok_or(ErrorCode::InvalidArgument)?;
        Ok(cache.info)
    }

    fn port_enum_params(
        &self,
        direction: Direction,
        port_id: u32,
        param_id: u32,
        index: u32,
        _filter: Option<Pod<'_>>,
    ) -> Result<Option<Vec<u8>>, ErrorCode> {
        let ports = self.ports.borrow();
        let cache = ports[Self::dir_index(direction)]
            .get(&port_id)
            .ok_or(ErrorCode::InvalidArgument)?;
        let mut matching = cache.params.iter().filter(|p| {
            Pod::from_slice(p)
                .and_then(|pod| pod.as_object().map(|o| o.type_id == param_id))
                .unwrap_or(false)
        });
        Ok(matching.nth(index as usize).cloned())
    }

    fn port_set_param(
        &self,
        direction: Direction,
        port_id: u32,
        param: &[u8],
    ) -> Result<OpResult, ErrorCode> {
        let seq = self.alloc_seq();
        self.send_event(&ClientNodeEvent::SetParam {
            seq,
            direction,
            port_id,
            param: param.to_vec(),
        });
        Ok(OpResult::Async(seq))
    }

    fn port_use_buffers(
        &self,
        direction: Direction,
        port_id: u32,
        buffers: Vec<Rc<crate::buffers::Buffer>>,
    ) -> Result<OpResult, ErrorCode> {
        let client = self.client.upgrade().ok_or(ErrorCode::Io)?;
        let wire: Vec<WireBuffer> = buffers
            .iter()
            .map(|buffer| {
                let data = buffer.datas.first();
                let (mem_id, offset, size) = match data.and_then(|d| d.block.as_ref().map(|b| (d, b)))
                {
                    Some((data, block)) => {
                        (client.ensure_mem(block), data.mapoffset, data.maxsize)
                    }
                    None => (crate::pod::INVALID_ID, 0, 0),
                };
                WireBuffer {
                    mem_id,
                    offset,
                    size,
                    buffer: buffer.clone(),
                }
            })
            .collect();
        let seq = self.alloc_seq();
        let payload = marshal_use_buffers(seq, direction, port_id, &wire);
        client.send_event(self.resource_id, EVENT_USE_BUFFERS, &payload, &[]);
        Ok(OpResult::Async(seq))
    }

    fn port_set_io(
        &self,
        _direction: Direction,
        _port_id: u32,
        _io: Option<IoHandle>,
    ) -> Result<(), ErrorCode> {
        // The graph adopts the transport slots via
        // `port_preferred_io`; there is nothing else to wire.
        Ok(())
    }

    fn port_preferred_io(&self, direction: Direction, port_id: u32) -> Option<IoHandle> {
        let transport = self.transport.borrow().clone()?;
        Some(IoHandle::Area {
            transport,
            direction,
            index: port_id,
        })
    }

    fn port_reuse_buffer(&self, port_id: u32, buffer_id: u32) -> Result<(), ErrorCode> {
        let transport = self.transport.borrow().clone().ok_or(ErrorCode::Io)?;
        // Reuse is delivered in-band; a pull request follows so the
        // stream keeps flowing.
        let _ = transport.send_event(TransportEvent::ReuseBuffer { port_id, buffer_id });
        let _ = transport.send_event(TransportEvent::NeedInput { port_id });
        transport.signal();
        Ok(())
    }

    fn send_command(&self, command: &NodeCommand) -> Result<OpResult, ErrorCode> {
        let seq = self.alloc_seq();
        self.send_event(&ClientNodeEvent::NodeCommand {
            seq,
            command: *command,
        });
        if matches!(command, NodeCommand::Start) {
            self.kick_outputs();
        }
        Ok(OpResult::Async(seq))
    }

    fn process_input(&self) -> Result<u32, ErrorCode> {
        // Processing happens in the remote client.
        Ok(0)
    }

    fn process_output(&self) -> Result<u32, ErrorCode> {
        Ok(0)
    }

    fn set_events(&self, events: Rc<dyn NodeImplEvents>) {
        *self.events.borrow_mut() = Some(events);
    }
}
