//! Ports and their per-peer mix endpoints.
//!
//! Every port owns a small internal mix stage. Each peer link gets a
//! `PortMix` with its own I/O slot; the mix stage moves buffer ids
//! between the node's slot and the mix slots: input ports merge the
//! first active peer, output ports tee to every active peer. With a
//! single attached peer the stage degenerates to a plain copy.

use {
    crate::{
        buffers::Buffer,
        error::ErrorCode,
        link::Link,
        node::Node,
        node_impl::{
            Direction, IoHandle, PROCESS_HAVE_DATA, PROCESS_NEED_DATA, PORT_FLAG_LATENCY_WRITE,
        },
        pod::{INVALID_ID, PodBuilder},
        transport::{STATUS_HAVE_DATA, STATUS_NEED_DATA},
        types,
    },
    linearize::StaticMap,
    std::{
        cell::{Cell, RefCell},
        rc::{Rc, Weak},
    },
};

#[derive(Copy, Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum PortState {
    /// No format configured.
    Configure,
    /// A format is set, no buffers yet.
    Ready,
    /// Buffers are in use.
    Paused,
    /// The owning node is running.
    Streaming,
}

impl PortState {
    pub fn as_str(self) -> &'static str {
        match self {
            PortState::Configure => "configure",
            PortState::Ready => "ready",
            PortState::Paused => "paused",
            PortState::Streaming => "streaming",
        }
    }
}

/// One peer endpoint of a port, paired with a link.
pub struct PortMix {
    pub(crate) port: Weak<Port>,
    /// The sub-port id on the mix stage.
    pub(crate) id: u32,
    pub(crate) io: IoHandle,
    pub(crate) link_ref: RefCell<Option<Weak<Link>>>,
    pub(crate) active: Cell<bool>,
}

impl PortMix {
    pub(crate) fn link(&self) -> Option<Rc<Link>> {
        self.link_ref.borrow().as_ref()?.upgrade()
    }
}

/// An aggregated latency range in nanoseconds.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Latency {
    pub min_ns: u64,
    pub max_ns: u64,
}

pub struct Port {
    pub(crate) node: Weak<Node>,
    pub(crate) direction: Direction,
    pub(crate) id: u32,
    state: Cell<PortState>,
    format: RefCell<Option<Vec<u8>>>,
    buffers: RefCell<Vec<Rc<Buffer>>>,
    pub(crate) mixes: RefCell<Vec<Rc<PortMix>>>,
    next_mix_id: Cell<u32>,
    io: RefCell<Option<IoHandle>>,
    latency: StaticMap<Direction, Cell<Latency>>,
}

impl Port {
    pub(crate) fn new(node: &Rc<Node>, direction: Direction, id: u32) -> Rc<Port> {
        let port = Rc::new(Port {
            node: Rc::downgrade(node),
            direction,
            id,
            state: Cell::new(PortState::Configure),
            format: RefCell::new(None),
            buffers: RefCell::new(Vec::new()),
            mixes: Default::default(),
            next_mix_id: Cell::new(0),
            io: RefCell::new(None),
            latency: Default::default(),
        });
        if let Err(e) = port.ensure_io() {
            log::warn!(
                "could not wire an io slot to {}:{}: {}",
                direction,
                id,
                e
            );
        }
        port
    }

    pub fn state(&self) -> PortState {
        self.state.get()
    }

    pub fn format(&self) -> Option<Vec<u8>> {
        self.format.borrow().clone()
    }

    pub fn buffers(&self) -> Vec<Rc<Buffer>> {
        self.buffers.borrow().clone()
    }

    pub(crate) fn io(&self) -> Option<IoHandle> {
        self.io.borrow().clone()
    }

    fn ensure_io(self: &Rc<Self>) -> Result<(), ErrorCode> {
        let Some(node) = self.node.upgrade() else {
            return Ok(());
        };
        let io = node
            .implementation
            .port_preferred_io(self.direction, self.id)
            .unwrap_or_else(IoHandle::shared);
        node.implementation
            .port_set_io(self.direction, self.id, Some(io.clone()))?;
        *self.io.borrow_mut() = Some(io);
        Ok(())
    }

    /// Re-acquires the implementation's slot, used after a client
    /// node renegotiated its transport.
    pub(crate) fn rewire_io(self: &Rc<Self>) {
        *self.io.borrow_mut() = None;
        if let Err(e) = self.ensure_io() {
            log::warn!("could not rewire an io slot: {}", e);
        }
    }

    /// Attaches a new mix endpoint for a link.
    pub(crate) fn init_mix(self: &Rc<Self>, link: &Rc<Link>) -> Rc<PortMix> {
        let id = self.next_mix_id.get();
        self.next_mix_id.set(id + 1);
        let mix = Rc::new(PortMix {
            port: Rc::downgrade(self),
            id,
            io: IoHandle::shared(),
            link_ref: RefCell::new(Some(Rc::downgrade(link))),
            active: Cell::new(false),
        });
        self.mixes.borrow_mut().push(mix.clone());
        mix
    }

    /// Detaches a mix endpoint. Releasing the last one clears the
    /// port's format.
    pub(crate) fn release_mix(self: &Rc<Self>, mix: &Rc<PortMix>) {
        mix.active.set(false);
        mix.link_ref.borrow_mut().take();
        self.mixes.borrow_mut().retain(|m| !Rc::ptr_eq(m, mix));
        if self.mixes.borrow().is_empty() {
            if let Err(e) = self.clear_buffers() {
                log::debug!("could not clear buffers of an unlinked port: {}", e);
            }
            if let Err(e) = self.clear_format() {
                log::debug!("could not clear the format of an unlinked port: {}", e);
            }
        }
    }

    /// Records a negotiated format; the port advances to `READY`.
    pub(crate) fn apply_format(&self, format: Option<Vec<u8>>) {
        match format {
            Some(format) => {
                *self.format.borrow_mut() = Some(format);
                if self.state.get() == PortState::Configure {
                    self.state.set(PortState::Ready);
                }
            }
            None => {
                *self.format.borrow_mut() = None;
                self.state.set(PortState::Configure);
            }
        }
    }

    /// Records the buffer set; the port advances to `PAUSED`.
    pub(crate) fn apply_buffers(&self, buffers: Vec<Rc<Buffer>>) {
        let empty = buffers.is_empty();
        *self.buffers.borrow_mut() = buffers;
        if empty {
            if self.state.get() >= PortState::Paused {
                self.state.set(PortState::Ready);
            }
        } else if self.state.get() == PortState::Ready {
            self.state.set(PortState::Paused);
        }
    }

    pub(crate) fn enter_streaming(&self) {
        if self.state.get() == PortState::Paused {
            self.state.set(PortState::Streaming);
        }
    }

    pub(crate) fn leave_streaming(&self) {
        if self.state.get() == PortState::Streaming {
            self.state.set(PortState::Paused);
        }
    }

    fn clear_format(self: &Rc<Self>) -> Result<(), ErrorCode> {
        let Some(node) = self.node.upgrade() else {
            return Ok(());
        };
        if self.format.borrow().is_none() {
            return Ok(());
        }
        node.implementation
            .port_set_format(self.direction, self.id, 0, None)?;
        self.apply_format(None);
        Ok(())
    }

    fn clear_buffers(self: &Rc<Self>) -> Result<(), ErrorCode> {
        let Some(node) = self.node.upgrade() else {
            return Ok(());
        };
        if self.buffers.borrow().is_empty() {
            return Ok(());
        }
        node.implementation
            .port_use_buffers(self.direction, self.id, Vec::new())?;
        self.apply_buffers(Vec::new());
        Ok(())
    }

    /// Releases buffers and format, returning the port to
    /// `CONFIGURE`. Used when the owning node suspends.
    pub(crate) fn reset_to_configure(self: &Rc<Self>) -> Result<(), ErrorCode> {
        self.clear_buffers()?;
        self.clear_format()?;
        Ok(())
    }

    /// Moves the node slot's result to the first active mix slot and
    /// asks the upstream peer for more data.
    pub(crate) fn mix_process_input(&self) -> u32 {
        let Some(io) = self.io() else {
            return 0;
        };
        if let Some(mix) = self.mixes.borrow().iter().find(|m| m.active.get()) {
            mix.io.set(io.status(), io.buffer_id());
            mix.io.set_status(STATUS_NEED_DATA);
        }
        PROCESS_HAVE_DATA | PROCESS_NEED_DATA
    }

    /// Tees the node slot to every active mix slot and marks the
    /// node slot ready for the next buffer.
    pub(crate) fn mix_process_output(&self) -> u32 {
        let Some(io) = self.io() else {
            return 0;
        };
        let status = io.status();
        let buffer_id = io.buffer_id();
        for mix in self.mixes.borrow().iter() {
            if mix.active.get() {
                mix.io.set(status, buffer_id);
            }
        }
        io.set(STATUS_NEED_DATA, INVALID_ID);
        if status == STATUS_HAVE_DATA {
            PROCESS_HAVE_DATA
        } else {
            PROCESS_NEED_DATA
        }
    }

    /// Fans a reusable buffer back out: the tee forwards to the
    /// node, the input mix forwards to the peer link.
    pub(crate) fn mix_reuse_buffer(&self, buffer_id: u32) {
        match self.direction {
            Direction::Output => {
                if let Some(node) = self.node.upgrade() {
                    let _ = node
                        .implementation
                        .port_reuse_buffer(self.id, buffer_id);
                }
            }
            Direction::Input => {
                for mix in self.mixes.borrow().iter() {
                    if mix.active.get() {
                        if let Some(link) = mix.link() {
                            link.return_output_buffer(buffer_id);
                        }
                        break;
                    }
                }
            }
        }
    }

    pub fn latency(&self, direction: Direction) -> Latency {
        self.latency[direction].get()
    }

    /// Re-aggregates peer latencies into one range per direction and
    /// pushes the result onto nodes that accept latency updates.
    pub(crate) fn recompute_latency(&self) {
        for direction in [Direction::Input, Direction::Output] {
            let mut total = Latency::default();
            let mut any = false;
            for mix in self.mixes.borrow().iter() {
                let Some(link) = mix.link() else {
                    continue;
                };
                let peer = match self.direction {
                    Direction::Input => link.output_port(),
                    Direction::Output => link.input_port(),
                };
                let peer_latency = peer.latency(direction);
                total.min_ns = total.min_ns.max(peer_latency.min_ns);
                total.max_ns = total.max_ns.max(peer_latency.max_ns);
                any = true;
            }
            if !any {
                continue;
            }
            self.latency[direction].set(total);
            self.push_latency(direction, total);
        }
    }

    fn push_latency(&self, direction: Direction, latency: Latency) {
        let Some(node) = self.node.upgrade() else {
            return;
        };
        let Ok(info) = node.implementation.port_get_info(self.direction, self.id) else {
            return;
        };
        if info.flags & PORT_FLAG_LATENCY_WRITE == 0 {
            return;
        }
        let mut b = PodBuilder::new();
        b.push_object(types::PARAM_LATENCY, 0, |b| {
            b.prop_id(types::KEY_LATENCY_DIRECTION, 0, &[direction.to_raw()]);
            b.prop_long(types::KEY_LATENCY_MIN_NS, 0, &[latency.min_ns as i64]);
            b.prop_long(types::KEY_LATENCY_MAX_NS, 0, &[latency.max_ns as i64]);
        });
        let _ = node
            .implementation
            .port_set_param(self.direction, self.id, b.as_slice());
    }
}
