//! The node capability consumed by the graph.
//!
//! Implementations come from the plugin host or, for client nodes,
//! from the protocol proxy in [`client_node`](crate::client_node).
//! Every operation can complete synchronously or return
//! [`OpResult::Async`] with a sequence number that is completed later
//! through [`NodeImplEvents::async_complete`] and the work queue.

use {
    crate::{
        buffers::Buffer,
        error::ErrorCode,
        pod::Pod,
        transport::{IoSlot, Transport},
        types,
    },
    linearize::Linearize,
    std::{
        cell::Cell,
        fmt,
        rc::Rc,
        sync::{
            Arc,
            atomic::{AtomicI32, AtomicU32, Ordering::SeqCst},
        },
    },
};

/// The direction of a port.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Linearize)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::Input => Direction::Output,
            Direction::Output => Direction::Input,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Input => "input",
            Direction::Output => "output",
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            Direction::Input => 0,
            Direction::Output => 1,
        }
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Direction::Input),
            1 => Some(Direction::Output),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The synchronous half of an operation result. Async completions
/// carry the sequence number their result will arrive under.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OpResult {
    Done,
    Async(u32),
}

/// Process status bits returned by `process_input`/`process_output`.
pub const PROCESS_NEED_DATA: u32 = 1 << 0;
pub const PROCESS_HAVE_DATA: u32 = 1 << 1;

/// Port info flags.
pub const PORT_FLAG_CAN_USE_BUFFERS: u32 = 1 << 0;
pub const PORT_FLAG_CAN_ALLOC_BUFFERS: u32 = 1 << 1;
pub const PORT_FLAG_REMOVABLE: u32 = 1 << 2;
/// The node accepts latency updates on this port.
pub const PORT_FLAG_LATENCY_WRITE: u32 = 1 << 3;

/// `port_set_format` flag: pick the nearest supported format rather
/// than failing on an imperfect match.
pub const SET_FORMAT_NEAREST: u32 = 1 << 0;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PortCounts {
    pub n_inputs: u32,
    pub max_inputs: u32,
    pub n_outputs: u32,
    pub max_outputs: u32,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PortImplInfo {
    pub flags: u32,
    pub rate: u32,
}

/// A command delivered to a node with `send_command`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NodeCommand {
    Pause,
    Start,
    Flush,
    ClockUpdate { now_ns: u64 },
}

impl NodeCommand {
    pub fn type_id(&self) -> u32 {
        match self {
            NodeCommand::Pause => types::COMMAND_PAUSE,
            NodeCommand::Start => types::COMMAND_START,
            NodeCommand::Flush => types::COMMAND_FLUSH,
            NodeCommand::ClockUpdate { .. } => types::COMMAND_CLOCK_UPDATE,
        }
    }

    pub fn marshal(&self, b: &mut crate::pod::PodBuilder) {
        b.push_struct(|b| {
            b.id(self.type_id());
            if let NodeCommand::ClockUpdate { now_ns } = self {
                b.long(*now_ns as i64);
            }
        });
    }

    pub fn demarshal(pod: Pod<'_>) -> Result<Self, crate::pod::PodError> {
        let mut it = pod.as_struct()?;
        let type_id = it.id()?;
        Ok(match type_id {
            types::COMMAND_PAUSE => NodeCommand::Pause,
            types::COMMAND_START => NodeCommand::Start,
            types::COMMAND_FLUSH => NodeCommand::Flush,
            types::COMMAND_CLOCK_UPDATE => NodeCommand::ClockUpdate {
                now_ns: it.long()? as u64,
            },
            _ => return Err(crate::pod::PodError::InvalidValue),
        })
    }
}

/// A reference to the I/O slot wired to a port.
///
/// Host slots live on the owning loop's thread; shared slots cross
/// loops via atomics; area slots live inside a transport region.
#[derive(Clone)]
pub enum IoHandle {
    Host(Rc<HostIo>),
    Shared(Arc<SharedIo>),
    Area {
        transport: Arc<Transport>,
        direction: Direction,
        index: u32,
    },
}

#[derive(Default)]
pub struct HostIo {
    status: Cell<i32>,
    buffer_id: Cell<u32>,
}

#[derive(Default)]
pub struct SharedIo {
    status: AtomicI32,
    buffer_id: AtomicU32,
}

impl IoHandle {
    pub fn host() -> Self {
        let io = HostIo::default();
        io.buffer_id.set(crate::pod::INVALID_ID);
        IoHandle::Host(Rc::new(io))
    }

    pub fn shared() -> Self {
        let io = SharedIo::default();
        io.buffer_id.store(crate::pod::INVALID_ID, SeqCst);
        IoHandle::Shared(Arc::new(io))
    }

    fn area_slot<'a>(transport: &'a Transport, direction: Direction, index: u32) -> Option<&'a IoSlot> {
        match direction {
            Direction::Input => transport.input_io(index).ok(),
            Direction::Output => transport.output_io(index).ok(),
        }
    }

    pub fn status(&self) -> i32 {
        match self {
            IoHandle::Host(io) => io.status.get(),
            IoHandle::Shared(io) => io.status.load(SeqCst),
            IoHandle::Area {
                transport,
                direction,
                index,
            } => Self::area_slot(transport, *direction, *index)
                .map(|s| s.status())
                .unwrap_or(0),
        }
    }

    pub fn buffer_id(&self) -> u32 {
        match self {
            IoHandle::Host(io) => io.buffer_id.get(),
            IoHandle::Shared(io) => io.buffer_id.load(SeqCst),
            IoHandle::Area {
                transport,
                direction,
                index,
            } => Self::area_slot(transport, *direction, *index)
                .map(|s| s.buffer_id())
                .unwrap_or(crate::pod::INVALID_ID),
        }
    }

    pub fn set(&self, status: i32, buffer_id: u32) {
        match self {
            IoHandle::Host(io) => {
                io.status.set(status);
                io.buffer_id.set(buffer_id);
            }
            IoHandle::Shared(io) => {
                io.buffer_id.store(buffer_id, SeqCst);
                io.status.store(status, SeqCst);
            }
            IoHandle::Area {
                transport,
                direction,
                index,
            } => {
                if let Some(slot) = Self::area_slot(transport, *direction, *index) {
                    slot.set(status, buffer_id);
                }
            }
        }
    }

    pub fn set_status(&self, status: i32) {
        self.set(status, self.buffer_id());
    }
}

/// Callbacks a node implementation delivers to the graph.
pub trait NodeImplEvents: 'static {
    /// The implementation's port set or properties changed; the
    /// graph re-queries them.
    fn ports_changed(&self) {}

    /// An input port ran out of data.
    fn need_input(&self) {}

    /// An output port produced data.
    fn have_output(&self) {}

    /// An output buffer can be reused by its producer.
    fn reuse_buffer(&self, port_id: u32, buffer_id: u32) {
        let _ = port_id;
        let _ = buffer_id;
    }

    /// The result of an earlier [`OpResult::Async`] operation.
    fn async_complete(&self, seq: u32, res: i32) {
        let _ = seq;
        let _ = res;
    }
}

/// The operations a node implementation provides, see the module
/// docs.
pub trait NodeImpl: 'static {
    fn get_n_ports(&self) -> PortCounts;

    fn get_port_ids(&self, direction: Direction) -> Vec<u32>;

    fn add_port(&self, direction: Direction, port_id: u32) -> Result<(), ErrorCode> {
        let _ = direction;
        let _ = port_id;
        Err(ErrorCode::NotSupported)
    }

    fn remove_port(&self, direction: Direction, port_id: u32) -> Result<(), ErrorCode> {
        let _ = direction;
        let _ = port_id;
        Err(ErrorCode::NotSupported)
    }

    /// Streams the supported formats of a port; `None` once `index`
    /// runs past the last one.
    fn port_enum_formats(
        &self,
        direction: Direction,
        port_id: u32,
        index: u32,
        filter: Option<Pod<'_>>,
    ) -> Result<Option<Vec<u8>>, ErrorCode>;

    fn port_set_format(
        &self,
        direction: Direction,
        port_id: u32,
        flags: u32,
        format: Option<&[u8]>,
    ) -> Result<OpResult, ErrorCode>;

    fn port_get_format(
        &self,
        direction: Direction,
        port_id: u32,
    ) -> Result<Option<Vec<u8>>, ErrorCode>;

    fn port_get_info(&self, direction: Direction, port_id: u32)
    -> Result<PortImplInfo, ErrorCode>;

    fn port_enum_params(
        &self,
        direction: Direction,
        port_id: u32,
        param_id: u32,
        index: u32,
        filter: Option<Pod<'_>>,
    ) -> Result<Option<Vec<u8>>, ErrorCode> {
        let _ = (direction, port_id, param_id, index, filter);
        Ok(None)
    }

    fn port_set_param(
        &self,
        direction: Direction,
        port_id: u32,
        param: &[u8],
    ) -> Result<OpResult, ErrorCode> {
        let _ = (direction, port_id, param);
        Err(ErrorCode::NotSupported)
    }

    fn port_use_buffers(
        &self,
        direction: Direction,
        port_id: u32,
        buffers: Vec<Rc<Buffer>>,
    ) -> Result<OpResult, ErrorCode>;

    fn port_alloc_buffers(
        &self,
        direction: Direction,
        port_id: u32,
        params: &[Vec<u8>],
        buffers: Vec<Rc<Buffer>>,
    ) -> Result<OpResult, ErrorCode> {
        let _ = (direction, port_id, params, buffers);
        Err(ErrorCode::NotSupported)
    }

    fn port_set_io(
        &self,
        direction: Direction,
        port_id: u32,
        io: Option<IoHandle>,
    ) -> Result<(), ErrorCode>;

    /// The I/O slot the implementation wants wired to a port, when
    /// it manages its own slots. Client nodes hand out their
    /// transport area slots here.
    fn port_preferred_io(&self, direction: Direction, port_id: u32) -> Option<IoHandle> {
        let _ = (direction, port_id);
        None
    }

    fn port_reuse_buffer(&self, port_id: u32, buffer_id: u32) -> Result<(), ErrorCode> {
        let _ = (port_id, buffer_id);
        Ok(())
    }

    fn send_command(&self, command: &NodeCommand) -> Result<OpResult, ErrorCode>;

    fn process_input(&self) -> Result<u32, ErrorCode>;

    fn process_output(&self) -> Result<u32, ErrorCode>;

    fn set_events(&self, events: Rc<dyn NodeImplEvents>);
}
