//! In-process daemon/client pairs for tests.
//!
//! Both ends share one event loop and talk over a socketpair; tests
//! pump the loop until a recorded condition holds. The data loop is
//! the real second thread, so transport tests exercise the actual
//! eventfd path.

use {
    crate::{
        buffers::{Buffer, BufferSpec, param_buffers},
        client::Client,
        context::Context,
        error::ErrorCode,
        event_loop::EventLoop,
        format::audio_raw_enum,
        node_impl::{
            Direction, IoHandle, NodeCommand, NodeImpl, NodeImplEvents, OpResult,
            PORT_FLAG_CAN_USE_BUFFERS, PROCESS_HAVE_DATA, PROCESS_NEED_DATA, PortCounts,
            PortImplInfo,
        },
        pod::{INVALID_ID, Pod},
        props::Properties,
        protocol::{
            core::CoreInfo,
            link::LinkInfo,
            node::NodeInfo,
        },
        remote::{Remote, RemoteHandler},
        transport::{STATUS_HAVE_DATA, STATUS_NEED_DATA},
        types,
    },
    std::{
        cell::{Cell, RefCell},
        os::fd::OwnedFd,
        rc::Rc,
        time::{Duration, Instant},
    },
    uapi::c,
};

/// Everything the recording handler observed, in delivery order.
#[derive(Debug)]
pub(crate) enum TestEvent {
    CoreInfo(CoreInfo),
    Done(u32),
    Error { id: u32, res: i32, message: String },
    Global { registry_id: u32, id: u32, type_name: String, version: u32 },
    GlobalRemove { registry_id: u32, id: u32 },
    NodeInfo { proxy_id: u32, info: NodeInfo },
    LinkInfo { proxy_id: u32, info: LinkInfo },
    RemovedId(u32),
}

#[derive(Default)]
pub(crate) struct Record {
    pub events: RefCell<Vec<TestEvent>>,
}

impl Record {
    pub fn dones(&self) -> Vec<u32> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                TestEvent::Done(seq) => Some(*seq),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<(u32, i32, String)> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                TestEvent::Error { id, res, message } => Some((*id, *res, message.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn globals(&self) -> Vec<(u32, String, u32)> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                TestEvent::Global {
                    id,
                    type_name,
                    version,
                    ..
                } => Some((*id, type_name.clone(), *version)),
                _ => None,
            })
            .collect()
    }

    pub fn find_global(&self, type_name: &str) -> Option<u32> {
        self.globals()
            .iter()
            .find(|(_, t, _)| t == type_name)
            .map(|(id, _, _)| *id)
    }

    pub fn removed_ids(&self) -> Vec<u32> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                TestEvent::RemovedId(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    pub fn node_infos(&self) -> Vec<(u32, NodeInfo)> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                TestEvent::NodeInfo { proxy_id, info } => Some((*proxy_id, info.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn link_infos(&self) -> Vec<(u32, LinkInfo)> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                TestEvent::LinkInfo { proxy_id, info } => Some((*proxy_id, info.clone())),
                _ => None,
            })
            .collect()
    }
}

pub(crate) struct RecordingHandler(pub Rc<Record>);

impl RemoteHandler for RecordingHandler {
    fn core_info(&mut self, info: &CoreInfo) {
        self.0.events.borrow_mut().push(TestEvent::CoreInfo(info.clone()));
    }

    fn done(&mut self, seq: u32) {
        self.0.events.borrow_mut().push(TestEvent::Done(seq));
    }

    fn error(&mut self, id: u32, res: i32, message: &str) {
        self.0.events.borrow_mut().push(TestEvent::Error {
            id,
            res,
            message: message.to_string(),
        });
    }

    fn global(&mut self, registry_id: u32, id: u32, type_name: &str, version: u32) {
        self.0.events.borrow_mut().push(TestEvent::Global {
            registry_id,
            id,
            type_name: type_name.to_string(),
            version,
        });
    }

    fn global_remove(&mut self, registry_id: u32, id: u32) {
        self.0
            .events
            .borrow_mut()
            .push(TestEvent::GlobalRemove { registry_id, id });
    }

    fn node_info(&mut self, proxy_id: u32, info: &NodeInfo) {
        self.0.events.borrow_mut().push(TestEvent::NodeInfo {
            proxy_id,
            info: info.clone(),
        });
    }

    fn link_info(&mut self, proxy_id: u32, info: &LinkInfo) {
        self.0.events.borrow_mut().push(TestEvent::LinkInfo {
            proxy_id,
            info: info.clone(),
        });
    }

    fn removed_id(&mut self, id: u32) {
        self.0.events.borrow_mut().push(TestEvent::RemovedId(id));
    }
}

pub(crate) struct TestPair {
    pub event_loop: Rc<EventLoop>,
    pub context: Rc<Context>,
    pub client: Rc<Client>,
    pub remote: Rc<Remote>,
    pub record: Rc<Record>,
}

pub(crate) fn socketpair() -> (OwnedFd, OwnedFd) {
    let (a, b) = uapi::socketpair(
        c::AF_UNIX,
        c::SOCK_STREAM | c::SOCK_NONBLOCK | c::SOCK_CLOEXEC,
        0,
    )
    .unwrap();
    (a.into(), b.into())
}

pub(crate) fn test_pair() -> TestPair {
    let _ = env_logger::builder().is_test(true).try_init();
    let event_loop = Rc::new(EventLoop::new().unwrap());
    let context = Context::new(&event_loop, Properties::new()).unwrap();
    let (server_end, client_end) = socketpair();
    let client = context.add_client(server_end).unwrap();
    let remote = Remote::connect_fd(&event_loop, client_end).unwrap();
    let record = Rc::new(Record::default());
    remote.set_handler(RecordingHandler(record.clone()));
    TestPair {
        event_loop,
        context,
        client,
        remote,
        record,
    }
}

impl TestPair {
    /// Adds a second client on the same loop.
    pub fn second_remote(&self) -> (Rc<Remote>, Rc<Record>) {
        let (server_end, client_end) = socketpair();
        self.context.add_client(server_end).unwrap();
        let remote = Remote::connect_fd(&self.event_loop, client_end).unwrap();
        let record = Rc::new(Record::default());
        remote.set_handler(RecordingHandler(record.clone()));
        (remote, record)
    }

    pub fn pump(&self) {
        for _ in 0..20 {
            self.event_loop
                .iterate(Some(Duration::from_millis(1)))
                .unwrap();
        }
    }

    /// Pumps the loop until `cond` holds or the timeout expires.
    pub fn pump_until(&self, cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            self.event_loop
                .iterate(Some(Duration::from_millis(5)))
                .unwrap();
        }
        cond()
    }

    /// A full `sync` round-trip.
    pub fn round_trip(&self, seq: u32) {
        self.remote.sync(seq);
        assert!(
            self.pump_until(|| self.record.dones().contains(&seq)),
            "sync({seq}) never completed"
        );
    }
}

/// A minimal processing node with one port, used on both the host
/// and the client side of tests.
pub(crate) struct TestNode {
    direction: Direction,
    formats: Vec<Vec<u8>>,
    format: RefCell<Option<Vec<u8>>>,
    buffers: RefCell<Vec<Rc<Buffer>>>,
    io: RefCell<Option<IoHandle>>,
    events: RefCell<Option<Rc<dyn NodeImplEvents>>>,
    pub commands: RefCell<Vec<NodeCommand>>,
    /// Buffer ids seen by `process_input`.
    pub consumed: RefCell<Vec<u32>>,
    /// Number of `process_output` calls.
    pub produced: Cell<u32>,
    pub reused: RefCell<Vec<(u32, u32)>>,
    buffer_spec: BufferSpec,
}

impl TestNode {
    pub fn with_formats(direction: Direction, formats: Vec<Vec<u8>>) -> Rc<TestNode> {
        Rc::new(TestNode {
            direction,
            formats,
            format: RefCell::new(None),
            buffers: RefCell::new(Vec::new()),
            io: RefCell::new(None),
            events: RefCell::new(None),
            commands: RefCell::new(Vec::new()),
            consumed: RefCell::new(Vec::new()),
            produced: Cell::new(0),
            reused: RefCell::new(Vec::new()),
            buffer_spec: BufferSpec {
                n_buffers: 4,
                size: 4096,
                stride: 0,
                align: 16,
            },
        })
    }

    /// A node with one output port producing stereo float.
    pub fn source(rates: &[i32]) -> Rc<TestNode> {
        Self::with_formats(
            Direction::Output,
            vec![audio_raw_enum(&[types::AUDIO_F32], rates, 2)],
        )
    }

    /// A node with one input port accepting stereo float.
    pub fn sink(rates: &[i32]) -> Rc<TestNode> {
        Self::with_formats(
            Direction::Input,
            vec![audio_raw_enum(&[types::AUDIO_F32], rates, 2)],
        )
    }

    pub fn current_format(&self) -> Option<Vec<u8>> {
        self.format.borrow().clone()
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.borrow().len()
    }

    pub fn io(&self) -> Option<IoHandle> {
        self.io.borrow().clone()
    }
}

impl NodeImpl for TestNode {
    fn get_n_ports(&self) -> PortCounts {
        match self.direction {
            Direction::Input => PortCounts {
                n_inputs: 1,
                max_inputs: 1,
                n_outputs: 0,
                max_outputs: 0,
            },
            Direction::Output => PortCounts {
                n_inputs: 0,
                max_inputs: 0,
                n_outputs: 1,
                max_outputs: 1,
            },
        }
    }

    fn get_port_ids(&self, direction: Direction) -> Vec<u32> {
        if direction == self.direction {
            vec![0]
        } else {
            Vec::new()
        }
    }

    fn port_enum_formats(
        &self,
        direction: Direction,
        port_id: u32,
        index: u32,
        _filter: Option<Pod<'_>>,
    ) -> Result<Option<Vec<u8>>, ErrorCode> {
        if direction != self.direction || port_id != 0 {
            return Err(ErrorCode::InvalidArgument);
        }
        Ok(self.formats.get(index as usize).cloned())
    }

    fn port_set_format(
        &self,
        direction: Direction,
        port_id: u32,
        _flags: u32,
        format: Option<&[u8]>,
    ) -> Result<OpResult, ErrorCode> {
        if direction != self.direction || port_id != 0 {
            return Err(ErrorCode::InvalidArgument);
        }
        *self.format.borrow_mut() = format.map(|f| f.to_vec());
        Ok(OpResult::Done)
    }

    fn port_get_format(
        &self,
        direction: Direction,
        port_id: u32,
    ) -> Result<Option<Vec<u8>>, ErrorCode> {
        if direction != self.direction || port_id != 0 {
            return Err(ErrorCode::InvalidArgument);
        }
        Ok(self.format.borrow().clone())
    }

    fn port_get_info(
        &self,
        direction: Direction,
        port_id: u32,
    ) -> Result<PortImplInfo, ErrorCode> {
        if direction != self.direction || port_id != 0 {
            return Err(ErrorCode::InvalidArgument);
        }
        Ok(PortImplInfo {
            flags: PORT_FLAG_CAN_USE_BUFFERS,
            rate: 48000,
        })
    }

    fn port_enum_params(
        &self,
        direction: Direction,
        port_id: u32,
        param_id: u32,
        index: u32,
        _filter: Option<Pod<'_>>,
    ) -> Result<Option<Vec<u8>>, ErrorCode> {
        if direction != self.direction || port_id != 0 {
            return Err(ErrorCode::InvalidArgument);
        }
        if param_id == types::PARAM_BUFFERS && index == 0 {
            return Ok(Some(param_buffers(&self.buffer_spec)));
        }
        Ok(None)
    }

    fn port_use_buffers(
        &self,
        direction: Direction,
        port_id: u32,
        buffers: Vec<Rc<Buffer>>,
    ) -> Result<OpResult, ErrorCode> {
        if direction != self.direction || port_id != 0 {
            return Err(ErrorCode::InvalidArgument);
        }
        *self.buffers.borrow_mut() = buffers;
        Ok(OpResult::Done)
    }

    fn port_set_io(
        &self,
        direction: Direction,
        port_id: u32,
        io: Option<IoHandle>,
    ) -> Result<(), ErrorCode> {
        if direction != self.direction || port_id != 0 {
            return Err(ErrorCode::InvalidArgument);
        }
        *self.io.borrow_mut() = io;
        Ok(())
    }

    fn port_reuse_buffer(&self, port_id: u32, buffer_id: u32) -> Result<(), ErrorCode> {
        self.reused.borrow_mut().push((port_id, buffer_id));
        Ok(())
    }

    fn send_command(&self, command: &NodeCommand) -> Result<OpResult, ErrorCode> {
        self.commands.borrow_mut().push(*command);
        Ok(OpResult::Done)
    }

    fn process_input(&self) -> Result<u32, ErrorCode> {
        let Some(io) = self.io.borrow().clone() else {
            return Err(ErrorCode::NotSupported);
        };
        if io.status() == STATUS_HAVE_DATA {
            self.consumed.borrow_mut().push(io.buffer_id());
            io.set(STATUS_NEED_DATA, INVALID_ID);
        }
        Ok(PROCESS_NEED_DATA)
    }

    fn process_output(&self) -> Result<u32, ErrorCode> {
        let Some(io) = self.io.borrow().clone() else {
            return Err(ErrorCode::NotSupported);
        };
        let n = self.produced.get();
        self.produced.set(n + 1);
        let n_buffers = self.buffers.borrow().len().max(1) as u32;
        io.set(STATUS_HAVE_DATA, n % n_buffers);
        Ok(PROCESS_HAVE_DATA)
    }

    fn set_events(&self, events: Rc<dyn NodeImplEvents>) {
        *self.events.borrow_mut() = Some(events);
    }
}
