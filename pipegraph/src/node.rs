//! Graph nodes.
//!
//! A node wraps a [`NodeImpl`] capability and owns its ports. State
//! changes go through the underlying implementation and complete
//! asynchronously via the work queue.

use {
    crate::{
        context::Context,
        global::Global,
        node_impl::{Direction, NodeCommand, NodeImpl, NodeImplEvents, OpResult, PortCounts},
        port::Port,
        props::Properties,
        protocol::node::{NODE_CHANGE_ALL, NodeInfo},
    },
    error_reporter::Report,
    std::{
        cell::{Cell, RefCell},
        collections::BTreeMap,
        rc::{Rc, Weak},
    },
    uapi::c,
};

#[cfg(test)]
mod tests;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NodeState {
    Error,
    Creating,
    Suspended,
    Idle,
    Running,
}

impl NodeState {
    pub fn to_raw(self) -> i32 {
        match self {
            NodeState::Error => -1,
            NodeState::Creating => 0,
            NodeState::Suspended => 1,
            NodeState::Idle => 2,
            NodeState::Running => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeState::Error => "error",
            NodeState::Creating => "creating",
            NodeState::Suspended => "suspended",
            NodeState::Idle => "idle",
            NodeState::Running => "running",
        }
    }
}

pub struct Node {
    pub(crate) context: Weak<Context>,
    /// Work-queue owner id.
    pub(crate) entity: u64,
    pub(crate) name: RefCell<String>,
    pub(crate) props: RefCell<Properties>,
    pub(crate) implementation: Rc<dyn NodeImpl>,
    pub(crate) global: RefCell<Option<Rc<Global>>>,
    /// The client that owns this node, for client nodes.
    pub(crate) owner: RefCell<Option<Weak<crate::client::Client>>>,
    state: Cell<NodeState>,
    error: RefCell<Option<String>>,
    pub(crate) input_ports: RefCell<BTreeMap<u32, Rc<Port>>>,
    pub(crate) output_ports: RefCell<BTreeMap<u32, Rc<Port>>>,
    counts: Cell<PortCounts>,
}

struct EventsBridge {
    node: Weak<Node>,
}

impl NodeImplEvents for EventsBridge {
    fn ports_changed(&self) {
        if let Some(node) = self.node.upgrade() {
            node.sync_ports();
        }
    }

    fn async_complete(&self, seq: u32, res: i32) {
        let Some(node) = self.node.upgrade() else {
            return;
        };
        let Some(context) = node.context.upgrade() else {
            return;
        };
        if !context.work.complete(node.entity, seq, res) {
            log::debug!("async completion {seq} on node {:?} had no continuation", node.name());
        }
    }

    fn reuse_buffer(&self, port_id: u32, buffer_id: u32) {
        if let Some(node) = self.node.upgrade() {
            node.return_input_buffer(port_id, buffer_id);
        }
    }
}

impl Node {
    pub(crate) fn new(
        context: &Rc<Context>,
        name: &str,
        implementation: Rc<dyn NodeImpl>,
        props: Properties,
    ) -> Rc<Node> {
        let node = Rc::new(Node {
            context: Rc::downgrade(context),
            entity: context.alloc_entity(),
            name: RefCell::new(name.to_string()),
            props: RefCell::new(props),
            implementation,
            global: RefCell::new(None),
            owner: RefCell::new(None),
            state: Cell::new(NodeState::Creating),
            error: RefCell::new(None),
            input_ports: Default::default(),
            output_ports: Default::default(),
            counts: Cell::new(PortCounts::default()),
        });
        node.implementation.set_events(Rc::new(EventsBridge {
            node: Rc::downgrade(&node),
        }));
        node.sync_ports();
        node.state.set(NodeState::Suspended);
        node
    }

    pub fn name(&self) -> String {
        self.name.borrow().clone()
    }

    pub fn state(&self) -> NodeState {
        self.state.get()
    }

    pub fn error(&self) -> Option<String> {
        self.error.borrow().clone()
    }

    pub(crate) fn global_id(&self) -> u32 {
        self.global
            .borrow()
            .as_ref()
            .map(|g| g.id)
            .unwrap_or(crate::pod::INVALID_ID)
    }

    pub(crate) fn ports(&self, direction: Direction) -> &RefCell<BTreeMap<u32, Rc<Port>>> {
        match direction {
            Direction::Input => &self.input_ports,
            Direction::Output => &self.output_ports,
        }
    }

    pub fn port(&self, direction: Direction, port_id: u32) -> Option<Rc<Port>> {
        self.ports(direction).borrow().get(&port_id).cloned()
    }

    /// Reconciles the port set with what the implementation reports.
    pub(crate) fn sync_ports(self: &Rc<Self>) {
        self.counts.set(self.implementation.get_n_ports());
        for direction in [Direction::Input, Direction::Output] {
            let ids = self.implementation.get_port_ids(direction);
            let stale: Vec<Rc<Port>> = {
                let ports = self.ports(direction).borrow();
                ports
                    .values()
                    .filter(|p| !ids.contains(&p.id))
                    .cloned()
                    .collect()
            };
            for port in stale {
                self.remove_port(&port);
            }
            for id in ids {
                match self.port(direction, id) {
                    None => {
                        let port = Port::new(self, direction, id);
                        self.ports(direction).borrow_mut().insert(id, port);
                    }
                    Some(port) => {
                        // Client nodes may have renegotiated their
                        // transport; adopt the fresh slots.
                        if self
                            .implementation
                            .port_preferred_io(direction, id)
                            .is_some()
                        {
                            port.rewire_io();
                        }
                    }
                }
            }
        }
        self.emit_info(NODE_CHANGE_ALL);
    }

    fn remove_port(self: &Rc<Self>, port: &Rc<Port>) {
        // Tears down any link still attached to the port.
        for mix in port.mixes.borrow().clone() {
            if let Some(link) = mix.link() {
                link.port_unlinked(port);
            }
        }
        self.ports(port.direction).borrow_mut().remove(&port.id);
    }

    /// The links attached to any port of this node.
    pub(crate) fn links(&self) -> Vec<Rc<crate::link::Link>> {
        let mut links = Vec::new();
        for ports in [&self.input_ports, &self.output_ports] {
            for port in ports.borrow().values() {
                for mix in port.mixes.borrow().iter() {
                    if let Some(link) = mix.link() {
                        if !links.iter().any(|l| Rc::ptr_eq(l, &link)) {
                            links.push(link);
                        }
                    }
                }
            }
        }
        links
    }

    pub(crate) fn set_error(self: &Rc<Self>, message: impl Into<String>) {
        let message = message.into();
        log::warn!("node {:?} failed: {}", self.name(), message);
        *self.error.borrow_mut() = Some(message);
        self.state.set(NodeState::Error);
        for link in self.links() {
            link.set_error("the attached node failed");
        }
        self.emit_info(NODE_CHANGE_ALL);
    }

    fn send_command_then(
        self: &Rc<Self>,
        command: NodeCommand,
        then: impl FnOnce(&Rc<Node>, i32) + 'static,
    ) {
        match self.implementation.send_command(&command) {
            Ok(OpResult::Done) => then(self, 0),
            Ok(OpResult::Async(seq)) => {
                let Some(context) = self.context.upgrade() else {
                    return;
                };
                let weak = Rc::downgrade(self);
                context.work.add(self.entity, seq, move |res| {
                    if let Some(node) = weak.upgrade() {
                        then(&node, res);
                    }
                });
            }
            Err(code) => self.set_error(format!("{command:?} failed: {code}")),
        }
    }

    /// Drives the node toward `target`. Completion is asynchronous;
    /// attached links re-check their state when it lands.
    pub(crate) fn set_state(self: &Rc<Self>, target: NodeState) {
        let current = self.state.get();
        if current == target || current == NodeState::Error {
            return;
        }
        match target {
            NodeState::Suspended => {
                self.send_command_then(NodeCommand::Pause, move |node, res| {
                    node.finish_state_change(NodeState::Suspended, res);
                });
            }
            NodeState::Idle => {
                self.send_command_then(NodeCommand::Pause, move |node, res| {
                    node.finish_state_change(NodeState::Idle, res);
                });
            }
            NodeState::Running => {
                for link in self.links() {
                    link.activate();
                }
                let now_ns = monotonic_ns();
                self.send_command_then(NodeCommand::ClockUpdate { now_ns }, |_, _| {});
                self.send_command_then(NodeCommand::Start, move |node, res| {
                    node.finish_state_change(NodeState::Running, res);
                });
            }
            NodeState::Creating | NodeState::Error => {}
        }
    }

    fn finish_state_change(self: &Rc<Self>, target: NodeState, res: i32) {
        if self.state.get() == NodeState::Error {
            return;
        }
        if res < 0 {
            self.set_error(format!(
                "state change to {} failed with {res}",
                target.as_str()
            ));
            return;
        }
        self.state.set(target);
        match target {
            NodeState::Suspended => {
                for ports in [&self.input_ports, &self.output_ports] {
                    for port in ports.borrow().values() {
                        if let Err(e) = port.reset_to_configure() {
                            log::warn!("could not reset a port: {}", Report::new(e));
                        }
                    }
                }
            }
            NodeState::Running => {
                for ports in [&self.input_ports, &self.output_ports] {
                    for port in ports.borrow().values() {
                        port.enter_streaming();
                    }
                }
            }
            _ => {}
        }
        self.emit_info(crate::protocol::node::NODE_CHANGE_STATE);
        for link in self.links() {
            link.check_states();
        }
    }

    /// Routes a consumed input buffer back to the producing peer.
    pub(crate) fn return_input_buffer(&self, port_id: u32, buffer_id: u32) {
        let Some(port) = self.port(Direction::Input, port_id) else {
            return;
        };
        port.mix_reuse_buffer(buffer_id);
    }

    pub(crate) fn info(&self) -> NodeInfo {
        let counts = self.counts.get();
        let collect = |ports: &RefCell<BTreeMap<u32, Rc<Port>>>| {
            ports
                .borrow()
                .values()
                .filter_map(|p| p.format())
                .collect::<Vec<_>>()
        };
        NodeInfo {
            id: self.global_id(),
            change_mask: 0,
            name: self.name(),
            max_inputs: counts.max_inputs,
            n_inputs: counts.n_inputs,
            input_formats: collect(&self.input_ports),
            max_outputs: counts.max_outputs,
            n_outputs: counts.n_outputs,
            output_formats: collect(&self.output_ports),
            state: self.state.get().to_raw(),
            error: self.error.borrow().clone(),
            props: self.props.borrow().clone(),
        }
    }

    pub(crate) fn emit_info(&self, change_mask: u32) {
        if let Some(context) = self.context.upgrade() {
            context.emit_node_info(self, change_mask);
        }
    }
}

fn monotonic_ns() -> u64 {
    let mut ts = c::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: plain syscall into a local timespec.
    unsafe {
        c::clock_gettime(c::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}
