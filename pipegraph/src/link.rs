//! Links between an output port and an input port.
//!
//! A link drives shared format negotiation, buffer allocation and
//! the staged activation of both endpoints. Its state machine
//! advances whenever either endpoint transitions; async operations
//! suspend the progression until the work queue routes their result
//! back.

use {
    crate::{
        buffers::{self, AllocatedBuffers, BufferSpec, Meta},
        context::Context,
        error::ErrorCode,
        format,
        global::Global,
        node::NodeState,
        node_impl::{
            Direction, OpResult, PORT_FLAG_CAN_ALLOC_BUFFERS, SET_FORMAT_NEAREST,
        },
        pod::Pod,
        port::{Port, PortMix, PortState},
        props::Properties,
        protocol::link::{LINK_CHANGE_FORMAT, LINK_CHANGE_STATE, LinkInfo},
        types,
    },
    std::{
        cell::{Cell, RefCell},
        rc::{Rc, Weak},
    },
};

#[cfg(test)]
mod tests;

#[derive(Copy, Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum LinkState {
    /// Terminal failure; see [`Link::error`].
    Error,
    /// One of the ports went away.
    Unlinked,
    Init,
    Negotiating,
    Allocating,
    Paused,
    Running,
}

impl LinkState {
    pub fn to_raw(self) -> i32 {
        match self {
            LinkState::Error => -2,
            LinkState::Unlinked => -1,
            LinkState::Init => 0,
            LinkState::Negotiating => 1,
            LinkState::Allocating => 2,
            LinkState::Paused => 3,
            LinkState::Running => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LinkState::Error => "error",
            LinkState::Unlinked => "unlinked",
            LinkState::Init => "init",
            LinkState::Negotiating => "negotiating",
            LinkState::Allocating => "allocating",
            LinkState::Paused => "paused",
            LinkState::Running => "running",
        }
    }
}

pub struct Link {
    pub(crate) context: Weak<Context>,
    pub(crate) entity: u64,
    pub(crate) global: RefCell<Option<Rc<Global>>>,
    output: Rc<Port>,
    input: Rc<Port>,
    out_mix: RefCell<Option<Rc<PortMix>>>,
    in_mix: RefCell<Option<Rc<PortMix>>>,
    state: Cell<LinkState>,
    error: RefCell<Option<String>>,
    filter: Option<Vec<u8>>,
    format: RefCell<Option<Vec<u8>>>,
    pub(crate) props: Properties,
    allocated: RefCell<Option<AllocatedBuffers>>,
    /// Outstanding async port operations.
    pending: Cell<u32>,
    active: Cell<bool>,
    checking: Cell<bool>,
}

impl Link {
    pub(crate) fn new(
        context: &Rc<Context>,
        output: Rc<Port>,
        input: Rc<Port>,
        filter: Option<Vec<u8>>,
        props: Properties,
    ) -> Rc<Link> {
        debug_assert_eq!(output.direction, Direction::Output);
        debug_assert_eq!(input.direction, Direction::Input);
        let link = Rc::new(Link {
            context: Rc::downgrade(context),
            entity: context.alloc_entity(),
            global: RefCell::new(None),
            output: output.clone(),
            input: input.clone(),
            out_mix: RefCell::new(None),
            in_mix: RefCell::new(None),
            state: Cell::new(LinkState::Init),
            error: RefCell::new(None),
            filter,
            format: RefCell::new(None),
            props,
            allocated: RefCell::new(None),
            pending: Cell::new(0),
            active: Cell::new(false),
            checking: Cell::new(false),
        });
        *link.out_mix.borrow_mut() = Some(output.init_mix(&link));
        *link.in_mix.borrow_mut() = Some(input.init_mix(&link));
        output.recompute_latency();
        input.recompute_latency();
        link
    }

    pub fn state(&self) -> LinkState {
        self.state.get()
    }

    pub fn error(&self) -> Option<String> {
        self.error.borrow().clone()
    }

    pub fn format(&self) -> Option<Vec<u8>> {
        self.format.borrow().clone()
    }

    pub fn output_port(&self) -> Rc<Port> {
        self.output.clone()
    }

    pub fn input_port(&self) -> Rc<Port> {
        self.input.clone()
    }

    pub(crate) fn out_mix(&self) -> Option<Rc<PortMix>> {
        self.out_mix.borrow().clone()
    }

    pub(crate) fn in_mix(&self) -> Option<Rc<PortMix>> {
        self.in_mix.borrow().clone()
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.get()
    }

    fn set_link_state(&self, state: LinkState, mask: u32) {
        if self.state.replace(state) == state {
            return;
        }
        log::debug!("link {} -> {}", self.entity, state.as_str());
        if let Some(context) = self.context.upgrade() {
            context.emit_link_info(self, mask | LINK_CHANGE_STATE);
        }
    }

    /// Starts driving the link toward `RUNNING`.
    pub(crate) fn activate(self: &Rc<Self>) {
        if self.active.replace(true) {
            return;
        }
        for mix in [self.out_mix(), self.in_mix()].into_iter().flatten() {
            mix.active.set(true);
        }
        self.check_states();
    }

    /// Returns the link to `PAUSED` and lets idle nodes wind down.
    pub(crate) fn deactivate(self: &Rc<Self>) {
        if !self.active.replace(false) {
            return;
        }
        for mix in [self.out_mix(), self.in_mix()].into_iter().flatten() {
            mix.active.set(false);
        }
        if self.state.get() == LinkState::Running {
            self.output.leave_streaming();
            self.input.leave_streaming();
            self.set_link_state(LinkState::Paused, 0);
        }
        for port in [&self.output, &self.input] {
            if let Some(node) = port.node.upgrade() {
                let any_active = node.links().iter().any(|l| l.is_active());
                if !any_active {
                    node.set_state(NodeState::Idle);
                }
            }
        }
    }

    /// Advances the state machine as far as the current port states
    /// allow. Re-entered whenever an endpoint or async operation
    /// completes.
    pub(crate) fn check_states(self: &Rc<Self>) {
        if matches!(self.state.get(), LinkState::Error | LinkState::Unlinked) {
            return;
        }
        if self.pending.get() > 0 || self.checking.replace(true) {
            return;
        }
        let res = self.advance();
        self.checking.set(false);
        if let Err(message) = res {
            self.set_error(message);
        }
    }

    fn advance(self: &Rc<Self>) -> Result<(), String> {
        if self.output.state() == PortState::Configure
            || self.input.state() == PortState::Configure
        {
            self.set_link_state(LinkState::Negotiating, 0);
            let format = self.negotiate_format()?;
            *self.format.borrow_mut() = Some(format.clone());
            if let Some(context) = self.context.upgrade() {
                context.emit_link_info(self, LINK_CHANGE_FORMAT);
            }
            for port in [&self.output, &self.input] {
                if port.state() == PortState::Configure {
                    self.drive_port_format(port, format.clone())?;
                }
            }
            if self.pending.get() > 0 {
                return Ok(());
            }
        }
        if self.output.state() == PortState::Ready && self.input.state() == PortState::Ready {
            self.set_link_state(LinkState::Allocating, 0);
            self.allocate()?;
            if self.pending.get() > 0 {
                return Ok(());
            }
        }
        if self.output.state() >= PortState::Paused
            && self.input.state() >= PortState::Paused
            && self.state.get() < LinkState::Paused
        {
            self.set_link_state(LinkState::Paused, 0);
        }
        if self.state.get() == LinkState::Paused && self.active.get() {
            for port in [&self.output, &self.input] {
                if let Some(node) = port.node.upgrade() {
                    node.set_state(NodeState::Running);
                }
            }
            if self.output.state() == PortState::Streaming
                && self.input.state() == PortState::Streaming
            {
                self.set_link_state(LinkState::Running, 0);
            }
        }
        Ok(())
    }

    /// Enumerates the output side filtered by the input side and the
    /// link's own filter, returning the first fixated match in the
    /// output's enumeration order.
    fn negotiate_format(&self) -> Result<Vec<u8>, String> {
        let out_node = self.output.node.upgrade().ok_or("the output node is gone")?;
        let in_node = self.input.node.upgrade().ok_or("the input node is gone")?;
        let mut out_index = 0;
        loop {
            let out_format = out_node
                .implementation
                .port_enum_formats(Direction::Output, self.output.id, out_index, None)
                .map_err(|e| format!("output formats: {e}"))?;
            let Some(out_format) = out_format else {
                return Err("no common format between the linked ports".to_string());
            };
            out_index += 1;
            let out_format = match &self.filter {
                Some(link_filter) => {
                    let a = Pod::from_slice(&out_format).map_err(|e| e.to_string())?;
                    let b = Pod::from_slice(link_filter).map_err(|e| e.to_string())?;
                    match format::filter(a, b) {
                        Ok(f) => f,
                        Err(_) => continue,
                    }
                }
                None => out_format,
            };
            let mut in_index = 0;
            loop {
                let in_format = in_node
                    .implementation
                    .port_enum_formats(Direction::Input, self.input.id, in_index, None)
                    .map_err(|e| format!("input formats: {e}"))?;
                let Some(in_format) = in_format else {
                    break;
                };
                in_index += 1;
                let a = Pod::from_slice(&out_format).map_err(|e| e.to_string())?;
                let b = Pod::from_slice(&in_format).map_err(|e| e.to_string())?;
                let Ok(common) = format::filter(a, b) else {
                    continue;
                };
                let fixated = format::fixate(Pod::from_slice(&common).map_err(|e| e.to_string())?)
                    .map_err(|e| format!("could not fixate the negotiated format: {e}"))?;
                return Ok(fixated);
            }
        }
    }

    fn drive_port_format(self: &Rc<Self>, port: &Rc<Port>, format: Vec<u8>) -> Result<(), String> {
        let node = port.node.upgrade().ok_or("the port's node is gone")?;
        let res = node.implementation.port_set_format(
            port.direction,
            port.id,
            SET_FORMAT_NEAREST,
            Some(&format),
        );
        match res {
            Ok(OpResult::Done) => {
                port.apply_format(Some(format));
                Ok(())
            }
            Ok(OpResult::Async(seq)) => {
                self.park(node.entity, seq, {
                    let port = port.clone();
                    move |link, res| {
                        if res < 0 {
                            link.set_error(format!("the peer rejected the format: {res}"));
                            return;
                        }
                        port.apply_format(Some(format));
                        link.check_states();
                    }
                });
                Ok(())
            }
            Err(code) => Err(format!(
                "{} port rejected the format: {code}",
                port.direction
            )),
        }
    }

    /// Parks a continuation for an async operation and counts it as
    /// pending.
    fn park(
        self: &Rc<Self>,
        owner: u64,
        seq: u32,
        then: impl FnOnce(&Rc<Link>, i32) + 'static,
    ) {
        let Some(context) = self.context.upgrade() else {
            return;
        };
        self.pending.set(self.pending.get() + 1);
        let weak = Rc::downgrade(self);
        context.work.add(owner, seq, move |res| {
            let Some(link) = weak.upgrade() else {
                return;
            };
            link.pending.set(link.pending.get() - 1);
            then(&link, res);
        });
    }

    /// Merges the `Buffers` constraints of both sides.
    fn buffer_spec(&self) -> Result<(BufferSpec, Vec<Meta>), String> {
        let mut spec = BufferSpec::default();
        let mut metas = Vec::new();
        let mut saw_spec = false;
        for port in [&self.output, &self.input] {
            let node = port.node.upgrade().ok_or("a node is gone")?;
            let param = node
                .implementation
                .port_enum_params(port.direction, port.id, types::PARAM_BUFFERS, 0, None)
                .map_err(|e| format!("buffer params: {e}"))?;
            if let Some(param) = param {
                let pod = Pod::from_slice(&param).map_err(|e| e.to_string())?;
                let side = buffers::parse_param_buffers(pod).map_err(|e| e.to_string())?;
                if saw_spec {
                    spec.size = spec.size.max(side.size);
                    spec.n_buffers = spec.n_buffers.min(side.n_buffers).max(1);
                    spec.stride = spec.stride.max(side.stride);
                    spec.align = spec.align.max(side.align);
                } else {
                    spec = side;
                    saw_spec = true;
                }
            }
            let meta = node
                .implementation
                .port_enum_params(port.direction, port.id, types::PARAM_META_ENABLE, 0, None)
                .map_err(|e| format!("meta params: {e}"))?;
            if let Some(meta) = meta {
                let pod = Pod::from_slice(&meta).map_err(|e| e.to_string())?;
                let obj = pod.as_object().map_err(|e| e.to_string())?;
                let ty = obj
                    .find(types::KEY_META_TYPE)
                    .map_err(|e| e.to_string())?
                    .map(|p| p.first().and_then(|v| v.as_id()))
                    .transpose()
                    .map_err(|e| e.to_string())?;
                let size = obj
                    .find(types::KEY_META_SIZE)
                    .map_err(|e| e.to_string())?
                    .map(|p| p.first().and_then(|v| v.as_int()))
                    .transpose()
                    .map_err(|e| e.to_string())?;
                if let (Some(ty), Some(size)) = (ty, size)
                    && ty != types::META_SHARED
                    && !metas.iter().any(|m: &Meta| m.ty == ty)
                {
                    metas.push(Meta {
                        ty,
                        size: size as u32,
                    });
                }
            }
            let padding = node
                .implementation
                .port_enum_params(port.direction, port.id, types::PARAM_VIDEO_PADDING, 0, None)
                .map_err(|e| format!("padding params: {e}"))?;
            if let Some(padding) = padding {
                let pod = Pod::from_slice(&padding).map_err(|e| e.to_string())?;
                let obj = pod.as_object().map_err(|e| e.to_string())?;
                if let Some(prop) = obj.find(types::KEY_VIDEO_PADDING).map_err(|e| e.to_string())?
                    && let Ok(pad) = prop.first().and_then(|v| v.as_int())
                {
                    spec.size += pad as u32;
                }
            }
        }
        Ok((spec, metas))
    }

    /// Allocates the buffer set and hands it to both sides. The
    /// output side allocates when it can; the memory itself always
    /// comes from the daemon's pool so both sides share one sealed
    /// memfd.
    fn allocate(self: &Rc<Self>) -> Result<(), String> {
        let context = self.context.upgrade().ok_or("the context is gone")?;
        let (spec, metas) = self.buffer_spec()?;
        let allocated = buffers::alloc_buffers(&context.pool, &spec, &metas)
            .map_err(|e| format!("could not allocate buffers: {e}"))?;
        let buffer_list = allocated.buffers.clone();
        *self.allocated.borrow_mut() = Some(allocated);
        for port in [&self.output, &self.input] {
            let node = port.node.upgrade().ok_or("a node is gone")?;
            let info = node
                .implementation
                .port_get_info(port.direction, port.id)
                .map_err(|e| format!("port info: {e}"))?;
            let res = if port.direction == Direction::Output
                && info.flags & PORT_FLAG_CAN_ALLOC_BUFFERS != 0
            {
                node.implementation.port_alloc_buffers(
                    port.direction,
                    port.id,
                    &[buffers::param_buffers(&spec)],
                    buffer_list.clone(),
                )
            } else {
                node.implementation
                    .port_use_buffers(port.direction, port.id, buffer_list.clone())
            };
            match res {
                Ok(OpResult::Done) => port.apply_buffers(buffer_list.clone()),
                Ok(OpResult::Async(seq)) => {
                    let port = port.clone();
                    let buffer_list = buffer_list.clone();
                    self.park(node.entity, seq, move |link, res| {
                        if res < 0 {
                            link.set_error(format!("the peer rejected the buffers: {res}"));
                            return;
                        }
                        port.apply_buffers(buffer_list);
                        link.check_states();
                    });
                }
                Err(ErrorCode::NotSupported) => {
                    return Err(format!(
                        "the {} port cannot take buffers",
                        port.direction
                    ));
                }
                Err(code) => return Err(format!("buffer setup failed: {code}")),
            }
        }
        Ok(())
    }

    /// Gives a buffer back to the producing output side.
    pub(crate) fn return_output_buffer(&self, buffer_id: u32) {
        if let Some(node) = self.output.node.upgrade() {
            let _ = node
                .implementation
                .port_reuse_buffer(self.output.id, buffer_id);
        }
    }

    pub(crate) fn set_error(self: &Rc<Self>, message: impl Into<String>) {
        let message = message.into();
        log::warn!("link {} failed: {message}", self.entity);
        *self.error.borrow_mut() = Some(message.clone());
        self.set_link_state(LinkState::Error, 0);
        if let Some(context) = self.context.upgrade() {
            context.surface_link_error(self, &message);
        }
    }

    /// One of the ports is going away; the link tears down.
    pub(crate) fn port_unlinked(self: &Rc<Self>, port: &Rc<Port>) {
        log::debug!(
            "link {}: port {}:{} unlinked",
            self.entity,
            port.direction,
            port.id
        );
        self.unlink();
    }

    pub(crate) fn unlink(self: &Rc<Self>) {
        if matches!(self.state.get(), LinkState::Unlinked) {
            return;
        }
        self.active.set(false);
        if let Some(mix) = self.out_mix.borrow_mut().take() {
            self.output.release_mix(&mix);
        }
        if let Some(mix) = self.in_mix.borrow_mut().take() {
            self.input.release_mix(&mix);
        }
        self.allocated.borrow_mut().take();
        if let Some(context) = self.context.upgrade() {
            context.work.cancel(self.entity);
        }
        self.set_link_state(LinkState::Unlinked, 0);
    }

    pub(crate) fn info(&self) -> LinkInfo {
        let node_id = |port: &Port| {
            port.node
                .upgrade()
                .map(|n| n.global_id())
                .unwrap_or(crate::pod::INVALID_ID)
        };
        LinkInfo {
            id: self
                .global
                .borrow()
                .as_ref()
                .map(|g| g.id)
                .unwrap_or(crate::pod::INVALID_ID),
            change_mask: 0,
            output_node_id: node_id(&self.output),
            output_port_id: self.output.id,
            input_node_id: node_id(&self.input),
            input_port_id: self.input.id,
            state: self.state.get().to_raw(),
            format: self.format.borrow().clone(),
        }
    }
}
