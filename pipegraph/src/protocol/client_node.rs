//! The client-node interface.
//!
//! The server mirrors every node operation over this interface; the
//! client answers async operations with `done`. Buffer descriptions
//! reference memory ids announced earlier with `core.add_mem`.

use {
    super::{ProtocolError, parse_payload, push_fd, read_opt_pod, read_pod_list, read_props,
            take_fd, write_pod_list, write_props},
    crate::{
        buffers::{self, Buffer},
        connection::FdQueue,
        mem::MemPool,
        node_impl::{Direction, NodeCommand, PortImplInfo},
        pod::{PodBuilder, PodError},
        props::Properties,
    },
    std::{os::fd::OwnedFd, rc::Rc},
};

pub const INTERFACE: &str = "client-node";

pub const METHOD_DONE: u8 = 0;
pub const METHOD_UPDATE: u8 = 1;
pub const METHOD_PORT_UPDATE: u8 = 2;
pub const METHOD_DESTROY: u8 = 3;

pub const EVENT_ADD_PORT: u8 = 0;
pub const EVENT_REMOVE_PORT: u8 = 1;
pub const EVENT_SET_FORMAT: u8 = 2;
pub const EVENT_SET_PARAM: u8 = 3;
pub const EVENT_USE_BUFFERS: u8 = 4;
pub const EVENT_NODE_COMMAND: u8 = 5;
pub const EVENT_PORT_COMMAND: u8 = 6;
pub const EVENT_TRANSPORT: u8 = 7;

pub const UPDATE_MAX_INPUTS: u32 = 1 << 0;
pub const UPDATE_MAX_OUTPUTS: u32 = 1 << 1;
pub const UPDATE_PROPS: u32 = 1 << 2;

pub const PORT_UPDATE_POSSIBLE_FORMATS: u32 = 1 << 0;
pub const PORT_UPDATE_FORMAT: u32 = 1 << 1;
pub const PORT_UPDATE_PARAMS: u32 = 1 << 2;
pub const PORT_UPDATE_INFO: u32 = 1 << 3;

fn write_direction(b: &mut PodBuilder, direction: Direction) {
    b.uint(direction.to_raw());
}

fn read_direction(it: &mut crate::pod::PodIter<'_>) -> Result<Direction, PodError> {
    Direction::from_raw(it.uint()?).ok_or(PodError::InvalidValue)
}

#[derive(Debug)]
pub enum ClientNodeMethod {
    /// Completes an async operation the server requested.
    Done {
        seq: u32,
        res: i32,
    },
    Update {
        change_mask: u32,
        max_inputs: u32,
        max_outputs: u32,
        props: Properties,
    },
    PortUpdate {
        direction: Direction,
        port_id: u32,
        change_mask: u32,
        possible_formats: Vec<Vec<u8>>,
        format: Option<Vec<u8>>,
        params: Vec<Vec<u8>>,
        info: Option<PortImplInfo>,
    },
    Destroy,
}

impl ClientNodeMethod {
    pub fn opcode(&self) -> u8 {
        match self {
            ClientNodeMethod::Done { .. } => METHOD_DONE,
            ClientNodeMethod::Update { .. } => METHOD_UPDATE,
            ClientNodeMethod::PortUpdate { .. } => METHOD_PORT_UPDATE,
            ClientNodeMethod::Destroy => METHOD_DESTROY,
        }
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut b = PodBuilder::new();
        b.push_struct(|b| match self {
            ClientNodeMethod::Done { seq, res } => {
                b.uint(*seq);
                b.int(*res);
            }
            ClientNodeMethod::Update {
                change_mask,
                max_inputs,
                max_outputs,
                props,
            } => {
                b.uint(*change_mask);
                b.uint(*max_inputs);
                b.uint(*max_outputs);
                write_props(b, props);
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
                write_direction(b, *direction);
                b.uint(*port_id);
                b.uint(*change_mask);
                write_pod_list(b, possible_formats);
                b.option_raw(format.as_deref());
                write_pod_list(b, params);
                match info {
                    Some(info) => {
                        b.uint(info.flags);
                        b.uint(info.rate);
                    }
                    None => {
                        b.none();
                        b.none();
                    }
                }
            }
            ClientNodeMethod::Destroy => {}
        });
        b.into_vec()
    }

    pub fn demarshal(opcode: u8, payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut it = parse_payload(payload)?;
        let method = match opcode {
            METHOD_DONE => ClientNodeMethod::Done {
                seq: it.uint()?,
                res: it.int()?,
            },
            METHOD_UPDATE => ClientNodeMethod::Update {
                change_mask: it.uint()?,
                max_inputs: it.uint()?,
                max_outputs: it.uint()?,
                props: read_props(&mut it)?,
            },
            METHOD_PORT_UPDATE => {
                let direction = read_direction(&mut it)?;
                let port_id = it.uint()?;
                let change_mask = it.uint()?;
                let possible_formats = read_pod_list(&mut it)?;
                let format = read_opt_pod(&mut it)?;
                let params = read_pod_list(&mut it)?;
                let flags = it.pod()?;
                let info = if flags.is_none() {
                    it.pod()?;
                    None
                } else {
                    Some(PortImplInfo {
                        flags: flags.as_int()? as u32,
                        rate: it.uint()?,
                    })
                };
                ClientNodeMethod::PortUpdate {
                    direction,
                    port_id,
                    change_mask,
                    possible_formats,
                    format,
                    params,
                    info,
                }
            }
            METHOD_DESTROY => ClientNodeMethod::Destroy,
            opcode => {
                return Err(ProtocolError::UnknownOpcode {
                    interface: INTERFACE,
                    opcode,
                });
            }
        };
        Ok(method)
    }
}

/// A buffer ready to be described to the peer: the skeleton plus the
/// peer-local id and range of the region backing it.
pub struct WireBuffer {
    pub mem_id: u32,
    pub offset: u32,
    pub size: u32,
    pub buffer: Rc<Buffer>,
}

#[derive(Debug)]
pub enum ClientNodeEvent {
    AddPort {
        seq: u32,
        direction: Direction,
        port_id: u32,
    },
    RemovePort {
        seq: u32,
        direction: Direction,
        port_id: u32,
    },
    SetFormat {
        seq: u32,
        direction: Direction,
        port_id: u32,
        flags: u32,
        format: Option<Vec<u8>>,
    },
    SetParam {
        seq: u32,
        direction: Direction,
        port_id: u32,
        param: Vec<u8>,
    },
    UseBuffers {
        seq: u32,
        direction: Direction,
        port_id: u32,
        buffers: Vec<Rc<Buffer>>,
    },
    NodeCommand {
        seq: u32,
        command: NodeCommand,
    },
    PortCommand {
        direction: Direction,
        port_id: u32,
        command: NodeCommand,
    },
    Transport {
        read_fd: Rc<OwnedFd>,
        write_fd: Rc<OwnedFd>,
        mem_fd: Rc<OwnedFd>,
        offset: u32,
        size: u32,
    },
}

/// The marshalling input for `use_buffers`; the other events marshal
/// from [`ClientNodeEvent`] directly.
pub fn marshal_use_buffers(
    seq: u32,
    direction: Direction,
    port_id: u32,
    buffers: &[WireBuffer],
) -> Vec<u8> {
    let mut b = PodBuilder::new();
    b.push_struct(|b| {
        b.uint(seq);
        write_direction(b, direction);
        b.uint(port_id);
        b.uint(buffers.len() as u32);
        for wire in buffers {
            buffers::marshal_buffer(b, &wire.buffer, wire.mem_id, wire.offset, wire.size);
        }
    });
    b.into_vec()
}

impl ClientNodeEvent {
    pub fn opcode(&self) -> u8 {
        match self {
            ClientNodeEvent::AddPort { .. } => EVENT_ADD_PORT,
            ClientNodeEvent::RemovePort { .. } => EVENT_REMOVE_PORT,
            ClientNodeEvent::SetFormat { .. } => EVENT_SET_FORMAT,
            ClientNodeEvent::SetParam { .. } => EVENT_SET_PARAM,
            ClientNodeEvent::UseBuffers { .. } => EVENT_USE_BUFFERS,
            ClientNodeEvent::NodeCommand { .. } => EVENT_NODE_COMMAND,
            ClientNodeEvent::PortCommand { .. } => EVENT_PORT_COMMAND,
            ClientNodeEvent::Transport { .. } => EVENT_TRANSPORT,
        }
    }

    /// Marshals every event except `UseBuffers`, which needs its
    /// buffers pre-resolved, see [`marshal_use_buffers`].
    pub fn marshal(&self, fds: &mut Vec<Rc<OwnedFd>>) -> Vec<u8> {
        let mut b = PodBuilder::new();
        b.push_struct(|b| match self {
            ClientNodeEvent::AddPort {
                seq,
                direction,
                port_id,
            }
            | ClientNodeEvent::RemovePort {
                seq,
                direction,
                port_id,
            } => {
                b.uint(*seq);
                write_direction(b, *direction);
                b.uint(*port_id);
            }
            ClientNodeEvent::SetFormat {
                seq,
                direction,
                port_id,
                flags,
                format,
            } => {
                b.uint(*seq);
                write_direction(b, *direction);
                b.uint(*port_id);
                b.uint(*flags);
                b.option_raw(format.as_deref());
            }
            ClientNodeEvent::SetParam {
                seq,
                direction,
                port_id,
                param,
            } => {
                b.uint(*seq);
                write_direction(b, *direction);
                b.uint(*port_id);
                b.raw(param);
            }
            ClientNodeEvent::UseBuffers { .. } => {
                unreachable!("use_buffers is marshalled with marshal_use_buffers")
            }
            ClientNodeEvent::NodeCommand { seq, command } => {
                b.uint(*seq);
                command.marshal(b);
            }
            ClientNodeEvent::PortCommand {
                direction,
                port_id,
                command,
            } => {
                write_direction(b, *direction);
                b.uint(*port_id);
                command.marshal(b);
            }
            ClientNodeEvent::Transport {
                read_fd,
                write_fd,
                mem_fd,
                offset,
                size,
            } => {
                b.fd(push_fd(fds, read_fd.clone()));
                b.fd(push_fd(fds, write_fd.clone()));
                b.fd(push_fd(fds, mem_fd.clone()));
                b.uint(*offset);
                b.uint(*size);
            }
        });
        b.into_vec()
    }

    /// Demarshals an event; `pool` resolves buffer memory ids.
    pub fn demarshal(
        opcode: u8,
        payload: &[u8],
        fds: &FdQueue,
        pool: &MemPool,
    ) -> Result<Self, ProtocolError> {
        let mut it = parse_payload(payload)?;
        let event = match opcode {
            EVENT_ADD_PORT => ClientNodeEvent::AddPort {
                seq: it.uint()?,
                direction: read_direction(&mut it)?,
                port_id: it.uint()?,
            },
            EVENT_REMOVE_PORT => ClientNodeEvent::RemovePort {
                seq: it.uint()?,
                direction: read_direction(&mut it)?,
                port_id: it.uint()?,
            },
            EVENT_SET_FORMAT => ClientNodeEvent::SetFormat {
                seq: it.uint()?,
                direction: read_direction(&mut it)?,
                port_id: it.uint()?,
                flags: it.uint()?,
                format: read_opt_pod(&mut it)?,
            },
            EVENT_SET_PARAM => ClientNodeEvent::SetParam {
                seq: it.uint()?,
                direction: read_direction(&mut it)?,
                port_id: it.uint()?,
                param: it.pod()?.to_vec(),
            },
            EVENT_USE_BUFFERS => {
                let seq = it.uint()?;
                let direction = read_direction(&mut it)?;
                let port_id = it.uint()?;
                let n = it.uint()?;
                let buffers = (0..n)
                    .map(|_| buffers::demarshal_buffer(&mut it, pool))
                    .collect::<Result<_, _>>()?;
                ClientNodeEvent::UseBuffers {
                    seq,
                    direction,
                    port_id,
                    buffers,
                }
            }
            EVENT_NODE_COMMAND => {
                let seq = it.uint()?;
                let command = NodeCommand::demarshal(it.pod()?)?;
                ClientNodeEvent::NodeCommand { seq, command }
            }
            EVENT_PORT_COMMAND => {
                let direction = read_direction(&mut it)?;
                let port_id = it.uint()?;
                let command = NodeCommand::demarshal(it.pod()?)?;
                ClientNodeEvent::PortCommand {
                    direction,
                    port_id,
                    command,
                }
            }
            EVENT_TRANSPORT => ClientNodeEvent::Transport {
                read_fd: take_fd(fds, it.fd_index()?)?,
                write_fd: take_fd(fds, it.fd_index()?)?,
                mem_fd: take_fd(fds, it.fd_index()?)?,
                offset: it.uint()?,
                size: it.uint()?,
            },
            opcode => {
                return Err(ProtocolError::UnknownOpcode {
                    interface: INTERFACE,
                    opcode,
                });
            }
        };
        Ok(event)
    }
}
