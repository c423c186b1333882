//! The core interface, object id 0 on both sides.

use {
    super::{
        ProtocolError, parse_payload, push_fd, read_opt_pod, read_props, write_props,
    },
    crate::{
        connection::FdQueue,
        pod::PodBuilder,
        props::Properties,
    },
    std::{os::fd::OwnedFd, rc::Rc},
};

pub const INTERFACE: &str = "core";

pub const METHOD_UPDATE_TYPES: u8 = 0;
pub const METHOD_SYNC: u8 = 1;
pub const METHOD_GET_REGISTRY: u8 = 2;
pub const METHOD_CLIENT_UPDATE: u8 = 3;
pub const METHOD_CREATE_NODE: u8 = 4;
pub const METHOD_CREATE_LINK: u8 = 5;
pub const METHOD_DESTROY: u8 = 6;

pub const EVENT_UPDATE_TYPES: u8 = 0;
pub const EVENT_DONE: u8 = 1;
pub const EVENT_ERROR: u8 = 2;
pub const EVENT_REMOVE_ID: u8 = 3;
pub const EVENT_INFO: u8 = 4;
pub const EVENT_ADD_MEM: u8 = 5;
pub const EVENT_REMOVE_MEM: u8 = 6;

#[derive(Debug)]
pub enum CoreMethod {
    UpdateTypes {
        first_id: u32,
        types: Vec<String>,
    },
    Sync {
        seq: u32,
    },
    GetRegistry {
        new_id: u32,
    },
    ClientUpdate {
        props: Properties,
    },
    CreateNode {
        factory: String,
        name: String,
        props: Properties,
        new_id: u32,
    },
    CreateLink {
        output_node: u32,
        output_port: u32,
        input_node: u32,
        input_port: u32,
        filter: Option<Vec<u8>>,
        props: Properties,
        new_id: u32,
    },
    /// Asks the server to destroy the resource with the given id.
    /// The server confirms with `remove_id`.
    Destroy {
        id: u32,
    },
}

impl CoreMethod {
    pub fn opcode(&self) -> u8 {
        match self {
            CoreMethod::UpdateTypes { .. } => METHOD_UPDATE_TYPES,
            CoreMethod::Sync { .. } => METHOD_SYNC,
            CoreMethod::GetRegistry { .. } => METHOD_GET_REGISTRY,
            CoreMethod::ClientUpdate { .. } => METHOD_CLIENT_UPDATE,
            CoreMethod::CreateNode { .. } => METHOD_CREATE_NODE,
            CoreMethod::CreateLink { .. } => METHOD_CREATE_LINK,
            CoreMethod::Destroy { .. } => METHOD_DESTROY,
        }
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut b = PodBuilder::new();
        b.push_struct(|b| match self {
            CoreMethod::UpdateTypes { first_id, types } => {
                b.uint(*first_id);
                b.uint(types.len() as u32);
                for ty in types {
                    b.string(ty);
                }
            }
            CoreMethod::Sync { seq } => b.uint(*seq),
            CoreMethod::GetRegistry { new_id } => b.uint(*new_id),
            CoreMethod::ClientUpdate { props } => write_props(b, props),
            CoreMethod::CreateNode {
                factory,
                name,
                props,
                new_id,
            } => {
                b.string(factory);
                b.string(name);
                write_props(b, props);
                b.uint(*new_id);
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
                b.uint(*output_node);
                b.uint(*output_port);
                b.uint(*input_node);
                b.uint(*input_port);
                b.option_raw(filter.as_deref());
                write_props(b, props);
                b.uint(*new_id);
            }
            CoreMethod::Destroy { id } => b.uint(*id),
        });
        b.into_vec()
    }

    pub fn demarshal(opcode: u8, payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut it = parse_payload(payload)?;
        let method = match opcode {
            METHOD_UPDATE_TYPES => {
                let first_id = it.uint()?;
                let n = it.uint()?;
                let types = (0..n)
                    .map(|_| Ok(it.string()?.to_string()))
                    .collect::<Result<_, ProtocolError>>()?;
                CoreMethod::UpdateTypes { first_id, types }
            }
            METHOD_SYNC => CoreMethod::Sync { seq: it.uint()? },
            METHOD_GET_REGISTRY => CoreMethod::GetRegistry { new_id: it.uint()? },
            METHOD_CLIENT_UPDATE => CoreMethod::ClientUpdate {
                props: read_props(&mut it)?,
            },
            METHOD_CREATE_NODE => CoreMethod::CreateNode {
                factory: it.string()?.to_string(),
                name: it.string()?.to_string(),
                props: read_props(&mut it)?,
                new_id: it.uint()?,
            },
            METHOD_CREATE_LINK => CoreMethod::CreateLink {
                output_node: it.uint()?,
                output_port: it.uint()?,
                input_node: it.uint()?,
                input_port: it.uint()?,
                filter: read_opt_pod(&mut it)?,
                props: read_props(&mut it)?,
                new_id: it.uint()?,
            },
            METHOD_DESTROY => CoreMethod::Destroy { id: it.uint()? },
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

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CoreInfo {
    pub change_mask: u32,
    pub user_name: String,
    pub host_name: String,
    pub version: String,
    pub name: String,
    pub cookie: u32,
    pub generation: u64,
    pub props: Properties,
}

pub const CORE_CHANGE_PROPS: u32 = 1 << 0;
pub const CORE_CHANGE_ALL: u32 = CORE_CHANGE_PROPS;

#[derive(Debug)]
pub enum CoreEvent {
    UpdateTypes {
        first_id: u32,
        types: Vec<String>,
    },
    Done {
        seq: u32,
    },
    Error {
        id: u32,
        res: i32,
        message: String,
    },
    RemoveId {
        id: u32,
    },
    Info(CoreInfo),
    AddMem {
        mem_id: u32,
        mem_type: u32,
        fd: Rc<OwnedFd>,
        flags: u32,
        offset: u32,
        size: u32,
    },
    RemoveMem {
        mem_id: u32,
    },
}

impl CoreEvent {
    pub fn opcode(&self) -> u8 {
        match self {
            CoreEvent::UpdateTypes { .. } => EVENT_UPDATE_TYPES,
            CoreEvent::Done { .. } => EVENT_DONE,
            CoreEvent::Error { .. } => EVENT_ERROR,
            CoreEvent::RemoveId { .. } => EVENT_REMOVE_ID,
            CoreEvent::Info(_) => EVENT_INFO,
            CoreEvent::AddMem { .. } => EVENT_ADD_MEM,
            CoreEvent::RemoveMem { .. } => EVENT_REMOVE_MEM,
        }
    }

    pub fn marshal(&self, fds: &mut Vec<Rc<OwnedFd>>) -> Vec<u8> {
        let mut b = PodBuilder::new();
        b.push_struct(|b| match self {
            CoreEvent::UpdateTypes { first_id, types } => {
                b.uint(*first_id);
                b.uint(types.len() as u32);
                for ty in types {
                    b.string(ty);
                }
            }
            CoreEvent::Done { seq } => b.uint(*seq),
            CoreEvent::Error { id, res, message } => {
                b.uint(*id);
                b.int(*res);
                b.string(message);
            }
            CoreEvent::RemoveId { id } => b.uint(*id),
            CoreEvent::Info(info) => {
                b.uint(info.change_mask);
                b.string(&info.user_name);
                b.string(&info.host_name);
                b.string(&info.version);
                b.string(&info.name);
                b.uint(info.cookie);
                b.long(info.generation as i64);
                write_props(b, &info.props);
            }
            CoreEvent::AddMem {
                mem_id,
                mem_type,
                fd,
                flags,
                offset,
                size,
            } => {
                b.uint(*mem_id);
                b.id(*mem_type);
                b.fd(push_fd(fds, fd.clone()));
                b.uint(*flags);
                b.uint(*offset);
                b.uint(*size);
            }
            CoreEvent::RemoveMem { mem_id } => b.uint(*mem_id),
        });
        b.into_vec()
    }

    pub fn demarshal(opcode: u8, payload: &[u8], fds: &FdQueue) -> Result<Self, ProtocolError> {
        let mut it = parse_payload(payload)?;
        let event = match opcode {
            EVENT_UPDATE_TYPES => {
                let first_id = it.uint()?;
                let n = it.uint()?;
                let types = (0..n)
                    .map(|_| Ok(it.string()?.to_string()))
                    .collect::<Result<_, ProtocolError>>()?;
                CoreEvent::UpdateTypes { first_id, types }
            }
            EVENT_DONE => CoreEvent::Done { seq: it.uint()? },
            EVENT_ERROR => CoreEvent::Error {
                id: it.uint()?,
                res: it.int()?,
                message: it.string()?.to_string(),
            },
            EVENT_REMOVE_ID => CoreEvent::RemoveId { id: it.uint()? },
            EVENT_INFO => CoreEvent::Info(CoreInfo {
                change_mask: it.uint()?,
                user_name: it.string()?.to_string(),
                host_name: it.string()?.to_string(),
                version: it.string()?.to_string(),
                name: it.string()?.to_string(),
                cookie: it.uint()?,
                generation: it.long()? as u64,
                props: read_props(&mut it)?,
            }),
            EVENT_ADD_MEM => CoreEvent::AddMem {
                mem_id: it.uint()?,
                mem_type: it.id()?,
                fd: super::take_fd(fds, it.fd_index()?)?,
                flags: it.uint()?,
                offset: it.uint()?,
                size: it.uint()?,
            },
            EVENT_REMOVE_MEM => CoreEvent::RemoveMem { mem_id: it.uint()? },
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
