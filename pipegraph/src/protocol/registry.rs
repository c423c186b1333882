//! The registry interface: streams globals to a subscribed client.

use {
    super::{ProtocolError, parse_payload},
    crate::pod::PodBuilder,
};

pub const INTERFACE: &str = "registry";

pub const METHOD_BIND: u8 = 0;

pub const EVENT_GLOBAL: u8 = 0;
pub const EVENT_GLOBAL_REMOVE: u8 = 1;

#[derive(Debug)]
pub enum RegistryMethod {
    /// Binds to the global `id`, creating the client-chosen `new_id`
    /// resource with the requested `version`.
    Bind { id: u32, version: u32, new_id: u32 },
}

impl RegistryMethod {
    pub fn opcode(&self) -> u8 {
        match self {
            RegistryMethod::Bind { .. } => METHOD_BIND,
        }
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut b = PodBuilder::new();
        b.push_struct(|b| match self {
            RegistryMethod::Bind {
                id,
                version,
                new_id,
            } => {
                b.uint(*id);
                b.uint(*version);
                b.uint(*new_id);
            }
        });
        b.into_vec()
    }

    pub fn demarshal(opcode: u8, payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut it = parse_payload(payload)?;
        match opcode {
            METHOD_BIND => Ok(RegistryMethod::Bind {
                id: it.uint()?,
                version: it.uint()?,
                new_id: it.uint()?,
            }),
            opcode => Err(ProtocolError::UnknownOpcode {
                interface: INTERFACE,
                opcode,
            }),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RegistryEvent {
    Global {
        id: u32,
        type_name: String,
        version: u32,
    },
    GlobalRemove {
        id: u32,
    },
}

impl RegistryEvent {
    pub fn opcode(&self) -> u8 {
        match self {
            RegistryEvent::Global { .. } => EVENT_GLOBAL,
            RegistryEvent::GlobalRemove { .. } => EVENT_GLOBAL_REMOVE,
        }
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut b = PodBuilder::new();
        b.push_struct(|b| match self {
            RegistryEvent::Global {
                id,
                type_name,
                version,
            } => {
                b.uint(*id);
                b.string(type_name);
                b.uint(*version);
            }
            RegistryEvent::GlobalRemove { id } => b.uint(*id),
        });
        b.into_vec()
    }

    pub fn demarshal(opcode: u8, payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut it = parse_payload(payload)?;
        match opcode {
            EVENT_GLOBAL => Ok(RegistryEvent::Global {
                id: it.uint()?,
                type_name: it.string()?.to_string(),
                version: it.uint()?,
            }),
            EVENT_GLOBAL_REMOVE => Ok(RegistryEvent::GlobalRemove { id: it.uint()? }),
            opcode => Err(ProtocolError::UnknownOpcode {
                interface: INTERFACE,
                opcode,
            }),
        }
    }
}
