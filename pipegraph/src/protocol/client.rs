//! The client interface: the daemon-side record of a peer, bindable
//! through the registry.

use {
    super::{ProtocolError, parse_payload, read_props, write_props},
    crate::{pod::PodBuilder, props::Properties},
};

pub const INTERFACE: &str = "client";

pub const EVENT_INFO: u8 = 0;

pub const CLIENT_CHANGE_PROPS: u32 = 1 << 0;
pub const CLIENT_CHANGE_ALL: u32 = CLIENT_CHANGE_PROPS;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ClientInfo {
    pub id: u32,
    pub change_mask: u32,
    pub props: Properties,
}

#[derive(Debug)]
pub enum ClientEvent {
    Info(ClientInfo),
}

impl ClientEvent {
    pub fn opcode(&self) -> u8 {
        match self {
            ClientEvent::Info(_) => EVENT_INFO,
        }
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut b = PodBuilder::new();
        b.push_struct(|b| match self {
            ClientEvent::Info(info) => {
                b.uint(info.id);
                b.uint(info.change_mask);
                write_props(b, &info.props);
            }
        });
        b.into_vec()
    }

    pub fn demarshal(opcode: u8, payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut it = parse_payload(payload)?;
        match opcode {
            EVENT_INFO => Ok(ClientEvent::Info(ClientInfo {
                id: it.uint()?,
                change_mask: it.uint()?,
                props: read_props(&mut it)?,
            })),
            opcode => Err(ProtocolError::UnknownOpcode {
                interface: INTERFACE,
                opcode,
            }),
        }
    }
}
