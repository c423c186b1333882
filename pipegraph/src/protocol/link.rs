//! The link interface: info events for bound link resources.

use {
    super::{ProtocolError, parse_payload, read_opt_pod},
    crate::pod::PodBuilder,
};

pub const INTERFACE: &str = "link";

pub const EVENT_INFO: u8 = 0;

pub const LINK_CHANGE_FORMAT: u32 = 1 << 0;
pub const LINK_CHANGE_STATE: u32 = 1 << 1;
pub const LINK_CHANGE_ALL: u32 = LINK_CHANGE_FORMAT | LINK_CHANGE_STATE;

#[derive(Clone, Debug, Default)]
pub struct LinkInfo {
    pub id: u32,
    pub change_mask: u32,
    pub output_node_id: u32,
    pub output_port_id: u32,
    pub input_node_id: u32,
    pub input_port_id: u32,
    /// The raw link state, see `LinkState::to_raw`.
    pub state: i32,
    pub format: Option<Vec<u8>>,
}

#[derive(Debug)]
pub enum LinkEvent {
    Info(LinkInfo),
}

impl LinkEvent {
    pub fn opcode(&self) -> u8 {
        match self {
            LinkEvent::Info(_) => EVENT_INFO,
        }
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut b = PodBuilder::new();
        b.push_struct(|b| match self {
            LinkEvent::Info(info) => {
                b.uint(info.id);
                b.uint(info.change_mask);
                b.uint(info.output_node_id);
                b.uint(info.output_port_id);
                b.uint(info.input_node_id);
                b.uint(info.input_port_id);
                b.int(info.state);
                b.option_raw(info.format.as_deref());
            }
        });
        b.into_vec()
    }

    pub fn demarshal(opcode: u8, payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut it = parse_payload(payload)?;
        match opcode {
            EVENT_INFO => Ok(LinkEvent::Info(LinkInfo {
                id: it.uint()?,
                change_mask: it.uint()?,
                output_node_id: it.uint()?,
                output_port_id: it.uint()?,
                input_node_id: it.uint()?,
                input_port_id: it.uint()?,
                state: it.int()?,
                format: read_opt_pod(&mut it)?,
            })),
            opcode => Err(ProtocolError::UnknownOpcode {
                interface: INTERFACE,
                opcode,
            }),
        }
    }
}
