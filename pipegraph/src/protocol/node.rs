//! The node interface: info events for bound node resources.

use {
    super::{ProtocolError, parse_payload, read_opt_pod, read_pod_list, read_props, write_pod_list,
            write_props},
    crate::{pod::PodBuilder, props::Properties},
};

pub const INTERFACE: &str = "node";

pub const EVENT_INFO: u8 = 0;

pub const NODE_CHANGE_INPUTS: u32 = 1 << 0;
pub const NODE_CHANGE_OUTPUTS: u32 = 1 << 1;
pub const NODE_CHANGE_STATE: u32 = 1 << 2;
pub const NODE_CHANGE_PROPS: u32 = 1 << 3;
pub const NODE_CHANGE_ALL: u32 =
    NODE_CHANGE_INPUTS | NODE_CHANGE_OUTPUTS | NODE_CHANGE_STATE | NODE_CHANGE_PROPS;

#[derive(Clone, Debug, Default)]
pub struct NodeInfo {
    pub id: u32,
    pub change_mask: u32,
    pub name: String,
    pub max_inputs: u32,
    pub n_inputs: u32,
    pub input_formats: Vec<Vec<u8>>,
    pub max_outputs: u32,
    pub n_outputs: u32,
    pub output_formats: Vec<Vec<u8>>,
    /// The raw node state, see `NodeState::to_raw`.
    pub state: i32,
    pub error: Option<String>,
    pub props: Properties,
}

#[derive(Debug)]
pub enum NodeEvent {
    Info(NodeInfo),
}

impl NodeEvent {
    pub fn opcode(&self) -> u8 {
        match self {
            NodeEvent::Info(_) => EVENT_INFO,
        }
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut b = PodBuilder::new();
        b.push_struct(|b| match self {
            NodeEvent::Info(info) => {
                b.uint(info.id);
                b.uint(info.change_mask);
                b.string(&info.name);
                b.uint(info.max_inputs);
                b.uint(info.n_inputs);
                write_pod_list(b, &info.input_formats);
                b.uint(info.max_outputs);
                b.uint(info.n_outputs);
                write_pod_list(b, &info.output_formats);
                b.int(info.state);
                match &info.error {
                    Some(e) => b.string(e),
                    None => b.none(),
                }
                write_props(b, &info.props);
            }
        });
        b.into_vec()
    }

    pub fn demarshal(opcode: u8, payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut it = parse_payload(payload)?;
        match opcode {
            EVENT_INFO => {
                let id = it.uint()?;
                let change_mask = it.uint()?;
                let name = it.string()?.to_string();
                let max_inputs = it.uint()?;
                let n_inputs = it.uint()?;
                let input_formats = read_pod_list(&mut it)?;
                let max_outputs = it.uint()?;
                let n_outputs = it.uint()?;
                let output_formats = read_pod_list(&mut it)?;
                let state = it.int()?;
                let error = read_opt_pod(&mut it)?;
                let error = match error {
                    Some(pod) => Some(
                        crate::pod::Pod::from_slice(&pod)?
                            .as_str()?
                            .to_string(),
                    ),
                    None => None,
                };
                let props = read_props(&mut it)?;
                Ok(NodeEvent::Info(NodeInfo {
                    id,
                    change_mask,
                    name,
                    max_inputs,
                    n_inputs,
                    input_formats,
                    max_outputs,
                    n_outputs,
                    output_formats,
                    state,
                    error,
                    props,
                }))
            }
            opcode => Err(ProtocolError::UnknownOpcode {
                interface: INTERFACE,
                opcode,
            }),
        }
    }
}
