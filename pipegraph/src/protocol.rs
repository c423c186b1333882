//! The wire protocol.
//!
//! Every interface gets one module with a method enum (what the
//! client calls) and an event enum (what the server emits), each
//! with `marshal`/`demarshal` and opcode constants. Payloads are a
//! single pod struct; fd-valued arguments encode the index of the fd
//! in the ancillary queue of their message.

use {
    crate::{
        buffers::BufferError,
        connection::FdQueue,
        pod::{Pod, PodBuilder, PodError, PodIter},
        props::Properties,
    },
    std::{os::fd::OwnedFd, rc::Rc},
    thiserror::Error,
};

pub mod client;
pub mod client_node;
pub mod core;
pub mod link;
pub mod node;
pub mod registry;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown opcode {opcode} on interface {interface}")]
    UnknownOpcode {
        interface: &'static str,
        opcode: u8,
    },
    #[error("could not parse the payload")]
    Pod(#[from] PodError),
    #[error("the file descriptor with index {0} is missing")]
    MissingFd(i64),
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

pub(crate) fn write_props(b: &mut PodBuilder, props: &Properties) {
    b.uint(props.len() as u32);
    for (k, v) in props.iter() {
        b.string(k);
        b.string(v);
    }
}

pub(crate) fn read_props(it: &mut PodIter<'_>) -> Result<Properties, PodError> {
    let n = it.uint()?;
    let mut props = Properties::new();
    for _ in 0..n {
        let k = it.string()?.to_string();
        let v = it.string()?.to_string();
        props.set(k, v);
    }
    Ok(props)
}

/// An optional pod argument: a none pod when absent, copied verbatim
/// otherwise.
pub(crate) fn read_opt_pod(it: &mut PodIter<'_>) -> Result<Option<Vec<u8>>, PodError> {
    let pod = it.pod()?;
    if pod.is_none() {
        return Ok(None);
    }
    Ok(Some(pod.to_vec()))
}

/// A list of pod arguments prefixed with their count.
pub(crate) fn write_pod_list(b: &mut PodBuilder, pods: &[Vec<u8>]) {
    b.uint(pods.len() as u32);
    for pod in pods {
        b.raw(pod);
    }
}

pub(crate) fn read_pod_list(it: &mut PodIter<'_>) -> Result<Vec<Vec<u8>>, PodError> {
    let n = it.uint()?;
    (0..n).map(|_| Ok(it.pod()?.to_vec())).collect()
}

/// Registers `fd` in the out-list and returns the index to encode.
pub(crate) fn push_fd(fds: &mut Vec<Rc<OwnedFd>>, fd: Rc<OwnedFd>) -> i64 {
    fds.push(fd);
    fds.len() as i64 - 1
}

/// Resolves a received fd index.
pub(crate) fn take_fd(fds: &FdQueue, index: i64) -> Result<Rc<OwnedFd>, ProtocolError> {
    fds.get(index).ok_or(ProtocolError::MissingFd(index))
}

pub(crate) fn parse_payload(payload: &[u8]) -> Result<PodIter<'_>, PodError> {
    Pod::from_slice(payload)?.as_struct()
}
