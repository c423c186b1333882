//! Low-level socket transfer.
//!
//! Frames are `(dest_id: u32, opcode << 24 | size: u32)` followed by
//! `size` payload bytes; payloads are 8-byte aligned pod structs.
//! Ancillary `SCM_RIGHTS` data carries file descriptors; every
//! received fd is made close-on-exec by the kernel via
//! `MSG_CMSG_CLOEXEC`.

use {
    isnt::std_1::primitive::IsntSliceExt,
    smallvec::SmallVec,
    std::{
        collections::VecDeque,
        io,
        mem::{self, MaybeUninit},
        os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
        rc::Rc,
        slice,
    },
    thiserror::Error,
    uapi::{Errno, Msghdr, MsghdrMut, c, sockaddr_none_mut, sockaddr_none_ref},
};

#[cfg(test)]
mod tests;

pub(crate) const HEADER_SIZE: usize = 8;
pub(crate) const MAX_MESSAGE_SIZE: usize = 32768;
const BUFFER_SIZE: usize = MAX_MESSAGE_SIZE * 2;

pub(crate) struct InputBuffer {
    buffer: Box<[u8; BUFFER_SIZE]>,
    valid_from: usize,
    valid_bytes: usize,
}

pub(crate) struct OutputBuffer {
    buffer: Box<[u8; BUFFER_SIZE]>,
    valid_from: usize,
    valid_to: usize,
    fds: VecDeque<Rc<OwnedFd>>,
    fd_offsets: VecDeque<FdOffset>,
}

struct FdOffset {
    offset: usize,
    num_fds: usize,
}

#[derive(Debug, Eq, PartialEq)]
pub(crate) enum FlushResult {
    Done,
    Blocked,
}

#[derive(Copy, Clone)]
pub(crate) struct Frame<'a> {
    pub(crate) dest_id: u32,
    pub(crate) opcode: u8,
    pub(crate) payload: &'a [u8],
}

#[derive(Debug, Error)]
pub enum TransError {
    #[error("failed to read from socket")]
    ReadFromSocket(#[source] io::Error),
    #[error("failed to write to socket")]
    WriteToSocket(#[source] io::Error),
    #[error("the connection is closed")]
    Closed,
    #[error("message has a supposed size {0} > {max}", max = MAX_MESSAGE_SIZE - HEADER_SIZE)]
    MessageTooLarge(usize),
    #[error("message has a supposed size {0} that is not a multiple of 8")]
    MessageNotAligned(usize),
}

fn get_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes(buf[offset..offset + 4].try_into().unwrap())
}

pub(crate) fn read_message<'a>(
    socket: RawFd,
    may_read_from_socket: &mut bool,
    buffer: &'a mut InputBuffer,
    fds: &mut VecDeque<Rc<OwnedFd>>,
) -> Result<Option<Frame<'a>>, TransError> {
    if buffer.valid_bytes == 0 {
        buffer.valid_from = 0;
    }
    if buffer.valid_from + HEADER_SIZE > BUFFER_SIZE {
        buffer.buffer.copy_within(buffer.valid_from.., 0);
        buffer.valid_from = 0;
    }
    if buffer.valid_bytes < HEADER_SIZE {
        if mem::take(may_read_from_socket) {
            read_from_socket(socket, buffer, fds)?;
        }
        if buffer.valid_bytes < HEADER_SIZE {
            return Ok(None);
        }
    }
    let word1 = get_u32(&buffer.buffer[..], buffer.valid_from + 4);
    let size = (word1 & 0x00ff_ffff) as usize;
    if size % 8 != 0 {
        return Err(TransError::MessageNotAligned(size));
    }
    if HEADER_SIZE + size > MAX_MESSAGE_SIZE {
        return Err(TransError::MessageTooLarge(size));
    }
    let total = HEADER_SIZE + size;
    if buffer.valid_from + total > BUFFER_SIZE {
        let start = buffer.valid_from;
        buffer
            .buffer
            .copy_within(start..start + buffer.valid_bytes, 0);
        buffer.valid_from = 0;
    }
    if total > buffer.valid_bytes {
        if mem::take(may_read_from_socket) {
            read_from_socket(socket, buffer, fds)?;
        }
        if total > buffer.valid_bytes {
            return Ok(None);
        }
    }
    let start = buffer.valid_from;
    buffer.valid_from += total;
    buffer.valid_bytes -= total;
    let dest_id = get_u32(&buffer.buffer[..], start);
    let word1 = get_u32(&buffer.buffer[..], start + 4);
    Ok(Some(Frame {
        dest_id,
        opcode: (word1 >> 24) as u8,
        payload: &buffer.buffer[start + HEADER_SIZE..start + total],
    }))
}

fn read_from_socket(
    fd: RawFd,
    buffer: &mut InputBuffer,
    fds: &mut VecDeque<Rc<OwnedFd>>,
) -> Result<(), TransError> {
    let start = buffer.valid_from + buffer.valid_bytes;
    let mut iovec = &mut buffer.buffer[start..];
    let mut control_buf = [0u8; 256];
    let mut header = MsghdrMut {
        iov: slice::from_mut(&mut iovec),
        control: Some(&mut control_buf),
        name: sockaddr_none_mut(),
        flags: 0,
    };
    let (init, _, mut control) =
        match uapi::recvmsg(fd, &mut header, c::MSG_CMSG_CLOEXEC | c::MSG_DONTWAIT) {
            Ok(r) => r,
            Err(e) if e.0 == c::EAGAIN => return Ok(()),
            Err(Errno(c::ECONNRESET)) => return Err(TransError::Closed),
            Err(e) => {
                return Err(TransError::ReadFromSocket(io::Error::from_raw_os_error(
                    e.0,
                )));
            }
        };
    if init.is_empty() && control.is_empty() {
        return Err(TransError::Closed);
    }
    buffer.valid_bytes += init.len();
    while control.is_not_empty() {
        let (_, hdr, data) = uapi::cmsg_read(&mut control).unwrap();
        if hdr.cmsg_level != c::SOL_SOCKET || hdr.cmsg_type != c::SCM_RIGHTS {
            continue;
        }
        for fd in uapi::pod_iter::<RawFd, _>(data).unwrap() {
            // SAFETY: The kernel guarantees that fd is valid
            unsafe {
                fds.push_back(Rc::new(OwnedFd::from_raw_fd(fd)));
            }
        }
    }
    Ok(())
}

pub(crate) fn flush_buffer(
    socket: RawFd,
    buffer: &mut OutputBuffer,
) -> Result<FlushResult, TransError> {
    loop {
        if buffer.valid_to == buffer.valid_from {
            return Ok(FlushResult::Done);
        }
        if write_to_socket(socket, buffer)? == FlushResult::Blocked {
            return Ok(FlushResult::Blocked);
        }
    }
}

fn write_to_socket(socket: RawFd, buffer: &mut OutputBuffer) -> Result<FlushResult, TransError> {
    let start = buffer.valid_from;
    let mut end = buffer.valid_to;
    let mut fd_offset = None;
    if let Some(fdo) = buffer.fd_offsets.front()
        && fdo.offset == start
    {
        fd_offset = buffer.fd_offsets.pop_front();
    }
    if let Some(fdo) = buffer.fd_offsets.front() {
        end = fdo.offset;
    }
    let mut control_buf = SmallVec::<[MaybeUninit<u8>; 128]>::new();
    let mut control = None;
    if let Some(fdo) = &fd_offset {
        let data_len = size_of::<RawFd>() * fdo.num_fds;
        let cmsg_space = uapi::cmsg_space(data_len);
        control_buf.reserve_exact(cmsg_space);
        // SAFETY: control_buf contains only MaybeUninit elements.
        unsafe {
            control_buf.set_len(cmsg_space);
        }
        let hdr = c::cmsghdr {
            cmsg_len: 0,
            cmsg_level: c::SOL_SOCKET,
            cmsg_type: c::SCM_RIGHTS,
        };
        let mut fds = SmallVec::<[RawFd; 128 / 4]>::new();
        for idx in 0..fdo.num_fds {
            fds.push(buffer.fds[idx].as_raw_fd());
        }
        let mut buf = &mut control_buf[..];
        uapi::cmsg_write(&mut buf, hdr, &fds[..]).unwrap();
        control = Some(&control_buf[..]);
    }
    let buf = &buffer.buffer[start..end];
    let msghdr = Msghdr {
        iov: slice::from_ref(&buf),
        control,
        name: sockaddr_none_ref(),
    };
    match uapi::sendmsg(socket, &msghdr, c::MSG_NOSIGNAL | c::MSG_DONTWAIT) {
        Ok(n) => {
            if let Some(fdo) = fd_offset {
                buffer.fds.drain(..fdo.num_fds);
            }
            buffer.valid_from += n;
            Ok(FlushResult::Done)
        }
        Err(e) if e.0 == c::EAGAIN => {
            if let Some(fdo) = fd_offset {
                buffer.fd_offsets.push_front(fdo);
            }
            Ok(FlushResult::Blocked)
        }
        Err(Errno(c::ECONNRESET)) => Err(TransError::Closed),
        Err(Errno(c::EPIPE)) => Err(TransError::Closed),
        Err(e) => Err(TransError::WriteToSocket(io::Error::from_raw_os_error(e.0))),
    }
}

impl Default for InputBuffer {
    fn default() -> Self {
        Self {
            buffer: Box::new([0; BUFFER_SIZE]),
            valid_from: 0,
            valid_bytes: 0,
        }
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self {
            buffer: Box::new([0; BUFFER_SIZE]),
            valid_from: 0,
            valid_to: 0,
            fds: Default::default(),
            fd_offsets: Default::default(),
        }
    }
}

impl OutputBuffer {
    fn push_frame(&mut self, dest_id: u32, opcode: u8, payload: &[u8], fds: &[Rc<OwnedFd>]) -> bool {
        debug_assert_eq!(payload.len() % 8, 0);
        if self.valid_from == self.valid_to {
            self.valid_from = 0;
            self.valid_to = 0;
        }
        let total = HEADER_SIZE + payload.len();
        if self.valid_to + total > BUFFER_SIZE {
            return false;
        }
        if fds.is_not_empty() {
            self.fd_offsets.push_back(FdOffset {
                offset: self.valid_to,
                num_fds: fds.len(),
            });
            self.fds.extend(fds.iter().cloned());
        }
        let word1 = (opcode as u32) << 24 | payload.len() as u32;
        self.buffer[self.valid_to..self.valid_to + 4].copy_from_slice(&dest_id.to_ne_bytes());
        self.buffer[self.valid_to + 4..self.valid_to + 8].copy_from_slice(&word1.to_ne_bytes());
        self.buffer[self.valid_to + 8..self.valid_to + total].copy_from_slice(payload);
        self.valid_to += total;
        true
    }
}

#[derive(Default)]
pub(crate) struct OutputSwapchain {
    pending: VecDeque<Box<OutputBuffer>>,
    stash: Vec<Box<OutputBuffer>>,
}

impl OutputSwapchain {
    pub(crate) fn push_frame(
        &mut self,
        dest_id: u32,
        opcode: u8,
        payload: &[u8],
        fds: &[Rc<OwnedFd>],
    ) -> Result<(), TransError> {
        if HEADER_SIZE + payload.len() > MAX_MESSAGE_SIZE {
            return Err(TransError::MessageTooLarge(payload.len()));
        }
        if let Some(last) = self.pending.back_mut()
            && last.push_frame(dest_id, opcode, payload, fds)
        {
            return Ok(());
        }
        let mut buf = self.stash.pop().unwrap_or_default();
        let pushed = buf.push_frame(dest_id, opcode, payload, fds);
        debug_assert!(pushed);
        self.pending.push_back(buf);
        Ok(())
    }

    pub(crate) fn flush(&mut self, fd: RawFd) -> Result<FlushResult, TransError> {
        while let Some(buf) = self.pending.front_mut() {
            match flush_buffer(fd, buf)? {
                FlushResult::Done => {
                    let buf = self.pending.pop_front().unwrap();
                    self.stash.push(buf);
                }
                FlushResult::Blocked => return Ok(FlushResult::Blocked),
            }
        }
        Ok(FlushResult::Done)
    }
}
