//! The shared-memory transport between the daemon and a client node.
//!
//! A single memfd holds a fixed header with the port counts, one I/O
//! slot per port, and two single-producer/single-consumer rings for
//! events, one per direction. Each side additionally holds two
//! eventfds: writing a `u64` to the write-fd tells the peer that
//! slots or rings changed, the read-fd is what a side polls.
//!
//! Both sides map the same region; all shared fields are atomics.
//! The eventfd write pairs with the consumer's read to order slot
//! updates against event consumption.

use {
    std::{
        io,
        mem::size_of,
        os::fd::{AsRawFd, FromRawFd, OwnedFd},
        ptr::{self, NonNull},
        sync::{
            Arc,
            atomic::{
                AtomicI32, AtomicU32,
                Ordering::{Acquire, Relaxed, Release},
            },
        },
    },
    thiserror::Error,
    uapi::c,
};

#[cfg(test)]
mod tests;

/// I/O slot status: the slot owner is idle.
pub const STATUS_OK: i32 = 0;
/// The port needs data before it can be processed.
pub const STATUS_NEED_DATA: i32 = 1;
/// The port has data available.
pub const STATUS_HAVE_DATA: i32 = 2;

const RING_ENTRIES: usize = 128;

const EVENT_NEED_INPUT: u32 = 1;
const EVENT_HAVE_OUTPUT: u32 = 2;
const EVENT_REUSE_BUFFER: u32 = 3;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransportEvent {
    NeedInput { port_id: u32 },
    HaveOutput { port_id: u32 },
    ReuseBuffer { port_id: u32, buffer_id: u32 },
}

/// Which end of the transport this mapping serves. The side selects
/// which ring is written and which is drained.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransportSide {
    Server,
    Client,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not create the transport memfd")]
    CreateMemfd(#[source] io::Error),
    #[error("could not create an eventfd")]
    CreateEventfd(#[source] io::Error),
    #[error("could not map the transport area")]
    Map(#[source] io::Error),
    #[error("the mapped area is too small for its port counts")]
    AreaTooSmall,
    #[error("the port index {0} is out of range")]
    BadPort(u32),
    #[error("the event ring is full")]
    RingFull,
    #[error("the peer sent the unknown transport event {0}")]
    BadEvent(u32),
}

#[repr(C)]
struct AreaHeader {
    max_inputs: AtomicU32,
    n_inputs: AtomicU32,
    max_outputs: AtomicU32,
    n_outputs: AtomicU32,
}

/// One port's shared I/O slot.
#[repr(C)]
pub struct IoSlot {
    status: AtomicI32,
    buffer_id: AtomicU32,
}

impl IoSlot {
    pub fn status(&self) -> i32 {
        self.status.load(Acquire)
    }

    pub fn buffer_id(&self) -> u32 {
        self.buffer_id.load(Acquire)
    }

    pub fn set(&self, status: i32, buffer_id: u32) {
        self.buffer_id.store(buffer_id, Relaxed);
        self.status.store(status, Release);
    }

    pub fn set_status(&self, status: i32) {
        self.status.store(status, Release);
    }
}

#[repr(C)]
struct RingHeader {
    read: AtomicU32,
    write: AtomicU32,
}

#[repr(C)]
#[derive(Copy, Clone)]
struct RingEntry {
    kind: u32,
    port_id: u32,
    buffer_id: u32,
    reserved: u32,
}

fn area_size(max_inputs: u32, max_outputs: u32) -> usize {
    size_of::<AreaHeader>()
        + (max_inputs + max_outputs) as usize * size_of::<IoSlot>()
        + 2 * (size_of::<RingHeader>() + RING_ENTRIES * size_of::<RingEntry>())
}

/// The information needed by the peer to map a transport.
pub struct TransportInfo {
    pub mem_fd: Arc<OwnedFd>,
    pub offset: u32,
    pub size: u32,
    /// The fd the *receiving* side polls for signals.
    pub read_fd: Arc<OwnedFd>,
    /// The fd the *receiving* side writes to signal its peer.
    pub write_fd: Arc<OwnedFd>,
}

pub struct Transport {
    side: TransportSide,
    mem_fd: Arc<OwnedFd>,
    base: NonNull<u8>,
    len: usize,
    max_inputs: u32,
    max_outputs: u32,
    /// Signalled by the peer, polled by us.
    wait_fd: Arc<OwnedFd>,
    /// Written by us to wake the peer.
    kick_fd: Arc<OwnedFd>,
}

// SAFETY: all access to the mapped area goes through atomics; the
// eventfds are plain fds.
unsafe impl Send for Transport {}
unsafe impl Sync for Transport {}

impl Drop for Transport {
    fn drop(&mut self) {
        // SAFETY: base/len describe our own successful mapping.
        unsafe {
            c::munmap(self.base.as_ptr().cast(), self.len);
        }
    }
}

fn eventfd() -> Result<Arc<OwnedFd>, TransportError> {
    // SAFETY: plain syscall, result checked below.
    let raw = unsafe { c::eventfd(0, c::EFD_CLOEXEC | c::EFD_NONBLOCK) };
    if raw == -1 {
        return Err(TransportError::CreateEventfd(io::Error::last_os_error()));
    }
    // SAFETY: eventfd returned a fresh fd.
    Ok(Arc::new(unsafe { OwnedFd::from_raw_fd(raw) }))
}

fn map_shared(fd: &OwnedFd, len: usize) -> Result<NonNull<u8>, TransportError> {
    // SAFETY: mapping a shared fd, checked below.
    let ptr = unsafe {
        c::mmap(
            ptr::null_mut(),
            len,
            c::PROT_READ | c::PROT_WRITE,
            c::MAP_SHARED,
            fd.as_raw_fd(),
            0,
        )
    };
    if ptr == c::MAP_FAILED {
        return Err(TransportError::Map(io::Error::last_os_error()));
    }
    Ok(NonNull::new(ptr.cast()).unwrap())
}

impl Transport {
    /// Allocates a fresh transport area plus its eventfd pair. Used
    /// by the server when a client node is created or its port
    /// counts change.
    pub fn alloc(
        max_inputs: u32,
        max_outputs: u32,
        n_inputs: u32,
        n_outputs: u32,
    ) -> Result<Arc<Transport>, TransportError> {
        let len = area_size(max_inputs, max_outputs);
        let fd = uapi::memfd_create("pipegraph-transport", c::MFD_CLOEXEC | c::MFD_ALLOW_SEALING)
            .map_err(|e| TransportError::CreateMemfd(io::Error::from(e)))?;
        uapi::ftruncate(fd.raw(), len as _)
            .map_err(|e| TransportError::CreateMemfd(io::Error::from(e)))?;
        // SAFETY: plain fcntl on an owned fd.
        unsafe {
            c::fcntl(
                fd.raw(),
                c::F_ADD_SEALS,
                c::F_SEAL_GROW | c::F_SEAL_SHRINK | c::F_SEAL_SEAL,
            );
        }
        let mem_fd: Arc<OwnedFd> = Arc::new(fd.into());
        let base = map_shared(&mem_fd, len)?;
        // SAFETY: the fresh mapping is zeroed; writing the header
        // fields before the fd is shared cannot race.
        let slf = Transport {
            side: TransportSide::Server,
            mem_fd,
            base,
            len,
            max_inputs,
            max_outputs,
            wait_fd: eventfd()?,
            kick_fd: eventfd()?,
        };
        let header = slf.header();
        header.max_inputs.store(max_inputs, Relaxed);
        header.n_inputs.store(n_inputs, Relaxed);
        header.max_outputs.store(max_outputs, Relaxed);
        header.n_outputs.store(n_outputs, Relaxed);
        for idx in 0..max_inputs {
            slf.io_slot_raw(true, idx).set(STATUS_OK, crate::pod::INVALID_ID);
        }
        for idx in 0..max_outputs {
            slf.io_slot_raw(false, idx).set(STATUS_OK, crate::pod::INVALID_ID);
        }
        Ok(Arc::new(slf))
    }

    /// Maps the transport described by `info` on the client side.
    pub fn from_info(
        info: &TransportInfo,
        max_inputs: u32,
        max_outputs: u32,
    ) -> Result<Arc<Transport>, TransportError> {
        let len = info.size as usize;
        if len < area_size(max_inputs, max_outputs) {
            return Err(TransportError::AreaTooSmall);
        }
        let base = map_shared(&info.mem_fd, len)?;
        Ok(Arc::new(Transport {
            side: TransportSide::Client,
            mem_fd: info.mem_fd.clone(),
            base,
            len,
            max_inputs,
            max_outputs,
            wait_fd: info.read_fd.clone(),
            kick_fd: info.write_fd.clone(),
        }))
    }

    /// The description sent to the peer; the signal fds are swapped
    /// so that our kick-fd is the peer's read-fd.
    pub fn info(&self) -> TransportInfo {
        TransportInfo {
            mem_fd: self.mem_fd.clone(),
            offset: 0,
            size: self.len as u32,
            read_fd: self.kick_fd.clone(),
            write_fd: self.wait_fd.clone(),
        }
    }

    /// The fd this side polls for peer signals.
    pub fn wait_fd(&self) -> &Arc<OwnedFd> {
        &self.wait_fd
    }

    fn header(&self) -> &AreaHeader {
        // SAFETY: the area is at least area_size() long and starts
        // with the header.
        unsafe { &*self.base.as_ptr().cast::<AreaHeader>() }
    }

    pub fn max_inputs(&self) -> u32 {
        self.max_inputs
    }

    pub fn max_outputs(&self) -> u32 {
        self.max_outputs
    }

    pub fn n_inputs(&self) -> u32 {
        self.header().n_inputs.load(Relaxed)
    }

    pub fn n_outputs(&self) -> u32 {
        self.header().n_outputs.load(Relaxed)
    }

    fn io_slot_raw(&self, input: bool, idx: u32) -> &IoSlot {
        debug_assert!(if input {
            idx < self.max_inputs
        } else {
            idx < self.max_outputs
        });
        let mut offset = size_of::<AreaHeader>();
        if !input {
            offset += self.max_inputs as usize * size_of::<IoSlot>();
        }
        offset += idx as usize * size_of::<IoSlot>();
        // SAFETY: offset stays within the area checked at
        // construction.
        unsafe { &*self.base.as_ptr().add(offset).cast::<IoSlot>() }
    }

    pub fn input_io(&self, idx: u32) -> Result<&IoSlot, TransportError> {
        if idx >= self.max_inputs {
            return Err(TransportError::BadPort(idx));
        }
        Ok(self.io_slot_raw(true, idx))
    }

    pub fn output_io(&self, idx: u32) -> Result<&IoSlot, TransportError> {
        if idx >= self.max_outputs {
            return Err(TransportError::BadPort(idx));
        }
        Ok(self.io_slot_raw(false, idx))
    }

    /// ring 0 carries client-to-server events, ring 1 the reverse.
    fn ring(&self, idx: usize) -> (&RingHeader, *mut RingEntry) {
        let mut offset = size_of::<AreaHeader>()
            + (self.max_inputs + self.max_outputs) as usize * size_of::<IoSlot>();
        offset += idx * (size_of::<RingHeader>() + RING_ENTRIES * size_of::<RingEntry>());
        // SAFETY: offset stays within the area checked at
        // construction.
        unsafe {
            let header = &*self.base.as_ptr().add(offset).cast::<RingHeader>();
            let entries = self
                .base
                .as_ptr()
                .add(offset + size_of::<RingHeader>())
                .cast::<RingEntry>();
            (header, entries)
        }
    }

    fn send_ring(&self) -> (&RingHeader, *mut RingEntry) {
        match self.side {
            TransportSide::Client => self.ring(0),
            TransportSide::Server => self.ring(1),
        }
    }

    fn recv_ring(&self) -> (&RingHeader, *mut RingEntry) {
        match self.side {
            TransportSide::Client => self.ring(1),
            TransportSide::Server => self.ring(0),
        }
    }

    /// Enqueues an event for the peer. The caller signals with
    /// [`Transport::signal`] once all updates are staged.
    pub fn send_event(&self, event: TransportEvent) -> Result<(), TransportError> {
        let (header, entries) = self.send_ring();
        let write = header.write.load(Relaxed);
        let read = header.read.load(Acquire);
        if write.wrapping_sub(read) as usize >= RING_ENTRIES {
            return Err(TransportError::RingFull);
        }
        let entry = match event {
            TransportEvent::NeedInput { port_id } => RingEntry {
                kind: EVENT_NEED_INPUT,
                port_id,
                buffer_id: 0,
                reserved: 0,
            },
            TransportEvent::HaveOutput { port_id } => RingEntry {
                kind: EVENT_HAVE_OUTPUT,
                port_id,
                buffer_id: 0,
                reserved: 0,
            },
            TransportEvent::ReuseBuffer { port_id, buffer_id } => RingEntry {
                kind: EVENT_REUSE_BUFFER,
                port_id,
                buffer_id,
                reserved: 0,
            },
        };
        // SAFETY: single producer per ring; the slot at write % N is
        // not visible to the consumer until the write index is
        // published below.
        unsafe {
            entries
                .add(write as usize % RING_ENTRIES)
                .write_volatile(entry);
        }
        header.write.store(write.wrapping_add(1), Release);
        Ok(())
    }

    /// Dequeues the next event from the peer in FIFO order.
    pub fn next_event(&self) -> Result<Option<TransportEvent>, TransportError> {
        let (header, entries) = self.recv_ring();
        let read = header.read.load(Relaxed);
        if read == header.write.load(Acquire) {
            return Ok(None);
        }
        // SAFETY: the entry was fully written before the write index
        // made it visible.
        let entry = unsafe { entries.add(read as usize % RING_ENTRIES).read_volatile() };
        header.read.store(read.wrapping_add(1), Release);
        let event = match entry.kind {
            EVENT_NEED_INPUT => TransportEvent::NeedInput {
                port_id: entry.port_id,
            },
            EVENT_HAVE_OUTPUT => TransportEvent::HaveOutput {
                port_id: entry.port_id,
            },
            EVENT_REUSE_BUFFER => TransportEvent::ReuseBuffer {
                port_id: entry.port_id,
                buffer_id: entry.buffer_id,
            },
            kind => return Err(TransportError::BadEvent(kind)),
        };
        Ok(Some(event))
    }

    /// Wakes the peer after staging slot updates and ring events.
    pub fn signal(&self) {
        let one = 1u64.to_ne_bytes();
        let _ = uapi::write(self.kick_fd.as_raw_fd(), &one);
    }

    /// Drains our wait-fd after a wakeup.
    pub fn consume_signal(&self) {
        let mut buf = [0u8; 8];
        let _ = uapi::read(self.wait_fd.as_raw_fd(), &mut buf[..]);
    }
}
