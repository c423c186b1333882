//! A framed protocol connection.
//!
//! The connection owns the send-side swapchain, the receive buffer
//! and the queue of file descriptors that arrived as ancillary data.
//! Writers hand a finished pod payload plus the fds it references to
//! [`Connection::send`]; the payload encodes each fd as its index in
//! that list. Readers resolve indices through [`FdQueue::get`] while
//! a message is dispatched; fds the message claimed are released when
//! the dispatch returns.

use {
    crate::trans::{self, FlushResult, InputBuffer, OutputSwapchain, TransError},
    std::{
        cell::{Cell, RefCell},
        collections::VecDeque,
        fmt::{self, Display, Formatter},
        os::fd::{AsRawFd, OwnedFd},
        rc::Rc,
    },
    thiserror::Error,
};


pub struct Connection {
    socket: Rc<OwnedFd>,
    outgoing: RefCell<OutputSwapchain>,
    incoming: RefCell<InputState>,
    flush_queued: Cell<bool>,
    dead: Cell<bool>,
}

#[derive(Default)]
struct InputState {
    buffer: Box<InputBuffer>,
    fds: FdQueue,
}

/// The file descriptors received with the current message batch.
#[derive(Default)]
pub struct FdQueue {
    fds: VecDeque<Rc<OwnedFd>>,
    used: Cell<usize>,
}

impl FdQueue {
    /// Resolves an fd index of the message currently dispatched.
    pub fn get(&self, index: i64) -> Option<Rc<OwnedFd>> {
        if index < 0 {
            return None;
        }
        let fd = self.fds.get(index as usize).cloned()?;
        let used = self.used.get();
        self.used.set(used.max(index as usize + 1));
        Some(fd)
    }

    fn release_used(&mut self) {
        let used = self.used.replace(0);
        self.fds.drain(..used.min(self.fds.len()));
    }
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("the connection is dead")]
    Dead,
    #[error(transparent)]
    Trans(TransError),
}

/// An error returned by [`Connection::receive`].
#[derive(Debug)]
pub enum ReceiveError<E> {
    Transport(TransError),
    Dispatch(E),
}

impl<E: Display> Display for ReceiveError<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ReceiveError::Transport(e) => write!(f, "could not read a message: {e}"),
            ReceiveError::Dispatch(e) => write!(f, "could not dispatch a message: {e}"),
        }
    }
}

impl Connection {
    pub fn new(socket: Rc<OwnedFd>) -> Self {
        Self {
            socket,
            outgoing: Default::default(),
            incoming: Default::default(),
            flush_queued: Cell::new(false),
            dead: Cell::new(false),
        }
    }

    pub fn socket(&self) -> &Rc<OwnedFd> {
        &self.socket
    }

    pub fn is_dead(&self) -> bool {
        self.dead.get()
    }

    pub(crate) fn mark_dead(&self) {
        self.dead.set(true);
    }

    /// Queues one message. Returns `true` if this send raised the
    /// need-flush condition, in which case the owner must schedule a
    /// flush.
    pub fn send(
        &self,
        dest_id: u32,
        opcode: u8,
        payload: &[u8],
        fds: &[Rc<OwnedFd>],
    ) -> Result<bool, ConnectionError> {
        if self.dead.get() {
            return Err(ConnectionError::Dead);
        }
        self.outgoing
            .borrow_mut()
            .push_frame(dest_id, opcode, payload, fds)
            .map_err(ConnectionError::Trans)?;
        Ok(!self.flush_queued.replace(true))
    }

    /// Writes queued messages to the socket. Short writes keep the
    /// tail queued and report [`FlushResult::Blocked`].
    pub fn flush(&self) -> Result<FlushResult, ConnectionError> {
        if self.dead.get() {
            return Err(ConnectionError::Dead);
        }
        let res = self
            .outgoing
            .borrow_mut()
            .flush(self.socket.as_raw_fd())
            .map_err(|e| {
                if matches!(e, TransError::Closed) {
                    self.dead.set(true);
                }
                ConnectionError::Trans(e)
            })?;
        if res == FlushResult::Done {
            self.flush_queued.set(false);
        }
        Ok(res)
    }

    pub fn needs_flush(&self) -> bool {
        self.flush_queued.get()
    }

    /// Reads and dispatches every complete message currently
    /// available. The handler receives `(dest_id, opcode, payload,
    /// fds)` per message; an error from the handler stops the loop.
    pub fn receive<E>(
        &self,
        mut handler: impl FnMut(u32, u8, &[u8], &FdQueue) -> Result<(), E>,
    ) -> Result<(), ReceiveError<E>> {
        let incoming = &mut *self.incoming.borrow_mut();
        let mut may_read = true;
        loop {
            if self.dead.get() {
                return Ok(());
            }
            let msg = trans::read_message(
                self.socket.as_raw_fd(),
                &mut may_read,
                &mut incoming.buffer,
                &mut incoming.fds.fds,
            )
            .map_err(|e| {
                self.dead.set(true);
                ReceiveError::Transport(e)
            })?;
            let Some(msg) = msg else {
                return Ok(());
            };
            let res = handler(msg.dest_id, msg.opcode, msg.payload, &incoming.fds);
            incoming.fds.release_used();
            res.map_err(ReceiveError::Dispatch)?;
        }
    }
}
