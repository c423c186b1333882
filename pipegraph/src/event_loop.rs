//! The cooperative event loop.
//!
//! Each loop runs on exactly one thread; callbacks registered on a
//! loop never race each other. A process typically runs two loops: a
//! main loop for the control protocol and a data loop for transport
//! signalling.
//!
//! Other threads reach into a loop with [`LoopHandle::invoke`]
//! (fire-and-forget, returns a sequence number) and
//! [`LoopHandle::invoke_sync`] (blocks until the closure ran).
//! *Before-iterate* hooks run immediately before the loop blocks on
//! readiness and are used to flush queued connection writes.

use {
    parking_lot::{Condvar, Mutex},
    std::{
        cell::{Cell, RefCell},
        collections::{HashMap, VecDeque},
        io,
        os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd},
        rc::Rc,
        sync::{
            Arc,
            atomic::{AtomicU32, Ordering::Relaxed},
        },
        thread::{self, ThreadId},
        time::Duration,
    },
    thiserror::Error,
    uapi::{Errno, c},
};

#[cfg(test)]
mod tests;

pub const READABLE: u32 = c::EPOLLIN as u32;
pub const WRITABLE: u32 = c::EPOLLOUT as u32;
pub const ERROR: u32 = (c::EPOLLERR | c::EPOLLHUP) as u32;

const MAX_EVENTS: usize = 16;

#[derive(Debug, Error)]
pub enum LoopError {
    #[error("could not create epoll fd")]
    CreateEpoll(#[source] io::Error),
    #[error("could not create an eventfd")]
    CreateEventfd(#[source] io::Error),
    #[error("could not create a timerfd")]
    CreateTimerfd(#[source] io::Error),
    #[error("could not arm a timerfd")]
    ArmTimerfd(#[source] io::Error),
    #[error("could not read epoll events")]
    Wait(#[source] io::Error),
    #[error("could not register a file descriptor")]
    Register(#[source] io::Error),
    #[error("could not update epoll interests")]
    Update(#[source] io::Error),
    #[error("the source does not exist")]
    NoSource,
    #[error("could not spawn the data loop thread")]
    SpawnThread(#[source] io::Error),
    #[error("the data loop thread did not start")]
    DataLoopStart,
}

/// Identifies a source registered on an [`EventLoop`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct SourceId(u64);

enum Source {
    Fd {
        /// Not owned; the registrant keeps the fd alive until it
        /// removes the source.
        fd: RawFd,
        callback: Rc<dyn Fn(u32)>,
    },
    Timer {
        fd: Rc<OwnedFd>,
        callback: Rc<dyn Fn()>,
    },
    Wakeup,
}

struct PendingInvoke {
    seq: u32,
    func: Box<dyn FnOnce() + Send>,
    done: Option<Arc<(Mutex<bool>, Condvar)>>,
}

#[derive(Default)]
struct InvokeQueue {
    items: Mutex<VecDeque<PendingInvoke>>,
    next_seq: AtomicU32,
}

/// A `Send + Sync` handle used to run closures on the loop's thread.
#[derive(Clone)]
pub struct LoopHandle {
    queue: Arc<InvokeQueue>,
    wake: Arc<OwnedFd>,
    thread: ThreadId,
}

impl LoopHandle {
    /// Posts a closure onto the loop thread and returns the sequence
    /// number the completion will carry.
    pub fn invoke(&self, func: impl FnOnce() + Send + 'static) -> u32 {
        let seq = self.queue.next_seq.fetch_add(1, Relaxed);
        self.queue.items.lock().push_back(PendingInvoke {
            seq,
            func: Box::new(func),
            done: None,
        });
        self.wake_loop();
        seq
    }

    /// Posts a closure onto the loop thread and blocks until it ran.
    ///
    /// Calling this from the loop thread itself runs the closure
    /// inline.
    pub fn invoke_sync(&self, func: impl FnOnce() + Send + 'static) {
        if thread::current().id() == self.thread {
            func();
            return;
        }
        let done = Arc::new((Mutex::new(false), Condvar::new()));
        let seq = self.queue.next_seq.fetch_add(1, Relaxed);
        self.queue.items.lock().push_back(PendingInvoke {
            seq,
            func: Box::new(func),
            done: Some(done.clone()),
        });
        self.wake_loop();
        let (lock, cond) = &*done;
        let mut ran = lock.lock();
        while !*ran {
            cond.wait(&mut ran);
        }
    }

    fn wake_loop(&self) {
        let one = 1u64.to_ne_bytes();
        let _ = uapi::write(self.wake.as_raw_fd(), &one);
    }
}

pub struct EventLoop {
    epoll: OwnedFd,
    next_id: Cell<u64>,
    sources: RefCell<HashMap<u64, Source>>,
    wake: Arc<OwnedFd>,
    queue: Arc<InvokeQueue>,
    idle: RefCell<VecDeque<Box<dyn FnOnce()>>>,
    before: RefCell<Vec<(u64, Rc<dyn Fn()>)>>,
    quit: Cell<bool>,
    thread: ThreadId,
}

impl EventLoop {
    pub fn new() -> Result<Self, LoopError> {
        let epoll = uapi::epoll_create1(c::EPOLL_CLOEXEC)
            .map_err(|e| LoopError::CreateEpoll(e.into()))?;
        let wake = eventfd().map_err(LoopError::CreateEventfd)?;
        let slf = EventLoop {
            epoll: epoll.into(),
            next_id: Cell::new(1),
            sources: Default::default(),
            wake: Arc::new(wake),
            queue: Default::default(),
            idle: Default::default(),
            before: Default::default(),
            quit: Cell::new(false),
            thread: thread::current().id(),
        };
        let id = slf.alloc_id();
        slf.register(id, slf.wake.as_fd(), READABLE)?;
        slf.sources.borrow_mut().insert(id, Source::Wakeup);
        Ok(slf)
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            queue: self.queue.clone(),
            wake: self.wake.clone(),
            thread: self.thread,
        }
    }

    fn alloc_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    fn register(&self, id: u64, fd: BorrowedFd<'_>, events: u32) -> Result<(), LoopError> {
        let event = c::epoll_event { events, u64: id };
        uapi::epoll_ctl(
            self.epoll.as_raw_fd(),
            c::EPOLL_CTL_ADD,
            fd.as_raw_fd(),
            Some(&event),
        )
        .map_err(|e| LoopError::Register(io::Error::from(e)))
    }

    /// Registers a file descriptor. The caller keeps the fd alive
    /// until it removes the source; the callback receives the ready
    /// event mask.
    pub fn add_fd(
        &self,
        fd: BorrowedFd<'_>,
        events: u32,
        callback: Rc<dyn Fn(u32)>,
    ) -> Result<SourceId, LoopError> {
        let id = self.alloc_id();
        self.register(id, fd, events)?;
        self.sources.borrow_mut().insert(
            id,
            Source::Fd {
                fd: fd.as_raw_fd(),
                callback,
            },
        );
        Ok(SourceId(id))
    }

    /// Changes the interest mask of a registered fd.
    pub fn update_fd(&self, id: SourceId, events: u32) -> Result<(), LoopError> {
        let sources = self.sources.borrow();
        let Some(Source::Fd { fd, .. }) = sources.get(&id.0) else {
            return Err(LoopError::NoSource);
        };
        let event = c::epoll_event { events, u64: id.0 };
        uapi::epoll_ctl(self.epoll.as_raw_fd(), c::EPOLL_CTL_MOD, *fd, Some(&event))
            .map_err(|e| LoopError::Update(io::Error::from(e)))
    }

    /// Arms a timer. With an `interval` the timer repeats, otherwise
    /// it fires once but stays registered.
    pub fn add_timer(
        &self,
        delay: Duration,
        interval: Option<Duration>,
        callback: Rc<dyn Fn()>,
    ) -> Result<SourceId, LoopError> {
        // SAFETY: plain syscall, result checked below.
        let raw = unsafe { c::timerfd_create(c::CLOCK_MONOTONIC, c::TFD_CLOEXEC | c::TFD_NONBLOCK) };
        if raw == -1 {
            return Err(LoopError::CreateTimerfd(io::Error::last_os_error()));
        }
        // SAFETY: timerfd_create returned a fresh fd.
        let fd: OwnedFd = unsafe { std::os::fd::FromRawFd::from_raw_fd(raw) };
        let spec = c::itimerspec {
            it_interval: timespec(interval.unwrap_or(Duration::ZERO)),
            it_value: timespec(delay.max(Duration::from_nanos(1))),
        };
        // SAFETY: fd is a valid timerfd.
        let res = unsafe { c::timerfd_settime(fd.as_raw_fd(), 0, &spec, std::ptr::null_mut()) };
        if res == -1 {
            return Err(LoopError::ArmTimerfd(io::Error::last_os_error()));
        }
        let fd = Rc::new(fd);
        let id = self.alloc_id();
        self.register(id, fd.as_fd(), READABLE)?;
        self.sources
            .borrow_mut()
            .insert(id, Source::Timer { fd, callback });
        Ok(SourceId(id))
    }

    /// Removes a source. Safe to call from within a callback.
    pub fn remove(&self, id: SourceId) {
        let source = self.sources.borrow_mut().remove(&id.0);
        let fd = match &source {
            Some(Source::Fd { fd, .. }) => *fd,
            Some(Source::Timer { fd, .. }) => fd.as_raw_fd(),
            _ => return,
        };
        let _ = uapi::epoll_ctl(self.epoll.as_raw_fd(), c::EPOLL_CTL_DEL, fd, None);
    }

    /// Queues a closure that runs at the start of the next iteration.
    pub fn add_idle(&self, func: impl FnOnce() + 'static) {
        self.idle.borrow_mut().push_back(Box::new(func));
    }

    /// Registers a hook that runs immediately before the loop blocks.
    pub fn add_before_iterate(&self, hook: Rc<dyn Fn()>) -> SourceId {
        let id = self.alloc_id();
        self.before.borrow_mut().push((id, hook));
        SourceId(id)
    }

    pub fn remove_before_iterate(&self, id: SourceId) {
        self.before.borrow_mut().retain(|(i, _)| *i != id.0);
    }

    pub fn quit(&self) {
        self.quit.set(true);
    }

    pub fn is_quit(&self) -> bool {
        self.quit.get()
    }

    /// Runs one iteration: idle work, before-iterate hooks, poll,
    /// dispatch. Returns whether any work was done.
    pub fn iterate(&self, timeout: Option<Duration>) -> Result<bool, LoopError> {
        let mut did_work = false;
        loop {
            let idle = self.idle.borrow_mut().pop_front();
            let Some(idle) = idle else {
                break;
            };
            did_work = true;
            idle();
        }
        let hooks: Vec<_> = self.before.borrow().iter().map(|(_, h)| h.clone()).collect();
        for hook in hooks {
            hook();
        }
        let timeout = match timeout {
            _ if did_work => 0,
            Some(t) => t.as_millis().try_into().unwrap_or(c::c_int::MAX),
            None => -1,
        };
        let mut events = [c::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let n = loop {
            match uapi::epoll_wait(self.epoll.as_raw_fd(), &mut events, timeout) {
                Ok(n) => break n,
                Err(Errno(c::EINTR)) => continue,
                Err(e) => return Err(LoopError::Wait(e.into())),
            }
        };
        for event in &events[..n] {
            did_work = true;
            let source_events = event.events;
            let id = event.u64;
            enum Dispatch {
                Fd(Rc<dyn Fn(u32)>),
                Timer(Rc<OwnedFd>, Rc<dyn Fn()>),
                Wakeup,
                Gone,
            }
            let dispatch = match self.sources.borrow().get(&id) {
                Some(Source::Fd { callback, .. }) => Dispatch::Fd(callback.clone()),
                Some(Source::Timer { fd, callback }) => {
                    Dispatch::Timer(fd.clone(), callback.clone())
                }
                Some(Source::Wakeup) => Dispatch::Wakeup,
                None => Dispatch::Gone,
            };
            match dispatch {
                Dispatch::Fd(cb) => cb(source_events),
                Dispatch::Timer(fd, cb) => {
                    let mut expirations = [0u8; 8];
                    let _ = uapi::read(fd.as_raw_fd(), &mut expirations[..]);
                    cb();
                }
                Dispatch::Wakeup => self.drain_invokes(),
                Dispatch::Gone => {}
            }
        }
        Ok(did_work)
    }

    /// Dispatches until [`EventLoop::quit`] is called.
    pub fn run(&self) -> Result<(), LoopError> {
        while !self.quit.get() {
            self.iterate(None)?;
        }
        Ok(())
    }

    fn drain_invokes(&self) {
        let mut buf = [0u8; 8];
        let _ = uapi::read(self.wake.as_raw_fd(), &mut buf[..]);
        loop {
            let item = self.queue.items.lock().pop_front();
            let Some(item) = item else {
                break;
            };
            (item.func)();
            let _ = item.seq;
            if let Some(done) = item.done {
                let (lock, cond) = &*done;
                *lock.lock() = true;
                cond.notify_all();
            }
        }
    }
}

fn timespec(d: Duration) -> c::timespec {
    c::timespec {
        tv_sec: d.as_secs() as _,
        tv_nsec: d.subsec_nanos() as _,
    }
}

fn eventfd() -> Result<OwnedFd, io::Error> {
    // SAFETY: plain syscall, result checked below.
    let raw = unsafe { c::eventfd(0, c::EFD_CLOEXEC | c::EFD_NONBLOCK) };
    if raw == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: eventfd returned a fresh fd.
    Ok(unsafe { std::os::fd::FromRawFd::from_raw_fd(raw) })
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<EventLoop>>> = const { RefCell::new(None) };
}

impl EventLoop {
    /// Makes this loop the thread's current loop, reachable from
    /// closures posted with [`LoopHandle::invoke`].
    pub fn make_current(self: &Rc<Self>) {
        CURRENT.with(|c| *c.borrow_mut() = Some(self.clone()));
    }

    /// Runs `f` with the thread's current loop, if one was installed.
    pub fn with_current<T>(f: impl FnOnce(&Rc<EventLoop>) -> T) -> Option<T> {
        CURRENT.with(|c| c.borrow().as_ref().map(f))
    }
}

/// A second loop on its own thread, used for the data plane.
pub struct DataLoop {
    handle: LoopHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl DataLoop {
    pub fn spawn(name: &str) -> Result<DataLoop, LoopError> {
        let (tx, rx) = std::sync::mpsc::channel();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let el = match EventLoop::new() {
                    Ok(el) => Rc::new(el),
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                };
                el.make_current();
                let _ = tx.send(Ok(el.handle()));
                if let Err(e) = el.run() {
                    log::error!(
                        "The data loop failed: {}",
                        error_reporter::Report::new(e)
                    );
                }
            })
            .map_err(LoopError::SpawnThread)?;
        let handle = rx.recv().map_err(|_| LoopError::DataLoopStart)??;
        Ok(DataLoop {
            handle,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }
}

impl Drop for DataLoop {
    fn drop(&mut self) {
        self.handle.invoke(|| {
            EventLoop::with_current(|el| el.quit());
        });
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
