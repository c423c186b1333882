use {
    crate::DaemonError,
    log::LevelFilter,
    pipegraph::{context::Context, event_loop::{EventLoop, READABLE}, props::Properties},
    std::{
        env, io,
        os::fd::{AsFd, FromRawFd, OwnedFd},
        rc::Rc,
    },
    uapi::c,
};

pub fn main(name: Option<String>, verbose: u8) -> Result<(), DaemonError> {
    init_logging(verbose);
    // Block the termination signals before any thread is spawned so
    // the data loop inherits the mask and the signalfd sees them.
    let signals = signal_fd().map_err(DaemonError::Signals)?;
    let event_loop = Rc::new(EventLoop::new().map_err(DaemonError::CreateLoop)?);
    event_loop.make_current();
    let mut props = Properties::new();
    if let Some(name) = &name {
        props.set("core.name", name.clone());
    }
    let context = Context::new(&event_loop, props).map_err(DaemonError::CreateContext)?;
    let path = context.listen(name.as_deref()).map_err(DaemonError::Listen)?;
    log::info!("pipegraphd {} on {path}", env!("CARGO_PKG_VERSION"));
    {
        let weak = Rc::downgrade(&event_loop);
        event_loop
            .add_fd(
                signals.as_fd(),
                READABLE,
                Rc::new(move |_| {
                    log::info!("terminating on signal");
                    if let Some(el) = weak.upgrade() {
                        el.quit();
                    }
                }),
            )
            .map_err(DaemonError::WatchSignals)?;
    }
    event_loop.run().map_err(DaemonError::Run)?;
    drop(context);
    Ok(())
}

/// PIPEGRAPH_DEBUG and -v select the default filter; RUST_LOG still
/// overrides.
fn init_logging(verbose: u8) {
    let base = env::var("PIPEGRAPH_DEBUG")
        .ok()
        .and_then(|v| v.parse::<u8>().ok())
        .unwrap_or(2);
    let filter = match base.saturating_add(verbose) {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        3 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(filter)
        .parse_default_env()
        .init();
}

/// Blocks SIGINT/SIGTERM on the process and returns a signalfd that
/// becomes readable when either arrives.
fn signal_fd() -> Result<OwnedFd, io::Error> {
    // SAFETY: the set is a local buffer; signalfd returns a fresh fd
    // on success, checked below.
    unsafe {
        let mut set: c::sigset_t = uapi::pod_zeroed();
        c::sigemptyset(&mut set);
        c::sigaddset(&mut set, c::SIGINT);
        c::sigaddset(&mut set, c::SIGTERM);
        if c::pthread_sigmask(c::SIG_BLOCK, &set, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
        let raw = c::signalfd(-1, &set, c::SFD_CLOEXEC | c::SFD_NONBLOCK);
        if raw == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(OwnedFd::from_raw_fd(raw))
    }
}
