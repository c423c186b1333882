use {
    crate::event_loop::{EventLoop, READABLE},
    std::{
        cell::{Cell, RefCell},
        os::fd::{AsFd, AsRawFd, OwnedFd},
        rc::Rc,
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering::SeqCst},
        },
        thread,
        time::Duration,
    },
};

#[test]
fn fd_readiness_dispatches_callback() {
    let el = EventLoop::new().unwrap();
    let (r, w) = uapi::pipe().unwrap();
    let r: Rc<OwnedFd> = Rc::new(r.into());
    let hits = Rc::new(Cell::new(0));
    let hits2 = hits.clone();
    el.add_fd(
        r.as_fd(),
        READABLE,
        Rc::new(move |events| {
            assert_ne!(events & READABLE, 0);
            hits2.set(hits2.get() + 1);
        }),
    )
    .unwrap();
    assert!(!el.iterate(Some(Duration::ZERO)).unwrap());
    uapi::write(w.raw(), &[1u8]).unwrap();
    assert!(el.iterate(Some(Duration::from_secs(1))).unwrap());
    assert_eq!(hits.get(), 1);
}

#[test]
fn invoke_crosses_threads() {
    let el = EventLoop::new().unwrap();
    let handle = el.handle();
    let flag = Arc::new(AtomicBool::new(false));
    let flag2 = flag.clone();
    let t = thread::spawn(move || {
        handle.invoke(move || flag2.store(true, SeqCst));
    });
    t.join().unwrap();
    el.iterate(Some(Duration::from_secs(1))).unwrap();
    assert!(flag.load(SeqCst));
}

#[test]
fn invoke_sync_blocks_until_done() {
    let el = EventLoop::new().unwrap();
    let handle = el.handle();
    let flag = Arc::new(AtomicBool::new(false));
    let flag2 = flag.clone();
    let t = thread::spawn(move || {
        handle.invoke_sync(move || flag2.store(true, SeqCst));
        // After invoke_sync returns, the closure has run.
        assert!(flag.load(SeqCst));
    });
    // Pump until the worker thread observed completion.
    while !t.is_finished() {
        el.iterate(Some(Duration::from_millis(10))).unwrap();
    }
    t.join().unwrap();
}

#[test]
fn invoke_sync_runs_inline_on_loop_thread() {
    let el = EventLoop::new().unwrap();
    let ran = Arc::new(AtomicBool::new(false));
    let ran2 = ran.clone();
    el.handle().invoke_sync(move || ran2.store(true, SeqCst));
    assert!(ran.load(SeqCst));
}

#[test]
fn timer_fires() {
    let el = EventLoop::new().unwrap();
    let fired = Rc::new(Cell::new(false));
    let fired2 = fired.clone();
    el.add_timer(
        Duration::from_millis(5),
        None,
        Rc::new(move || fired2.set(true)),
    )
    .unwrap();
    while !fired.get() {
        el.iterate(Some(Duration::from_secs(1))).unwrap();
    }
}

#[test]
fn idle_and_before_iterate_order() {
    let el = EventLoop::new().unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));
    let o1 = order.clone();
    let o2 = order.clone();
    el.add_idle(move || o1.borrow_mut().push("idle"));
    el.add_before_iterate(Rc::new(move || o2.borrow_mut().push("before")));
    el.iterate(Some(Duration::ZERO)).unwrap();
    // Idle work runs first, the before hook runs right before the
    // loop polls.
    assert_eq!(&*order.borrow(), &["idle", "before"]);
}

#[test]
fn remove_fd_stops_dispatch() {
    let el = EventLoop::new().unwrap();
    let (r, w) = uapi::pipe().unwrap();
    let r: Rc<OwnedFd> = Rc::new(r.into());
    let hits = Rc::new(Cell::new(0));
    let hits2 = hits.clone();
    let id = el
        .add_fd(r.as_fd(), READABLE, Rc::new(move |_| hits2.set(hits2.get() + 1)))
        .unwrap();
    uapi::write(w.raw(), &[1u8]).unwrap();
    el.iterate(Some(Duration::from_secs(1))).unwrap();
    assert_eq!(hits.get(), 1);
    el.remove(id);
    uapi::write(w.raw(), &[1u8]).unwrap();
    el.iterate(Some(Duration::ZERO)).unwrap();
    assert_eq!(hits.get(), 1);
    drop(w);
    let _ = r.as_raw_fd();
}
