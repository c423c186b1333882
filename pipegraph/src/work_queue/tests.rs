use {
    crate::work_queue::WorkQueue,
    std::{cell::RefCell, rc::Rc},
};

#[test]
fn completion_routes_by_owner_and_seq() {
    let wq = WorkQueue::new();
    let log = Rc::new(RefCell::new(Vec::new()));
    for (owner, seq) in [(1, 10), (1, 11), (2, 10)] {
        let log = log.clone();
        wq.add(owner, seq, move |res| log.borrow_mut().push((owner, seq, res)));
    }
    assert!(wq.complete(1, 11, 0));
    assert!(wq.complete(2, 10, -5));
    assert!(!wq.complete(2, 10, 0));
    assert_eq!(&*log.borrow(), &[(1, 11, 0), (2, 10, -5)]);
    assert!(wq.has_pending(1));
}

#[test]
fn cancel_drops_continuations() {
    let wq = WorkQueue::new();
    let log = Rc::new(RefCell::new(Vec::new()));
    let l = log.clone();
    wq.add(7, 1, move |_| l.borrow_mut().push(1));
    wq.cancel(7);
    assert!(!wq.complete(7, 1, 0));
    assert!(log.borrow().is_empty());
    assert!(!wq.has_pending(7));
}

#[test]
fn continuation_may_add_more_work() {
    let wq = Rc::new(WorkQueue::new());
    let log = Rc::new(RefCell::new(Vec::new()));
    let wq2 = wq.clone();
    let log2 = log.clone();
    wq.add(1, 1, move |_| {
        let log3 = log2.clone();
        log2.borrow_mut().push("first");
        wq2.add(1, 2, move |_| log3.borrow_mut().push("second"));
    });
    assert!(wq.complete(1, 1, 0));
    assert!(wq.complete(1, 2, 0));
    assert_eq!(&*log.borrow(), &["first", "second"]);
}
