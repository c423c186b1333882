use {
    crate::{
        error::ErrorCode,
        global::{TYPE_CLIENT, TYPE_CORE, TYPE_FACTORY, TYPE_NODE},
        props::Properties,
        test_framework::{Record, TestEvent, TestNode, test_pair},
    },
    std::rc::Rc,
};

fn position(record: &Rc<Record>, pred: impl Fn(&TestEvent) -> bool) -> Option<usize> {
    record.events.borrow().iter().position(pred)
}

fn last_position(record: &Rc<Record>, pred: impl Fn(&TestEvent) -> bool) -> Option<usize> {
    record.events.borrow().iter().rposition(pred)
}

#[test]
fn connect_delivers_the_core_hello() {
    let tp = test_pair();
    tp.pump();
    let info = tp.remote.core_info().expect("no core info received");
    assert_eq!(info.name, "pipegraph-0");
    assert!(!info.version.is_empty());
    // The core and the built-in factory were registered before we
    // connected.
    assert!(info.generation >= 1);
}

#[test]
fn registry_snapshot_is_ordered_and_fenced_by_sync() {
    let tp = test_pair();
    let src = TestNode::source(&[48000]);
    tp.context.add_node("src", src, Properties::new());

    // Request the snapshot and the barrier in the same batch; FIFO
    // dispatch must deliver every global before done.
    tp.remote.get_registry();
    tp.remote.sync(7);
    assert!(tp.pump_until(|| tp.record.dones().contains(&7)));

    let globals = tp.record.globals();
    assert!(!globals.is_empty());
    assert_eq!(globals[0], (0, TYPE_CORE.to_string(), 1));
    // Registration order, which for sequential ids is ascending.
    for pair in globals.windows(2) {
        assert!(pair[0].0 < pair[1].0);
    }
    assert!(tp.record.find_global(TYPE_FACTORY).is_some());
    assert!(tp.record.find_global(TYPE_NODE).is_some());

    let last_global = last_position(&tp.record, |e| matches!(e, TestEvent::Global { .. }));
    let done = position(&tp.record, |e| matches!(e, TestEvent::Done(7)));
    assert!(last_global.unwrap() < done.unwrap());
}

#[test]
fn globals_registered_later_are_streamed_live() {
    let tp = test_pair();
    tp.remote.get_registry();
    tp.round_trip(1);
    assert_eq!(tp.record.find_global(TYPE_NODE), None);

    let node = tp
        .context
        .add_node("late", TestNode::source(&[48000]), Properties::new());
    let id = node.global.borrow().as_ref().unwrap().id;
    assert!(tp.pump_until(|| tp.record.find_global(TYPE_NODE) == Some(id)));
}

#[test]
fn bind_round_trip_releases_the_id() {
    let tp = test_pair();
    tp.context
        .add_node("src", TestNode::source(&[48000]), Properties::new());
    let registry = tp.remote.get_registry();
    tp.round_trip(1);
    let global_id = tp.record.find_global(TYPE_NODE).unwrap();

    let proxy = tp.remote.bind(registry, global_id, TYPE_NODE, 1);
    // The just-bound event.
    assert!(tp.pump_until(|| {
        tp.record
            .node_infos()
            .iter()
            .any(|(id, info)| *id == proxy && info.name == "src")
    }));

    tp.remote.destroy(proxy);
    assert!(tp.pump_until(|| tp.record.removed_ids().contains(&proxy)));
    // The acknowledged id is the first candidate for reuse.
    let again = tp.remote.bind(registry, global_id, TYPE_NODE, 1);
    assert_eq!(again, proxy);
    tp.round_trip(2);
    assert!(!tp.remote.is_dead());
}

#[test]
fn ids_stay_reserved_until_the_ack() {
    let tp = test_pair();
    tp.context
        .add_node("src", TestNode::source(&[48000]), Properties::new());
    let registry = tp.remote.get_registry();
    tp.round_trip(1);
    let global_id = tp.record.find_global(TYPE_NODE).unwrap();

    let proxy = tp.remote.bind(registry, global_id, TYPE_NODE, 1);
    tp.remote.destroy(proxy);
    // No pumping: remove_id has not arrived, the id is a zombie.
    let other = tp.remote.bind(registry, global_id, TYPE_NODE, 1);
    assert_ne!(other, proxy);
}

#[test]
fn unknown_core_opcode_is_surfaced_and_non_fatal() {
    let tp = test_pair();
    tp.remote.send_raw_opcode(0, 99);
    assert!(tp.pump_until(|| !tp.record.errors().is_empty()));
    let (id, res, _) = tp.record.errors()[0].clone();
    assert_eq!(id, 0);
    assert_eq!(res, ErrorCode::InvalidArgument.to_raw());
    // The connection survives; further methods still work.
    tp.round_trip(3);
    assert!(!tp.remote.is_dead());
}

#[test]
fn unknown_opcode_on_a_bound_proxy_carries_its_id() {
    let tp = test_pair();
    tp.context
        .add_node("src", TestNode::source(&[48000]), Properties::new());
    let registry = tp.remote.get_registry();
    tp.round_trip(1);
    let global_id = tp.record.find_global(TYPE_NODE).unwrap();
    let proxy = tp.remote.bind(registry, global_id, TYPE_NODE, 1);
    tp.round_trip(2);

    // The node interface has no methods at all.
    tp.remote.send_raw_opcode(proxy, 0);
    assert!(tp.pump_until(|| !tp.record.errors().is_empty()));
    let (id, res, _) = tp.record.errors()[0].clone();
    assert_eq!(id, proxy);
    assert_eq!(res, ErrorCode::InvalidArgument.to_raw());
    tp.round_trip(3);
}

#[test]
fn client_update_publishes_a_client_global() {
    let tp = test_pair();
    let (remote_b, record_b) = tp.second_remote();
    remote_b.get_registry();
    tp.remote.sync(1);
    assert!(tp.pump_until(|| tp.record.dones().contains(&1)));
    assert_eq!(record_b.find_global(TYPE_CLIENT), None);

    tp.remote
        .client_update(Properties::from([("application.name", "recorder")]));
    assert!(tp.pump_until(|| record_b.find_global(TYPE_CLIENT).is_some()));

    // A second update must not register a second global.
    tp.remote
        .client_update(Properties::from([("application.name", "recorder2")]));
    tp.round_trip(2);
    let clients = record_b
        .globals()
        .iter()
        .filter(|(_, t, _)| t == TYPE_CLIENT)
        .count();
    assert_eq!(clients, 1);
}
