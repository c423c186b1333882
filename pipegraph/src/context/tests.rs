use crate::{
    error::ErrorCode,
    global::{PERM_ALL, TYPE_LINK, TYPE_NODE},
    link::LinkState,
    node_impl::{Direction, NodeCommand},
    props::Properties,
    test_framework::{TestEvent, TestNode, test_pair},
};

#[test]
fn create_link_over_the_wire_reaches_running() {
    let tp = test_pair();
    let src = TestNode::source(&[48000, 44100]);
    let sink = TestNode::sink(&[48000]);
    let src_node = tp.context.add_node("src", src, Properties::new());
    let sink_node = tp.context.add_node("sink", sink, Properties::new());
    tp.remote.get_registry();
    tp.round_trip(1);

    let src_id = src_node.global.borrow().as_ref().unwrap().id;
    let sink_id = sink_node.global.borrow().as_ref().unwrap().id;
    let proxy = tp
        .remote
        .create_link(src_id, 0, sink_id, 0, None, Properties::new());
    assert!(tp.pump_until(|| {
        tp.record
            .link_infos()
            .iter()
            .any(|(id, info)| *id == proxy && info.state == LinkState::Running.to_raw())
    }));
    let (_, info) = tp
        .record
        .link_infos()
        .into_iter()
        .filter(|(id, _)| *id == proxy)
        .next_back()
        .unwrap();
    assert_eq!(info.output_node_id, src_id);
    assert_eq!(info.input_node_id, sink_id);
    assert!(info.format.is_some());
    // The link was also published.
    assert!(tp.pump_until(|| tp.record.find_global(TYPE_LINK).is_some()));
    assert!(tp.record.errors().is_empty());
}

#[test]
fn references_ahead_of_the_clients_view_are_stale() {
    let tp = test_pair();
    let src_node = tp
        .context
        .add_node("src", TestNode::source(&[48000]), Properties::new());
    let sink_node = tp
        .context
        .add_node("sink", TestNode::sink(&[48000]), Properties::new());
    let src_id = src_node.global.borrow().as_ref().unwrap().id;
    let sink_id = sink_node.global.borrow().as_ref().unwrap().id;

    // No registry: the client has never been told about any global.
    tp.remote
        .create_link(src_id, 0, sink_id, 0, None, Properties::new());
    assert!(tp.pump_until(|| !tp.record.errors().is_empty()));
    let (id, res, _) = tp.record.errors()[0].clone();
    assert_eq!(id, 0);
    assert_eq!(res, ErrorCode::Stale.to_raw());

    // After the registry snapshot the same reference is current.
    tp.remote.get_registry();
    tp.round_trip(1);
    let proxy = tp
        .remote
        .create_link(src_id, 0, sink_id, 0, None, Properties::new());
    assert!(tp.pump_until(|| {
        tp.record
            .link_infos()
            .iter()
            .any(|(id, _)| *id == proxy)
    }));
}

#[test]
fn ids_that_never_existed_are_invalid_not_stale() {
    let tp = test_pair();
    tp.remote.get_registry();
    tp.round_trip(1);
    tp.remote
        .create_link(4000, 0, 4001, 0, None, Properties::new());
    assert!(tp.pump_until(|| !tp.record.errors().is_empty()));
    let (_, res, _) = tp.record.errors()[0].clone();
    assert_eq!(res, ErrorCode::InvalidArgument.to_raw());
}

#[test]
fn permission_masks_synthesize_registry_events() {
    let tp = test_pair();
    let node = tp
        .context
        .add_node("src", TestNode::source(&[48000]), Properties::new());
    let node_id = node.global.borrow().as_ref().unwrap().id;
    tp.remote.get_registry();
    tp.round_trip(1);
    assert_eq!(tp.record.find_global(TYPE_NODE), Some(node_id));

    tp.context.set_permission(&tp.client, node_id, 0);
    assert!(tp.pump_until(|| {
        tp.record
            .events
            .borrow()
            .iter()
            .any(|e| matches!(e, TestEvent::GlobalRemove { id, .. } if *id == node_id))
    }));

    // An unreadable global cannot be referenced either.
    let sink_node = tp
        .context
        .add_node("sink", TestNode::sink(&[48000]), Properties::new());
    let sink_id = sink_node.global.borrow().as_ref().unwrap().id;
    tp.round_trip(2);
    tp.remote
        .create_link(node_id, 0, sink_id, 0, None, Properties::new());
    assert!(tp.pump_until(|| !tp.record.errors().is_empty()));
    let (_, res, _) = tp.record.errors()[0].clone();
    assert_eq!(res, ErrorCode::NoPermission.to_raw());

    // Restoring the mask re-announces the global.
    tp.context.set_permission(&tp.client, node_id, PERM_ALL);
    tp.round_trip(3);
    let announcements = tp
        .record
        .globals()
        .iter()
        .filter(|(id, _, _)| *id == node_id)
        .count();
    assert_eq!(announcements, 2);
}

#[test]
fn killing_a_client_removes_its_globals() {
    let tp = test_pair();
    let (remote_b, record_b) = tp.second_remote();
    remote_b.get_registry();
    tp.remote
        .client_update(Properties::from([("application.name", "producer")]));
    let _client_node = tp.remote.create_client_node(
        "cam",
        Properties::new(),
        TestNode::source(&[48000]),
    );
    assert!(tp.pump_until(|| {
        record_b.find_global(crate::global::TYPE_CLIENT).is_some()
            && record_b.find_global(TYPE_NODE).is_some()
    }));
    let client_gid = record_b.find_global(crate::global::TYPE_CLIENT).unwrap();
    let node_gid = record_b.find_global(TYPE_NODE).unwrap();

    tp.context.kill_client(&tp.client);
    let removed = |gid: u32| {
        record_b
            .events
            .borrow()
            .iter()
            .any(|e| matches!(e, TestEvent::GlobalRemove { id, .. } if *id == gid))
    };
    assert!(tp.pump_until(|| removed(client_gid) && removed(node_gid)));
}

#[test]
fn client_node_negotiates_and_streams() {
    let tp = test_pair();
    let sink_impl = TestNode::sink(&[48000]);
    let sink_node = tp
        .context
        .add_node("sink", sink_impl.clone(), Properties::new());
    let source_impl = TestNode::source(&[48000]);
    let client_node =
        tp.remote
            .create_client_node("cam", Properties::new(), source_impl.clone());

    // The server materializes the node once the port updates arrive.
    assert!(tp.pump_until(|| {
        tp.context
            .nodes
            .borrow()
            .iter()
            .any(|n| n.name() == "cam" && n.port(Direction::Output, 0).is_some())
    }));
    let node = tp
        .context
        .nodes
        .borrow()
        .iter()
        .find(|n| n.name() == "cam")
        .cloned()
        .unwrap();
    let out_port = node.port(Direction::Output, 0).unwrap();
    let in_port = sink_node.port(Direction::Input, 0).unwrap();

    let link = tp.context.link_ports(out_port, in_port);
    // Format and buffers round-trip over the protocol.
    assert!(tp.pump_until(|| link.state() == LinkState::Running));
    assert!(source_impl.current_format().is_some());
    assert_eq!(source_impl.buffer_count(), 4);
    assert!(source_impl.commands.borrow().contains(&NodeCommand::Start));
    // The buffers the client mapped are backed by announced pool
    // blocks.
    assert!(tp.remote.pool.get(0).is_some());

    // Start kicks a pull; the produced buffer crosses the transport
    // into the sink and its reuse is delivered back on the ring.
    assert!(tp.pump_until(|| sink_impl.consumed.borrow().contains(&0)));
    assert!(tp.pump_until(|| {
        source_impl
            .reused
            .borrow()
            .iter()
            .any(|(port, buffer)| *port == 0 && *buffer == 0)
    }));

    // Tearing the node down unlinks and acknowledges the id.
    let proxy = client_node.proxy_id();
    client_node.destroy();
    assert!(tp.pump_until(|| tp.record.removed_ids().contains(&proxy)));
    assert_eq!(link.state(), LinkState::Unlinked);
}

#[test]
fn duplicate_resource_ids_are_a_protocol_violation() {
    let tp = test_pair();
    // Id 0 is the implicit core binding of every client.
    tp.remote
        .send_core_method(&crate::protocol::core::CoreMethod::GetRegistry { new_id: 0 });
    assert!(tp.pump_until(|| tp.remote.is_dead() || tp.client.is_destroyed()));
    assert!(tp.client.is_destroyed());
}
