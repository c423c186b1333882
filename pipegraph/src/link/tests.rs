use {
    crate::{
        link::{Link, LinkState},
        node_impl::Direction,
        pod::Pod,
        port::PortState,
        props::Properties,
        test_framework::{TestNode, test_pair},
        types,
    },
    std::rc::Rc,
};

fn format_rate(data: &[u8]) -> i32 {
    let pod = Pod::from_slice(data).unwrap();
    let obj = pod.as_object().unwrap();
    obj.find(types::KEY_AUDIO_RATE)
        .unwrap()
        .unwrap()
        .first()
        .unwrap()
        .as_int()
        .unwrap()
}

#[test]
fn negotiation_prefers_the_outputs_enumeration_order() {
    let tp = test_pair();
    let source = TestNode::source(&[48000, 44100]);
    let sink = TestNode::sink(&[44100, 48000, 96000]);
    let src_node = tp
        .context
        .add_node("src", source.clone(), Properties::new());
    let sink_node = tp.context.add_node("sink", sink.clone(), Properties::new());
    let out_port = src_node.port(Direction::Output, 0).unwrap();
    let in_port = sink_node.port(Direction::Input, 0).unwrap();

    let link = Link::new(&tp.context, out_port.clone(), in_port.clone(), None, Properties::new());
    link.check_states();

    // The first common entry in the output's enumeration order wins.
    assert_eq!(format_rate(&link.format().unwrap()), 48000);
    assert_eq!(format_rate(&source.current_format().unwrap()), 48000);
    assert_eq!(format_rate(&sink.current_format().unwrap()), 48000);
    assert_eq!(link.state(), LinkState::Paused);
    assert_eq!(out_port.state(), PortState::Paused);
    assert_eq!(in_port.state(), PortState::Paused);
}

#[test]
fn both_endpoints_share_the_buffer_set() {
    let tp = test_pair();
    let source = TestNode::source(&[48000]);
    let sink = TestNode::sink(&[48000]);
    let src_node = tp.context.add_node("src", source, Properties::new());
    let sink_node = tp.context.add_node("sink", sink, Properties::new());
    let out_port = src_node.port(Direction::Output, 0).unwrap();
    let in_port = sink_node.port(Direction::Input, 0).unwrap();
    let link = Link::new(&tp.context, out_port.clone(), in_port.clone(), None, Properties::new());
    link.check_states();

    let out_buffers = out_port.buffers();
    let in_buffers = in_port.buffers();
    assert!(!out_buffers.is_empty());
    assert_eq!(out_buffers.len(), in_buffers.len());
    for (a, b) in out_buffers.iter().zip(&in_buffers) {
        // The same objects, not copies: same backing block and
        // offset.
        assert!(Rc::ptr_eq(a, b));
        assert!(a.datas[0].block.is_some());
    }
}

#[test]
fn link_filter_constrains_the_choice() {
    let tp = test_pair();
    let source = TestNode::source(&[48000, 44100]);
    let sink = TestNode::sink(&[48000, 44100]);
    let src_node = tp.context.add_node("src", source, Properties::new());
    let sink_node = tp.context.add_node("sink", sink, Properties::new());
    let filter = crate::format::audio_raw_enum(&[types::AUDIO_F32], &[44100], 2);
    let link = Link::new(
        &tp.context,
        src_node.port(Direction::Output, 0).unwrap(),
        sink_node.port(Direction::Input, 0).unwrap(),
        Some(filter),
        Properties::new(),
    );
    link.check_states();
    assert_eq!(format_rate(&link.format().unwrap()), 44100);
}

#[test]
fn no_common_format_is_a_link_error() {
    let tp = test_pair();
    let source = TestNode::source(&[48000]);
    let sink = TestNode::sink(&[44100]);
    let src_node = tp
        .context
        .add_node("src", source.clone(), Properties::new());
    let sink_node = tp.context.add_node("sink", sink, Properties::new());
    let link = Link::new(
        &tp.context,
        src_node.port(Direction::Output, 0).unwrap(),
        sink_node.port(Direction::Input, 0).unwrap(),
        None,
        Properties::new(),
    );
    link.check_states();
    assert_eq!(link.state(), LinkState::Error);
    assert!(link.error().is_some());
    // A format failure does not take the nodes down.
    assert_ne!(src_node.state(), crate::node::NodeState::Error);
    assert_eq!(src_node.port(Direction::Output, 0).unwrap().state(), PortState::Configure);
}

#[test]
fn activation_runs_both_nodes() {
    let tp = test_pair();
    let source = TestNode::source(&[48000]);
    let sink = TestNode::sink(&[48000]);
    let src_node = tp.context.add_node("src", source, Properties::new());
    let sink_node = tp.context.add_node("sink", sink, Properties::new());
    let out_port = src_node.port(Direction::Output, 0).unwrap();
    let in_port = sink_node.port(Direction::Input, 0).unwrap();
    let link = tp.context.link_ports(out_port.clone(), in_port.clone());
    assert_eq!(link.state(), LinkState::Running);
    assert_eq!(out_port.state(), PortState::Streaming);
    assert_eq!(in_port.state(), PortState::Streaming);

    link.deactivate();
    assert_eq!(link.state(), LinkState::Paused);
    assert_eq!(out_port.state(), PortState::Paused);
    assert_eq!(src_node.state(), crate::node::NodeState::Idle);
    assert_eq!(sink_node.state(), crate::node::NodeState::Idle);
}

#[test]
fn unlink_releases_the_ports() {
    let tp = test_pair();
    let source = TestNode::source(&[48000]);
    let sink = TestNode::sink(&[48000]);
    let src_node = tp
        .context
        .add_node("src", source.clone(), Properties::new());
    let sink_node = tp.context.add_node("sink", sink, Properties::new());
    let out_port = src_node.port(Direction::Output, 0).unwrap();
    let in_port = sink_node.port(Direction::Input, 0).unwrap();
    let link = tp.context.link_ports(out_port.clone(), in_port.clone());

    link.unlink();
    assert_eq!(link.state(), LinkState::Unlinked);
    assert!(out_port.mixes.borrow().is_empty());
    assert!(in_port.mixes.borrow().is_empty());
    // Releasing the last mix clears the port's format.
    assert_eq!(source.current_format(), None);
    assert_eq!(out_port.state(), PortState::Configure);
}
