use {
    crate::{
        node::NodeState,
        node_impl::{Direction, NodeCommand},
        port::PortState,
        props::Properties,
        test_framework::{TestNode, test_pair},
    },
    std::rc::Rc,
};

#[test]
fn ports_come_from_the_implementation() {
    let tp = test_pair();
    let source = TestNode::source(&[48000]);
    let node = tp
        .context
        .add_node("src", source.clone(), Properties::new());
    assert_eq!(node.state(), NodeState::Suspended);
    let port = node.port(Direction::Output, 0).unwrap();
    assert_eq!(port.state(), PortState::Configure);
    assert!(node.port(Direction::Input, 0).is_none());
    // The implementation got an io slot wired.
    assert!(source.io().is_some());
}

#[test]
fn running_then_suspended_clears_formats_and_buffers() {
    let tp = test_pair();
    let source = TestNode::source(&[48000]);
    let sink = TestNode::sink(&[48000]);
    let src_node = tp
        .context
        .add_node("src", source.clone(), Properties::new());
    let sink_node = tp.context.add_node("sink", sink.clone(), Properties::new());
    let out_port = src_node.port(Direction::Output, 0).unwrap();
    let in_port = sink_node.port(Direction::Input, 0).unwrap();
    tp.context.link_ports(out_port.clone(), in_port.clone());

    assert_eq!(src_node.state(), NodeState::Running);
    assert_eq!(sink_node.state(), NodeState::Running);
    assert_eq!(out_port.state(), PortState::Streaming);
    assert!(source.current_format().is_some());
    assert!(source.buffer_count() > 0);
    assert!(
        source
            .commands
            .borrow()
            .contains(&NodeCommand::Start)
    );

    src_node.set_state(NodeState::Suspended);
    assert_eq!(src_node.state(), NodeState::Suspended);
    assert_eq!(out_port.state(), PortState::Configure);
    // Observable through the capability as well.
    assert_eq!(
        src_node
            .implementation
            .port_get_format(Direction::Output, 0)
            .unwrap(),
        None
    );
    assert_eq!(source.buffer_count(), 0);
    assert!(
        source
            .commands
            .borrow()
            .contains(&NodeCommand::Pause)
    );
}

#[test]
fn failing_command_moves_the_node_to_error() {
    struct FailingStart(Rc<TestNode>);
    impl crate::node_impl::NodeImpl for FailingStart {
        fn get_n_ports(&self) -> crate::node_impl::PortCounts {
            self.0.get_n_ports()
        }
        fn get_port_ids(&self, direction: Direction) -> Vec<u32> {
            self.0.get_port_ids(direction)
        }
        fn port_enum_formats(
            &self,
            direction: Direction,
            port_id: u32,
            index: u32,
            filter: Option<crate::pod::Pod<'_>>,
        ) -> Result<Option<Vec<u8>>, crate::error::ErrorCode> {
            self.0.port_enum_formats(direction, port_id, index, filter)
        }
        fn port_set_format(
            &self,
            direction: Direction,
            port_id: u32,
            flags: u32,
            format: Option<&[u8]>,
        ) -> Result<crate::node_impl::OpResult, crate::error::ErrorCode> {
            self.0.port_set_format(direction, port_id, flags, format)
        }
        fn port_get_format(
            &self,
            direction: Direction,
            port_id: u32,
        ) -> Result<Option<Vec<u8>>, crate::error::ErrorCode> {
            self.0.port_get_format(direction, port_id)
        }
        fn port_get_info(
            &self,
            direction: Direction,
            port_id: u32,
        ) -> Result<crate::node_impl::PortImplInfo, crate::error::ErrorCode> {
            self.0.port_get_info(direction, port_id)
        }
        fn port_enum_params(
            &self,
            direction: Direction,
            port_id: u32,
            param_id: u32,
            index: u32,
            filter: Option<crate::pod::Pod<'_>>,
        ) -> Result<Option<Vec<u8>>, crate::error::ErrorCode> {
            self.0
                .port_enum_params(direction, port_id, param_id, index, filter)
        }
        fn port_use_buffers(
            &self,
            direction: Direction,
            port_id: u32,
            buffers: Vec<Rc<crate::buffers::Buffer>>,
        ) -> Result<crate::node_impl::OpResult, crate::error::ErrorCode> {
            self.0.port_use_buffers(direction, port_id, buffers)
        }
        fn port_set_io(
            &self,
            direction: Direction,
            port_id: u32,
            io: Option<crate::node_impl::IoHandle>,
        ) -> Result<(), crate::error::ErrorCode> {
            self.0.port_set_io(direction, port_id, io)
        }
        fn send_command(
            &self,
            command: &NodeCommand,
        ) -> Result<crate::node_impl::OpResult, crate::error::ErrorCode> {
            if matches!(command, NodeCommand::Start) {
                return Err(crate::error::ErrorCode::NotSupported);
            }
            self.0.send_command(command)
        }
        fn process_input(&self) -> Result<u32, crate::error::ErrorCode> {
            self.0.process_input()
        }
        fn process_output(&self) -> Result<u32, crate::error::ErrorCode> {
            self.0.process_output()
        }
        fn set_events(&self, events: Rc<dyn crate::node_impl::NodeImplEvents>) {
            self.0.set_events(events)
        }
    }

    let tp = test_pair();
    let source = TestNode::source(&[48000]);
    let sink = TestNode::sink(&[48000]);
    let src_node = tp.context.add_node(
        "failing",
        Rc::new(FailingStart(source)),
        Properties::new(),
    );
    let sink_node = tp.context.add_node("sink", sink, Properties::new());
    let link = tp.context.link_ports(
        src_node.port(Direction::Output, 0).unwrap(),
        sink_node.port(Direction::Input, 0).unwrap(),
    );
    assert_eq!(src_node.state(), NodeState::Error);
    assert!(src_node.error().is_some());
    // The attached link is driven to error as well.
    assert_eq!(link.state(), crate::link::LinkState::Error);
}
