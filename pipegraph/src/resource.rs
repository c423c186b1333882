//! Per-client bindings of server objects.

use {
    crate::{client::Client, client_node::ClientNode, link::Link, node::Node},
    std::rc::{Rc, Weak},
};

/// What a resource id in a client's id space is bound to.
pub enum ResourceKind {
    /// The core object; always bound at id 0.
    Core,
    Registry,
    /// A binding to another (or the own) client's record.
    Client(Weak<Client>),
    Node(Weak<Node>),
    Link(Weak<Link>),
    /// A client node created by this client through the factory.
    ClientNode(Rc<ClientNode>),
}

pub struct Resource {
    pub id: u32,
    pub version: u32,
    /// The global this resource is bound to, if it was created via
    /// `registry.bind`.
    pub global_id: Option<u32>,
    pub kind: ResourceKind,
}

impl Resource {
    pub fn interface_name(&self) -> &'static str {
        match &self.kind {
            ResourceKind::Core => "core",
            ResourceKind::Registry => "registry",
            ResourceKind::Client(_) => "client",
            ResourceKind::Node(_) => "node",
            ResourceKind::Link(_) => "link",
            ResourceKind::ClientNode(_) => "client-node",
        }
    }
}
