//! A userspace multimedia graph runtime.
//!
//! A central daemon hosts a graph of media-processing nodes. Clients
//! attach over an `AF_UNIX` socket, publish their own nodes and
//! exchange buffers with the graph through zero-copy shared memory.
//!
//! The two roots are [`context::Context`] (the daemon) and
//! [`remote::Remote`] (a client connection). Everything between them
//! splits into a control plane and a data plane:
//!
//! ```text
//! Remote ── connection ── Context ── Node ── Port ── Link
//!    │       (framed pods,     │
//!    │        fd passing)      └─ registry / globals / factories
//!    │
//!    └── transport (shared memfd: io slots + event rings,
//!                   eventfd signalling, data loop)
//! ```
//!
//! - The wire protocol frames messages as `(dest_id, opcode, size)`
//!   plus one [pod](pod) payload; see [`protocol`].
//! - Server objects visible to clients are globals announced through
//!   the registry; per-client bindings are resources, mirrored by
//!   client-side proxies with their own id space.
//! - Nodes negotiate formats and buffers through their links; the
//!   staged transitions live in [`link`] and [`node`].
//! - Nodes whose processing runs inside a client are bridged by
//!   [`client_node`] and [`transport`].
//!
//! Processing node implementations plug in through the
//! [`node_impl::NodeImpl`] trait; the daemon binary and the plugin
//! host build on top of this crate.

pub mod buffers;
pub mod client;
pub mod client_node;
pub mod connection;
pub mod context;
pub mod error;
pub mod event_loop;
pub mod format;
pub mod global;
pub mod link;
pub mod mem;
pub mod node;
pub mod node_impl;
pub mod pod;
pub mod port;
pub mod props;
pub mod protocol;
pub mod remote;
pub mod resource;
#[cfg(test)]
mod test_framework;
mod trans;
pub mod transport;
pub mod types;
mod utils;
pub mod work_queue;
