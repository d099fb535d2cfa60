//! Node-to-node networking: URIs, transports, peers, listeners and the
//! per-node [`Universe`] hub.

mod listener;
pub mod peer;
mod transport;
pub mod universe;
pub mod uri;

pub use peer::{NodeState, Peer, PeerId, MAX_RECONNECT_ATTEMPTS, PROTOCOL_VERSION};
pub use universe::{RpcHandler, Universe};
pub use uri::{NetUri, Scheme};
