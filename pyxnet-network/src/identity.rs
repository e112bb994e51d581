//! Node identity: ids, modes, addresses and advertised node info.

mod network_address;
mod node_info;

#[cfg(any(test, feature = "proptest-impl"))]
pub mod arbitrary;


pub use network_address::NetworkAddress;
pub use node_info::{Mode, NodeId, NodeInfo, PublicKey};
