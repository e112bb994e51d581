//! Randomised test data generation for node identity types.

use std::net::{IpAddr, SocketAddr};

use proptest::{arbitrary::any, arbitrary::Arbitrary, collection::vec, prelude::*};
use uuid::Uuid;

use super::{Mode, NetworkAddress, NodeId, NodeInfo, PublicKey};

/// Returns a strategy for socket addresses that survive serialization.
///
/// IPv6 flow info and scope ids are not sent on the wire, so they are always zero.
pub fn wire_socket_addr() -> impl Strategy<Value = SocketAddr> {
    (any::<IpAddr>(), any::<u16>()).prop_map(|(ip, port)| SocketAddr::new(ip, port))
}

impl Arbitrary for NetworkAddress {
    type Parameters = ();

    fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
        (vec(wire_socket_addr(), 0..4), vec(wire_socket_addr(), 0..4))
            .prop_map(|(internal, external)| NetworkAddress { internal, external })
            .boxed()
    }

    type Strategy = BoxedStrategy<Self>;
}

impl Arbitrary for NodeId {
    type Parameters = ();

    fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
        any::<u128>()
            .prop_map(|id| NodeId::from(Uuid::from_u128(id)))
            .boxed()
    }

    type Strategy = BoxedStrategy<Self>;
}

impl Arbitrary for NodeInfo {
    type Parameters = ();

    fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
        (
            any::<NodeId>(),
            vec(any::<u8>(), 0..64),
            any::<Mode>(),
            any::<i32>(),
            any::<i32>(),
            any::<NetworkAddress>(),
            ".{0,16}",
        )
            .prop_map(
                |(id, key, mode, hub_count, leaf_count, address, friendly_name)| NodeInfo {
                    id,
                    public_key: PublicKey(key),
                    mode,
                    hub_count,
                    leaf_count,
                    address,
                    friendly_name,
                },
            )
            .boxed()
    }

    type Strategy = BoxedStrategy<Self>;
}

impl NodeInfo {
    /// Returns a strategy for node infos with `mode`.
    pub fn mode_strategy(mode: Mode) -> BoxedStrategy<Self> {
        any::<NodeInfo>()
            .prop_map(move |mut info| {
                info.mode = mode;
                info
            })
            .boxed()
    }
}
