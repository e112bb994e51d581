//! The internal and external endpoints a node can be reached at.

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
};

use crate::protocol::wire::{
    ip_from_slice, MessageReader, WireDeserialize, WireError, WireMessage, WireSerialize,
};

/// The detail type byte for an endpoint on the node's local network.
const INTERNAL_DETAIL: u8 = 1;

/// The detail type byte for a public or NAT-mapped endpoint.
const EXTERNAL_DETAIL: u8 = 2;

/// The endpoints a node can be reached at.
///
/// Internal endpoints are visible on the node's local network, external
/// endpoints are public or NAT-mapped. List order is preserved, and
/// duplicates are kept.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct NetworkAddress {
    /// Endpoints on the node's local network.
    pub internal: Vec<SocketAddr>,
    /// Public or NAT-mapped endpoints.
    pub external: Vec<SocketAddr>,
}

impl NetworkAddress {
    /// An address with a single internal endpoint.
    pub fn internal(addr: SocketAddr) -> NetworkAddress {
        NetworkAddress {
            internal: vec![addr],
            external: Vec::new(),
        }
    }

    /// Does this address have no endpoints at all?
    pub fn is_empty(&self) -> bool {
        self.internal.is_empty() && self.external.is_empty()
    }

    /// Do `self` and `other` share an external IP, so they are probably
    /// behind the same NAT?
    pub fn shares_external_ip(&self, other: &NetworkAddress) -> bool {
        self.external
            .iter()
            .any(|mine| other.external.iter().any(|theirs| mine.ip() == theirs.ip()))
    }

    /// Returns the endpoints a node at `from` should try when connecting to `self`.
    ///
    /// Internal endpoints are only useful when there is no external endpoint,
    /// or when both nodes are behind the same external IP.
    pub fn connect_candidates(&self, from: &NetworkAddress) -> Vec<SocketAddr> {
        if self.external.is_empty() {
            return self.internal.clone();
        }

        if self.shares_external_ip(from) {
            self.internal
                .iter()
                .chain(self.external.iter())
                .copied()
                .collect()
        } else {
            self.external.clone()
        }
    }
}

impl fmt::Debug for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Internal: ( ")?;
        for ep in &self.internal {
            write!(f, "{ep} ")?;
        }
        write!(f, "); External: ( ")?;
        for ep in &self.external {
            write!(f, "{ep} ")?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

fn put_detail(message: &mut WireMessage, detail: u8, addr: &SocketAddr) {
    let octets = match addr.ip() {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    };

    message.put_u8(detail);
    // The detail length covers the address bytes and the port.
    message.put_u16(octets.len() as u16 + 2);
    message.put_raw(&octets);
    message.put_u16(addr.port());
}

impl WireSerialize for NetworkAddress {
    fn wire_serialize(&self, message: &mut WireMessage) {
        let count = self.internal.len() + self.external.len();
        message.put_u16(u16::try_from(count).unwrap_or(u16::MAX));

        let details = self
            .internal
            .iter()
            .map(|addr| (INTERNAL_DETAIL, addr))
            .chain(self.external.iter().map(|addr| (EXTERNAL_DETAIL, addr)))
            .take(usize::from(u16::MAX));

        for (detail, addr) in details {
            put_detail(message, detail, addr);
        }
    }
}

impl WireDeserialize for NetworkAddress {
    fn wire_deserialize(reader: &mut MessageReader<'_>) -> Result<Self, WireError> {
        let mut address = NetworkAddress::default();

        let count = reader.read_u16()?;
        for _ in 0..count {
            let detail = reader.read_u8()?;
            let len = usize::from(reader.read_u16()?);

            let list = match detail {
                INTERNAL_DETAIL => &mut address.internal,
                EXTERNAL_DETAIL => &mut address.external,
                _ => {
                    // Skip details from newer peers.
                    reader.skip(len)?;
                    continue;
                }
            };

            if len < 2 {
                return Err(WireError::BadLength(len as i64));
            }
            let ip = ip_from_slice(reader.read_raw(len - 2)?)?;
            let port = reader.read_u16()?;
            list.push(SocketAddr::new(ip, port));
        }

        Ok(address)
    }
}
