//! Node identity and the advertised description of a node.

use std::{
    fmt,
    hash::{Hash, Hasher},
};

use uuid::Uuid;

use crate::{
    identity::NetworkAddress,
    protocol::wire::{
        MessageReader, TaggedMessage, Tag, WireDeserialize, WireError, WireMessage, WireSerialize,
    },
};

/// A process-wide unique node identifier.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Returns a new random node id.
    pub fn new_random() -> NodeId {
        NodeId(Uuid::new_v4())
    }

    /// The nil id, which matches any node in a connection request.
    pub const fn nil() -> NodeId {
        NodeId(Uuid::nil())
    }

    /// Is this the nil id?
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    /// The underlying GUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for NodeId {
    fn from(uuid: Uuid) -> Self {
        NodeId(uuid)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NodeId").field(&self.0.to_string()).finish()
    }
}

/// The operating mode of a node.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(any(test, feature = "proptest-impl"), derive(proptest_derive::Arbitrary))]
pub enum Mode {
    /// The mode has not been advertised yet.
    #[default]
    Unknown,
    /// Relays queries and gossip for other hubs and its leaves.
    Hub,
    /// Attaches to hubs, and does not relay.
    Leaf,
}

impl Mode {
    const HUB_ID: u8 = b'H';
    const LEAF_ID: u8 = b'L';
    const UNKNOWN_ID: u8 = b'U';

    pub(crate) fn to_wire(self) -> u8 {
        match self {
            Mode::Hub => Self::HUB_ID,
            Mode::Leaf => Self::LEAF_ID,
            Mode::Unknown => Self::UNKNOWN_ID,
        }
    }

    pub(crate) fn from_wire(value: u8) -> Result<Mode, WireError> {
        match value {
            Self::HUB_ID => Ok(Mode::Hub),
            Self::LEAF_ID => Ok(Mode::Leaf),
            Self::UNKNOWN_ID => Ok(Mode::Unknown),
            _ => Err(WireError::BadValue {
                field: "node mode",
                value,
            }),
        }
    }
}

/// A reference to a node's public key.
///
/// Key handling belongs to the signing collaborator, so the key is opaque here.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct PublicKey(pub Vec<u8>);

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKey")
            .field(&format!("{} bytes", self.0.len()))
            .finish()
    }
}

/// The advertised description of a node.
///
/// Two `NodeInfo`s are equal if they have the same [`NodeId`], even if the
/// rest of their fields differ.
#[derive(Clone)]
pub struct NodeInfo {
    /// The unique id of the node.
    pub id: NodeId,
    /// The node's public key.
    pub public_key: PublicKey,
    /// The node's operating mode.
    pub mode: Mode,
    /// The number of hubs the node is connected to.
    pub hub_count: i32,
    /// The number of leaves connected to the node.
    pub leaf_count: i32,
    /// Where the node can be reached.
    pub address: NetworkAddress,
    /// A human-readable name, which may be empty.
    pub friendly_name: String,
}

impl NodeInfo {
    /// Returns a node info for `id`, with every other field empty.
    ///
    /// Used as a placeholder for a remote node before it has sent its own info.
    pub fn placeholder(id: NodeId) -> NodeInfo {
        NodeInfo {
            id,
            public_key: PublicKey::default(),
            mode: Mode::Unknown,
            hub_count: 0,
            leaf_count: 0,
            address: NetworkAddress::default(),
            friendly_name: String::new(),
        }
    }

    /// Is this node a hub?
    pub fn is_hub(&self) -> bool {
        self.mode == Mode::Hub
    }

    /// Is this node a leaf?
    pub fn is_leaf(&self) -> bool {
        self.mode == Mode::Leaf
    }

    /// Do `self` and `other` describe the same node with the same advertised fields?
    pub fn same_advertisement(&self, other: &NodeInfo) -> bool {
        self.id == other.id
            && self.public_key == other.public_key
            && self.mode == other.mode
            && self.hub_count == other.hub_count
            && self.leaf_count == other.leaf_count
            && self.address == other.address
            && self.friendly_name == other.friendly_name
    }
}

impl PartialEq for NodeInfo {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodeInfo {}

impl Hash for NodeInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.friendly_name.is_empty() {
            write!(f, "{}", self.id)
        } else {
            f.write_str(&self.friendly_name)
        }
    }
}

impl fmt::Debug for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeInfo")
            .field("id", &self.id)
            .field("friendly_name", &self.friendly_name)
            .field("mode", &self.mode)
            .field("hub_count", &self.hub_count)
            .field("leaf_count", &self.leaf_count)
            .field("address", &self.address)
            .finish()
    }
}

impl WireSerialize for NodeInfo {
    fn wire_serialize(&self, message: &mut WireMessage) {
        message.put_char(self.mode.to_wire());
        message.put_i32(self.hub_count);
        message.put_i32(self.leaf_count);
        message.put_guid(self.id.as_uuid());
        self.address.wire_serialize(message);
        message.put_string(&self.friendly_name);
        message.put_bytes(&self.public_key.0);
    }
}

impl WireDeserialize for NodeInfo {
    fn wire_deserialize(reader: &mut MessageReader<'_>) -> Result<Self, WireError> {
        let mode = Mode::from_wire(reader.read_char()?)?;
        let hub_count = reader.read_i32()?;
        let leaf_count = reader.read_i32()?;
        let id = NodeId(reader.read_guid()?);
        let address = NetworkAddress::wire_deserialize(reader)?;
        let friendly_name = reader.read_string()?;
        let public_key = PublicKey(reader.read_bytes()?);

        Ok(NodeInfo {
            id,
            public_key,
            mode,
            hub_count,
            leaf_count,
            address,
            friendly_name,
        })
    }
}

impl TaggedMessage for NodeInfo {
    const TAG: Tag = Tag::NODE_INFO;
}
