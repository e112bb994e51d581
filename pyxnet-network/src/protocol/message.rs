//! Typed PYXNet messages.
//!
//! Each type here is a [`TaggedMessage`]: it serializes to a [`WireMessage`]
//! with its own tag, and parses only messages with that tag.
//! Liveness messages (`PING`, `PONG`, `CLOS`) have no payload, so they are
//! built directly from their [`Tag`].

use std::io::{Read, Write};

use flate2::{read::DeflateDecoder, write::DeflateEncoder, Compression};
use uuid::Uuid;

use crate::{
    hub_membership::HubList,
    identity::{NodeId, NodeInfo},
    protocol::wire::{
        MessageReader, Tag, TaggedMessage, WireDeserialize, WireError, WireMessage, WireSerialize,
    },
};

/// Nested messages are written as counted bytes, including their tag.
impl WireSerialize for WireMessage {
    fn wire_serialize(&self, message: &mut WireMessage) {
        message.put_message(self);
    }
}

impl WireDeserialize for WireMessage {
    fn wire_deserialize(reader: &mut MessageReader<'_>) -> Result<Self, WireError> {
        reader.read_message()
    }
}

/// Implements [`TaggedMessage`] for message types with a fixed tag.
macro_rules! tagged_message {
    ($($ty:ty => $tag:expr),+ $(,)?) => {
        $(
            impl TaggedMessage for $ty {
                const TAG: Tag = $tag;
            }
        )+
    };
}

tagged_message! {
    Query => Tag::QUERY,
    QueryAcknowledgement => Tag::QUERY_ACK,
    QueryResult => Tag::QUERY_RESULT,
    MessageRelay => Tag::MESSAGE_RELAY,
    MessageRelayAck => Tag::MESSAGE_RELAY_ACK,
    StackConnector => Tag::CONNECTOR,
    ConnectionRequest => Tag::CONNECTION_REQUEST,
    ConnectionResponse => Tag::CONNECTION_RESPONSE,
    Status => Tag::STATUS,
    StatusRequest => Tag::STATUS_REQUEST,
    SignedEnvelope => Tag::SIGNED,
}

/// A content query, broadcast across the hub graph.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Query {
    /// Identifies the query, so duplicates can be dropped and results
    /// correlated.
    pub guid: Uuid,
    /// The node that issued the query, and receives its results.
    pub origin: NodeInfo,
    /// The number of hops from the origin's first hub.
    pub hop_count: i32,
    /// The text to match against query filters.
    pub contents: String,
    /// Opaque extra conditions, interpreted by the content layer.
    pub qualifiers: Vec<WireMessage>,
}

impl Query {
    /// Returns a new query from `origin`, with a random GUID.
    pub fn new(origin: NodeInfo, contents: impl Into<String>) -> Query {
        Query {
            guid: Uuid::new_v4(),
            origin,
            hop_count: 0,
            contents: contents.into(),
            qualifiers: Vec::new(),
        }
    }

    /// Returns a copy of this query one hop further from its origin.
    pub fn hopped(&self) -> Query {
        Query {
            hop_count: self.hop_count.saturating_add(1),
            ..self.clone()
        }
    }
}

impl WireSerialize for Query {
    fn wire_serialize(&self, message: &mut WireMessage) {
        message.put_guid(&self.guid);
        self.origin.wire_serialize(message);
        message.put_i32(self.hop_count);
        message.put_string(&self.contents);
        self.qualifiers.wire_serialize(message);
    }
}

impl WireDeserialize for Query {
    fn wire_deserialize(reader: &mut MessageReader<'_>) -> Result<Self, WireError> {
        Ok(Query {
            guid: reader.read_guid()?,
            origin: NodeInfo::wire_deserialize(reader)?,
            hop_count: reader.read_i32()?,
            contents: reader.read_string()?,
            qualifiers: Vec::wire_deserialize(reader)?,
        })
    }
}

/// The body shared by query and relay acknowledgements.
///
/// A hub acknowledges each broadcast it receives. A dead end means the
/// broadcast should continue with other hubs: the acknowledgement lists
/// the hubs this hub has already covered, and more hubs to try.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Acknowledgement {
    /// The query or relay GUID being acknowledged.
    pub guid: Uuid,
    /// The acknowledging node.
    pub from: NodeInfo,
    /// Should the broadcast continue elsewhere?
    pub is_dead_end: bool,
    /// Hubs that have already seen the broadcast.
    pub visited: Vec<NodeInfo>,
    /// Hubs the broadcast could try next.
    pub candidates: Vec<NodeInfo>,
}

impl Acknowledgement {
    /// Returns an acknowledgement that stops the broadcast.
    pub fn reached(guid: Uuid, from: NodeInfo) -> Acknowledgement {
        Acknowledgement {
            guid,
            from,
            is_dead_end: false,
            visited: Vec::new(),
            candidates: Vec::new(),
        }
    }

    /// Returns a dead-end acknowledgement that marks `from` as visited.
    pub fn dead_end(guid: Uuid, from: NodeInfo, candidates: Vec<NodeInfo>) -> Acknowledgement {
        Acknowledgement {
            guid,
            visited: vec![from.clone()],
            from,
            is_dead_end: true,
            candidates,
        }
    }
}

impl WireSerialize for Acknowledgement {
    fn wire_serialize(&self, message: &mut WireMessage) {
        message.put_guid(&self.guid);
        self.from.wire_serialize(message);
        message.put_bool(self.is_dead_end);
        self.visited.wire_serialize(message);
        self.candidates.wire_serialize(message);
    }
}

impl WireDeserialize for Acknowledgement {
    fn wire_deserialize(reader: &mut MessageReader<'_>) -> Result<Self, WireError> {
        Ok(Acknowledgement {
            guid: reader.read_guid()?,
            from: NodeInfo::wire_deserialize(reader)?,
            is_dead_end: reader.read_bool()?,
            visited: Vec::wire_deserialize(reader)?,
            candidates: Vec::wire_deserialize(reader)?,
        })
    }
}

/// An acknowledgement of a [`Query`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryAcknowledgement(pub Acknowledgement);

/// An acknowledgement of a [`MessageRelay`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageRelayAck(pub Acknowledgement);

macro_rules! acknowledgement_newtype {
    ($($ty:ident),+) => {
        $(
            impl WireSerialize for $ty {
                fn wire_serialize(&self, message: &mut WireMessage) {
                    self.0.wire_serialize(message);
                }
            }

            impl WireDeserialize for $ty {
                fn wire_deserialize(reader: &mut MessageReader<'_>) -> Result<Self, WireError> {
                    Acknowledgement::wire_deserialize(reader).map($ty)
                }
            }

            impl From<Acknowledgement> for $ty {
                fn from(ack: Acknowledgement) -> Self {
                    $ty(ack)
                }
            }
        )+
    };
}

acknowledgement_newtype!(QueryAcknowledgement, MessageRelayAck);

/// A query match, sent back towards the query origin.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryResult {
    /// The GUID of the matched query.
    pub query_guid: Uuid,
    /// The node that issued the query.
    pub query_origin: NodeInfo,
    /// The size of the matching data, in bytes.
    pub data_size: i64,
    /// The kind of hash in `hash_code`.
    pub hash_code_type: u8,
    /// A hash of the matching data, which may be empty.
    pub hash_code: Vec<u8>,
    /// The node that holds the data.
    pub result_node: NodeInfo,
    /// The matching content.
    pub matching_contents: String,
    /// A description of the match.
    pub matching_description: String,
    /// The dataset that matched.
    pub matching_dataset_id: String,
    /// Opaque extra information from the content layer.
    pub extra_info: Option<WireMessage>,
    /// Must the result be delivered over a direct connection to the origin?
    pub requires_direct_connection: bool,
}

impl QueryResult {
    /// Returns an empty result for `query`, found at `result_node`.
    pub fn for_query(query: &Query, result_node: NodeInfo) -> QueryResult {
        QueryResult {
            query_guid: query.guid,
            query_origin: query.origin.clone(),
            data_size: 0,
            hash_code_type: 0,
            hash_code: Vec::new(),
            result_node,
            matching_contents: String::new(),
            matching_description: String::new(),
            matching_dataset_id: String::new(),
            extra_info: None,
            requires_direct_connection: false,
        }
    }
}

impl WireSerialize for QueryResult {
    fn wire_serialize(&self, message: &mut WireMessage) {
        message.put_guid(&self.query_guid);
        self.query_origin.wire_serialize(message);
        message.put_i64(self.data_size);
        message.put_u8(self.hash_code_type);
        message.put_bytes(&self.hash_code);
        self.result_node.wire_serialize(message);
        message.put_string(&self.matching_contents);
        message.put_string(&self.matching_description);
        message.put_string(&self.matching_dataset_id);
        match &self.extra_info {
            Some(extra) => message.put_message(extra),
            None => message.put_length(0),
        }
        message.put_bool(self.requires_direct_connection);
    }
}

impl WireDeserialize for QueryResult {
    fn wire_deserialize(reader: &mut MessageReader<'_>) -> Result<Self, WireError> {
        Ok(QueryResult {
            query_guid: reader.read_guid()?,
            query_origin: NodeInfo::wire_deserialize(reader)?,
            data_size: reader.read_i64()?,
            hash_code_type: reader.read_u8()?,
            hash_code: reader.read_bytes()?,
            result_node: NodeInfo::wire_deserialize(reader)?,
            matching_contents: reader.read_string()?,
            matching_description: reader.read_string()?,
            matching_dataset_id: reader.read_string()?,
            extra_info: match reader.read_bytes()? {
                bytes if bytes.is_empty() => None,
                bytes => Some(WireMessage::from_bytes(bytes)?),
            },
            requires_direct_connection: reader.read_bool()?,
        })
    }
}

/// A message being carried across the hub graph to a single node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageRelay {
    /// Identifies the relay, so acknowledgements can be correlated.
    pub guid: Uuid,
    /// The node that should receive `payload`.
    pub target: NodeId,
    /// The node that started the relay.
    pub origin: NodeInfo,
    /// The relayed message.
    pub payload: WireMessage,
}

impl MessageRelay {
    /// Returns a new relay of `payload` to `target`, with a random GUID.
    pub fn new(origin: NodeInfo, target: NodeId, payload: WireMessage) -> MessageRelay {
        MessageRelay {
            guid: Uuid::new_v4(),
            target,
            origin,
            payload,
        }
    }
}

impl WireSerialize for MessageRelay {
    fn wire_serialize(&self, message: &mut WireMessage) {
        message.put_guid(&self.guid);
        message.put_guid(self.target.as_uuid());
        self.origin.wire_serialize(message);
        message.put_message(&self.payload);
    }
}

impl WireDeserialize for MessageRelay {
    fn wire_deserialize(reader: &mut MessageReader<'_>) -> Result<Self, WireError> {
        Ok(MessageRelay {
            guid: reader.read_guid()?,
            target: reader.read_guid()?.into(),
            origin: NodeInfo::wire_deserialize(reader)?,
            payload: reader.read_message()?,
        })
    }
}

/// Asks the receiver to open a connection to `node`.
///
/// Used when `node` cannot be reached directly, usually because it is
/// behind a firewall.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackConnector {
    /// The node to connect to.
    pub node: NodeInfo,
    /// Should the new connection be persistent?
    pub persistent: bool,
}

impl WireSerialize for StackConnector {
    fn wire_serialize(&self, message: &mut WireMessage) {
        self.node.wire_serialize(message);
        message.put_bool(self.persistent);
    }
}

impl WireDeserialize for StackConnector {
    fn wire_deserialize(reader: &mut MessageReader<'_>) -> Result<Self, WireError> {
        Ok(StackConnector {
            node: NodeInfo::wire_deserialize(reader)?,
            persistent: reader.read_bool()?,
        })
    }
}

/// The first message sent on an outbound connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionRequest {
    /// Does the initiator want a persistent connection?
    pub persistent: bool,
    /// The initiator.
    pub from: NodeInfo,
    /// The initiator's hub membership.
    pub hubs: HubList,
    /// The node the initiator expects to reach, or nil for any node.
    pub target: NodeId,
}

impl WireSerialize for ConnectionRequest {
    fn wire_serialize(&self, message: &mut WireMessage) {
        message.put_bool(self.persistent);
        self.from.wire_serialize(message);
        self.hubs.wire_serialize(message);
        message.put_guid(self.target.as_uuid());
    }
}

impl WireDeserialize for ConnectionRequest {
    fn wire_deserialize(reader: &mut MessageReader<'_>) -> Result<Self, WireError> {
        Ok(ConnectionRequest {
            persistent: reader.read_bool()?,
            from: NodeInfo::wire_deserialize(reader)?,
            hubs: HubList::wire_deserialize(reader)?,
            target: reader.read_guid()?.into(),
        })
    }
}

/// Why a responder refused a connection request.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// The connection was no longer waiting for a handshake.
    NodeNotPending,
    /// The responder is not the node the initiator asked for.
    IncorrectNode,
    /// The initiator connected to itself.
    SameNode,
}

impl RejectReason {
    fn to_wire(reason: Option<RejectReason>) -> i32 {
        match reason {
            None => 0,
            Some(RejectReason::NodeNotPending) => 1,
            Some(RejectReason::IncorrectNode) => 2,
            Some(RejectReason::SameNode) => 3,
        }
    }

    fn from_wire(code: i32) -> Result<Option<RejectReason>, WireError> {
        match code {
            0 => Ok(None),
            1 => Ok(Some(RejectReason::NodeNotPending)),
            2 => Ok(Some(RejectReason::IncorrectNode)),
            3 => Ok(Some(RejectReason::SameNode)),
            _ => Err(WireError::BadValue {
                field: "connection response error",
                value: code.clamp(0, 0xFF) as u8,
            }),
        }
    }
}

/// The responder's reply to a [`ConnectionRequest`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionResponse {
    /// Echoes the persistence of the request.
    pub persistent: bool,
    /// The responder.
    pub from: NodeInfo,
    /// The responder's hub membership.
    pub hubs: HubList,
    /// Why the request was refused, or `None` if it was accepted.
    pub error: Option<RejectReason>,
}

impl WireSerialize for ConnectionResponse {
    fn wire_serialize(&self, message: &mut WireMessage) {
        message.put_bool(self.persistent);
        self.from.wire_serialize(message);
        self.hubs.wire_serialize(message);
        message.put_i32(RejectReason::to_wire(self.error));
    }
}

impl WireDeserialize for ConnectionResponse {
    fn wire_deserialize(reader: &mut MessageReader<'_>) -> Result<Self, WireError> {
        Ok(ConnectionResponse {
            persistent: reader.read_bool()?,
            from: NodeInfo::wire_deserialize(reader)?,
            hubs: HubList::wire_deserialize(reader)?,
            error: RejectReason::from_wire(reader.read_i32()?)?,
        })
    }
}

/// A summary of a node's state, sent in reply to a [`StatusRequest`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    /// The reporting node.
    pub node: NodeInfo,
    /// The number of persistent connections.
    pub persistent_connections: i32,
    /// The number of temporary connections.
    pub temporary_connections: i32,
    /// The number of volatile connections.
    pub volatile_connections: i32,
    /// The number of hubs in the node's membership.
    pub known_hubs: i32,
    /// How long the node has been running, in seconds.
    pub uptime_secs: i64,
}

impl WireSerialize for Status {
    fn wire_serialize(&self, message: &mut WireMessage) {
        self.node.wire_serialize(message);
        message.put_i32(self.persistent_connections);
        message.put_i32(self.temporary_connections);
        message.put_i32(self.volatile_connections);
        message.put_i32(self.known_hubs);
        message.put_i64(self.uptime_secs);
    }
}

impl WireDeserialize for Status {
    fn wire_deserialize(reader: &mut MessageReader<'_>) -> Result<Self, WireError> {
        Ok(Status {
            node: NodeInfo::wire_deserialize(reader)?,
            persistent_connections: reader.read_i32()?,
            temporary_connections: reader.read_i32()?,
            volatile_connections: reader.read_i32()?,
            known_hubs: reader.read_i32()?,
            uptime_secs: reader.read_i64()?,
        })
    }
}

/// Asks the receiver for its [`Status`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StatusRequest;

impl WireSerialize for StatusRequest {
    fn wire_serialize(&self, _message: &mut WireMessage) {}
}

impl WireDeserialize for StatusRequest {
    fn wire_deserialize(_reader: &mut MessageReader<'_>) -> Result<Self, WireError> {
        Ok(StatusRequest)
    }
}

/// A message wrapped with its sender's signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedEnvelope {
    /// The node whose key made the signature.
    pub signer: NodeId,
    /// The signed message.
    pub payload: WireMessage,
    /// The signature over the serialized payload.
    pub signature: Vec<u8>,
}

impl WireSerialize for SignedEnvelope {
    fn wire_serialize(&self, message: &mut WireMessage) {
        message.put_guid(self.signer.as_uuid());
        message.put_message(&self.payload);
        message.put_bytes(&self.signature);
    }
}

impl WireDeserialize for SignedEnvelope {
    fn wire_deserialize(reader: &mut MessageReader<'_>) -> Result<Self, WireError> {
        Ok(SignedEnvelope {
            signer: reader.read_guid()?.into(),
            payload: reader.read_message()?,
            signature: reader.read_bytes()?,
        })
    }
}

/// A byte payload that is optionally deflate-compressed on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataPackage {
    compressed: bool,
    data: Vec<u8>,
}

impl DataPackage {
    /// Packages `data`, compressing it if `compress` is set.
    ///
    /// Falls back to sending the data uncompressed if compression fails.
    pub fn new(data: Vec<u8>, compress: bool) -> DataPackage {
        if compress {
            match deflate(&data) {
                Ok(compressed) => {
                    return DataPackage {
                        compressed: true,
                        data: compressed,
                    }
                }
                Err(error) => warn!(?error, "sending data package uncompressed"),
            }
        }

        DataPackage {
            compressed: false,
            data,
        }
    }

    /// Is the payload compressed on the wire?
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Returns the original data, failing if it is larger than `max_len`.
    pub fn into_data(self, max_len: usize) -> Result<Vec<u8>, WireError> {
        if !self.compressed {
            if self.data.len() > max_len {
                return Err(WireError::BadLength(self.data.len() as i64));
            }
            return Ok(self.data);
        }

        let mut data = Vec::new();
        DeflateDecoder::new(self.data.as_slice())
            .take(max_len as u64 + 1)
            .read_to_end(&mut data)?;

        if data.len() > max_len {
            return Err(WireError::BadLength(data.len() as i64));
        }

        Ok(data)
    }
}

fn deflate(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

impl WireSerialize for DataPackage {
    fn wire_serialize(&self, message: &mut WireMessage) {
        message.put_bool(self.compressed);
        message.put_bytes(&self.data);
    }
}

impl WireDeserialize for DataPackage {
    fn wire_deserialize(reader: &mut MessageReader<'_>) -> Result<Self, WireError> {
        Ok(DataPackage {
            compressed: reader.read_bool()?,
            data: reader.read_bytes()?,
        })
    }
}
