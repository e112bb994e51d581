//! The untyped PYXNet wire message, and a cursor for reading it.
//!
//! Every PYXNet message starts with a 4-byte ASCII [`Tag`], followed by a
//! payload made of little-endian fields appended one after another.
//! There is no schema on the wire: the reader must extract fields in the
//! same order they were appended.

use std::{borrow::Cow, fmt, net::IpAddr};

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;
use uuid::Uuid;

/// The length of a message type tag, in bytes.
pub const TAG_LEN: usize = 4;

/// A 4-byte message type tag.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(pub [u8; TAG_LEN]);

impl Tag {
    /// Liveness check.
    pub const PING: Tag = Tag(*b"PING");
    /// Liveness reply.
    pub const PONG: Tag = Tag(*b"PONG");
    /// The sender's [`NodeInfo`](crate::NodeInfo).
    pub const NODE_INFO: Tag = Tag(*b"LNIn");
    /// The sender's [`HubMembership`](crate::HubMembership).
    pub const KNOWN_HUB_LIST: Tag = Tag(*b"KHLi");
    /// A content query.
    pub const QUERY: Tag = Tag(*b"Qery");
    /// A query acknowledgement.
    pub const QUERY_ACK: Tag = Tag(*b"QuAk");
    /// The sender's [`QueryFilter`](crate::QueryFilter).
    pub const QUERY_FILTER: Tag = Tag(*b"QHaT");
    /// The sender is closing the connection.
    pub const CLOSE: Tag = Tag(*b"CLOS");
    /// A status report.
    pub const STATUS: Tag = Tag(*b"Stat");
    /// A request for a status report.
    pub const STATUS_REQUEST: Tag = Tag(*b"StRq");
    /// A query result, travelling back to the query origin.
    pub const QUERY_RESULT: Tag = Tag(*b"QRes");
    /// A connection handshake request.
    pub const CONNECTION_REQUEST: Tag = Tag(*b"SCRq");
    /// A connection handshake response.
    pub const CONNECTION_RESPONSE: Tag = Tag(*b"SCRs");
    /// A request to open a connection back to a node.
    pub const CONNECTOR: Tag = Tag(*b"Conn");
    /// A message being relayed towards a target node.
    pub const MESSAGE_RELAY: Tag = Tag(*b"MRly");
    /// A message relay acknowledgement.
    pub const MESSAGE_RELAY_ACK: Tag = Tag(*b"MRAk");
    /// A signed envelope around another message.
    pub const SIGNED: Tag = Tag(*b"SgnM");

    /// Returns the tag as text, replacing any non-UTF-8 bytes.
    pub fn as_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Tag").field(&self.as_str()).finish()
    }
}

impl From<&[u8; TAG_LEN]> for Tag {
    fn from(bytes: &[u8; TAG_LEN]) -> Self {
        Tag(*bytes)
    }
}

/// An error reading or writing the PYXNet wire format.
#[derive(Error, Debug)]
pub enum WireError {
    /// A field extends past the end of the message.
    #[error("truncated message: {needed} bytes needed at offset {offset}, but only {available} remain")]
    TruncatedMessage {
        /// The cursor position when the read started.
        offset: usize,
        /// The number of bytes the field needs.
        needed: usize,
        /// The number of unread bytes in the message.
        available: usize,
    },

    /// The message is too short to hold a type tag.
    #[error("message is {0} bytes long, too short for a type tag")]
    MissingTag(usize),

    /// The message does not have the type tag the reader expected.
    #[error("expected a {expected} message, got a {actual} message")]
    UnexpectedTag {
        /// The tag the reader was expecting.
        expected: Tag,
        /// The tag of the message.
        actual: Tag,
    },

    /// A length prefix or count is negative, or too large for its field.
    #[error("invalid length {0}")]
    BadLength(i64),

    /// A string field is not valid UTF-8.
    #[error("invalid UTF-8 string field")]
    BadString(#[from] std::string::FromUtf8Error),

    /// An enumerated field has an unknown value.
    #[error("invalid {field} value {value:#04x}")]
    BadValue {
        /// The name of the field.
        field: &'static str,
        /// The raw value.
        value: u8,
    },

    /// The message has unread bytes after its last field.
    #[error("{0} bytes of extra data at the end of the message")]
    TrailingData(usize),

    /// The frame length exceeds the configured maximum.
    #[error("frame length {len} exceeds the maximum of {max} bytes")]
    FrameTooLong {
        /// The length from the frame prefix.
        len: usize,
        /// The configured maximum.
        max: usize,
    },

    /// An underlying IO error, including compression errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// An append-only PYXNet message buffer.
///
/// The first [`TAG_LEN`] bytes are always the message [`Tag`].
/// Messages compare and order byte-wise.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WireMessage {
    bytes: Vec<u8>,
}

impl WireMessage {
    /// Creates an empty message with `tag`.
    pub fn new(tag: Tag) -> WireMessage {
        let mut bytes = Vec::with_capacity(64);
        bytes.extend_from_slice(&tag.0);
        WireMessage { bytes }
    }

    /// Wraps a serialized message, checking that it has a tag.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Result<WireMessage, WireError> {
        let bytes = bytes.into();
        if bytes.len() < TAG_LEN {
            return Err(WireError::MissingTag(bytes.len()));
        }

        Ok(WireMessage { bytes })
    }

    /// The message type tag.
    pub fn tag(&self) -> Tag {
        let mut tag = [0; TAG_LEN];
        tag.copy_from_slice(&self.bytes[..TAG_LEN]);
        Tag(tag)
    }

    /// Does this message have type `tag`?
    pub fn starts_with(&self, tag: Tag) -> bool {
        self.bytes[..TAG_LEN] == tag.0
    }

    /// The serialized message, including its tag.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consumes the message, returning its serialized bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// The serialized length of the message, including its tag.
    pub fn serialized_len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns a cursor positioned at the first payload byte.
    pub fn reader(&self) -> MessageReader<'_> {
        MessageReader::new(self)
    }

    /// Appends an `i32`.
    pub fn put_i32(&mut self, value: i32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    /// Appends an `i64`.
    pub fn put_i64(&mut self, value: i64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    /// Appends a `u16`.
    pub fn put_u16(&mut self, value: u16) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    /// Appends a `u32`.
    pub fn put_u32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    /// Appends a bool as a single byte.
    pub fn put_bool(&mut self, value: bool) {
        self.bytes.push(u8::from(value));
    }

    /// Appends a single byte.
    pub fn put_u8(&mut self, value: u8) {
        self.bytes.push(value);
    }

    /// Appends a single-byte character.
    pub fn put_char(&mut self, value: u8) {
        self.bytes.push(value);
    }

    /// Appends a 16-byte GUID, in the mixed-endian layout used by PYXNet peers.
    pub fn put_guid(&mut self, value: &Uuid) {
        self.bytes.extend_from_slice(&value.to_bytes_le());
    }

    /// Appends a length-prefixed UTF-8 string.
    pub fn put_string(&mut self, value: &str) {
        self.put_bytes(value.as_bytes());
    }

    /// Appends a length-prefixed byte array.
    pub fn put_bytes(&mut self, value: &[u8]) {
        self.put_length(value.len());
        self.bytes.extend_from_slice(value);
    }

    /// Appends bytes without a length prefix.
    ///
    /// The reader must know the length from an earlier field.
    pub fn put_raw(&mut self, value: &[u8]) {
        self.bytes.extend_from_slice(value);
    }

    /// Appends another message, including its tag, as a length-prefixed byte array.
    pub fn put_message(&mut self, value: &WireMessage) {
        self.put_bytes(value.as_bytes());
    }

    /// Appends an IP address as a length-prefixed byte array.
    pub fn put_ip(&mut self, value: &IpAddr) {
        match value {
            IpAddr::V4(ip) => self.put_bytes(&ip.octets()),
            IpAddr::V6(ip) => self.put_bytes(&ip.octets()),
        }
    }

    /// Appends a collection length as an `i32`.
    ///
    /// Lengths are bounded by the maximum frame length, so they always fit.
    pub fn put_length(&mut self, len: usize) {
        self.put_i32(i32::try_from(len).unwrap_or(i32::MAX));
    }
}

impl fmt::Debug for WireMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WireMessage")
            .field("tag", &self.tag())
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// A cursor that extracts fields from a [`WireMessage`] in order.
///
/// Reads that would go past the end of the message fail with
/// [`WireError::TruncatedMessage`], and leave the cursor where it was.
#[derive(Clone, Debug)]
pub struct MessageReader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> MessageReader<'a> {
    /// Returns a cursor positioned just after the tag of `message`.
    pub fn new(message: &'a WireMessage) -> MessageReader<'a> {
        MessageReader {
            bytes: message.as_bytes(),
            position: TAG_LEN,
        }
    }

    /// The current offset from the start of the message.
    pub fn position(&self) -> usize {
        self.position
    }

    /// The number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.position
    }

    /// Have all the bytes been read?
    pub fn at_end(&self) -> bool {
        self.remaining() == 0
    }

    /// Fails with [`WireError::TrailingData`] if there are unread bytes.
    pub fn assert_at_end(&self) -> Result<(), WireError> {
        match self.remaining() {
            0 => Ok(()),
            extra => Err(WireError::TrailingData(extra)),
        }
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], WireError> {
        if needed > self.remaining() {
            return Err(WireError::TruncatedMessage {
                offset: self.position,
                needed,
                available: self.remaining(),
            });
        }

        let field = &self.bytes[self.position..self.position + needed];
        self.position += needed;
        Ok(field)
    }

    /// Skips `len` bytes.
    pub fn skip(&mut self, len: usize) -> Result<(), WireError> {
        self.take(len).map(|_| ())
    }

    /// Extracts an `i32`.
    pub fn read_i32(&mut self) -> Result<i32, WireError> {
        Ok(LittleEndian::read_i32(self.take(4)?))
    }

    /// Extracts an `i64`.
    pub fn read_i64(&mut self) -> Result<i64, WireError> {
        Ok(LittleEndian::read_i64(self.take(8)?))
    }

    /// Extracts a `u16`.
    pub fn read_u16(&mut self) -> Result<u16, WireError> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    /// Extracts a `u32`.
    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    /// Extracts a single-byte bool. Any non-zero byte is `true`.
    pub fn read_bool(&mut self) -> Result<bool, WireError> {
        Ok(self.read_u8()? != 0)
    }

    /// Extracts a single byte.
    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    /// Extracts a single-byte character.
    pub fn read_char(&mut self) -> Result<u8, WireError> {
        self.read_u8()
    }

    /// Extracts a 16-byte GUID.
    pub fn read_guid(&mut self) -> Result<Uuid, WireError> {
        let mut guid = [0; 16];
        guid.copy_from_slice(self.take(16)?);
        Ok(Uuid::from_bytes_le(guid))
    }

    /// Extracts a length prefix written by [`WireMessage::put_length`].
    pub fn read_length(&mut self) -> Result<usize, WireError> {
        let len = self.read_i32()?;
        usize::try_from(len).map_err(|_| WireError::BadLength(len.into()))
    }

    /// Extracts a length-prefixed UTF-8 string.
    ///
    /// A zero length reads as the empty string.
    pub fn read_string(&mut self) -> Result<String, WireError> {
        let bytes = self.read_bytes()?;
        Ok(String::from_utf8(bytes)?)
    }

    /// Extracts a length-prefixed byte array.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>, WireError> {
        let start = self.position;
        let len = self.read_length()?;
        match self.take(len) {
            Ok(bytes) => Ok(bytes.to_vec()),
            Err(e) => {
                self.position = start;
                Err(e)
            }
        }
    }

    /// Extracts `len` bytes without a length prefix.
    pub fn read_raw(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        self.take(len)
    }

    /// Extracts a nested message written by [`WireMessage::put_message`].
    pub fn read_message(&mut self) -> Result<WireMessage, WireError> {
        WireMessage::from_bytes(self.read_bytes()?)
    }

    /// Extracts an IP address written by [`WireMessage::put_ip`].
    pub fn read_ip(&mut self) -> Result<IpAddr, WireError> {
        let bytes = self.read_bytes()?;
        ip_from_slice(&bytes)
    }
}

/// Converts 4 or 16 raw address bytes into an IP address.
pub(crate) fn ip_from_slice(bytes: &[u8]) -> Result<IpAddr, WireError> {
    if let Ok(v4) = <[u8; 4]>::try_from(bytes) {
        Ok(IpAddr::from(v4))
    } else if let Ok(v6) = <[u8; 16]>::try_from(bytes) {
        Ok(IpAddr::from(v6))
    } else {
        Err(WireError::BadLength(bytes.len() as i64))
    }
}

/// Serializes a value by appending its fields to a [`WireMessage`].
pub trait WireSerialize {
    /// Appends the fields of `self` to `message`, without a tag.
    fn wire_serialize(&self, message: &mut WireMessage);
}

/// Deserializes a value by extracting its fields from a [`MessageReader`].
pub trait WireDeserialize: Sized {
    /// Extracts a value from the current position of `reader`.
    fn wire_deserialize(reader: &mut MessageReader<'_>) -> Result<Self, WireError>;
}

/// A value that is sent as a whole message with its own [`Tag`].
pub trait TaggedMessage: WireSerialize + WireDeserialize {
    /// The type tag of the message.
    const TAG: Tag;

    /// Builds the tagged message for this value.
    fn to_message(&self) -> WireMessage {
        let mut message = WireMessage::new(Self::TAG);
        self.wire_serialize(&mut message);
        message
    }

    /// Parses a tagged message, rejecting other tags and trailing data.
    fn from_message(message: &WireMessage) -> Result<Self, WireError> {
        if !message.starts_with(Self::TAG) {
            return Err(WireError::UnexpectedTag {
                expected: Self::TAG,
                actual: message.tag(),
            });
        }

        let mut reader = message.reader();
        let value = Self::wire_deserialize(&mut reader)?;
        reader.assert_at_end()?;

        Ok(value)
    }
}

impl<T: WireSerialize> WireSerialize for Vec<T> {
    fn wire_serialize(&self, message: &mut WireMessage) {
        message.put_length(self.len());
        for item in self {
            item.wire_serialize(message);
        }
    }
}

impl<T: WireDeserialize> WireDeserialize for Vec<T> {
    fn wire_deserialize(reader: &mut MessageReader<'_>) -> Result<Self, WireError> {
        let count = reader.read_length()?;
        // Every item is at least one byte, so a larger count must be truncated.
        if count > reader.remaining() {
            return Err(WireError::BadLength(count as i64));
        }

        (0..count).map(|_| T::wire_deserialize(reader)).collect()
    }
}
