//! A Tokio codec mapping byte streams to PYXNet message streams.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::constants;

use super::wire::{WireError, WireMessage, TAG_LEN};

/// The length of the frame length prefix.
const HEADER_LEN: usize = 4;

/// A codec which produces PYXNet messages from byte streams and vice versa.
pub struct Codec {
    builder: Builder,
    state: DecodeState,
}

/// A builder for specifying [`Codec`] options.
pub struct Builder {
    /// The maximum allowable message length, including the tag.
    max_len: usize,
}

impl Codec {
    /// Return a builder for constructing a [`Codec`].
    ///
    /// # Example
    /// ```
    /// # use pyxnet_network::protocol::codec::Codec;
    /// let codec = Codec::builder().with_max_body_len(4_000_000).finish();
    /// ```
    pub fn builder() -> Builder {
        Builder {
            max_len: constants::MAX_MESSAGE_LEN,
        }
    }
}

impl Builder {
    /// Finalize the builder and return a [`Codec`].
    pub fn finish(self) -> Codec {
        Codec {
            builder: self,
            state: DecodeState::Head,
        }
    }

    /// Configure the codec's maximum accepted message size, in bytes.
    pub fn with_max_body_len(mut self, len: usize) -> Self {
        self.max_len = len;
        self
    }
}

// ======== Encoding =========

impl Encoder<WireMessage> for Codec {
    type Error = WireError;

    fn encode(&mut self, item: WireMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = item.serialized_len();
        if len > self.builder.max_len {
            return Err(WireError::FrameTooLong {
                len,
                max: self.builder.max_len,
            });
        }

        trace!(tag = %item.tag(), len, "encoding message");

        dst.reserve(HEADER_LEN + len);
        dst.put_u32_le(len as u32);
        dst.extend_from_slice(item.as_bytes());

        Ok(())
    }
}

// ======== Decoding =========

enum DecodeState {
    Head,
    Body { body_len: usize },
}

impl fmt::Debug for DecodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeState::Head => write!(f, "DecodeState::Head"),
            DecodeState::Body { body_len } => f
                .debug_struct("DecodeState::Body")
                .field("body_len", &body_len)
                .finish(),
        }
    }
}

impl Decoder for Codec {
    type Item = WireMessage;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.state {
            DecodeState::Head => {
                // First check that the src buffer contains an entire length prefix.
                if src.len() < HEADER_LEN {
                    trace!(?self.state, "src buffer does not have an entire header, waiting");
                    // Signal that decoding requires more data.
                    return Ok(None);
                }

                let header = src.split_to(HEADER_LEN);
                let body_len = LittleEndian::read_u32(&header) as usize;
                trace!(?self.state, body_len, "read header from src buffer");

                if body_len > self.builder.max_len {
                    return Err(WireError::FrameTooLong {
                        len: body_len,
                        max: self.builder.max_len,
                    });
                }
                if body_len < TAG_LEN {
                    return Err(WireError::MissingTag(body_len));
                }

                // Reserve buffer space for the expected body and the following header.
                src.reserve(body_len + HEADER_LEN);

                self.state = DecodeState::Body { body_len };

                // Now that the state is updated, recurse to attempt body decoding.
                self.decode(src)
            }
            DecodeState::Body { body_len } => {
                if src.len() < body_len {
                    // Need to wait for the full body
                    trace!(?self.state, len = src.len(), "src buffer does not have an entire body, waiting");
                    return Ok(None);
                }

                // Now that we know we have the full body, split off the body,
                // and reset the decoder state for the next message.
                let body = src.split_to(body_len);
                self.state = DecodeState::Head;

                WireMessage::from_bytes(body.to_vec()).map(Some)
            }
        }
    }
}
