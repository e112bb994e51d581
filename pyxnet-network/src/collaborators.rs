//! Services a node uses but does not implement: message signing and
//! encryption, and NAT port mapping.

use std::net::SocketAddr;

use futures::future::{self, BoxFuture, FutureExt};
use thiserror::Error;

use crate::{
    identity::{NodeId, NodeInfo},
    protocol::{message::SignedEnvelope, wire::WireMessage},
};

/// A signing or encryption failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecurityError {
    /// The signature does not match the payload.
    #[error("signature from {0} does not match its payload")]
    BadSignature(NodeId),

    /// There is no key for the node.
    #[error("no key is known for node {0}")]
    UnknownKey(NodeId),

    /// This security provider cannot perform the operation.
    #[error("{0} is not supported")]
    Unsupported(&'static str),
}

/// Signs, verifies, encrypts and decrypts messages.
pub trait MessageSecurity: Send + Sync + 'static {
    /// Wraps `message` in an envelope signed by `signer`.
    fn sign(
        &self,
        message: &WireMessage,
        signer: &NodeInfo,
    ) -> Result<SignedEnvelope, SecurityError>;

    /// Verifies `envelope`, and returns the signed message.
    fn open(&self, envelope: &SignedEnvelope) -> Result<WireMessage, SecurityError>;

    /// Encrypts `message` so only `recipient` can read it.
    fn encrypt(
        &self,
        message: &WireMessage,
        recipient: &NodeInfo,
    ) -> Result<WireMessage, SecurityError>;

    /// Decrypts a message encrypted for this node.
    fn decrypt(&self, message: &WireMessage) -> Result<WireMessage, SecurityError>;
}

/// Signs with empty signatures, and only opens unsigned envelopes.
///
/// For nodes that run without a key store.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoSecurity;

impl MessageSecurity for NoSecurity {
    fn sign(
        &self,
        message: &WireMessage,
        signer: &NodeInfo,
    ) -> Result<SignedEnvelope, SecurityError> {
        Ok(SignedEnvelope {
            signer: signer.id,
            payload: message.clone(),
            signature: Vec::new(),
        })
    }

    fn open(&self, envelope: &SignedEnvelope) -> Result<WireMessage, SecurityError> {
        if envelope.signature.is_empty() {
            Ok(envelope.payload.clone())
        } else {
            Err(SecurityError::UnknownKey(envelope.signer))
        }
    }

    fn encrypt(
        &self,
        _message: &WireMessage,
        _recipient: &NodeInfo,
    ) -> Result<WireMessage, SecurityError> {
        Err(SecurityError::Unsupported("encryption"))
    }

    fn decrypt(&self, _message: &WireMessage) -> Result<WireMessage, SecurityError> {
        Err(SecurityError::Unsupported("decryption"))
    }
}

/// Maps local endpoints to public ones, usually through a NAT router.
pub trait PortMapper: Send + Sync + 'static {
    /// Returns the external endpoint for `internal`, if it can be mapped.
    fn map_port(&self, internal: SocketAddr) -> BoxFuture<'static, Option<SocketAddr>>;
}

/// Never maps any endpoint.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoPortMapping;

impl PortMapper for NoPortMapping {
    fn map_port(&self, _internal: SocketAddr) -> BoxFuture<'static, Option<SocketAddr>> {
        future::ready(None).boxed()
    }
}
