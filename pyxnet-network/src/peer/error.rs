//! Peer-related errors.

use std::{
    borrow::Cow,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use thiserror::Error;

use tracing_error::TracedError;

use crate::{
    identity::NodeId,
    protocol::{message::RejectReason, wire::WireError},
    BoxError,
};

/// The error that closed a connection, shared between every clone of the
/// connection and the callers that ask why it closed.
///
/// The [`TracedError`] keeps the span trace of the connection task that
/// recorded it.
#[derive(Error, Debug, Clone)]
#[error(transparent)]
pub struct SharedPeerError(Arc<TracedError<PeerError>>);

impl<E> From<E> for SharedPeerError
where
    PeerError: From<E>,
{
    fn from(source: E) -> Self {
        Self(Arc::new(TracedError::from(PeerError::from(source))))
    }
}

/// An error that closed a peer connection.
#[derive(Error, Debug)]
pub enum PeerError {
    /// The remote node closed the transport stream.
    #[error("Peer closed connection")]
    ConnectionClosed,

    /// The remote node sent a `CLOS` message.
    #[error("Peer requested close")]
    CloseRequested,

    /// This node closed the connection.
    #[error("Connection closed locally")]
    ConnectionDropped,

    /// Sending a message to a remote node took too long.
    #[error("Sending message timed out")]
    ConnectionSendTimeout,

    /// The remote node sent a malformed message, or the transport failed.
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),
}

impl PeerError {
    /// Returns the error type as a string, for logs and statistics.
    pub fn kind(&self) -> Cow<'static, str> {
        match self {
            PeerError::ConnectionClosed => "ConnectionClosed".into(),
            PeerError::CloseRequested => "CloseRequested".into(),
            PeerError::ConnectionDropped => "ConnectionDropped".into(),
            PeerError::ConnectionSendTimeout => "ConnectionSendTimeout".into(),
            PeerError::Wire(inner) => format!("Wire({})", inner).into(),
        }
    }
}

/// Holds the reason a connection closed.
///
/// A connection closes once, so only the first error is kept. The slot is
/// read from any thread while the connection task writes it, so the lock
/// is only held to copy the error in or out.
#[derive(Default, Clone)]
pub struct ErrorSlot(Arc<Mutex<Option<SharedPeerError>>>);

impl fmt::Debug for ErrorSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // `try_lock` so a debug print never waits on the connection task.
        f.debug_tuple("ErrorSlot").field(&self.0.try_lock()).finish()
    }
}

impl ErrorSlot {
    fn slot(&self) -> MutexGuard<'_, Option<SharedPeerError>> {
        self.0.lock().expect("connection error mutex should be unpoisoned")
    }

    /// The error that closed the connection, or `None` if it is still open.
    pub fn closed_by(&self) -> Option<SharedPeerError> {
        self.slot().clone()
    }

    /// Records `error` as the reason the connection closed.
    ///
    /// Fails with the recorded error if the connection had already closed.
    pub fn close_with(&self, error: SharedPeerError) -> Result<(), AlreadyClosed> {
        let mut slot = self.slot();

        match slot.as_ref() {
            Some(first) => Err(AlreadyClosed {
                closed_by: first.clone(),
            }),
            None => {
                *slot = Some(error);
                Ok(())
            }
        }
    }
}

/// A second close reason for a connection that had already closed.
#[derive(Clone, Debug)]
pub struct AlreadyClosed {
    /// The error that closed the connection first.
    pub closed_by: SharedPeerError,
}

/// An error during a connection handshake.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// The connection request could not be sent.
    #[error("Connection request could not be sent")]
    RequestNotSent,

    /// The responder did not answer within the handshake timeout.
    #[error("Timeout waiting for the connection response")]
    TimedOut,

    /// The responder is not the node we asked for.
    #[error("Connected to {actual}, but expected {expected}")]
    IncorrectNode {
        /// The node the initiator asked for.
        expected: NodeId,
        /// The node that responded.
        actual: NodeId,
    },

    /// The initiator and responder are the same node.
    #[error("Connected to self")]
    SameNode,

    /// The connection was no longer waiting for a handshake.
    #[error("Connection is not pending")]
    NodeNotPending,

    /// The connection closed before the handshake finished.
    #[error("Connection closed during handshake")]
    ConnectionClosed,
}

impl HandshakeError {
    /// Returns the error an initiator reports when the responder refuses
    /// its request with `reason`.
    pub fn from_rejection(reason: RejectReason, expected: NodeId, actual: NodeId) -> Self {
        match reason {
            RejectReason::NodeNotPending => HandshakeError::NodeNotPending,
            RejectReason::IncorrectNode => HandshakeError::IncorrectNode { expected, actual },
            RejectReason::SameNode => HandshakeError::SameNode,
        }
    }

    /// Returns the rejection code a responder sends for this error, if any.
    pub fn rejection(&self) -> Option<RejectReason> {
        match self {
            HandshakeError::NodeNotPending => Some(RejectReason::NodeNotPending),
            HandshakeError::IncorrectNode { .. } => Some(RejectReason::IncorrectNode),
            HandshakeError::SameNode => Some(RejectReason::SameNode),
            HandshakeError::RequestNotSent
            | HandshakeError::TimedOut
            | HandshakeError::ConnectionClosed => None,
        }
    }
}

impl From<tokio::time::error::Elapsed> for HandshakeError {
    fn from(_source: tokio::time::error::Elapsed) -> Self {
        HandshakeError::TimedOut
    }
}

/// An error opening a connection to another node.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The target node has no endpoints we can try.
    #[error("{0} has no usable network address")]
    NoAddress(NodeId),

    /// The target node failed recently, and is not retried yet.
    #[error("{0} was recently unreachable")]
    RecentlyUnreachable(NodeId),

    /// Every endpoint failed to connect.
    #[error("Transport error: {0}")]
    Transport(BoxError),

    /// The transport connected, but the handshake failed.
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// The node is shutting down.
    #[error("Node is shutting down")]
    ShuttingDown,
}
