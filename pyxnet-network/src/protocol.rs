//! The PYXNet wire protocol: the message buffer, typed messages, and
//! transport framing.

pub mod codec;
pub mod message;
pub mod wire;
