//! The connections of a node, sorted into pools.

mod holder;
mod manager;
mod pools;
mod unreachable;


pub use manager::{ConnectionHost, ConnectionManager};
pub use pools::{PoolCounts, PoolKind};
