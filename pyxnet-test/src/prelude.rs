//! Common [`pyxnet_test`](crate) types, traits, and functions.

pub use crate::{
    net::{random_known_port, random_loopback_addr},
    timing::wait_until,
};

pub use color_eyre;
pub use color_eyre::eyre;
pub use eyre::Result;
pub use proptest::prelude::*;
