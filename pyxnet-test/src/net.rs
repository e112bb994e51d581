//! Network testing utility functions for PYXNet.

use std::net::{Ipv4Addr, SocketAddr};

use rand::Rng;

/// The name of the env var that skips PYXNet tests which need a working
/// loopback TCP stack.
///
/// We use a constant so that the compiler detects typos.
pub const PYXNET_SKIP_NETWORK_TESTS: &str = "PYXNET_SKIP_NETWORK_TESTS";

/// Should we skip PYXNet tests which need real TCP sockets?
pub fn pyxnet_skip_network_tests() -> bool {
    if std::env::var_os(PYXNET_SKIP_NETWORK_TESTS).is_some() {
        eprintln!(
            "Skipping network test because '${}' is set.",
            PYXNET_SKIP_NETWORK_TESTS
        );
        return true;
    }

    false
}

/// Returns a random port number from the ephemeral port range.
///
/// Does not check if the port is already in use. It's impossible to do this
/// check in a reliable, cross-platform way.
///
/// Use this function when you need to use the same random port multiple
/// times. For example: setting up both ends of a connection, or giving
/// several in-memory nodes distinct addresses.
pub fn random_known_port() -> u16 {
    // Use the intersection of the IANA/Windows/macOS ephemeral port range,
    // and the Linux ephemeral port range, excluding ports less than 53500.
    rand::thread_rng().gen_range(53500..60999)
}

/// Returns a loopback socket address with a random known port.
pub fn random_loopback_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, random_known_port()))
}
