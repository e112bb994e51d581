use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    string::String,
    time::Duration,
};

use serde::{de, Deserialize, Deserializer};
use thiserror::Error;

use crate::{constants, identity::Mode, protocol::wire::TAG_LEN};


/// Configuration for the overlay node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Config {
    /// The address on which this node should listen for connections.
    ///
    /// Can be `address:port` or just `address`. If there is no configured
    /// port, the node listens on [`constants::DEFAULT_PORT`].
    ///
    /// The bound address is advertised to other nodes as an internal
    /// endpoint. External endpoints come from the port mapper.
    pub listen_addr: SocketAddr,

    /// A human-readable name advertised in this node's info.
    pub friendly_name: String,

    /// The mode this node starts in.
    ///
    /// `Unknown` nodes act as leaves until they are promoted.
    pub mode: Mode,

    /// How long a connection initiator waits for the handshake response.
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,

    /// How often every connection is pinged.
    #[serde(with = "humantime_serde")]
    pub ping_interval: Duration,

    /// How often this node checks whether its info needs to be re-sent.
    #[serde(with = "humantime_serde")]
    pub node_info_interval: Duration,

    /// This node's info is re-sent when it is older than this, even if it
    /// has not changed.
    #[serde(with = "humantime_serde")]
    pub node_info_max_age: Duration,

    /// The minimum time between two hub list broadcasts.
    #[serde(with = "humantime_serde")]
    pub hub_list_interval: Duration,

    /// The minimum time between two query filter broadcasts.
    #[serde(with = "humantime_serde")]
    pub query_filter_interval: Duration,

    /// How long a hub that could not be reached is skipped by new connection
    /// attempts and broadcasts.
    #[serde(with = "humantime_serde")]
    pub retry_connecting_hubs_timeout: Duration,

    /// How long a query broadcast waits for each hub's acknowledgement.
    #[serde(with = "humantime_serde")]
    pub query_hop_timeout: Duration,

    /// How long a message relay waits for each hub's acknowledgement.
    #[serde(with = "humantime_serde")]
    pub relay_hop_timeout: Duration,

    /// The maximum length of a single message, including its tag.
    pub max_message_len: usize,

    /// The number of recent query GUIDs remembered for duplicate detection.
    pub recent_query_capacity: usize,

    /// Should outgoing query filters be deflate-compressed?
    pub compress_query_filters: bool,

    /// How long temporary connections opened for query results are kept open.
    #[serde(with = "humantime_serde")]
    pub temporary_connection_hold: Duration,
}

/// An invalid [`Config`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A periodic timer would fire continuously.
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),

    /// Messages this short could not hold a tag.
    #[error("max_message_len {0} is too short to hold a message tag")]
    MessageLenTooShort(usize),

    /// The recent query cache could not hold any queries.
    #[error("recent_query_capacity must be at least 1")]
    ZeroQueryCapacity,
}

impl Config {
    /// Checks that the configured values can run a node.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("handshake_timeout", self.handshake_timeout),
            ("ping_interval", self.ping_interval),
            ("node_info_interval", self.node_info_interval),
            ("node_info_max_age", self.node_info_max_age),
            ("hub_list_interval", self.hub_list_interval),
            ("query_filter_interval", self.query_filter_interval),
            ("query_hop_timeout", self.query_hop_timeout),
            ("relay_hop_timeout", self.relay_hop_timeout),
        ];

        if let Some((name, _)) = intervals.iter().find(|(_, interval)| interval.is_zero()) {
            return Err(ConfigError::ZeroInterval(name));
        }

        if self.max_message_len < TAG_LEN {
            return Err(ConfigError::MessageLenTooShort(self.max_message_len));
        }

        if self.recent_query_capacity == 0 {
            return Err(ConfigError::ZeroQueryCapacity);
        }

        Ok(())
    }

    /// A config for tests: listens on an OS-assigned loopback port, and
    /// uses short timeouts.
    pub fn for_tests(friendly_name: impl Into<String>, mode: Mode) -> Config {
        Config {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            friendly_name: friendly_name.into(),
            mode,
            handshake_timeout: Duration::from_secs(5),
            query_hop_timeout: Duration::from_millis(200),
            relay_hop_timeout: Duration::from_millis(200),
            ..Config::default()
        }
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            listen_addr: SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                constants::DEFAULT_PORT,
            ),
            friendly_name: String::new(),
            mode: Mode::Leaf,
            handshake_timeout: constants::HANDSHAKE_TIMEOUT,
            ping_interval: constants::PING_INTERVAL,
            node_info_interval: constants::NODE_INFO_INTERVAL,
            node_info_max_age: constants::NODE_INFO_MAX_AGE,
            hub_list_interval: constants::HUB_LIST_INTERVAL,
            query_filter_interval: constants::QUERY_FILTER_INTERVAL,
            retry_connecting_hubs_timeout: constants::RETRY_CONNECTING_HUBS_TIMEOUT,
            query_hop_timeout: constants::QUERY_HOP_TIMEOUT,
            relay_hop_timeout: constants::RELAY_HOP_TIMEOUT,
            max_message_len: constants::MAX_MESSAGE_LEN,
            recent_query_capacity: constants::RECENT_QUERY_CAPACITY,
            compress_query_filters: true,
            temporary_connection_hold: constants::TEMPORARY_CONNECTION_HOLD,
        }
    }
}

impl<'de> Deserialize<'de> for Config {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields, default)]
        struct DConfig {
            listen_addr: String,
            friendly_name: String,
            mode: Mode,
            #[serde(with = "humantime_serde")]
            handshake_timeout: Duration,
            #[serde(with = "humantime_serde")]
            ping_interval: Duration,
            #[serde(with = "humantime_serde")]
            node_info_interval: Duration,
            #[serde(with = "humantime_serde")]
            node_info_max_age: Duration,
            #[serde(with = "humantime_serde")]
            hub_list_interval: Duration,
            #[serde(with = "humantime_serde")]
            query_filter_interval: Duration,
            #[serde(with = "humantime_serde")]
            retry_connecting_hubs_timeout: Duration,
            #[serde(with = "humantime_serde")]
            query_hop_timeout: Duration,
            #[serde(with = "humantime_serde")]
            relay_hop_timeout: Duration,
            max_message_len: usize,
            recent_query_capacity: usize,
            compress_query_filters: bool,
            #[serde(with = "humantime_serde")]
            temporary_connection_hold: Duration,
        }

        impl Default for DConfig {
            fn default() -> Self {
                let config = Config::default();
                Self {
                    listen_addr: config.listen_addr.to_string(),
                    friendly_name: config.friendly_name,
                    mode: config.mode,
                    handshake_timeout: config.handshake_timeout,
                    ping_interval: config.ping_interval,
                    node_info_interval: config.node_info_interval,
                    node_info_max_age: config.node_info_max_age,
                    hub_list_interval: config.hub_list_interval,
                    query_filter_interval: config.query_filter_interval,
                    retry_connecting_hubs_timeout: config.retry_connecting_hubs_timeout,
                    query_hop_timeout: config.query_hop_timeout,
                    relay_hop_timeout: config.relay_hop_timeout,
                    max_message_len: config.max_message_len,
                    recent_query_capacity: config.recent_query_capacity,
                    compress_query_filters: config.compress_query_filters,
                    temporary_connection_hold: config.temporary_connection_hold,
                }
            }
        }

        let config = DConfig::deserialize(deserializer)?;
        let listen_addr = match config.listen_addr.parse::<SocketAddr>() {
            Ok(socket) => Ok(socket),
            Err(_) => match config.listen_addr.parse::<IpAddr>() {
                Ok(ip) => Ok(SocketAddr::new(ip, constants::DEFAULT_PORT)),
                Err(err) => Err(de::Error::custom(format!(
                    "{}; Hint: addresses can be a IPv4 or IPv6 (with brackets) address, the port is optional",
                    err
                ))),
            },
        }?;

        let config = Config {
            listen_addr,
            friendly_name: config.friendly_name,
            mode: config.mode,
            handshake_timeout: config.handshake_timeout,
            ping_interval: config.ping_interval,
            node_info_interval: config.node_info_interval,
            node_info_max_age: config.node_info_max_age,
            hub_list_interval: config.hub_list_interval,
            query_filter_interval: config.query_filter_interval,
            retry_connecting_hubs_timeout: config.retry_connecting_hubs_timeout,
            query_hop_timeout: config.query_hop_timeout,
            relay_hop_timeout: config.relay_hop_timeout,
            max_message_len: config.max_message_len,
            recent_query_capacity: config.recent_query_capacity,
            compress_query_filters: config.compress_query_filters,
            temporary_connection_hold: config.temporary_connection_hold,
        };

        config.validate().map_err(de::Error::custom)?;

        Ok(config)
    }
}
