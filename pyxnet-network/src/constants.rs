//! Definitions of constants.

use std::time::Duration;

/// The default maximum length of a single message, including its tag.
///
/// Query filters are the largest routine messages: 128 KiB uncompressed.
pub const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

/// How long a connection initiator waits for the handshake response.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Sending a single message to a peer must complete within this time,
/// or the connection is closed.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Regular interval for sending keepalive `PING` messages to each connected peer.
pub const PING_INTERVAL: Duration = Duration::from_secs(90);

/// Regular interval for checking whether our node info needs to be re-sent.
pub const NODE_INFO_INTERVAL: Duration = Duration::from_secs(90);

/// Our node info is re-sent when it changes, or when the last send is older than this.
pub const NODE_INFO_MAX_AGE: Duration = Duration::from_secs(360);

/// The minimum time between two known hub list broadcasts.
pub const HUB_LIST_INTERVAL: Duration = Duration::from_secs(180);

/// The minimum time between two query filter broadcasts.
pub const QUERY_FILTER_INTERVAL: Duration = Duration::from_secs(120);

/// A query filter send that is already due is delayed by this much,
/// so that bursts of filter changes are coalesced.
pub const QUERY_FILTER_COALESCE_DELAY: Duration = Duration::from_millis(5);

/// How long a failed connection target is skipped before we try it again.
///
/// Also the cooldown for hubs that a broadcast could not reach.
pub const RETRY_CONNECTING_HUBS_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// The head start given to a direct connection attempt, before asking the
/// target to connect back to us.
pub const REVERSE_CONNECT_HEAD_START: Duration = Duration::from_secs(1);

/// How often we check for the inbound connection from a reverse connect.
pub const REVERSE_CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How often we check whether a pending connection has finished its handshake.
pub const PENDING_CONNECTION_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How often a caller waits for another caller's connection attempt to the same node.
pub const CONNECT_IN_PROGRESS_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// The hop timeout for a query broadcast.
pub const QUERY_HOP_TIMEOUT: Duration = Duration::from_millis(1000);

/// The hop timeout for a message relay broadcast.
pub const RELAY_HOP_TIMEOUT: Duration = Duration::from_millis(1000);

/// How long [`Node::query`](crate::Node::query) reports results before the query expires.
pub const QUERY_EXPIRY: Duration = Duration::from_secs(60);

/// How many times a query result is re-sent over a fresh connection to the query origin.
pub const QUERY_RESULT_ATTEMPTS: usize = 3;

/// The reverse connect timeout used when sending a query result to the query origin.
pub const QUERY_RESULT_REVERSE_TIMEOUT: Duration = Duration::from_secs(20);

/// How long a temporary connection is kept open by default.
pub const TEMPORARY_CONNECTION_HOLD: Duration = Duration::from_secs(5);

/// How often held temporary connections are checked for expiry.
pub const CONNECTION_HOLD_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// How many recently seen query GUIDs are remembered, to detect duplicate queries.
pub const RECENT_QUERY_CAPACITY: usize = 1000;

/// The default port for PYXNet listeners.
pub const DEFAULT_PORT: u16 = 44044;
