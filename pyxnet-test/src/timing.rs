//! Helpers for waiting on asynchronous conditions in tests.

use std::time::Duration;

use thiserror::Error;

/// The default interval between condition checks in [`wait_until`].
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A condition did not become true before its deadline.
#[derive(Error, Debug, Clone)]
#[error("condition {description:?} was still false after {}", humanize(.waited))]
pub struct ConditionTimedOut {
    /// A description of the condition, for test failure messages.
    pub description: String,
    /// How long the condition was polled for.
    pub waited: Duration,
}

fn humanize(duration: &Duration) -> humantime::FormattedDuration {
    humantime::format_duration(*duration)
}

/// Polls `condition` every [`POLL_INTERVAL`] until it returns `true`, or `timeout` elapses.
///
/// Works with paused Tokio time, because it sleeps using the Tokio timer.
pub async fn wait_until<F>(
    description: &str,
    timeout: Duration,
    mut condition: F,
) -> Result<(), ConditionTimedOut>
where
    F: FnMut() -> bool,
{
    let start = tokio::time::Instant::now();

    loop {
        if condition() {
            return Ok(());
        }

        let waited = start.elapsed();
        if waited >= timeout {
            return Err(ConditionTimedOut {
                description: description.to_string(),
                waited,
            });
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
