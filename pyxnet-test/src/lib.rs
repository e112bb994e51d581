//! Shared test harness for the PYXNet crates.
#![warn(missing_docs)]
#![deny(clippy::await_holding_lock)]
#![forbid(unsafe_code)]

use std::{collections::HashSet, sync::Once};

use color_eyre::config::{Frame, HookBuilder};
use once_cell::sync::Lazy;
use tracing_error::ErrorLayer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub mod net;
pub mod prelude;
pub mod timing;

/// A multi-threaded runtime for tests that are not `async`, such as
/// `proptest!` bodies that spawn connection tasks.
///
/// Tests that pause the Tokio clock need their own runtime.
pub static RUNTIME: Lazy<tokio::runtime::Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("test runtime should build")
});

/// The log filter used when `RUST_LOG` is not set.
///
/// Closed and malformed connections are logged at `info` and `warn` by the
/// overlay, and many tests close connections on purpose.
const DEFAULT_LOG_FILTER: &str = "warn,pyxnet_network=error";

/// Backtrace frames from these prefixes are runtime plumbing.
const HIDDEN_FRAME_PREFIXES: &[&str] = &[
    "tokio::",
    "<futures_util::",
    "<T as futures_util",
    "<tracing_futures::Instrumented",
    "<core::future::",
    "<alloc::boxed::Box",
    "<std::panic::AssertUnwindSafe",
    "core::ops::function::FnOnce::call_once",
    "core::result::Result",
    "std::panic",
    "std::thread::local",
    "test::",
];

static INIT: Once = Once::new();

/// Installs the tracing subscriber and the error report hooks, once per
/// test process.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

        // Another test binary in this process may have installed a subscriber.
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false))
            .with(ErrorLayer::default())
            .try_init();

        let _ = HookBuilder::default()
            .add_frame_filter(Box::new(hide_plumbing_frames))
            .install();
    })
}

/// Drops repeated frames, and frames from [`HIDDEN_FRAME_PREFIXES`].
fn hide_plumbing_frames(frames: &mut Vec<&Frame>) {
    let mut seen = HashSet::new();

    frames.retain(|frame| {
        if !seen.insert((frame.lineno, &frame.filename)) {
            return false;
        }

        match &frame.name {
            Some(name) => !HIDDEN_FRAME_PREFIXES
                .iter()
                .any(|prefix| name.starts_with(prefix)),
            None => true,
        }
    });
}
