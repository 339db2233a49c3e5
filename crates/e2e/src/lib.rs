//! QLink E2E Test Harness
//!
//! In-process mock servers for both machine-control protocols, driven by
//! scripted responder closures over real TCP and Unix sockets, plus the
//! small helpers the scenario tests share.

pub mod server;

use std::time::Duration;

pub use server::{QmpRequest, QmpServer, QtestServer, ServerOp};

/// Install the test log subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds, panicking after five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached within 5s");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
