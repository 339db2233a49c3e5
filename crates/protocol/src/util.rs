//! Small task helpers shared by the protocol engine.

use std::future::Future;

use tokio::task::JoinHandle;
use tracing::Instrument;

/// Spawn a session task inside a named tracing span, so its log lines
/// carry the protocol and task name.
pub(crate) fn spawn_task<F>(protocol: &'static str, task: &'static str, future: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(future.instrument(tracing::debug_span!("session", protocol, task)))
}
