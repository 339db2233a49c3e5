//! qtest protocol client
//!
//! Whitespace-delimited lines. The protocol has no correlation id: replies
//! arrive in issue order and are matched against a pending FIFO, while
//! `IRQ` lines are split off as asynchronous events.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::sync::Mutex as AsyncMutex;
use tracing::trace;

use crate::error::{Error, Result};
use crate::protocol::{Engine, Protocol, State};
use crate::transport::{Address, LineStream};

/// One qtest message: non-empty whitespace-separated tokens.
pub type Tokens = Vec<String>;

/// Correlation state and hooks for the qtest protocol.
struct QtestProto {
    next_seq: AtomicU64,
    pending: Mutex<VecDeque<(u64, oneshot::Sender<Tokens>)>>,
}

impl QtestProto {
    fn new() -> Self {
        QtestProto {
            next_seq: AtomicU64::new(0),
            pending: Mutex::new(VecDeque::new()),
        }
    }
}

#[async_trait]
impl Protocol for QtestProto {
    type In = Tokens;
    type Out = Tokens;
    type Event = Tokens;

    const NAME: &'static str = "qtest";

    fn decode(&self, line: &str) -> Result<Tokens> {
        let line = line.trim();
        if line.is_empty() {
            return Err(Error::Protocol("empty message".to_string()));
        }
        Ok(line.split(' ').map(str::to_owned).collect())
    }

    fn encode(&self, msg: &Tokens) -> Result<String> {
        Ok(msg.join(" "))
    }

    fn on_message(&self, msg: Tokens, events: &mpsc::UnboundedSender<Tokens>) -> Result<()> {
        if msg[0] == "IRQ" {
            let _ = events.send(msg);
            return Ok(());
        }

        // FIFO: the oldest pending request owns this reply.
        let slot = self
            .pending
            .lock()
            .pop_front()
            .ok_or_else(|| Error::Protocol("response with no pending request".to_string()))?;
        // A cancelled caller has dropped its receiver; the FIFO position is
        // consumed either way.
        let _ = slot.1.send(msg);
        Ok(())
    }

    fn begin_session(&self) {
        self.next_seq.store(0, Ordering::SeqCst);
        self.pending.lock().clear();
    }

    fn cancel_pending(&self) {
        self.pending.lock().clear();
    }

    async fn establish_session(&self, _stream: &mut LineStream) -> Result<()> {
        // qtest has no handshake; the session is usable immediately.
        Ok(())
    }

    fn cb_inbound(&self, msg: &Tokens) {
        trace!(protocol = Self::NAME, "<-- {}", msg.join(" "));
    }

    fn cb_outbound(&self, msg: &Tokens) {
        trace!(protocol = Self::NAME, "--> {}", msg.join(" "));
    }
}

/// Removes a caller's pending slot if the caller gives up on it.
struct PendingGuard {
    proto: Arc<QtestProto>,
    seq: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.proto.pending.lock().retain(|(seq, _)| *seq != self.seq);
    }
}

/// Asynchronous qtest client.
pub struct QtestClient {
    engine: Engine<QtestProto>,
    /// Serializes slot registration with queue order so that FIFO position
    /// always matches wire order.
    issue: AsyncMutex<()>,
}

impl QtestClient {
    /// Create a new client (does not connect).
    pub fn new() -> Self {
        QtestClient {
            engine: Engine::new(QtestProto::new()),
            issue: AsyncMutex::new(()),
        }
    }

    /// Connect to a qtest server.
    pub async fn connect(&self, address: &Address) -> Result<()> {
        self.engine.connect(address).await
    }

    /// Await one incoming connection from a qtest server.
    pub async fn accept(&self, address: &Address) -> Result<()> {
        self.engine.accept(address).await
    }

    /// Tear down the session. Idempotent; never fails.
    pub async fn disconnect(&self) {
        self.engine.disconnect().await
    }

    /// True exactly while the session is running.
    pub fn running(&self) -> bool {
        self.engine.running()
    }

    /// True while the session is being torn down.
    pub fn disconnecting(&self) -> bool {
        self.engine.disconnecting()
    }

    /// Current session state.
    pub fn state(&self) -> State {
        self.engine.state()
    }

    /// Why the last session ended, if it ended from the inside.
    pub fn disconnect_cause(&self) -> Option<Arc<Error>> {
        self.engine.disconnect_cause()
    }

    /// Register the callback for `IRQ` messages. Replaces any previous
    /// callback; events arriving with no callback registered are dropped.
    pub async fn on_event<F, Fut>(&self, mut callback: F)
    where
        F: FnMut(Tokens) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.engine
            .set_event_handler(Box::new(move |msg| callback(msg).boxed()))
            .await;
    }

    /// Execute a qtest command and await its reply.
    ///
    /// Returns the reply tokens after the `OK` status. `FAIL` and `ERR`
    /// surface as [`Error::Qtest`]; an unrecognized status is an
    /// [`Error::Protocol`] for this caller and leaves the session running.
    pub async fn execute(&self, cmd: &str, args: &[&str]) -> Result<Tokens> {
        if self.engine.disconnecting() {
            return Err(Error::State(
                "session is disconnecting; call disconnect() to finish teardown".to_string(),
            ));
        }
        if !self.engine.running() {
            return Err(Error::State(format!(
                "cannot execute: session is {:?}",
                self.engine.state()
            )));
        }

        let mut msg: Tokens = Vec::with_capacity(1 + args.len());
        msg.push(cmd.to_string());
        msg.extend(args.iter().map(|arg| arg.to_string()));

        let proto = Arc::clone(self.engine.proto());
        let seq = proto.next_seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        let guard = PendingGuard {
            proto: Arc::clone(&proto),
            seq,
        };

        {
            // Register the slot and enqueue the request as one step, so a
            // concurrent caller cannot interleave between them.
            let _issue = self.issue.lock().await;
            proto.pending.lock().push_back((seq, tx));
            self.engine.send(msg).await?;
        }

        let reply = rx
            .await
            .map_err(|_| Error::Disconnected("session terminated while awaiting reply".to_string()))?;
        drop(guard);

        classify(reply)
    }
}

impl Default for QtestClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Split the status token off a reply and map it to a result.
fn classify(mut reply: Tokens) -> Result<Tokens> {
    let status = reply.remove(0);
    match status.as_str() {
        "OK" => Ok(reply),
        "FAIL" | "ERR" => Err(Error::Qtest {
            status,
            reason: reply.join(" "),
        }),
        other => Err(Error::Protocol(format!(
            "unknown response status '{}'",
            other
        ))),
    }
}
