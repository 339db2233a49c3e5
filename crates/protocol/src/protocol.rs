//! Generic asynchronous protocol engine
//!
//! Drives one session at a time over a line-oriented stream: a reader task
//! frames and dispatches inbound messages, a writer task drains a bounded
//! outgoing queue, and a dispatcher task pumps asynchronous events into the
//! registered callback. Concrete protocols plug in through the [`Protocol`]
//! hook trait and keep their own request-correlation state.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::transport::{self, Address, LineReader, LineStream, LineWriter};
use crate::util::spawn_task;

/// Capacity of the outgoing request queue; producers wait when it is full.
pub(crate) const OUTGOING_CAPACITY: usize = 64;

/// Connection lifecycle of a protocol session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No session; ready to connect.
    Idle,
    /// Transport and handshake in progress.
    Connecting,
    /// Session tasks are live; requests may be issued.
    Running,
    /// Session is being torn down.
    Disconnecting,
}

/// Callback invoked by the dispatcher task for each asynchronous event.
pub(crate) type EventHandler<E> = Box<dyn FnMut(E) -> BoxFuture<'static, ()> + Send>;

/// Hooks a concrete protocol provides to the generic engine.
#[async_trait]
pub(crate) trait Protocol: Send + Sync + 'static {
    /// Inbound wire message.
    type In: fmt::Debug + Send + 'static;
    /// Outbound wire message.
    type Out: fmt::Debug + Send + 'static;
    /// Message delivered to the registered event callback.
    type Event: Send + 'static;

    /// Short protocol name used in log lines.
    const NAME: &'static str;

    /// Decode one wire line into an inbound message.
    fn decode(&self, line: &str) -> Result<Self::In>;

    /// Encode one outbound message as a single wire line, without the
    /// terminating newline.
    fn encode(&self, msg: &Self::Out) -> Result<String>;

    /// Route one inbound message to a pending request slot or the event
    /// queue. An error here is fatal to the session.
    fn on_message(&self, msg: Self::In, events: &mpsc::UnboundedSender<Self::Event>)
        -> Result<()>;

    /// Reset per-session bookkeeping before a new session starts.
    fn begin_session(&self);

    /// Drop every pending request slot, waking the callers.
    fn cancel_pending(&self);

    /// Protocol handshake, run on the raw stream before the session tasks
    /// take over.
    async fn establish_session(&self, stream: &mut LineStream) -> Result<()>;

    /// Observe one inbound message before dispatch.
    fn cb_inbound(&self, msg: &Self::In) {
        trace!(protocol = Self::NAME, "<-- {:?}", msg);
    }

    /// Observe one outbound message before it is written.
    fn cb_outbound(&self, msg: &Self::Out) {
        trace!(protocol = Self::NAME, "--> {:?}", msg);
    }
}

/// One live session: its outgoing queue, stop token and tasks.
struct Session<Out> {
    outgoing: mpsc::Sender<Out>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// The generic engine: state machine, session tasks and event dispatch.
pub(crate) struct Engine<P: Protocol> {
    proto: Arc<P>,
    state: Arc<Mutex<State>>,
    cause: Arc<Mutex<Option<Arc<Error>>>>,
    handler: Arc<AsyncMutex<Option<EventHandler<P::Event>>>>,
    session: AsyncMutex<Option<Session<P::Out>>>,
}

impl<P: Protocol> Engine<P> {
    pub(crate) fn new(proto: P) -> Self {
        Engine {
            proto: Arc::new(proto),
            state: Arc::new(Mutex::new(State::Idle)),
            cause: Arc::new(Mutex::new(None)),
            handler: Arc::new(AsyncMutex::new(None)),
            session: AsyncMutex::new(None),
        }
    }

    /// The concrete protocol, for specialization-side bookkeeping.
    pub(crate) fn proto(&self) -> &Arc<P> {
        &self.proto
    }

    pub(crate) fn state(&self) -> State {
        *self.state.lock()
    }

    /// True exactly in state [`State::Running`].
    pub(crate) fn running(&self) -> bool {
        self.state() == State::Running
    }

    /// True while a session is being torn down.
    pub(crate) fn disconnecting(&self) -> bool {
        self.state() == State::Disconnecting
    }

    /// Root cause of the most recent internally-triggered teardown, kept
    /// until the next connect.
    pub(crate) fn disconnect_cause(&self) -> Option<Arc<Error>> {
        self.cause.lock().clone()
    }

    /// Register the event callback; at most one is active.
    pub(crate) async fn set_event_handler(&self, handler: EventHandler<P::Event>) {
        *self.handler.lock().await = Some(handler);
    }

    /// Open a client session.
    pub(crate) async fn connect(&self, address: &Address) -> Result<()> {
        self.start_session(address, false).await
    }

    /// Await one incoming connection and run the same handshake.
    pub(crate) async fn accept(&self, address: &Address) -> Result<()> {
        self.start_session(address, true).await
    }

    async fn start_session(&self, address: &Address, server: bool) -> Result<()> {
        let mut session = self.session.lock().await;

        {
            let mut state = self.state.lock();
            if *state != State::Idle {
                return Err(Error::State(format!(
                    "cannot connect: session is {:?}",
                    *state
                )));
            }
            *state = State::Connecting;
        }
        *self.cause.lock() = None;

        match self.establish(address, server).await {
            Ok(new_session) => {
                *session = Some(new_session);
                *self.state.lock() = State::Running;
                debug!(protocol = P::NAME, address = %address, "session running");
                Ok(())
            }
            Err(err) => {
                *self.state.lock() = State::Idle;
                Err(err.into_connect(format!("failed to establish session with {}", address)))
            }
        }
    }

    async fn establish(&self, address: &Address, server: bool) -> Result<Session<P::Out>> {
        let mut stream = if server {
            transport::accept(address).await?
        } else {
            transport::connect(address).await?
        };

        self.proto.begin_session();
        // On failure the stream drops here, closing both halves.
        self.proto.establish_session(&mut stream).await?;

        let LineStream { reader, writer } = stream;
        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let tasks = vec![
            spawn_task(
                P::NAME,
                "reader",
                reader_task(
                    Arc::clone(&self.proto),
                    reader,
                    events_tx,
                    Arc::clone(&self.state),
                    Arc::clone(&self.cause),
                    cancel.clone(),
                ),
            ),
            spawn_task(
                P::NAME,
                "writer",
                writer_task(
                    Arc::clone(&self.proto),
                    writer,
                    outgoing_rx,
                    Arc::clone(&self.state),
                    Arc::clone(&self.cause),
                    cancel.clone(),
                ),
            ),
            spawn_task(
                P::NAME,
                "dispatcher",
                dispatcher_task(Arc::clone(&self.handler), events_rx, cancel.clone()),
            ),
        ];

        Ok(Session {
            outgoing: outgoing_tx,
            cancel,
            tasks,
        })
    }

    /// Tear the session down and return to [`State::Idle`]. Idempotent and
    /// infallible; an internal failure cause stays available through
    /// [`Engine::disconnect_cause`].
    pub(crate) async fn disconnect(&self) {
        let mut session = self.session.lock().await;
        let Some(active) = session.take() else {
            // Never connected, or torn down already.
            return;
        };

        *self.state.lock() = State::Disconnecting;
        active.cancel.cancel();
        for task in active.tasks {
            let _ = task.await;
        }
        // The bottom half may have run already; this wakes anything that
        // slipped in between.
        self.proto.cancel_pending();
        *self.state.lock() = State::Idle;
        debug!(protocol = P::NAME, "session closed");
    }

    /// Hand one message to the writer task, waiting for queue space.
    pub(crate) async fn send(&self, msg: P::Out) -> Result<()> {
        let outgoing = {
            let session = self.session.lock().await;
            match session.as_ref() {
                Some(active) if self.running() => active.outgoing.clone(),
                _ => {
                    return Err(Error::State(format!(
                        "cannot execute: session is {:?}",
                        self.state()
                    )))
                }
            }
        };
        outgoing
            .send(msg)
            .await
            .map_err(|_| Error::Disconnected("session terminated".to_string()))
    }
}

impl<P: Protocol> Drop for Engine<P> {
    fn drop(&mut self) {
        // Detached session tasks would otherwise outlive the client.
        if let Some(active) = self.session.get_mut().as_ref() {
            active.cancel.cancel();
        }
    }
}

/// Bottom-half disconnect: the first session task that fails (or sees EOF)
/// flips the state, records the cause and wakes everything. Safe to enter
/// from any task; later entrants find the token already cancelled.
fn bh_disconnect<P: Protocol>(
    proto: &P,
    state: &Mutex<State>,
    cause: &Mutex<Option<Arc<Error>>>,
    cancel: &CancellationToken,
    err: Option<Error>,
) {
    {
        let mut state = state.lock();
        if matches!(*state, State::Running | State::Connecting) {
            *state = State::Disconnecting;
            match err {
                Some(err) => {
                    warn!(protocol = P::NAME, error = %err, "session failed");
                    *cause.lock() = Some(Arc::new(err));
                }
                None => debug!(protocol = P::NAME, "session closed by peer"),
            }
        }
    }
    cancel.cancel();
    proto.cancel_pending();
}

async fn reader_task<P: Protocol>(
    proto: Arc<P>,
    mut reader: LineReader,
    events: mpsc::UnboundedSender<P::Event>,
    state: Arc<Mutex<State>>,
    cause: Arc<Mutex<Option<Arc<Error>>>>,
    cancel: CancellationToken,
) {
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = reader.read_line() => line,
        };

        let outcome = match line {
            Ok(Some(line)) => proto.decode(&line).and_then(|msg| {
                proto.cb_inbound(&msg);
                proto.on_message(msg, &events)
            }),
            // EOF is a clean teardown, not an error.
            Ok(None) => {
                bh_disconnect(proto.as_ref(), &state, &cause, &cancel, None);
                break;
            }
            Err(err) => Err(err),
        };

        if let Err(err) = outcome {
            bh_disconnect(proto.as_ref(), &state, &cause, &cancel, Some(err));
            break;
        }
    }
}

async fn writer_task<P: Protocol>(
    proto: Arc<P>,
    mut writer: LineWriter,
    mut outgoing: mpsc::Receiver<P::Out>,
    state: Arc<Mutex<State>>,
    cause: Arc<Mutex<Option<Arc<Error>>>>,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = outgoing.recv() => msg,
        };
        let Some(msg) = msg else { break };

        proto.cb_outbound(&msg);
        let result = match proto.encode(&msg) {
            Ok(line) => writer.write_line(&line).await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            bh_disconnect(proto.as_ref(), &state, &cause, &cancel, Some(err));
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn dispatcher_task<E: Send + 'static>(
    handler: Arc<AsyncMutex<Option<EventHandler<E>>>>,
    mut events: mpsc::UnboundedReceiver<E>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else { break };

        // Callbacks run one at a time, on this task only.
        let mut handler = handler.lock().await;
        if let Some(callback) = handler.as_mut() {
            callback(event).await;
        }
    }
}
