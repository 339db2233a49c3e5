//! QMP (QEMU Machine Protocol) client
//!
//! One JSON object per line. The server opens with a greeting, the client
//! negotiates capabilities, and from then on requests are correlated by an
//! engine-injected `id` while `event` messages flow to the registered
//! callback.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::{Error, ErrorInfo, Result};
use crate::protocol::{Engine, Protocol, State};
use crate::transport::{Address, LineStream};

/// The server's opening message announcing capabilities and version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Greeting {
    #[serde(rename = "QMP")]
    pub qmp: GreetingBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GreetingBody {
    /// Server version description; layout varies between servers.
    pub version: Value,
    #[serde(default)]
    pub capabilities: Vec<Value>,
}

/// Asynchronous event notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: i64,
    pub microseconds: i64,
}

/// Reply to an executed command: exactly one of `return` or `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Ok {
        #[serde(rename = "return")]
        ret: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<Value>,
    },
    Err {
        error: ErrorInfo,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<Value>,
    },
}

impl Response {
    fn id(&self) -> Option<&Value> {
        match self {
            Response::Ok { id, .. } | Response::Err { id, .. } => id.as_ref(),
        }
    }
}

/// Command message; the `id` is injected by the engine, never by callers.
#[derive(Debug, Clone, Serialize)]
pub struct Command {
    pub execute: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

/// Inbound message shapes the engine recognizes.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum QmpMessage {
    Greeting(Greeting),
    Response(Response),
    Event(Event),
}

/// Correlation state and hooks for the QMP protocol.
struct QmpProto {
    greeting: Mutex<Option<Greeting>>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Response>>>,
}

impl QmpProto {
    fn new() -> Self {
        QmpProto {
            greeting: Mutex::new(None),
            next_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Protocol for QmpProto {
    type In = QmpMessage;
    type Out = Command;
    type Event = Event;

    const NAME: &'static str = "qmp";

    fn decode(&self, line: &str) -> Result<QmpMessage> {
        serde_json::from_str(line)
            .map_err(|err| Error::Protocol(format!("malformed message: {}", err)))
    }

    fn encode(&self, msg: &Command) -> Result<String> {
        Ok(serde_json::to_string(msg)?)
    }

    fn on_message(&self, msg: QmpMessage, events: &mpsc::UnboundedSender<Event>) -> Result<()> {
        match msg {
            QmpMessage::Greeting(_) => Err(Error::Protocol(
                "unexpected greeting after negotiation".to_string(),
            )),
            QmpMessage::Event(event) => {
                // The dispatcher may already be gone during teardown.
                let _ = events.send(event);
                Ok(())
            }
            QmpMessage::Response(response) => {
                let id = response
                    .id()
                    .and_then(Value::as_u64)
                    .ok_or_else(|| Error::Protocol("response without usable id".to_string()))?;
                let slot = self.pending.lock().remove(&id).ok_or_else(|| {
                    Error::Protocol(format!("response with unknown id {}", id))
                })?;
                // A cancelled caller has dropped its receiver; nothing to do.
                let _ = slot.send(response);
                Ok(())
            }
        }
    }

    fn begin_session(&self) {
        *self.greeting.lock() = None;
        self.next_id.store(0, Ordering::SeqCst);
        self.pending.lock().clear();
    }

    fn cancel_pending(&self) {
        // Dropping the senders wakes every waiting caller.
        self.pending.lock().clear();
    }

    async fn establish_session(&self, stream: &mut LineStream) -> Result<()> {
        let line = stream
            .reader
            .read_line()
            .await?
            .ok_or_else(|| Error::connect("connection closed before greeting"))?;
        let greeting: Greeting = serde_json::from_str(&line)
            .map_err(|_| Error::connect("expected greeting"))?;
        debug!(protocol = Self::NAME, "received greeting");
        *self.greeting.lock() = Some(greeting);

        // Capability negotiation happens directly on the stream, before the
        // session tasks exist; it carries no id.
        let negotiate = Command {
            execute: "qmp_capabilities".to_string(),
            arguments: None,
            id: None,
        };
        stream.writer.write_line(&serde_json::to_string(&negotiate)?).await?;

        let line = stream
            .reader
            .read_line()
            .await?
            .ok_or_else(|| Error::connect("connection closed during negotiation"))?;
        let response: Response = serde_json::from_str(&line)
            .map_err(|_| Error::connect("malformed negotiation response"))?;
        if let Response::Err { error, .. } = response {
            return Err(Error::connect(format!(
                "capability negotiation failed: {}",
                error.desc
            )));
        }

        Ok(())
    }
}

/// Removes a caller's pending slot if the caller gives up on it.
struct PendingGuard {
    proto: Arc<QmpProto>,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.proto.pending.lock().remove(&self.id);
    }
}

/// Asynchronous QMP client.
///
/// ```no_run
/// # use qlink_protocol::{Address, QmpClient};
/// # async fn demo() -> qlink_protocol::Result<()> {
/// let qmp = QmpClient::new();
/// qmp.connect(&Address::tcp("127.0.0.1", 4444)).await?;
/// let status = qmp.execute("query-status", None).await?;
/// println!("{}", status);
/// qmp.disconnect().await;
/// # Ok(())
/// # }
/// ```
pub struct QmpClient {
    engine: Engine<QmpProto>,
}

impl QmpClient {
    /// Create a new client (does not connect).
    pub fn new() -> Self {
        QmpClient {
            engine: Engine::new(QmpProto::new()),
        }
    }

    /// Connect to a QMP server and negotiate capabilities.
    pub async fn connect(&self, address: &Address) -> Result<()> {
        self.engine.connect(address).await
    }

    /// Await one incoming connection from a QMP server, then negotiate.
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

    /// Greeting received from the server during the current session.
    pub fn greeting(&self) -> Option<Greeting> {
        self.engine.proto().greeting.lock().clone()
    }

    /// Register the event callback. Replaces any previous callback; events
    /// arriving with no callback registered are dropped.
    pub async fn on_event<F, Fut>(&self, mut callback: F)
    where
        F: FnMut(Event) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.engine
            .set_event_handler(Box::new(move |event| callback(event).boxed()))
            .await;
    }

    /// Execute a command and await its correlated response.
    ///
    /// Returns the `return` payload verbatim. A server-reported failure
    /// surfaces as [`Error::Execute`]; if the session ends during the wait
    /// the result is [`Error::Disconnected`].
    pub async fn execute(&self, command: &str, arguments: Option<Value>) -> Result<Value> {
        if !self.engine.running() {
            return Err(Error::State(format!(
                "cannot execute: session is {:?}",
                self.engine.state()
            )));
        }

        let proto = Arc::clone(self.engine.proto());
        let id = proto.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        proto.pending.lock().insert(id, tx);
        let _guard = PendingGuard { proto, id };

        let command_msg = Command {
            execute: command.to_string(),
            arguments,
            id: Some(id),
        };
        let sent = serde_json::to_value(&command_msg)?;
        self.engine.send(command_msg).await?;

        let response = rx
            .await
            .map_err(|_| Error::Disconnected("session terminated while awaiting reply".to_string()))?;

        let received = serde_json::to_value(&response)?;
        match response {
            Response::Ok { ret, .. } => Ok(ret),
            Response::Err { error, .. } => Err(Error::Execute {
                command: command.to_string(),
                sent,
                received,
                error,
            }),
        }
    }
}

impl Default for QmpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;

    #[test]
    fn test_command_serialization() {
        let cmd = Command {
            execute: "block-dirty-bitmap-add".to_string(),
            arguments: Some(serde_json::json!({"node": "ide0-hd0"})),
            id: Some(3),
        };

        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"execute\":\"block-dirty-bitmap-add\""));
        assert!(json.contains("\"arguments\""));
        assert!(json.contains("\"id\":3"));
    }

    #[test]
    fn test_negotiation_command_has_no_id() {
        let cmd = Command {
            execute: "qmp_capabilities".to_string(),
            arguments: None,
            id: None,
        };

        let json = serde_json::to_string(&cmd).unwrap();
        assert_eq!(json, r#"{"execute":"qmp_capabilities"}"#);
    }

    #[test]
    fn test_greeting_parsing() {
        let json = r#"{"QMP": {"version": {"qemu": {"major": 8, "minor": 2, "micro": 0}}, "capabilities": ["oob"]}}"#;
        let msg: QmpMessage = serde_json::from_str(json).unwrap();
        let QmpMessage::Greeting(greeting) = msg else {
            panic!("expected greeting");
        };
        assert_eq!(greeting.qmp.capabilities.len(), 1);
    }

    #[test]
    fn test_response_parsing() {
        let json = r#"{"return": {}, "id": 0}"#;
        let msg: QmpMessage = serde_json::from_str(json).unwrap();
        let QmpMessage::Response(response) = msg else {
            panic!("expected response");
        };
        assert_eq!(response.id().and_then(Value::as_u64), Some(0));
        assert!(matches!(response, Response::Ok { .. }));
    }

    #[test]
    fn test_error_response_parsing() {
        let json = r#"{"error": {"class": "GenericError", "desc": "oops"}, "id": 7}"#;
        let msg: QmpMessage = serde_json::from_str(json).unwrap();
        let QmpMessage::Response(Response::Err { error, id }) = msg else {
            panic!("expected error response");
        };
        assert_eq!(error.class, ErrorClass::GenericError);
        assert_eq!(id.as_ref().and_then(Value::as_u64), Some(7));
    }

    #[test]
    fn test_event_parsing() {
        let json = r#"{"event": "SHUTDOWN", "data": {"guest": true}, "timestamp": {"seconds": 1, "microseconds": 2}}"#;
        let msg: QmpMessage = serde_json::from_str(json).unwrap();
        let QmpMessage::Event(event) = msg else {
            panic!("expected event");
        };
        assert_eq!(event.event, "SHUTDOWN");
        assert_eq!(event.timestamp.unwrap().seconds, 1);
    }

    #[test]
    fn test_null_return_is_a_response() {
        let json = r#"{"return": null, "id": 2}"#;
        let msg: QmpMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(
            msg,
            QmpMessage::Response(Response::Ok { ret: Value::Null, .. })
        ));
    }

    #[test]
    fn test_unclassifiable_message_is_rejected() {
        let result: std::result::Result<QmpMessage, _> =
            serde_json::from_str(r#"{"neither": "fish", "nor": "fowl"}"#);
        assert!(result.is_err());
    }
}
