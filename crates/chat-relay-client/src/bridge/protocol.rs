//! Bridge wire protocol and peer.
//!
//! The bridge is a sidecar process that owns the third-party client. We
//! write one JSON request per line to its stdin and read one JSON message
//! per line from its stdout: either a lifecycle event or the response to
//! an earlier request, matched by `requestId`.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chat_relay_core::{ClientError, EventSink, PlatformMessage};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter},
    sync::{Mutex as AsyncMutex, oneshot},
    task::JoinHandle,
};
use uuid::Uuid;

/// Protocol error.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Io(io) => Self::Io(io),
            ProtocolError::Json(json) => Self::Protocol(json.to_string()),
        }
    }
}

/// Request sent to the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeRequest {
    pub request_id: String,
    #[serde(flatten)]
    pub command: BridgeCommand,
}

/// Operation requested from the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum BridgeCommand {
    #[serde(rename_all = "camelCase")]
    Initialize { client_id: String },
    SendMessage { to: String, text: String },
    GetChats,
    #[serde(rename_all = "camelCase")]
    GetChatMessages { chat_id: String, limit: usize },
    #[serde(rename_all = "camelCase")]
    GetContact { contact_id: String },
    GetContacts,
    #[serde(rename_all = "camelCase")]
    GetProfilePicUrl { contact_id: String },
    Logout,
    Destroy,
}

/// Message received from the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BridgeMessage {
    /// Login challenge issued.
    Qr { data: String },
    /// Authenticated as `wid`.
    Ready { wid: String },
    /// Inbound message.
    Message { message: PlatformMessage },
    /// Session lost.
    Disconnected {
        #[serde(default)]
        reason: String,
    },
    /// Reply to a request.
    #[serde(rename_all = "camelCase")]
    Response {
        request_id: String,
        ok: bool,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        error: Option<String>,
    },
}

type Pending = HashMap<String, oneshot::Sender<Result<Value, String>>>;

struct PeerInner {
    writer: AsyncMutex<BufWriter<Box<dyn AsyncWrite + Send + Unpin>>>,
    pending: Mutex<Pending>,
    identity: Arc<RwLock<Option<String>>>,
    timeout: Duration,
    closing: AtomicBool,
}

/// Handles bidirectional communication with one bridge process.
#[derive(Clone)]
pub struct ProtocolPeer {
    inner: Arc<PeerInner>,
}

impl ProtocolPeer {
    /// Spawn a new protocol peer.
    ///
    /// This starts a background task reading from `reader`. Lifecycle
    /// events go to `sink`; the `ready` identity is recorded in `identity`
    /// before the event is pushed.
    pub fn spawn<R, W>(
        reader: R,
        writer: W,
        sink: EventSink,
        identity: Arc<RwLock<Option<String>>>,
        timeout: Duration,
    ) -> (Self, JoinHandle<()>)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let peer = Self {
            inner: Arc::new(PeerInner {
                writer: AsyncMutex::new(BufWriter::new(Box::new(writer))),
                pending: Mutex::new(HashMap::new()),
                identity,
                timeout,
                closing: AtomicBool::new(false),
            }),
        };

        let reader_peer = peer.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = reader_peer.read_loop(reader, &sink).await {
                tracing::error!(user_id = %sink.user_id(), "Bridge reader loop error: {e}");
            }
            reader_peer.on_closed(&sink);
        });

        (peer, task)
    }

    async fn read_loop<R>(&self, reader: R, sink: &EventSink) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut buffer = String::new();

        loop {
            buffer.clear();
            if reader.read_line(&mut buffer).await? == 0 {
                break; // EOF
            }
            let line = buffer.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<BridgeMessage>(line) {
                Ok(msg) => self.dispatch(msg, sink),
                Err(e) => {
                    tracing::warn!(user_id = %sink.user_id(), "Invalid bridge message: {e}");
                }
            }
        }
        Ok(())
    }

    fn dispatch(&self, msg: BridgeMessage, sink: &EventSink) {
        match msg {
            BridgeMessage::Qr { data } => sink.push_challenge(data),
            BridgeMessage::Ready { wid } => {
                *self.inner.identity.write() = Some(wid.clone());
                sink.push_ready(wid);
            }
            BridgeMessage::Message { message } => sink.push_message(message),
            BridgeMessage::Disconnected { reason } => {
                *self.inner.identity.write() = None;
                sink.push_disconnected(reason);
            }
            BridgeMessage::Response {
                request_id,
                ok,
                result,
                error,
            } => {
                let Some(tx) = self.inner.pending.lock().remove(&request_id) else {
                    tracing::debug!(%request_id, "Response for unknown request");
                    return;
                };
                let outcome = if ok {
                    Ok(result)
                } else {
                    Err(error.unwrap_or_else(|| "unknown bridge error".to_string()))
                };
                let _ = tx.send(outcome);
            }
        }
    }

    /// Reader reached EOF or failed: fail in-flight requests and, unless we
    /// are shutting the bridge down ourselves, report the disconnect.
    fn on_closed(&self, sink: &EventSink) {
        *self.inner.identity.write() = None;
        if !self.inner.closing.load(Ordering::Acquire) {
            sink.push_disconnected("bridge process exited");
        }
        // Dropping the senders fails every waiting request.
        self.inner.pending.lock().clear();
    }

    /// While set, the bridge exiting is expected and no disconnect event
    /// is reported for it.
    pub fn set_closing(&self, closing: bool) {
        self.inner.closing.store(closing, Ordering::Release);
    }

    /// Send a request and wait for its response.
    ///
    /// # Errors
    /// Returns `Rejected` if the bridge reports failure, `Timeout` if no
    /// response arrives in time, `NotConnected` if the bridge went away.
    pub async fn request(&self, command: BridgeCommand) -> Result<Value, ClientError> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(request_id.clone(), tx);

        let request = BridgeRequest {
            request_id: request_id.clone(),
            command,
        };
        if let Err(e) = self.send_json(&request).await {
            self.inner.pending.lock().remove(&request_id);
            return Err(e.into());
        }

        match tokio::time::timeout(self.inner.timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(ClientError::Rejected(message)),
            Ok(Err(_)) => Err(ClientError::NotConnected),
            Err(_) => {
                self.inner.pending.lock().remove(&request_id);
                Err(ClientError::Timeout(self.inner.timeout))
            }
        }
    }

    /// Send a request and decode its result.
    ///
    /// # Errors
    /// As [`Self::request`], plus `Protocol` if the result has the wrong shape.
    pub async fn request_as<T>(&self, command: BridgeCommand) -> Result<T, ClientError>
    where
        T: serde::de::DeserializeOwned,
    {
        let value = self.request(command).await?;
        serde_json::from_value(value).map_err(|e| ClientError::Protocol(e.to_string()))
    }

    async fn send_json<T: Serialize>(&self, message: &T) -> Result<(), ProtocolError> {
        let json = serde_json::to_string(message)?;
        let mut writer = self.inner.writer.lock().await;
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    /// Number of requests awaiting a response.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use chat_relay_core::{ClientEvent, SinkEnvelope, UserId};
    use serde_json::json;
    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, duplex},
        sync::mpsc,
    };

    use super::*;

    struct FakeBridge {
        requests: Lines<BufReader<DuplexStream>>,
        stdout: DuplexStream,
    }

    impl FakeBridge {
        async fn next_request(&mut self) -> BridgeRequest {
            let line = self.requests.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn emit(&mut self, value: Value) {
            let mut line = value.to_string();
            line.push('\n');
            self.stdout.write_all(line.as_bytes()).await.unwrap();
        }
    }

    fn setup(
        timeout: Duration,
    ) -> (
        ProtocolPeer,
        FakeBridge,
        mpsc::UnboundedReceiver<SinkEnvelope>,
        Arc<RwLock<Option<String>>>,
    ) {
        let (peer_stdin, bridge_stdin) = duplex(4096);
        let (bridge_stdout, peer_stdout) = duplex(4096);
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(UserId::new("u1"), 1, move |env| {
            let _ = tx.send(env);
        });
        let identity = Arc::new(RwLock::new(None));
        let (peer, _task) =
            ProtocolPeer::spawn(peer_stdout, peer_stdin, sink, Arc::clone(&identity), timeout);
        let bridge = FakeBridge {
            requests: BufReader::new(bridge_stdin).lines(),
            stdout: bridge_stdout,
        };
        (peer, bridge, rx, identity)
    }

    #[test]
    fn test_request_wire_format() {
        let request = BridgeRequest {
            request_id: "r1".to_string(),
            command: BridgeCommand::SendMessage {
                to: "to123".to_string(),
                text: "hi".to_string(),
            },
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"requestId": "r1", "method": "sendMessage", "params": {"to": "to123", "text": "hi"}})
        );

        let request = BridgeRequest {
            request_id: "r2".to_string(),
            command: BridgeCommand::GetChatMessages {
                chat_id: "c1".to_string(),
                limit: 10,
            },
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"requestId": "r2", "method": "getChatMessages", "params": {"chatId": "c1", "limit": 10}})
        );
    }

    #[tokio::test]
    async fn test_lifecycle_events_reach_sink() {
        let (_peer, mut bridge, mut events, identity) = setup(Duration::from_secs(5));

        bridge.emit(json!({"type": "qr", "data": "C1"})).await;
        bridge.emit(json!({"type": "ready", "wid": "me@c.us"})).await;
        bridge
            .emit(json!({"type": "message", "message": {
                "id": "m1", "from": "a@c.us", "to": "me@c.us", "body": "hi", "timestamp": 10, "fromMe": false
            }}))
            .await;

        assert_eq!(
            events.recv().await.unwrap().event,
            ClientEvent::Challenge("C1".to_string())
        );
        assert_eq!(
            events.recv().await.unwrap().event,
            ClientEvent::Ready {
                identity: "me@c.us".to_string()
            }
        );
        assert_eq!(identity.read().as_deref(), Some("me@c.us"));
        match events.recv().await.unwrap().event {
            ClientEvent::Message(msg) => assert_eq!(msg.body, "hi"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_response_matched_by_request_id() {
        let (peer, mut bridge, _events, _identity) = setup(Duration::from_secs(5));

        let call = tokio::spawn({
            let peer = peer.clone();
            async move { peer.request(BridgeCommand::GetContacts).await }
        });

        let request = bridge.next_request().await;
        assert_eq!(request.command, BridgeCommand::GetContacts);
        bridge
            .emit(json!({"type": "response", "requestId": "someone-else", "ok": true, "result": 1}))
            .await;
        bridge
            .emit(json!({"type": "response", "requestId": request.request_id, "ok": true, "result": [1, 2]}))
            .await;

        assert_eq!(call.await.unwrap().unwrap(), json!([1, 2]));
        assert_eq!(peer.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_error_response_is_rejected() {
        let (peer, mut bridge, _events, _identity) = setup(Duration::from_secs(5));

        let call = tokio::spawn({
            let peer = peer.clone();
            async move { peer.request(BridgeCommand::Logout).await }
        });
        let request = bridge.next_request().await;
        bridge
            .emit(json!({"type": "response", "requestId": request.request_id, "ok": false, "error": "not logged in"}))
            .await;

        match call.await.unwrap() {
            Err(ClientError::Rejected(msg)) => assert_eq!(msg, "not logged in"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out() {
        let (peer, mut bridge, _events, _identity) = setup(Duration::from_secs(30));

        let call = tokio::spawn({
            let peer = peer.clone();
            async move { peer.request(BridgeCommand::GetChats).await }
        });
        let _ = bridge.next_request().await;

        assert!(matches!(call.await.unwrap(), Err(ClientError::Timeout(_))));
        assert_eq!(peer.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_eof_reports_disconnect_and_fails_pending() {
        let (peer, mut bridge, mut events, identity) = setup(Duration::from_secs(5));
        bridge.emit(json!({"type": "ready", "wid": "me@c.us"})).await;
        let _ = events.recv().await;

        let call = tokio::spawn({
            let peer = peer.clone();
            async move { peer.request(BridgeCommand::GetChats).await }
        });
        let _ = bridge.next_request().await;
        drop(bridge);

        assert!(matches!(call.await.unwrap(), Err(ClientError::NotConnected)));
        assert!(matches!(
            events.recv().await.unwrap().event,
            ClientEvent::Disconnected { .. }
        ));
        assert_eq!(*identity.read(), None);
    }

    #[tokio::test]
    async fn test_eof_while_closing_is_silent() {
        let (peer, bridge, mut events, _identity) = setup(Duration::from_secs(5));
        peer.set_closing(true);
        drop(bridge);
        drop(peer);

        // Sender side closes once the reader task ends.
        assert_eq!(events.recv().await, None);
    }
}
