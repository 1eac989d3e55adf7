//! JSON-over-WebSocket signaling channel with auto-reconnect.
//!
//! Frames:
//! - request:      `{"id": 7, "method": "consume", "data": {...}}`
//! - notification: `{"event": "muteState", "data": {...}}` (both directions)
//! - ack:          `{"id": 7, "ok": true, "data": {...}}` or `{"id": 7, "ok": false, "error": "..."}`

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{SignalingChannel, SignalingEvent, names};
use crate::error::SignalingError;
use crate::retry::RetryPolicy;

type AckSender = oneshot::Sender<Result<Value, SignalingError>>;
type PendingMap = Arc<Mutex<HashMap<u64, (String, AckSender)>>>;

#[derive(Debug, Deserialize)]
struct InboundFrame {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    ok: Option<bool>,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    event: Option<String>,
}

/// WebSocket signaling client.
///
/// ```rust,no_run
/// use nexus_voice::retry::RetryPolicy;
/// use nexus_voice::signaling::{SignalingChannel, WsSignaling};
///
/// # async fn run() {
/// let ws = WsSignaling::connect("ws://localhost:8082/voice", RetryPolicy::default());
/// let mut events = ws.subscribe();
/// while let Ok(event) = events.recv().await {
///     println!("{}: {}", event.name, event.data);
/// }
/// # }
/// ```
pub struct WsSignaling {
    outbound: mpsc::UnboundedSender<String>,
    pending: PendingMap,
    next_id: AtomicU64,
    events: broadcast::Sender<SignalingEvent>,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl WsSignaling {
    /// Spawns the background connection task and returns immediately; use
    /// [`SignalingChannel::subscribe`] to observe `connect`/`disconnect`.
    pub fn connect(url: impl Into<String>, reconnect: RetryPolicy) -> Self {
        let url = url.into();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();

        tokio::spawn(run_connection(
            url,
            reconnect,
            outbound_rx,
            events.clone(),
            pending.clone(),
            connected.clone(),
            shutdown.clone(),
        ));

        Self {
            outbound,
            pending,
            next_id: AtomicU64::new(1),
            events,
            connected,
            shutdown,
        }
    }

    /// Stop the background task and fail every pending request.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for WsSignaling {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl SignalingChannel for WsSignaling {
    async fn request(
        &self,
        method: &str,
        data: Value,
        timeout: Duration,
    ) -> Result<Value, SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::Disconnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id, (method.to_owned(), tx));

        let frame = json!({ "id": id, "method": method, "data": data }).to_string();
        if self.outbound.send(frame).is_err() {
            lock_pending(&self.pending).remove(&id);
            return Err(SignalingError::Disconnected);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SignalingError::Disconnected),
            Err(_) => {
                lock_pending(&self.pending).remove(&id);
                Err(SignalingError::Timeout {
                    method: method.to_owned(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn notify(&self, event: &str, data: Value) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::Disconnected);
        }
        let frame = json!({ "event": event, "data": data }).to_string();
        self.outbound
            .send(frame)
            .map_err(|_| SignalingError::Disconnected)
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.events.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

fn lock_pending(
    pending: &PendingMap,
) -> std::sync::MutexGuard<'_, HashMap<u64, (String, AckSender)>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn fail_pending(pending: &PendingMap) {
    let drained: Vec<_> = lock_pending(pending).drain().collect();
    for (_, (_, tx)) in drained {
        let _ = tx.send(Err(SignalingError::Disconnected));
    }
}

async fn run_connection(
    url: String,
    reconnect: RetryPolicy,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    events: broadcast::Sender<SignalingEvent>,
    pending: PendingMap,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    let mut attempts = 0u32;
    let mut ever_connected = false;

    loop {
        let outcome = tokio::select! {
            _ = shutdown.cancelled() => break,
            outcome = run_once(&url, &mut outbound_rx, &events, &pending, &connected, ever_connected) => outcome,
        };

        let was_connected = connected.swap(false, Ordering::AcqRel);
        fail_pending(&pending);
        if was_connected {
            ever_connected = true;
            let _ = events.send(SignalingEvent::new(names::DISCONNECT, Value::Null));
        }

        match outcome {
            Ok(()) => attempts = 0,
            Err(e) => {
                attempts += 1;
                if !reconnect.allows(attempts) {
                    error!(url = %url, error = %e, "Signaling: max reconnect attempts reached");
                    break;
                }
                warn!(url = %url, error = %e, attempt = attempts, "Signaling: connection failed");
            }
        }

        let delay = reconnect.delay_for(attempts.max(1));
        debug!(?delay, "Signaling: reconnecting");
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    connected.store(false, Ordering::Release);
    fail_pending(&pending);
    info!(url = %url, "Signaling: connection task stopped");
}

async fn run_once(
    url: &str,
    outbound_rx: &mut mpsc::UnboundedReceiver<String>,
    events: &broadcast::Sender<SignalingEvent>,
    pending: &PendingMap,
    connected: &AtomicBool,
    is_reconnect: bool,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let (ws, _) = connect_async(url).await?;
    let (mut sink, mut stream) = ws.split();

    // Anything queued while offline belongs to a previous connection.
    while outbound_rx.try_recv().is_ok() {}

    connected.store(true, Ordering::Release);
    let name = if is_reconnect {
        names::RECONNECT
    } else {
        names::CONNECT
    };
    info!(url = %url, "Signaling: connected");
    let _ = events.send(SignalingEvent::new(name, Value::Null));

    loop {
        tokio::select! {
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { return Ok(()) };
                sink.send(Message::Text(frame.into())).await?;
            }
            msg = stream.next() => {
                let Some(msg) = msg else { return Ok(()) };
                let text = match msg? {
                    Message::Text(t) => t.as_str().to_owned(),
                    Message::Close(_) => return Ok(()),
                    _ => continue,
                };
                dispatch_frame(&text, events, pending);
            }
        }
    }
}

fn dispatch_frame(text: &str, events: &broadcast::Sender<SignalingEvent>, pending: &PendingMap) {
    let frame: InboundFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            warn!(error = %e, "Signaling: dropping unparseable frame");
            return;
        }
    };

    if let Some(id) = frame.id {
        let Some((method, tx)) = lock_pending(pending).remove(&id) else {
            debug!(id, "Signaling: ack for unknown or expired request");
            return;
        };
        let result = if frame.ok.unwrap_or(frame.error.is_none()) {
            Ok(frame.data)
        } else {
            Err(SignalingError::Rejected {
                method,
                message: frame.error.unwrap_or_else(|| "request failed".into()),
            })
        };
        let _ = tx.send(result);
    } else if let Some(name) = frame.event {
        let _ = events.send(SignalingEvent::new(name, frame.data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn acks_resolve_requests_and_events_are_broadcast() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                let req: Value = serde_json::from_str(text.as_str()).unwrap();
                let id = req["id"].as_u64().unwrap();
                let reply = if req["method"] == "join" {
                    json!({ "id": id, "ok": true, "data": { "peers": [] } })
                } else {
                    json!({ "id": id, "ok": false, "error": "nope" })
                };
                ws.send(Message::Text(reply.to_string().into())).await.unwrap();
                let event = json!({ "event": "peerLeft", "data": { "peerId": "s9" } });
                ws.send(Message::Text(event.to_string().into())).await.unwrap();
            }
        });

        let ws = WsSignaling::connect(
            format!("ws://{addr}"),
            RetryPolicy::new(3, Duration::from_millis(50)),
        );
        let mut events = ws.subscribe();
        let first = events.recv().await.unwrap();
        assert_eq!(first.name, names::CONNECT);

        let ack = ws
            .request("join", json!({}), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(ack, json!({ "peers": [] }));

        let rejected = ws
            .request("consume", json!({}), Duration::from_secs(5))
            .await;
        assert!(matches!(rejected, Err(SignalingError::Rejected { .. })));

        let event = events.recv().await.unwrap();
        assert_eq!(event.name, names::PEER_LEFT);
        assert_eq!(event.data, json!({ "peerId": "s9" }));
    }

    #[tokio::test]
    async fn requests_fail_fast_while_offline() {
        let ws = WsSignaling::connect(
            "ws://127.0.0.1:9",
            RetryPolicy::new(1, Duration::from_millis(10)),
        );
        let result = ws
            .request("join", json!({}), Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(SignalingError::Disconnected)));
    }
}
