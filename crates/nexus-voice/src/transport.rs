//! Transport manager: opens send/receive transports and services their
//! callbacks.
//!
//! Every transport gets a pump task that answers `connect` and `produce`
//! through signaling and reacts to `failed`/`disconnected` with a bounded
//! series of ICE restarts. Exhausting them reports the connection lost.
//!
//! Receive transports are pooled one per remote peer.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{MediaError, VoiceError, VoiceResult};
use crate::events::EngineEvent;
use crate::media::{
    ConsumerOptions, Direction, LocalConsumer, LocalProducer, LocalTransport,
    MediaEngine, MediaTrack, ProduceOptions, TransportEvent,
};
use crate::retry::{RetryError, RetryPolicy};
use crate::signaling::SignalingClient;

/// A transport plus the bookkeeping that makes closing it idempotent.
pub struct ManagedTransport {
    id: String,
    direction: Direction,
    transport: Arc<dyn LocalTransport>,
    closed: AtomicBool,
    pump: CancellationToken,
}

impl std::fmt::Debug for ManagedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedTransport")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl ManagedTransport {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn produce(
        &self,
        track: Arc<dyn MediaTrack>,
        options: ProduceOptions,
    ) -> Result<Arc<dyn LocalProducer>, MediaError> {
        if self.is_closed() {
            return Err(MediaError::Closed("transport"));
        }
        self.transport.produce(track, options).await
    }

    pub async fn consume(
        &self,
        options: ConsumerOptions,
    ) -> Result<Arc<dyn LocalConsumer>, MediaError> {
        if self.is_closed() {
            return Err(MediaError::Closed("transport"));
        }
        self.transport.consume(options).await
    }

    /// One server-coordinated ICE restart.
    pub async fn restart_ice(&self, client: &SignalingClient) -> VoiceResult<()> {
        restart_ice_once(self.transport.as_ref(), client).await
    }

    /// Close once. Returns `Ok(false)` if it was already closed.
    pub fn close(&self) -> Result<bool, MediaError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        self.pump.cancel();
        self.transport.close()?;
        debug!(transport = %self.id, direction = ?self.direction, "Transport closed");
        Ok(true)
    }
}

async fn restart_ice_once(transport: &dyn LocalTransport, client: &SignalingClient) -> VoiceResult<()> {
    let ice_parameters = client.restart_ice(&transport.id()).await?;
    transport.restart_ice(ice_parameters).await?;
    Ok(())
}

/// Opens transports. Cheap to clone; holds no per-room state.
#[derive(Clone)]
pub struct TransportManager {
    client: SignalingClient,
    engine: Arc<dyn MediaEngine>,
    ice_restart: RetryPolicy,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl TransportManager {
    pub(crate) fn new(
        client: SignalingClient,
        engine: Arc<dyn MediaEngine>,
        ice_restart: RetryPolicy,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            client,
            engine,
            ice_restart,
            events,
        }
    }

    pub async fn create_send_transport(
        &self,
        cancel: &CancellationToken,
    ) -> VoiceResult<Arc<ManagedTransport>> {
        self.open(Direction::Send, cancel).await
    }

    pub async fn create_receive_transport(
        &self,
        cancel: &CancellationToken,
    ) -> VoiceResult<Arc<ManagedTransport>> {
        self.open(Direction::Receive, cancel).await
    }

    /// The pump task lives until the transport is closed or `cancel` fires.
    /// Only the server round-trip is abandoned on cancel; a transport the
    /// engine already opened is returned for the caller to close.
    async fn open(
        &self,
        direction: Direction,
        cancel: &CancellationToken,
    ) -> VoiceResult<Arc<ManagedTransport>> {
        let options = tokio::select! {
            _ = cancel.cancelled() => return Err(VoiceError::Cancelled),
            r = self.client.create_webrtc_transport(direction) => r?,
        };
        let handle = match direction {
            Direction::Send => self.engine.create_send_transport(options).await?,
            Direction::Receive => self.engine.create_recv_transport(options).await?,
        };

        let pump = cancel.child_token();
        let managed = Arc::new(ManagedTransport {
            id: handle.transport.id(),
            direction,
            transport: handle.transport.clone(),
            closed: AtomicBool::new(false),
            pump: pump.clone(),
        });

        tokio::spawn(pump_events(
            handle.transport,
            handle.events,
            self.client.clone(),
            self.ice_restart.clone(),
            self.events.clone(),
            pump,
        ));

        info!(transport = %managed.id, ?direction, "Transport created");
        Ok(managed)
    }
}

async fn pump_events(
    transport: Arc<dyn LocalTransport>,
    mut events: mpsc::Receiver<TransportEvent>,
    client: SignalingClient,
    ice_restart: RetryPolicy,
    engine_events: mpsc::UnboundedSender<EngineEvent>,
    cancel: CancellationToken,
) {
    let id = transport.id();
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(e) => e,
                None => break,
            },
        };

        let handled = async {
            match event {
                TransportEvent::Connect {
                    dtls_parameters,
                    reply,
                } => {
                    let result = client.connect_transport(&id, dtls_parameters).await;
                    if let Err(e) = &result {
                        warn!(transport = %id, error = %e, "connectTransport rejected");
                    }
                    let _ = reply.send(result.map_err(|e| e.to_string()));
                }
                TransportEvent::Produce {
                    kind,
                    rtp_parameters,
                    app_data,
                    reply,
                } => {
                    let result = client.produce(&id, kind, rtp_parameters, app_data).await;
                    if let Err(e) = &result {
                        warn!(transport = %id, ?kind, error = %e, "produce rejected");
                    }
                    let _ = reply.send(result.map_err(|e| e.to_string()));
                }
                TransportEvent::ConnectionStateChange(state) => {
                    debug!(transport = %id, ?state, "Transport state changed");
                    if state.needs_ice_restart() {
                        recover_ice(&transport, &client, &ice_restart, &engine_events, &cancel)
                            .await;
                    }
                }
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = handled => {}
        }
    }
    debug!(transport = %id, "Transport pump stopped");
}

async fn recover_ice(
    transport: &Arc<dyn LocalTransport>,
    client: &SignalingClient,
    policy: &RetryPolicy,
    engine_events: &mpsc::UnboundedSender<EngineEvent>,
    cancel: &CancellationToken,
) {
    let id = transport.id();
    let outcome = policy
        .retry(cancel, "restartIce", |attempt| {
            debug!(transport = %id, attempt, "Restarting ICE");
            let transport = transport.clone();
            let client = client.clone();
            async move { restart_ice_once(transport.as_ref(), &client).await }
        })
        .await;

    match outcome {
        Ok(()) => info!(transport = %id, "ICE restart succeeded"),
        Err(RetryError::Cancelled) => {}
        Err(RetryError::Exhausted { attempts, last }) => {
            error!(transport = %id, attempts, error = %last, "ICE restart failed, connection lost");
            let _ = engine_events.send(EngineEvent::ConnectionLost { transport_id: id });
        }
    }
}

/// The room's transports: one send transport, receive transports per peer.
#[derive(Default)]
pub struct TransportRegistry {
    send: Option<Arc<ManagedTransport>>,
    recv: HashMap<String, Arc<ManagedTransport>>,
}

impl TransportRegistry {
    pub fn send(&self) -> Option<&Arc<ManagedTransport>> {
        self.send.as_ref()
    }

    pub fn set_send(&mut self, transport: Arc<ManagedTransport>) -> Option<Arc<ManagedTransport>> {
        self.send.replace(transport)
    }

    pub fn recv_for(&self, peer_id: &str) -> Option<&Arc<ManagedTransport>> {
        self.recv.get(peer_id)
    }

    /// Register a receive transport for a peer. If one won the race meanwhile,
    /// the existing transport is returned as `Err` and the caller keeps its own
    /// to close.
    pub fn insert_recv(
        &mut self,
        peer_id: &str,
        transport: Arc<ManagedTransport>,
    ) -> Result<Arc<ManagedTransport>, Arc<ManagedTransport>> {
        if let Some(existing) = self.recv.get(peer_id) {
            return Err(existing.clone());
        }
        self.recv.insert(peer_id.to_owned(), transport.clone());
        Ok(transport)
    }

    pub fn remove_recv(&mut self, peer_id: &str) -> Option<Arc<ManagedTransport>> {
        self.recv.remove(peer_id)
    }

    pub fn find(&self, transport_id: &str) -> Option<&Arc<ManagedTransport>> {
        self.send
            .iter()
            .chain(self.recv.values())
            .find(|t| t.id() == transport_id)
    }

    pub fn recv_count(&self) -> usize {
        self.recv.len()
    }

    pub fn send_count(&self) -> usize {
        usize::from(self.send.is_some())
    }

    /// Close everything. Failures are logged per transport and don't stop the rest.
    pub fn close_all(&mut self) {
        let all = self.send.take().into_iter().chain(self.recv.drain().map(|(_, t)| t));
        for transport in all {
            close_logged(&transport);
        }
    }
}

pub(crate) fn close_logged(transport: &ManagedTransport) {
    if let Err(e) = transport.close() {
        warn!(transport = %transport.id(), error = %e, "Failed to close transport");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{CodecOptions, ConnectionState};
    use crate::signaling::names;
    use crate::testing::{FakeEngine, FakeSignaling, FakeTrack};
    use serde_json::json;
    use std::time::Duration;

    fn setup() -> (
        Arc<FakeSignaling>,
        Arc<FakeEngine>,
        TransportManager,
        mpsc::UnboundedReceiver<EngineEvent>,
    ) {
        let signaling = Arc::new(FakeSignaling::default());
        let engine = Arc::new(FakeEngine::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = TransportManager::new(
            SignalingClient::new(signaling.clone(), Duration::from_secs(1)),
            engine.clone(),
            RetryPolicy::new(2, Duration::from_millis(10)),
            tx,
        );
        (signaling, engine, manager, rx)
    }

    fn mic_options() -> ProduceOptions {
        ProduceOptions {
            codec_options: Some(CodecOptions::voice()),
            app_data: json!({ "mediaType": "mic" }),
        }
    }

    #[tokio::test]
    async fn connect_and_produce_go_through_signaling() {
        let (signaling, _engine, manager, _rx) = setup();
        let cancel = CancellationToken::new();
        let transport = manager.create_send_transport(&cancel).await.unwrap();

        let producer = transport
            .produce(FakeTrack::audio("mic-0"), mic_options())
            .await
            .unwrap();
        assert!(producer.id().starts_with("local-producer-"));
        assert_eq!(signaling.count(names::CONNECT_TRANSPORT), 1);

        let requests = signaling.requests.lock().unwrap().clone();
        let (_, produce) = requests
            .iter()
            .find(|(m, _)| m == names::PRODUCE)
            .unwrap();
        assert_eq!(produce["transportId"], transport.id());
        assert_eq!(produce["appData"]["mediaType"], "mic");
    }

    #[tokio::test]
    async fn rejected_connect_fails_the_caller() {
        let (signaling, _engine, manager, _rx) = setup();
        signaling.fail(names::CONNECT_TRANSPORT, "bad dtls");
        let transport = manager
            .create_send_transport(&CancellationToken::new())
            .await
            .unwrap();
        let err = transport
            .produce(FakeTrack::audio("mic-0"), mic_options())
            .await;
        assert!(matches!(err, Err(MediaError::Engine(_))));
        assert_eq!(signaling.count(names::PRODUCE), 0);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (_signaling, engine, manager, _rx) = setup();
        let transport = manager
            .create_receive_transport(&CancellationToken::new())
            .await
            .unwrap();
        assert!(transport.close().unwrap());
        assert!(!transport.close().unwrap());
        let fake = engine.recv_transport(0).unwrap();
        assert_eq!(fake.close_calls.load(Ordering::SeqCst), 1);
        let options = serde_json::from_value(json!({
            "id": "c",
            "producerId": "p",
            "kind": "audio",
        }))
        .unwrap();
        assert!(transport.consume(options).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_state_triggers_ice_restart() {
        let (signaling, engine, manager, mut rx) = setup();
        let _transport = manager
            .create_send_transport(&CancellationToken::new())
            .await
            .unwrap();
        let fake = engine.send_transport().unwrap();

        fake.emit_state(ConnectionState::Failed).await;
        signaling.wait_for(names::RESTART_ICE, 1).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(fake.ice_restarts.load(Ordering::SeqCst), 1);
        assert_eq!(fake.connection_state(), ConnectionState::Connected);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_ice_restart_reports_connection_lost() {
        let (signaling, engine, manager, mut rx) = setup();
        signaling.fail(names::RESTART_ICE, "no such transport");
        let transport = manager
            .create_receive_transport(&CancellationToken::new())
            .await
            .unwrap();

        engine
            .recv_transport(0)
            .unwrap()
            .emit_state(ConnectionState::Disconnected)
            .await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(signaling.count(names::RESTART_ICE), 2);
        assert_eq!(
            rx.try_recv().unwrap(),
            EngineEvent::ConnectionLost {
                transport_id: transport.id().to_owned()
            }
        );
    }

    #[tokio::test]
    async fn registry_pools_receive_transports_per_peer() {
        let (_signaling, _engine, manager, _rx) = setup();
        let cancel = CancellationToken::new();
        let a = manager.create_receive_transport(&cancel).await.unwrap();
        let b = manager.create_receive_transport(&cancel).await.unwrap();

        let mut registry = TransportRegistry::default();
        assert!(registry.insert_recv("peer-1", a.clone()).is_ok());
        let winner = registry.insert_recv("peer-1", b.clone()).unwrap_err();
        assert_eq!(winner.id(), a.id());
        assert_eq!(registry.recv_count(), 1);

        assert!(registry.find(a.id()).is_some());
        let removed = registry.remove_recv("peer-1").unwrap();
        assert_eq!(removed.id(), a.id());
        assert!(registry.find(a.id()).is_none());
    }
}
