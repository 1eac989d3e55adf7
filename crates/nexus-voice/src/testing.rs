//! Test doubles: a scripted signaling server and an in-memory media stack.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nexus_common::models::{MediaKind, MediaType};
use serde_json::{Value, json};
use tokio::sync::{Notify, broadcast, mpsc, oneshot, watch};

use crate::error::{MediaError, SignalingError};
use crate::media::*;
use crate::signaling::{SignalingChannel, SignalingEvent, names};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap()
}

// ---------------------------------------------------------------------------
// Tracks
// ---------------------------------------------------------------------------

pub struct FakeTrack {
    id: String,
    kind: MediaKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
    ready: AtomicBool,
    ended: watch::Sender<bool>,
    audio: broadcast::Sender<AudioFrame>,
}

impl FakeTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Arc<Self> {
        let (ended, _) = watch::channel(false);
        let (audio, _) = broadcast::channel(64);
        Arc::new(Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            ready: AtomicBool::new(true),
            ended,
            audio,
        })
    }

    pub fn audio(id: impl Into<String>) -> Arc<Self> {
        Self::new(id, MediaKind::Audio)
    }

    pub fn video(id: impl Into<String>) -> Arc<Self> {
        Self::new(id, MediaKind::Video)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Push one PCM frame; returns the number of live subscribers.
    pub fn push(&self, samples: &[f32]) -> usize {
        self.audio.send(Arc::from(samples)).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.audio.receiver_count()
    }

    /// Simulate the platform ending the track (e.g. capture revoked).
    pub fn end(&self) {
        self.ended.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl MediaTrack for FakeTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.ended.send_replace(true);
    }

    fn ended(&self) -> watch::Receiver<bool> {
        self.ended.subscribe()
    }

    fn subscribe_audio(&self) -> Option<broadcast::Receiver<AudioFrame>> {
        (self.kind == MediaKind::Audio && self.ready.load(Ordering::SeqCst))
            .then(|| self.audio.subscribe())
    }
}

// ---------------------------------------------------------------------------
// Producers / consumers
// ---------------------------------------------------------------------------

pub struct FakeProducer {
    id: String,
    kind: MediaKind,
    track: Mutex<Arc<dyn MediaTrack>>,
    closed: AtomicBool,
    pub replaced: AtomicU32,
    replace_hold: Mutex<Option<Arc<Notify>>>,
}

impl FakeProducer {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// `replace_track` blocks until the returned handle is notified.
    pub fn hold_replace(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        *lock(&self.replace_hold) = Some(notify.clone());
        notify
    }
}

#[async_trait]
impl LocalProducer for FakeProducer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn track(&self) -> Arc<dyn MediaTrack> {
        lock(&self.track).clone()
    }

    async fn replace_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), MediaError> {
        let hold = lock(&self.replace_hold).take();
        if let Some(hold) = hold {
            hold.notified().await;
        }
        *lock(&self.track) = track;
        self.replaced.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> Result<(), MediaError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    app_data: Value,
    pub track: Arc<FakeTrack>,
    closed: AtomicBool,
    pub resumes: AtomicU32,
    pub pauses: AtomicU32,
    pub bytes: AtomicU64,
    /// While set, inbound byte counters stop moving.
    pub stalled: AtomicBool,
    pub fail_resume: AtomicBool,
}

impl FakeConsumer {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocalConsumer for FakeConsumer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn producer_id(&self) -> String {
        self.producer_id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn track(&self) -> Arc<dyn MediaTrack> {
        self.track.clone()
    }

    fn app_data(&self) -> Value {
        self.app_data.clone()
    }

    async fn resume(&self) -> Result<(), MediaError> {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        if self.fail_resume.load(Ordering::SeqCst) {
            return Err(MediaError::Engine("resume failed".into()));
        }
        Ok(())
    }

    async fn pause(&self) -> Result<(), MediaError> {
        self.pauses.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stats(&self) -> Result<ConsumerStats, MediaError> {
        if !self.stalled.load(Ordering::SeqCst) {
            self.bytes.fetch_add(1_000, Ordering::SeqCst);
        }
        Ok(ConsumerStats {
            bytes_received: self.bytes.load(Ordering::SeqCst),
            packets_received: 0,
        })
    }

    fn close(&self) -> Result<(), MediaError> {
        self.closed.store(true, Ordering::SeqCst);
        self.track.stop();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Transports / engine
// ---------------------------------------------------------------------------

pub struct FakeTransport {
    id: String,
    direction: Direction,
    events: mpsc::Sender<TransportEvent>,
    state: Mutex<ConnectionState>,
    connected: AtomicBool,
    pub close_calls: AtomicU32,
    pub fail_close: AtomicBool,
    pub ice_restarts: AtomicU32,
    pub producers: Mutex<Vec<Arc<FakeProducer>>>,
    pub consumers: Mutex<Vec<Arc<FakeConsumer>>>,
}

impl FakeTransport {
    pub fn is_closed(&self) -> bool {
        self.close_calls.load(Ordering::SeqCst) > 0 && !self.fail_close.load(Ordering::SeqCst)
    }

    /// Raise a connection-state change as the platform would.
    pub async fn emit_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
        let _ = self
            .events
            .send(TransportEvent::ConnectionStateChange(state))
            .await;
    }

    async fn ensure_connected(&self) -> Result<(), MediaError> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        let (reply, rx) = oneshot::channel();
        self.events
            .send(TransportEvent::Connect {
                dtls_parameters: json!({ "role": "client" }),
                reply,
            })
            .await
            .map_err(|_| MediaError::Closed("transport"))?;
        rx.await
            .map_err(|_| MediaError::Closed("transport"))?
            .map_err(MediaError::Engine)?;
        self.connected.store(true, Ordering::SeqCst);
        *lock(&self.state) = ConnectionState::Connected;
        Ok(())
    }
}

#[async_trait]
impl LocalTransport for FakeTransport {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn connection_state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    async fn produce(
        &self,
        track: Arc<dyn MediaTrack>,
        options: ProduceOptions,
    ) -> Result<Arc<dyn LocalProducer>, MediaError> {
        self.ensure_connected().await?;
        let (reply, rx) = oneshot::channel();
        self.events
            .send(TransportEvent::Produce {
                kind: track.kind(),
                rtp_parameters: json!({ "codecs": [] }),
                app_data: options.app_data,
                reply,
            })
            .await
            .map_err(|_| MediaError::Closed("transport"))?;
        let id = rx
            .await
            .map_err(|_| MediaError::Closed("transport"))?
            .map_err(MediaError::Engine)?;
        let producer = Arc::new(FakeProducer {
            id,
            kind: track.kind(),
            track: Mutex::new(track),
            closed: AtomicBool::new(false),
            replaced: AtomicU32::new(0),
            replace_hold: Mutex::new(None),
        });
        lock(&self.producers).push(producer.clone());
        Ok(producer)
    }

    async fn consume(
        &self,
        options: ConsumerOptions,
    ) -> Result<Arc<dyn LocalConsumer>, MediaError> {
        self.ensure_connected().await?;
        let consumer = Arc::new(FakeConsumer {
            track: FakeTrack::new(format!("track-{}", options.id), options.kind),
            id: options.id,
            producer_id: options.producer_id,
            kind: options.kind,
            app_data: options.app_data,
            closed: AtomicBool::new(false),
            resumes: AtomicU32::new(0),
            pauses: AtomicU32::new(0),
            bytes: AtomicU64::new(0),
            stalled: AtomicBool::new(false),
            fail_resume: AtomicBool::new(false),
        });
        lock(&self.consumers).push(consumer.clone());
        Ok(consumer)
    }

    async fn restart_ice(&self, _ice_parameters: IceParameters) -> Result<(), MediaError> {
        self.ice_restarts.fetch_add(1, Ordering::SeqCst);
        *lock(&self.state) = ConnectionState::Connected;
        Ok(())
    }

    fn close(&self) -> Result<(), MediaError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(MediaError::Engine("close failed".into()));
        }
        *lock(&self.state) = ConnectionState::Closed;
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeEngine {
    loaded: Mutex<Option<Value>>,
    fail_load: AtomicBool,
    pub no_video: AtomicBool,
    pub fail_next_close: AtomicBool,
    pub send_transports: Mutex<Vec<Arc<FakeTransport>>>,
    pub recv_transports: Mutex<Vec<Arc<FakeTransport>>>,
}

impl FakeEngine {
    pub fn fail_load(&self) {
        self.fail_load.store(true, Ordering::SeqCst);
    }

    pub fn send_transport(&self) -> Option<Arc<FakeTransport>> {
        lock(&self.send_transports).last().cloned()
    }

    pub fn recv_transport(&self, index: usize) -> Option<Arc<FakeTransport>> {
        lock(&self.recv_transports).get(index).cloned()
    }

    pub fn all_transports(&self) -> Vec<Arc<FakeTransport>> {
        let mut all = lock(&self.send_transports).clone();
        all.extend(lock(&self.recv_transports).iter().cloned());
        all
    }

    pub fn consumers(&self) -> Vec<Arc<FakeConsumer>> {
        lock(&self.recv_transports)
            .iter()
            .flat_map(|t| lock(&t.consumers).clone())
            .collect()
    }

    pub fn producers(&self) -> Vec<Arc<FakeProducer>> {
        lock(&self.send_transports)
            .iter()
            .flat_map(|t| lock(&t.producers).clone())
            .collect()
    }

    fn open(&self, options: TransportOptions, direction: Direction) -> TransportHandle {
        let (events, rx) = mpsc::channel(16);
        let transport = Arc::new(FakeTransport {
            id: options.id,
            direction,
            events,
            state: Mutex::new(ConnectionState::New),
            connected: AtomicBool::new(false),
            close_calls: AtomicU32::new(0),
            fail_close: AtomicBool::new(self.fail_next_close.swap(false, Ordering::SeqCst)),
            ice_restarts: AtomicU32::new(0),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
        });
        match direction {
            Direction::Send => lock(&self.send_transports).push(transport.clone()),
            Direction::Receive => lock(&self.recv_transports).push(transport.clone()),
        }
        TransportHandle {
            transport,
            events: rx,
        }
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    async fn load(&self, router_capabilities: &RtpCapabilities) -> Result<(), MediaError> {
        if self.fail_load.load(Ordering::SeqCst) {
            return Err(MediaError::Engine("unsupported codecs".into()));
        }
        *lock(&self.loaded) = Some(router_capabilities.clone());
        Ok(())
    }

    fn rtp_capabilities(&self) -> Option<RtpCapabilities> {
        lock(&self.loaded).clone()
    }

    fn can_produce(&self, kind: MediaKind) -> bool {
        let video_blocked = kind == MediaKind::Video && self.no_video.load(Ordering::SeqCst);
        lock(&self.loaded).is_some() && !video_blocked
    }

    async fn create_send_transport(
        &self,
        options: TransportOptions,
    ) -> Result<TransportHandle, MediaError> {
        Ok(self.open(options, Direction::Send))
    }

    async fn create_recv_transport(
        &self,
        options: TransportOptions,
    ) -> Result<TransportHandle, MediaError> {
        Ok(self.open(options, Direction::Receive))
    }
}

// ---------------------------------------------------------------------------
// Devices / output
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeDevices {
    pub deny_mic: AtomicBool,
    pub deny_screen: AtomicBool,
    pub deny_webcam: AtomicBool,
    pub mic_requests: AtomicU32,
    pub mics: Mutex<Vec<Arc<FakeTrack>>>,
    pub screens: Mutex<Vec<Arc<FakeTrack>>>,
    pub webcams: Mutex<Vec<Arc<FakeTrack>>>,
}

impl FakeDevices {
    pub fn last_mic(&self) -> Option<Arc<FakeTrack>> {
        lock(&self.mics).last().cloned()
    }

    pub fn last_screen(&self) -> Option<Arc<FakeTrack>> {
        lock(&self.screens).last().cloned()
    }

    pub fn last_webcam(&self) -> Option<Arc<FakeTrack>> {
        lock(&self.webcams).last().cloned()
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn microphone(
        &self,
        _constraints: &AudioConstraints,
    ) -> Result<Arc<dyn MediaTrack>, MediaError> {
        let n = self.mic_requests.fetch_add(1, Ordering::SeqCst);
        if self.deny_mic.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied(MediaType::Mic));
        }
        let track = FakeTrack::audio(format!("mic-{n}"));
        lock(&self.mics).push(track.clone());
        Ok(track)
    }

    async fn screen(&self) -> Result<Arc<dyn MediaTrack>, MediaError> {
        if self.deny_screen.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied(MediaType::Screen));
        }
        let track = FakeTrack::video(format!("screen-{}", lock(&self.screens).len()));
        lock(&self.screens).push(track.clone());
        Ok(track)
    }

    async fn webcam(&self) -> Result<Arc<dyn MediaTrack>, MediaError> {
        if self.deny_webcam.load(Ordering::SeqCst) {
            return Err(MediaError::DeviceUnavailable(MediaType::Webcam));
        }
        let track = FakeTrack::video(format!("webcam-{}", lock(&self.webcams).len()));
        lock(&self.webcams).push(track.clone());
        Ok(track)
    }
}

/// Records the frames handed to the speaker, per peer.
#[derive(Default)]
pub struct RecordingOutput {
    pub frames: Mutex<HashMap<String, Vec<Vec<f32>>>>,
}

impl RecordingOutput {
    pub fn frames_for(&self, peer_id: &str) -> Vec<Vec<f32>> {
        lock(&self.frames).get(peer_id).cloned().unwrap_or_default()
    }
}

impl AudioOutput for RecordingOutput {
    fn play(&self, peer_id: &str, frame: &[f32]) {
        lock(&self.frames)
            .entry(peer_id.to_owned())
            .or_default()
            .push(frame.to_vec());
    }
}

// ---------------------------------------------------------------------------
// Signaling
// ---------------------------------------------------------------------------

type Handler = Box<dyn Fn(&Value) -> Result<Value, SignalingError> + Send + Sync>;

/// Scripted stand-in for the SFU's signaling endpoint.
pub struct FakeSignaling {
    events: broadcast::Sender<SignalingEvent>,
    connected: AtomicBool,
    counter: AtomicU64,
    pub requests: Mutex<Vec<(String, Value)>>,
    pub notifications: Mutex<Vec<(String, Value)>>,
    handlers: Mutex<HashMap<String, Handler>>,
    holds: Mutex<HashMap<String, Arc<Notify>>>,
    producer_types: Mutex<HashMap<String, (MediaKind, Option<MediaType>)>>,
}

impl Default for FakeSignaling {
    fn default() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            events,
            connected: AtomicBool::new(true),
            counter: AtomicU64::new(0),
            requests: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
            handlers: Mutex::new(HashMap::new()),
            holds: Mutex::new(HashMap::new()),
            producer_types: Mutex::new(HashMap::new()),
        }
    }
}

impl FakeSignaling {
    pub fn on(
        &self,
        method: &str,
        handler: impl Fn(&Value) -> Result<Value, SignalingError> + Send + Sync + 'static,
    ) {
        lock(&self.handlers).insert(method.to_owned(), Box::new(handler));
    }

    pub fn fail(&self, method: &str, message: &str) {
        let (m, msg) = (method.to_owned(), message.to_owned());
        self.on(method, move |_| {
            Err(SignalingError::Rejected {
                method: m.clone(),
                message: msg.clone(),
            })
        });
    }

    /// Requests for `method` block until the returned handle is notified.
    pub fn hold(&self, method: &str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        lock(&self.holds).insert(method.to_owned(), notify.clone());
        notify
    }

    /// Register a producer so `consume` acks carry the right kind and tag.
    pub fn register_producer(&self, producer_id: &str, kind: MediaKind, media_type: Option<MediaType>) {
        lock(&self.producer_types).insert(producer_id.to_owned(), (kind, media_type));
    }

    pub fn emit(&self, name: &str, data: Value) {
        let _ = self.events.send(SignalingEvent::new(name, data));
    }

    /// Announce a remote producer (registers it for `consume` too).
    pub fn announce_producer(
        &self,
        producer_id: &str,
        peer_id: &str,
        kind: MediaKind,
        media_type: Option<MediaType>,
    ) {
        self.register_producer(producer_id, kind, media_type);
        self.emit(
            names::NEW_PRODUCER,
            json!({
                "producerId": producer_id,
                "producerSocketId": peer_id,
                "kind": kind,
                "mediaType": media_type,
            }),
        );
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn count(&self, method: &str) -> usize {
        lock(&self.requests)
            .iter()
            .filter(|(m, _)| m == method)
            .count()
    }

    pub fn notified(&self, event: &str) -> Vec<Value> {
        lock(&self.notifications)
            .iter()
            .filter(|(e, _)| e == event)
            .map(|(_, d)| d.clone())
            .collect()
    }

    /// Wait (in virtual time) until `method` has been requested `n` times.
    pub async fn wait_for(&self, method: &str, n: usize) {
        for _ in 0..2_000 {
            if self.count(method) >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("`{method}` was never requested {n} time(s)");
    }

    fn default_reply(&self, method: &str, data: &Value) -> Value {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        match method {
            names::JOIN => json!({
                "rtpCapabilities": { "codecs": ["opus", "vp8"] },
                "peerId": "self",
                "peers": [],
                "producers": [],
            }),
            names::CREATE_WEBRTC_TRANSPORT => json!({
                "id": format!("transport-{n}"),
                "iceParameters": {},
                "iceCandidates": [],
                "dtlsParameters": {},
            }),
            names::PRODUCE => json!({ "id": format!("local-producer-{n}") }),
            names::CONSUME => {
                let producer_id = data["remoteProducerId"].as_str().unwrap_or_default();
                let (kind, media_type) = lock(&self.producer_types)
                    .get(producer_id)
                    .cloned()
                    .unwrap_or((MediaKind::Audio, None));
                json!({
                    "id": format!("consumer-{n}"),
                    "producerId": producer_id,
                    "kind": kind,
                    "rtpParameters": {},
                    "appData": { "mediaType": media_type },
                })
            }
            names::RESTART_ICE => json!({ "iceParameters": { "usernameFragment": "x" } }),
            _ => json!({}),
        }
    }
}

#[async_trait]
impl SignalingChannel for FakeSignaling {
    async fn request(
        &self,
        method: &str,
        data: Value,
        timeout: Duration,
    ) -> Result<Value, SignalingError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SignalingError::Disconnected);
        }
        lock(&self.requests).push((method.to_owned(), data.clone()));

        let hold = lock(&self.holds).get(method).cloned();
        if let Some(hold) = hold {
            if tokio::time::timeout(timeout, hold.notified()).await.is_err() {
                return Err(SignalingError::Timeout {
                    method: method.to_owned(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }

        let handlers = lock(&self.handlers);
        match handlers.get(method) {
            Some(handler) => handler(&data),
            None => {
                drop(handlers);
                Ok(self.default_reply(method, &data))
            }
        }
    }

    async fn notify(&self, event: &str, data: Value) -> Result<(), SignalingError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SignalingError::Disconnected);
        }
        lock(&self.notifications).push((event.to_owned(), data));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.events.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
