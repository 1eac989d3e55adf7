//! Session lifecycle controller.
//!
//! [`VoiceSession`] owns one room at a time. Joining runs negotiation, the send
//! transport and the microphone producer in order; remote producers are
//! consumed as they are announced. Every resource of a room lives in its
//! room state, so leaving is a single take-and-teardown that works the
//! same whether the join finished or not.
//!
//! A background loop applies signaling events and the events raised by the
//! session's own tasks (VAD, watchers, transport pumps, stats monitors).

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use nexus_common::config::VoiceClientConfig;
use nexus_common::models::{
    MediaType, NoiseSuppressionMode, PeerDescriptor, ProducerClosedInfo, ProducerInfo,
};
use serde::Serialize;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::audio::graph::NodeSettings;
use crate::audio::{AudioContext, AudioNodeView, VadSettings, effective_gain};
use crate::consumer::{ConsumerManager, ConsumerRegistry, ConsumerRoute, RemoteConsumer, VideoEntry};
use crate::error::{SignalingError, VoiceError, VoiceResult};
use crate::events::{EngineEvent, SessionEvent};
use crate::hotkeys::{HotkeyAction, HotkeyBindings};
use crate::media::{AudioOutput, MediaDevices, MediaEngine};
use crate::negotiator::{NegotiatedCapabilities, negotiate};
use crate::peers::{Peer, PeerRoster};
use crate::prefs::PreferenceStore;
use crate::presence::RoomPresence;
use crate::producer::{ActiveProducer, LocalProducers, ProducerManager};
use crate::retry::RetryPolicy;
use crate::signaling::{JoinRequest, ServerEvent, SignalingChannel, SignalingClient, SignalingEvent};
use crate::transport::{ManagedTransport, TransportManager, TransportRegistry, close_logged};

/// External collaborators a session drives.
pub struct SessionDeps {
    pub signaling: Arc<dyn SignalingChannel>,
    pub engine: Arc<dyn MediaEngine>,
    pub devices: Arc<dyn MediaDevices>,
    pub output: Arc<dyn AudioOutput>,
    pub preferences: Arc<dyn PreferenceStore>,
}

/// Who we are, as far as presence is concerned.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalUser {
    pub user_id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RoomPhase {
    Joining,
    Joined,
}

/// Immutable view of the session for presentation layers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub room_id: Option<Uuid>,
    pub phase: Option<RoomPhase>,
    pub muted: bool,
    pub audio_enabled: bool,
    pub speaking: bool,
    pub noise_suppression: NoiseSuppressionMode,
    pub peers: Vec<Peer>,
    /// Peers whose screen share is being shown.
    pub screens: Vec<String>,
    /// Peers whose webcam is being shown.
    pub webcams: Vec<String>,
    pub audio_nodes: Vec<AudioNodeView>,
}

impl SessionSnapshot {
    pub fn is_joined(&self) -> bool {
        self.phase == Some(RoomPhase::Joined)
    }

    pub fn peer(&self, peer_id: &str) -> Option<&Peer> {
        self.peers.iter().find(|p| p.id == peer_id)
    }
}

/// Live resource counts. All zero when no room is open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDiagnostics {
    pub send_transports: usize,
    pub recv_transports: usize,
    pub producers: usize,
    pub consumers: usize,
    pub pending_consumers: usize,
    pub audio_nodes: usize,
    pub video_entries: usize,
    /// Live periodic tasks: consumer stats monitors, per-node analysers and
    /// the local VAD.
    pub timers: usize,
}

/// Every resource belonging to one room.
struct RoomSession {
    generation: u64,
    room_id: Uuid,
    display_name: String,
    phase: RoomPhase,
    cancel: CancellationToken,
    self_peer_id: Option<String>,
    capabilities: Option<NegotiatedCapabilities>,
    transports: TransportRegistry,
    producers: LocalProducers,
    consumers: ConsumerRegistry,
    peers: PeerRoster,
    audio: AudioContext,
    /// Producers announced before the join finished.
    pending_producers: Vec<ProducerInfo>,
}

impl RoomSession {
    fn is_own_producer(&self, info: &ProducerInfo) -> bool {
        self.self_peer_id.as_deref() == Some(info.producer_socket_id.as_str())
            || self.producers.owns(&info.producer_id)
    }

    fn apply_gains(&self, audio_enabled: bool, max_boost: f32) {
        for view in self.audio.views() {
            let volume = self.peers.get(&view.peer_id).map(|p| p.volume).unwrap_or(0);
            self.audio
                .set_gain(&view.peer_id, effective_gain(audio_enabled, volume, max_boost));
        }
    }
}

struct SessionState {
    room: Option<RoomSession>,
    muted: bool,
    audio_enabled: bool,
    speaking: bool,
    noise_mode: NoiseSuppressionMode,
}

/// The room if it is still the one started as `generation`.
fn live(room: &mut Option<RoomSession>, generation: u64) -> Option<&mut RoomSession> {
    room.as_mut().filter(|r| r.generation == generation)
}

struct SessionInner {
    config: VoiceClientConfig,
    user: LocalUser,
    client: SignalingClient,
    engine: Arc<dyn MediaEngine>,
    output: Arc<dyn AudioOutput>,
    preferences: Arc<dyn PreferenceStore>,
    transports: TransportManager,
    producers: ProducerManager,
    consumers: ConsumerManager,
    hotkeys: HotkeyBindings,
    presence: RoomPresence,
    state: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    engine_tx: mpsc::UnboundedSender<EngineEvent>,
    /// Read by the local VAD task without taking the state lock.
    mic_muted: Arc<AtomicBool>,
    generations: AtomicU64,
    shutdown: CancellationToken,
    timers: TaskTracker,
}

/// A client voice session. Dropping it leaves the current room.
pub struct VoiceSession {
    inner: Arc<SessionInner>,
}

impl VoiceSession {
    /// Create a session and start its event loop. Must be called inside a
    /// Tokio runtime.
    pub fn new(config: VoiceClientConfig, deps: SessionDeps, user: LocalUser) -> Self {
        let client = SignalingClient::new(deps.signaling, config.signaling.request_timeout());
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        let timers = TaskTracker::new();

        let transports = TransportManager::new(
            client.clone(),
            deps.engine.clone(),
            RetryPolicy::from_config(&config.transport.ice_restart),
            engine_tx.clone(),
        );
        let producers = ProducerManager::new(
            deps.devices,
            engine_tx.clone(),
            config.audio.clone(),
            RetryPolicy::from_config(&config.consumer.track_acquire),
            timers.clone(),
        );
        let consumers = ConsumerManager::new(
            client.clone(),
            config.consumer.clone(),
            engine_tx.clone(),
            timers.clone(),
        );

        let state = SessionState {
            room: None,
            muted: false,
            audio_enabled: true,
            speaking: false,
            noise_mode: config.audio.noise_suppression,
        };

        let inner = Arc::new(SessionInner {
            hotkeys: HotkeyBindings::from_config(&config.hotkeys),
            config,
            user,
            engine: deps.engine,
            output: deps.output,
            preferences: deps.preferences,
            transports,
            producers,
            consumers,
            presence: RoomPresence::new(),
            state: Mutex::new(state),
            events,
            engine_tx,
            mic_muted: Arc::new(AtomicBool::new(false)),
            generations: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            timers,
            client,
        });

        let signaling = inner.client.subscribe();
        tokio::spawn(run_loop(inner.clone(), signaling, engine_rx));
        Self { inner }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Voice-channel presence, kept in sync whether or not a room is open.
    pub fn presence(&self) -> RoomPresence {
        self.inner.presence.clone()
    }

    pub fn local_user(&self) -> &LocalUser {
        &self.inner.user
    }

    /// Join `room_id`. Leaves any other room first; joining the room that is
    /// already joined is a no-op, and joining the one being joined fails with
    /// [`VoiceError::JoinInProgress`]. Any failure tears the attempt down.
    pub async fn join(
        &self,
        room_id: Uuid,
        display_name: &str,
        initial_muted: bool,
        initial_audio_enabled: bool,
    ) -> VoiceResult<()> {
        let inner = &self.inner;

        let previous = {
            let mut st = inner.state.lock().await;
            match &st.room {
                Some(r) if r.room_id == room_id && r.phase == RoomPhase::Joining => {
                    return Err(VoiceError::JoinInProgress);
                }
                Some(r) if r.room_id == room_id => return Ok(()),
                _ => {}
            }
            st.room.take()
        };
        if let Some(previous) = previous {
            info!(from = %previous.room_id, to = %room_id, "Switching rooms");
            inner.teardown(previous).await;
        }

        let (generation, cancel) = {
            let mut st = inner.state.lock().await;
            if st.room.is_some() {
                return Err(VoiceError::JoinInProgress);
            }
            st.muted = initial_muted;
            st.audio_enabled = initial_audio_enabled;
            st.speaking = false;
            inner.mic_muted.store(initial_muted, Ordering::Release);

            let generation = inner.generations.fetch_add(1, Ordering::Relaxed) + 1;
            let cancel = inner.shutdown.child_token();
            let audio = AudioContext::new(
                inner.output.clone(),
                NodeSettings {
                    vad: VadSettings::from(&inner.config.audio),
                    acquire: RetryPolicy::from_config(&inner.config.consumer.track_acquire),
                },
                inner.engine_tx.clone(),
                cancel.child_token(),
                inner.timers.clone(),
            );
            st.room = Some(RoomSession {
                generation,
                room_id,
                display_name: display_name.to_owned(),
                phase: RoomPhase::Joining,
                cancel: cancel.clone(),
                self_peer_id: None,
                capabilities: None,
                transports: TransportRegistry::default(),
                producers: LocalProducers::default(),
                consumers: ConsumerRegistry::default(),
                peers: PeerRoster::new(),
                audio,
                pending_producers: Vec::new(),
            });
            (generation, cancel)
        };

        info!(room = %room_id, muted = initial_muted, audio = initial_audio_enabled, "Joining room");
        match inner.run_join(generation, room_id, display_name, &cancel).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let room = {
                    let mut st = inner.state.lock().await;
                    if live(&mut st.room, generation).is_some() {
                        st.room.take()
                    } else {
                        None
                    }
                };
                if let Some(room) = room {
                    inner.teardown(room).await;
                }
                if matches!(e, VoiceError::Cancelled) {
                    info!(room = %room_id, "Join abandoned");
                } else {
                    error!(room = %room_id, error = %e, "Join failed");
                    inner.report(&e);
                }
                Err(e)
            }
        }
    }

    /// Leave the current room, whatever state it is in. Idempotent.
    pub async fn leave(&self) -> VoiceResult<()> {
        let room = {
            let mut st = self.inner.state.lock().await;
            st.speaking = false;
            st.room.take()
        };
        if let Some(room) = room {
            self.inner.teardown(room).await;
        }
        Ok(())
    }

    pub async fn is_joined(&self) -> bool {
        let st = self.inner.state.lock().await;
        st.room.as_ref().is_some_and(|r| r.phase == RoomPhase::Joined)
    }

    /// Mute or unmute the microphone. Muting clears local speaking at once.
    pub async fn set_muted(&self, muted: bool) -> VoiceResult<()> {
        let inner = &self.inner;
        let (announce, stopped_speaking) = {
            let mut st = inner.state.lock().await;
            st.muted = muted;
            inner.mic_muted.store(muted, Ordering::Release);
            let stopped_speaking = muted && std::mem::take(&mut st.speaking);
            let room = st.room.as_ref();
            if let Some(mic) = room.and_then(|r| r.producers.get(MediaType::Mic)) {
                mic.set_enabled(!muted);
            }
            let announce = room
                .filter(|r| r.phase == RoomPhase::Joined)
                .map(|r| r.room_id);
            (announce, stopped_speaking)
        };

        inner.emit(SessionEvent::LocalMuted { muted });
        if stopped_speaking {
            inner.emit(SessionEvent::LocalSpeaking { speaking: false });
        }
        info!(muted, "Microphone mute changed");

        if let Some(room_id) = announce {
            if let Err(e) = inner.client.mute_state(muted).await {
                warn!(error = %e, "muteState not delivered");
            }
            let speaking = if muted { Some(false) } else { None };
            if let Err(e) = inner
                .client
                .announce_presence_state(room_id, inner.user.user_id, Some(muted), speaking)
                .await
            {
                debug!(error = %e, "Presence state not delivered");
            }
        }
        Ok(())
    }

    /// Returns the new mute state.
    pub async fn toggle_mute(&self) -> VoiceResult<bool> {
        let muted = !self.inner.state.lock().await.muted;
        self.set_muted(muted).await?;
        Ok(muted)
    }

    /// Enable or disable hearing everyone. Gains are recomputed for every peer.
    pub async fn set_audio_enabled(&self, enabled: bool) -> VoiceResult<()> {
        let inner = &self.inner;
        let announce = {
            let mut st = inner.state.lock().await;
            st.audio_enabled = enabled;
            let room = st.room.as_ref();
            if let Some(room) = room {
                room.apply_gains(enabled, inner.config.audio.max_boost);
            }
            room.filter(|r| r.phase == RoomPhase::Joined).is_some()
        };

        inner.emit(SessionEvent::LocalAudioEnabled { enabled });
        info!(enabled, "Audio output changed");
        if announce {
            if let Err(e) = inner.client.audio_state(enabled).await {
                warn!(error = %e, "audioState not delivered");
            }
        }
        Ok(())
    }

    /// Returns the new audio-enabled state.
    pub async fn toggle_audio(&self) -> VoiceResult<bool> {
        let enabled = !self.inner.state.lock().await.audio_enabled;
        self.set_audio_enabled(enabled).await?;
        Ok(enabled)
    }

    /// Local-only volume for one peer, persisted per user. 0 mutes them.
    pub async fn set_peer_volume(&self, peer_id: &str, volume: u8) -> VoiceResult<()> {
        self.update_peer(peer_id, |peers| peers.set_volume(peer_id, volume).cloned())
            .await
            .map(|_| ())
    }

    /// Flip individual mute for one peer. Returns whether they are now muted.
    pub async fn toggle_peer_mute(&self, peer_id: &str) -> VoiceResult<bool> {
        let peer = self
            .update_peer(peer_id, |peers| peers.toggle_individual_mute(peer_id).cloned())
            .await?;
        Ok(peer.individually_muted())
    }

    async fn update_peer(
        &self,
        peer_id: &str,
        change: impl FnOnce(&mut PeerRoster) -> Option<Peer>,
    ) -> VoiceResult<Peer> {
        let inner = &self.inner;
        let peer = {
            let mut st = inner.state.lock().await;
            let audio_enabled = st.audio_enabled;
            let room = st.room.as_mut().ok_or(VoiceError::NotJoined)?;
            let peer = change(&mut room.peers).ok_or_else(|| VoiceError::UnknownPeer(peer_id.to_owned()))?;
            room.audio.set_gain(
                peer_id,
                effective_gain(audio_enabled, peer.volume, inner.config.audio.max_boost),
            );
            peer
        };

        debug!(peer = %peer_id, volume = peer.volume, "Peer volume changed");
        inner.emit(SessionEvent::PeerUpdated {
            peer_id: peer_id.to_owned(),
        });
        if let Err(e) = inner.preferences.set_volume(&peer.preference_key(), peer.volume) {
            warn!(peer = %peer_id, error = %e, "Failed to persist volume");
        }
        Ok(peer)
    }

    /// Switch noise suppression. A live microphone keeps its producer.
    ///
    /// The mic is taken out of the room while its track is swapped so the
    /// state lock is never held across the swap. A mode change that lands
    /// meanwhile is applied on the next pass.
    pub async fn set_noise_suppression(&self, mode: NoiseSuppressionMode) -> VoiceResult<()> {
        let inner = &self.inner;
        inner.state.lock().await.noise_mode = mode;
        info!(?mode, "Noise suppression mode set");

        loop {
            let (generation, wanted, mut mic) = {
                let mut st = inner.state.lock().await;
                let wanted = st.noise_mode;
                let Some(room) = st.room.as_mut() else {
                    return Ok(());
                };
                let current = room.producers.get(MediaType::Mic).map(ActiveProducer::noise_suppression);
                if current.is_none_or(|current| current == wanted) {
                    return Ok(());
                }
                let Some(mic) = room.producers.take(MediaType::Mic) else {
                    return Ok(());
                };
                (room.generation, wanted, mic)
            };

            let swapped = mic
                .set_noise_suppression(
                    wanted,
                    inner.config.audio.gate_threshold,
                    RetryPolicy::from_config(&inner.config.consumer.track_acquire),
                )
                .await;

            let orphan = {
                let mut st = inner.state.lock().await;
                let muted = st.muted;
                match live(&mut st.room, generation) {
                    Some(room) if room.producers.get(MediaType::Mic).is_none() => {
                        mic.set_enabled(!muted);
                        room.producers.insert(mic);
                        None
                    }
                    _ => Some(mic),
                }
            };
            if let Some(orphan) = orphan {
                inner.end_producer(orphan).await;
                return Ok(());
            }
            let replaced = swapped?;
            debug!(mode = ?wanted, replaced, "Noise suppression applied to live microphone");
        }
    }

    pub async fn start_screen_share(&self) -> VoiceResult<()> {
        self.start_video(MediaType::Screen).await
    }

    /// Returns whether a screen share was running.
    pub async fn stop_screen_share(&self) -> VoiceResult<bool> {
        self.stop_video(MediaType::Screen).await
    }

    pub async fn start_webcam(&self) -> VoiceResult<()> {
        self.start_video(MediaType::Webcam).await
    }

    pub async fn stop_webcam(&self) -> VoiceResult<bool> {
        self.stop_video(MediaType::Webcam).await
    }

    /// Start a video producer, replacing any running one of the same type.
    /// Failures are reported but leave the voice session untouched.
    async fn start_video(&self, media_type: MediaType) -> VoiceResult<()> {
        let inner = &self.inner;
        let (generation, transport, cancel, previous) = {
            let mut st = inner.state.lock().await;
            let room = st
                .room
                .as_mut()
                .filter(|r| r.phase == RoomPhase::Joined)
                .ok_or(VoiceError::NotJoined)?;
            let transport = room.transports.send().cloned().ok_or(VoiceError::NotJoined)?;
            if !room.capabilities.as_ref().is_some_and(|c| c.can_produce_video) {
                let e = VoiceError::Negotiation("device cannot produce video".into());
                warn!(media = %media_type, "Video not negotiated; not starting");
                inner.report(&e);
                return Err(e);
            }
            (
                room.generation,
                transport,
                room.cancel.clone(),
                room.producers.take(media_type),
            )
        };
        if let Some(previous) = previous {
            inner.end_producer(previous).await;
        }

        let active = match inner.producers.start_video(&transport, media_type, &cancel).await {
            Ok(active) => active,
            Err(e) => {
                if !matches!(e, VoiceError::Cancelled) {
                    warn!(media = %media_type, error = %e, "Could not start video");
                    inner.report(&e);
                }
                return Err(e);
            }
        };

        let displaced = {
            let mut st = inner.state.lock().await;
            match live(&mut st.room, generation) {
                Some(room) => Ok(room.producers.insert(active)),
                None => Err(active),
            }
        };
        match displaced {
            Ok(Some(other)) => inner.end_producer(other).await,
            Ok(None) => {}
            Err(mut orphan) => {
                orphan.shutdown();
                return Err(VoiceError::Cancelled);
            }
        }
        Ok(())
    }

    async fn stop_video(&self, media_type: MediaType) -> VoiceResult<bool> {
        let producer = {
            let mut st = self.inner.state.lock().await;
            st.room
                .as_mut()
                .ok_or(VoiceError::NotJoined)?
                .producers
                .take(media_type)
        };
        match producer {
            Some(producer) => {
                self.inner.end_producer(producer).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Apply a pressed key combination. Returns the action it triggered.
    pub async fn handle_hotkey(&self, pressed: &str) -> VoiceResult<Option<HotkeyAction>> {
        let Some(action) = self.inner.hotkeys.action_for(pressed) else {
            return Ok(None);
        };
        match action {
            HotkeyAction::ToggleMic => {
                self.toggle_mute().await?;
            }
            HotkeyAction::ToggleAudio => {
                self.toggle_audio().await?;
            }
        }
        Ok(Some(action))
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let st = self.inner.state.lock().await;
        let room = st.room.as_ref();
        let mut screens = Vec::new();
        let mut webcams = Vec::new();
        if let Some(room) = room {
            for peer in room.peers.ids() {
                if room.consumers.video(&peer, MediaType::Screen).is_some() {
                    screens.push(peer.clone());
                }
                if room.consumers.video(&peer, MediaType::Webcam).is_some() {
                    webcams.push(peer);
                }
            }
        }
        screens.sort();
        webcams.sort();

        SessionSnapshot {
            room_id: room.map(|r| r.room_id),
            phase: room.map(|r| r.phase),
            muted: st.muted,
            audio_enabled: st.audio_enabled,
            speaking: st.speaking,
            noise_suppression: st.noise_mode,
            peers: room.map(|r| r.peers.snapshot()).unwrap_or_default(),
            screens,
            webcams,
            audio_nodes: room.map(|r| r.audio.views()).unwrap_or_default(),
        }
    }

    pub async fn diagnostics(&self) -> SessionDiagnostics {
        let st = self.inner.state.lock().await;
        let Some(room) = st.room.as_ref() else {
            return SessionDiagnostics::default();
        };
        SessionDiagnostics {
            send_transports: room.transports.send_count(),
            recv_transports: room.transports.recv_count(),
            producers: room.producers.len(),
            consumers: room.consumers.len(),
            pending_consumers: room.pending_producers.len(),
            audio_nodes: room.audio.len(),
            video_entries: room.consumers.video_count(),
            timers: self.inner.timers.len(),
        }
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> VoiceResult<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(VoiceError::Cancelled),
        out = fut => Ok(out),
    }
}

impl SessionInner {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn report(&self, err: &VoiceError) {
        self.emit(SessionEvent::Error {
            category: err.category(),
            message: err.to_string(),
        });
    }

    /// Run `f` on the room if it is still the one started as `generation`.
    async fn with_room<T>(
        &self,
        generation: u64,
        f: impl FnOnce(&mut RoomSession) -> T,
    ) -> VoiceResult<T> {
        let mut st = self.state.lock().await;
        live(&mut st.room, generation)
            .map(f)
            .ok_or(VoiceError::Cancelled)
    }

    async fn run_join(
        self: &Arc<Self>,
        generation: u64,
        room_id: Uuid,
        display_name: &str,
        cancel: &CancellationToken,
    ) -> VoiceResult<()> {
        let (muted, audio_enabled) = {
            let st = self.state.lock().await;
            (st.muted, st.audio_enabled)
        };

        let request = JoinRequest {
            room_id,
            name: display_name.to_owned(),
            initial_muted: muted,
            initial_audio_enabled: audio_enabled,
        };
        let response = cancellable(cancel, self.client.join(&request))
            .await?
            .map_err(|e| match e {
                SignalingError::Rejected { message, .. } => {
                    VoiceError::Negotiation(format!("join rejected: {message}"))
                }
                other => other.into(),
            })?;

        let capabilities = cancellable(
            cancel,
            negotiate(self.engine.as_ref(), response.rtp_capabilities.as_ref()),
        )
        .await??;
        let can_produce_audio = capabilities.can_produce_audio;

        let joined_peers = self
            .with_room(generation, |room| {
                room.self_peer_id = response.peer_id.clone();
                room.capabilities = Some(capabilities);
                room.pending_producers.extend(response.producers.iter().cloned());
                response
                    .peers
                    .iter()
                    .filter(|p| Some(&p.id) != response.peer_id.as_ref())
                    .map(|desc| {
                        let stored = self.preferences.volume(&desc.preference_key());
                        room.peers.upsert(desc, stored).id.clone()
                    })
                    .collect::<Vec<_>>()
            })
            .await?;
        for peer_id in joined_peers {
            self.emit(SessionEvent::PeerJoined { peer_id });
        }

        let send = self.transports.create_send_transport(cancel).await?;
        let registered = self
            .with_room(generation, |room| {
                room.transports.set_send(send.clone());
            })
            .await;
        if let Err(e) = registered {
            close_logged(&send);
            return Err(e);
        }

        if can_produce_audio {
            let noise_mode = self.state.lock().await.noise_mode;
            let mic = self
                .producers
                .create_local_audio(&send, self.mic_muted.clone(), noise_mode, cancel)
                .await?;
            let mut slot = Some(mic);
            let displaced = self
                .with_room(generation, |room| slot.take().and_then(|mic| room.producers.insert(mic)))
                .await;
            if let Some(mut orphan) = slot {
                orphan.shutdown();
            }
            if let Some(mut other) = displaced? {
                other.shutdown();
            }
        }

        // Mute and audio can change while the join runs. Announce what the
        // state holds now and only flip to Joined once the last announcement
        // still matches; from then on the setters announce themselves.
        let mut announced: Option<(bool, bool)> = None;
        let pending = loop {
            let current = {
                let mut st = self.state.lock().await;
                let current = (st.muted, st.audio_enabled);
                let room = live(&mut st.room, generation).ok_or(VoiceError::Cancelled)?;
                if announced == Some(current) {
                    room.phase = RoomPhase::Joined;
                    break std::mem::take(&mut room.pending_producers);
                }
                current
            };
            let (muted, audio_enabled) = current;
            self.client.mute_state(muted).await?;
            self.client.audio_state(audio_enabled).await?;
            let presence = match announced {
                None => {
                    self.client
                        .announce_presence_join(room_id, self.user.user_id, display_name, muted)
                        .await
                }
                Some(_) => {
                    self.client
                        .announce_presence_state(room_id, self.user.user_id, Some(muted), None)
                        .await
                }
            };
            if let Err(e) = presence {
                warn!(room = %room_id, error = %e, "Presence not delivered");
            }
            announced = Some(current);
        };

        info!(room = %room_id, pending = pending.len(), "Joined room");
        self.emit(SessionEvent::Joined { room_id });
        for info in pending {
            self.spawn_consume(generation, info, cancel.clone());
        }
        Ok(())
    }

    /// Close everything a room owns, then tell the server we left.
    /// Each failure is logged and never stops the rest.
    async fn teardown(&self, mut room: RoomSession) {
        let room_id = room.room_id;
        debug!(room = %room_id, phase = ?room.phase, "Tearing down room");
        room.cancel.cancel();

        let (consumers, videos) = room.consumers.take_all();
        for consumer in &consumers {
            consumer.close();
        }
        for video in &videos {
            video.track.stop();
        }

        let mut closed = Vec::new();
        for mut producer in room.producers.take_all() {
            producer.shutdown();
            closed.push((producer.id(), producer.media_type()));
        }

        room.audio.close();
        room.transports.close_all();
        room.peers.clear();
        room.pending_producers.clear();

        for (producer_id, media_type) in &closed {
            ActiveProducer::announce_closed(&self.client, producer_id, *media_type).await;
        }
        if let Err(e) = self.client.leave(room_id).await {
            warn!(room = %room_id, error = %e, "leave not delivered");
        }
        if let Err(e) = self
            .client
            .announce_presence_leave(room_id, self.user.user_id)
            .await
        {
            debug!(room = %room_id, error = %e, "Presence leave not delivered");
        }

        info!(
            room = %room_id,
            name = %room.display_name,
            consumers = consumers.len(),
            producers = closed.len(),
            "Left room"
        );
        self.emit(SessionEvent::Left { room_id });
    }

    async fn end_producer(&self, mut producer: ActiveProducer) {
        producer.shutdown();
        ActiveProducer::announce_closed(&self.client, &producer.id(), producer.media_type()).await;
    }

    fn spawn_consume(self: &Arc<Self>, generation: u64, info: ProducerInfo, cancel: CancellationToken) {
        let inner = self.clone();
        tokio::spawn(async move { inner.consume_producer(generation, info, cancel).await });
    }

    async fn consume_producer(&self, generation: u64, info: ProducerInfo, cancel: CancellationToken) {
        let peer_id = info.producer_socket_id.clone();
        let claimed = self
            .with_room(generation, |room| {
                if room.is_own_producer(&info) {
                    trace!(producer = %info.producer_id, "Skipping own producer");
                    return None;
                }
                let capabilities = room.capabilities.as_ref()?.local.clone();
                if !room.consumers.begin(&info.producer_id) {
                    debug!(producer = %info.producer_id, "Producer already consumed");
                    return None;
                }
                Some((capabilities, room.transports.recv_for(&peer_id).cloned()))
            })
            .await;
        let Ok(Some((capabilities, pooled))) = claimed else {
            return;
        };

        let transport = match pooled {
            Some(t) => Ok(t),
            None => self.receive_transport_for(generation, &peer_id, &cancel).await,
        };
        let result = match transport {
            Ok(transport) => {
                self.consumers
                    .consume(transport, &capabilities, &info, &cancel)
                    .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(remote) => self.register_consumer(generation, remote).await,
            Err(e) => {
                let _ = self
                    .with_room(generation, |room| room.consumers.abandon(&info.producer_id))
                    .await;
                if !matches!(e, VoiceError::Cancelled) {
                    warn!(producer = %info.producer_id, peer = %peer_id, error = %e, "Consume failed");
                    self.report(&e);
                }
            }
        }
    }

    /// The pooled receive transport for a peer, creating it on first use.
    async fn receive_transport_for(
        &self,
        generation: u64,
        peer_id: &str,
        cancel: &CancellationToken,
    ) -> VoiceResult<Arc<ManagedTransport>> {
        let created = self.transports.create_receive_transport(cancel).await?;
        let pooled = self
            .with_room(generation, |room| room.transports.insert_recv(peer_id, created.clone()))
            .await;
        match pooled {
            Ok(Ok(transport)) => Ok(transport),
            Ok(Err(existing)) => {
                debug!(peer = %peer_id, "Receive transport raced; reusing the pooled one");
                close_logged(&created);
                Ok(existing)
            }
            Err(e) => {
                close_logged(&created);
                Err(e)
            }
        }
    }

    async fn register_consumer(&self, generation: u64, remote: RemoteConsumer) {
        let mut st = self.state.lock().await;
        let audio_enabled = st.audio_enabled;
        let Some(room) = live(&mut st.room, generation) else {
            remote.close();
            return;
        };
        let (peer_id, producer_id) = (remote.peer_id().to_owned(), remote.producer_id().to_owned());
        if !room.consumers.is_in_flight(&producer_id) {
            debug!(producer = %producer_id, "Producer closed while consuming");
            remote.close();
            return;
        }

        let mut video_event = None;
        match remote.route() {
            ConsumerRoute::Audio => {
                let Some(peer) = room.peers.get(&peer_id) else {
                    debug!(peer = %peer_id, "Audio consumer for a peer that left; closing");
                    room.consumers.abandon(&producer_id);
                    remote.close();
                    return;
                };
                let gain = effective_gain(audio_enabled, peer.volume, self.config.audio.max_boost);
                room.audio.attach(&peer_id, &remote.id(), remote.track(), gain);
            }
            route @ (ConsumerRoute::Screen | ConsumerRoute::Webcam) => {
                let media_type = route.media_type().unwrap_or(MediaType::Webcam);
                let entry = VideoEntry {
                    producer_id: producer_id.clone(),
                    consumer_id: remote.id(),
                    track: remote.track(),
                };
                if let Some(old) = room.consumers.set_video(&peer_id, media_type, entry) {
                    old.track.stop();
                }
                video_event = Some(media_type);
            }
        }
        room.consumers.insert(remote);
        drop(st);

        if let Some(media_type) = video_event {
            self.emit(SessionEvent::RemoteVideo {
                peer_id,
                media_type,
                active: true,
            });
        }
    }

    /// Drop a consumer and everything it feeds.
    fn drop_consumer(&self, room: &mut RoomSession, producer_id: &str) {
        let Some((consumer, video)) = room.consumers.remove_by_producer(producer_id) else {
            return;
        };
        consumer.close();
        room.audio.detach_consumer(consumer.peer_id(), &consumer.id());
        if let Some(video) = video {
            video.track.stop();
            if let Some(media_type) = consumer.route().media_type() {
                self.emit(SessionEvent::RemoteVideo {
                    peer_id: consumer.peer_id().to_owned(),
                    media_type,
                    active: false,
                });
            }
        }
        debug!(producer = %producer_id, consumer = %consumer.id(), "Consumer removed");
    }

    async fn handle_signaling(self: &Arc<Self>, event: SignalingEvent) {
        let event = match ServerEvent::parse(&event) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "Dropping malformed signaling event");
                return;
            }
        };
        if event.is_presence() {
            self.presence.apply(&event).await;
            return;
        }

        match event {
            ServerEvent::Connected => self.reannounce().await,
            ServerEvent::Reconnected => {
                self.reannounce().await;
                self.emit(SessionEvent::SignalingReconnected);
            }
            ServerEvent::Disconnected => warn!("Signaling disconnected"),
            ServerEvent::PeerJoined(desc) => self.on_peer_joined(desc).await,
            ServerEvent::PeerLeft { peer_id } => self.on_peer_left(&peer_id).await,
            ServerEvent::NewProducer(info) => self.on_new_producer(info).await,
            ServerEvent::ProducerClosed(info) => self.on_producer_closed(info).await,
            ServerEvent::PeerMuteStateChanged(flag) => {
                let changed = self
                    .peer_flag(&flag.peer_id, |peers| {
                        let was_speaking = peers.get(&flag.peer_id).is_some_and(|p| p.is_speaking);
                        peers.set_muted(&flag.peer_id, flag.value).map(|p| was_speaking && !p.is_speaking)
                    })
                    .await;
                if let Some(stopped_speaking) = changed {
                    self.emit(SessionEvent::PeerUpdated {
                        peer_id: flag.peer_id.clone(),
                    });
                    if stopped_speaking {
                        self.emit(SessionEvent::PeerSpeaking {
                            peer_id: flag.peer_id,
                            speaking: false,
                        });
                    }
                }
            }
            ServerEvent::PeerAudioStateChanged(flag) => {
                let changed = self
                    .peer_flag(&flag.peer_id, |peers| {
                        peers.set_audio_enabled(&flag.peer_id, flag.value).map(|_| ())
                    })
                    .await;
                if changed.is_some() {
                    self.emit(SessionEvent::PeerUpdated {
                        peer_id: flag.peer_id,
                    });
                }
            }
            ServerEvent::SpeakingStateChanged(flag) => {
                let changed = self
                    .peer_flag(&flag.peer_id, |peers| {
                        let before = peers.get(&flag.peer_id)?.is_speaking;
                        let after = peers.set_speaking(&flag.peer_id, flag.value)?.is_speaking;
                        (before != after).then_some(after)
                    })
                    .await;
                if let Some(speaking) = changed {
                    self.emit(SessionEvent::PeerSpeaking {
                        peer_id: flag.peer_id,
                        speaking,
                    });
                }
            }
            ServerEvent::Other(name) => trace!(event = %name, "Ignoring signaling event"),
            _ => {}
        }
    }

    async fn peer_flag<T>(&self, peer_id: &str, f: impl FnOnce(&mut PeerRoster) -> Option<T>) -> Option<T> {
        let mut st = self.state.lock().await;
        let room = st.room.as_mut()?;
        if room.self_peer_id.as_deref() == Some(peer_id) {
            return None;
        }
        f(&mut room.peers)
    }

    async fn reannounce(&self) {
        let state = {
            let st = self.state.lock().await;
            st.room
                .as_ref()
                .filter(|r| r.phase == RoomPhase::Joined)
                .map(|_| (st.muted, st.audio_enabled))
        };
        let Some((muted, audio_enabled)) = state else {
            return;
        };
        info!(muted, audio_enabled, "Re-announcing local state");
        if let Err(e) = self.client.mute_state(muted).await {
            warn!(error = %e, "muteState not delivered");
        }
        if let Err(e) = self.client.audio_state(audio_enabled).await {
            warn!(error = %e, "audioState not delivered");
        }
    }

    async fn on_peer_joined(&self, desc: PeerDescriptor) {
        let stored = self.preferences.volume(&desc.preference_key());
        let added = {
            let mut st = self.state.lock().await;
            let Some(room) = st.room.as_mut() else {
                return;
            };
            if room.self_peer_id.as_deref() == Some(desc.id.as_str()) {
                return;
            }
            let fresh = !room.peers.contains(&desc.id);
            room.peers.upsert(&desc, stored);
            fresh
        };
        if added {
            info!(peer = %desc.id, name = %desc.name, "Peer joined");
            self.emit(SessionEvent::PeerJoined { peer_id: desc.id });
        } else {
            self.emit(SessionEvent::PeerUpdated { peer_id: desc.id });
        }
    }

    /// Purge the peer with every consumer, node, video entry and transport.
    async fn on_peer_left(&self, peer_id: &str) {
        let (removed, videos) = {
            let mut st = self.state.lock().await;
            let Some(room) = st.room.as_mut() else {
                return;
            };
            let removed = room.peers.remove(peer_id).is_some();
            let (consumers, videos) = room.consumers.remove_for_peer(peer_id);
            for consumer in &consumers {
                consumer.close();
            }
            for video in &videos {
                video.track.stop();
            }
            room.audio.detach(peer_id);
            if let Some(transport) = room.transports.remove_recv(peer_id) {
                close_logged(&transport);
            }
            room.pending_producers.retain(|p| p.producer_socket_id != peer_id);
            let videos: Vec<MediaType> = consumers
                .iter()
                .filter_map(|c| c.route().media_type())
                .collect();
            (removed, videos)
        };
        for media_type in &videos {
            self.emit(SessionEvent::RemoteVideo {
                peer_id: peer_id.to_owned(),
                media_type: *media_type,
                active: false,
            });
        }
        if removed {
            info!(peer = %peer_id, videos = videos.len(), "Peer left");
            self.emit(SessionEvent::PeerLeft {
                peer_id: peer_id.to_owned(),
            });
        }
    }

    async fn on_new_producer(self: &Arc<Self>, info: ProducerInfo) {
        let target = {
            let mut st = self.state.lock().await;
            let Some(room) = st.room.as_mut() else {
                return;
            };
            if room.is_own_producer(&info) {
                trace!(producer = %info.producer_id, "Own producer announced");
                return;
            }
            match room.phase {
                RoomPhase::Joining => {
                    if !room.pending_producers.iter().any(|p| p.producer_id == info.producer_id) {
                        room.pending_producers.push(info);
                    }
                    return;
                }
                RoomPhase::Joined => (room.generation, room.cancel.clone()),
            }
        };
        debug!(producer = %info.producer_id, peer = %info.producer_socket_id, kind = ?info.kind, "New remote producer");
        self.spawn_consume(target.0, info, target.1);
    }

    async fn on_producer_closed(&self, info: ProducerClosedInfo) {
        let mut st = self.state.lock().await;
        let Some(room) = st.room.as_mut() else {
            return;
        };
        room.pending_producers.retain(|p| p.producer_id != info.producer_id);
        self.drop_consumer(room, &info.producer_id);
    }

    async fn handle_engine(&self, event: EngineEvent) {
        match event {
            EngineEvent::VoiceActivity { peer_id, active } => {
                let mut st = self.state.lock().await;
                if let Some(room) = st.room.as_mut() {
                    room.peers.set_voice_activity(&peer_id, active);
                }
            }
            EngineEvent::LocalVoiceActivity { speaking } => self.on_local_voice(speaking).await,
            EngineEvent::LocalTrackEnded {
                media_type,
                producer_id,
            } => {
                let producer = {
                    let mut st = self.state.lock().await;
                    st.room
                        .as_mut()
                        .and_then(|r| r.producers.take_if(media_type, &producer_id))
                };
                if let Some(producer) = producer {
                    warn!(media = %media_type, producer = %producer_id, "Local track ended; closing producer");
                    self.end_producer(producer).await;
                    self.emit(SessionEvent::LocalMediaEnded { media_type });
                }
            }
            EngineEvent::ConsumerTrackEnded { producer_id } => {
                let mut st = self.state.lock().await;
                if let Some(room) = st.room.as_mut() {
                    self.drop_consumer(room, &producer_id);
                }
            }
            EngineEvent::ConnectionLost { transport_id } => self.on_connection_lost(transport_id).await,
            EngineEvent::ConsumerRecovered { consumer_id } => {
                self.emit(SessionEvent::ConsumerRecovered { consumer_id });
            }
            EngineEvent::ConsumerStalled { consumer_id } => {
                self.emit(SessionEvent::ConsumerStalled { consumer_id });
            }
            EngineEvent::ConsumerUnrecovered { consumer_id } => {
                self.report(&VoiceError::ConsumerStalled { consumer_id });
            }
        }
    }

    /// Local VAD transitions. Ignored while muted; a muted mic is never speaking.
    async fn on_local_voice(&self, speaking: bool) {
        let room_id = {
            let mut st = self.state.lock().await;
            if st.muted || st.speaking == speaking {
                return;
            }
            let Some(room) = st.room.as_ref().filter(|r| r.phase == RoomPhase::Joined) else {
                return;
            };
            let room_id = room.room_id;
            st.speaking = speaking;
            room_id
        };
        trace!(speaking, "Local speaking changed");
        self.emit(SessionEvent::LocalSpeaking { speaking });
        if let Err(e) = self.client.speaking(speaking).await {
            debug!(error = %e, "speaking not delivered");
        }
        if let Err(e) = self
            .client
            .announce_presence_state(room_id, self.user.user_id, None, Some(speaking))
            .await
        {
            debug!(error = %e, "Presence state not delivered");
        }
    }

    /// ICE restarts ran out. Recovery needs a fresh join, so the whole room
    /// is torn down.
    async fn on_connection_lost(&self, transport_id: String) {
        let room = {
            let mut st = self.state.lock().await;
            let owned = st
                .room
                .as_ref()
                .is_some_and(|room| room.transports.find(&transport_id).is_some());
            if !owned {
                debug!(transport = %transport_id, "Connection lost on a transport we no longer own");
                return;
            }
            st.speaking = false;
            st.room.take()
        };
        let Some(room) = room else {
            return;
        };
        error!(room = %room.room_id, transport = %transport_id, "Connection lost; rejoin required");
        self.teardown(room).await;
        self.emit(SessionEvent::ConnectionLost { transport_id });
        self.report(&VoiceError::ConnectionLost);
    }

    async fn shutdown_room(&self) {
        let room = self.state.lock().await.room.take();
        if let Some(room) = room {
            self.teardown(room).await;
        }
    }
}

async fn run_loop(
    inner: Arc<SessionInner>,
    mut signaling: broadcast::Receiver<SignalingEvent>,
    mut engine: mpsc::UnboundedReceiver<EngineEvent>,
) {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            event = signaling.recv() => match event {
                Ok(event) => inner.handle_signaling(event).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Session lagging behind signaling");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    warn!("Signaling channel closed");
                    inner.shutdown_room().await;
                    break;
                }
            },
            Some(event) = engine.recv() => inner.handle_engine(event).await,
        }
    }
    inner.shutdown_room().await;
    debug!("Session loop stopped");
}
