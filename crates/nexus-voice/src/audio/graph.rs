//! Per-peer playback graph: `source → analyser → gain → output`, plus a
//! fallback sink whose volume mirrors the gain.
//!
//! One [`AudioContext`] exists per joined room. It owns every peer node, and
//! nodes are always disconnected before the context closes.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use super::vad::{VadSettings, VoiceActivityDetector};
use super::{acquire_frames, calculate_rms};
use crate::events::EngineEvent;
use crate::media::{AudioOutput, MediaTrack};
use crate::retry::RetryPolicy;

/// Gain for a peer given the local switches.
///
/// Zero whenever audio is globally disabled or the peer is individually muted
/// (volume 0); otherwise `volume / 100 * max_boost`.
pub fn effective_gain(global_audio_enabled: bool, volume: u8, max_boost: f32) -> f32 {
    if !global_audio_enabled || volume == 0 {
        return 0.0;
    }
    f32::from(volume.min(100)) / 100.0 * max_boost
}

/// Lock-free `f32` cell.
#[derive(Debug, Default)]
struct AtomicF32(AtomicU32);

impl AtomicF32 {
    fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Acquire))
    }

    fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Release);
    }
}

/// Last signal level seen on a peer's stream.
#[derive(Debug, Default)]
pub struct Analyser {
    level: AtomicF32,
}

impl Analyser {
    pub fn level(&self) -> f32 {
        self.level.load()
    }

    fn feed(&self, frame: &[f32]) -> f32 {
        let level = calculate_rms(frame);
        self.level.store(level);
        level
    }
}

/// Plain media element style sink. Its volume cannot exceed 1.0.
#[derive(Debug)]
pub struct FallbackSink {
    volume: AtomicF32,
}

impl FallbackSink {
    fn new(gain: f32) -> Self {
        Self {
            volume: AtomicF32::new(gain.clamp(0.0, 1.0)),
        }
    }

    pub fn volume(&self) -> f32 {
        self.volume.load()
    }

    fn mirror(&self, gain: f32) {
        self.volume.store(gain.clamp(0.0, 1.0));
    }
}

/// One remote audio source wired into the context.
pub struct PeerAudioNode {
    peer_id: String,
    consumer_id: String,
    gain: Arc<AtomicF32>,
    analyser: Arc<Analyser>,
    fallback: FallbackSink,
    connected: Arc<AtomicBool>,
    task: CancellationToken,
}

impl PeerAudioNode {
    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    pub fn gain(&self) -> f32 {
        self.gain.load()
    }

    pub fn set_gain(&self, gain: f32) {
        self.gain.store(gain);
        self.fallback.mirror(gain);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn disconnect(&self) {
        self.task.cancel();
        self.connected.store(false, Ordering::Release);
        debug!(peer = %self.peer_id, consumer = %self.consumer_id, "Audio node disconnected");
    }

    fn view(&self) -> AudioNodeView {
        AudioNodeView {
            peer_id: self.peer_id.clone(),
            consumer_id: self.consumer_id.clone(),
            gain: self.gain(),
            fallback_volume: self.fallback.volume(),
            level: self.analyser.level(),
        }
    }
}

/// Read-only view of a node for snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioNodeView {
    pub peer_id: String,
    pub consumer_id: String,
    pub gain: f32,
    pub fallback_volume: f32,
    pub level: f32,
}

/// Everything a node's processing task needs besides the track.
#[derive(Clone)]
pub struct NodeSettings {
    pub vad: VadSettings,
    pub acquire: RetryPolicy,
}

/// The session's audio processing context.
pub struct AudioContext {
    output: Arc<dyn AudioOutput>,
    events: mpsc::UnboundedSender<EngineEvent>,
    settings: NodeSettings,
    nodes: HashMap<String, PeerAudioNode>,
    cancel: CancellationToken,
    timers: TaskTracker,
    closed: bool,
}

impl AudioContext {
    /// `cancel` scopes every node task; closing the context cancels it.
    /// Node samplers run on `timers`.
    pub(crate) fn new(
        output: Arc<dyn AudioOutput>,
        settings: NodeSettings,
        events: mpsc::UnboundedSender<EngineEvent>,
        cancel: CancellationToken,
        timers: TaskTracker,
    ) -> Self {
        Self {
            output,
            events,
            settings,
            nodes: HashMap::new(),
            cancel,
            timers,
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, peer_id: &str) -> Option<&PeerAudioNode> {
        self.nodes.get(peer_id)
    }

    /// Wire a peer's track in. An existing node for the peer is replaced.
    pub fn attach(&mut self, peer_id: &str, consumer_id: &str, track: Arc<dyn MediaTrack>, gain: f32) {
        if self.closed {
            warn!(peer = %peer_id, "Audio context closed; not attaching");
            return;
        }
        self.detach(peer_id);

        let node = PeerAudioNode {
            peer_id: peer_id.to_owned(),
            consumer_id: consumer_id.to_owned(),
            gain: Arc::new(AtomicF32::new(gain)),
            analyser: Arc::new(Analyser::default()),
            fallback: FallbackSink::new(gain),
            connected: Arc::new(AtomicBool::new(true)),
            task: self.cancel.child_token(),
        };

        self.timers.spawn(run_node(
            peer_id.to_owned(),
            track,
            node.gain.clone(),
            node.analyser.clone(),
            node.connected.clone(),
            self.output.clone(),
            self.settings.clone(),
            self.events.clone(),
            node.task.clone(),
        ));

        debug!(peer = %peer_id, consumer = %consumer_id, gain, "Audio node attached");
        self.nodes.insert(peer_id.to_owned(), node);
    }

    /// Disconnect and drop a peer's node. Returns whether one existed.
    pub fn detach(&mut self, peer_id: &str) -> bool {
        match self.nodes.remove(peer_id) {
            Some(node) => {
                node.disconnect();
                true
            }
            None => false,
        }
    }

    /// Detach only if the node still belongs to `consumer_id`.
    pub fn detach_consumer(&mut self, peer_id: &str, consumer_id: &str) -> bool {
        if self.nodes.get(peer_id).is_some_and(|n| n.consumer_id == consumer_id) {
            return self.detach(peer_id);
        }
        false
    }

    pub fn set_gain(&self, peer_id: &str, gain: f32) -> bool {
        match self.nodes.get(peer_id) {
            Some(node) => {
                node.set_gain(gain);
                true
            }
            None => false,
        }
    }

    pub fn views(&self) -> Vec<AudioNodeView> {
        let mut views: Vec<_> = self.nodes.values().map(PeerAudioNode::view).collect();
        views.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        views
    }

    /// Disconnect every node, then shut the context. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        for (_, node) in self.nodes.drain() {
            node.disconnect();
        }
        self.cancel.cancel();
        self.closed = true;
        debug!("Audio context closed");
    }
}

impl Drop for AudioContext {
    fn drop(&mut self) {
        self.close();
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_node(
    peer_id: String,
    track: Arc<dyn MediaTrack>,
    gain: Arc<AtomicF32>,
    analyser: Arc<Analyser>,
    connected: Arc<AtomicBool>,
    output: Arc<dyn AudioOutput>,
    settings: NodeSettings,
    events: mpsc::UnboundedSender<EngineEvent>,
    cancel: CancellationToken,
) {
    let mut frames = match acquire_frames(&track, &settings.acquire, &cancel).await {
        Ok(rx) => rx,
        Err(e) => {
            warn!(peer = %peer_id, error = ?e, "Audio node: no frames from remote track");
            return;
        }
    };

    let mut vad = VoiceActivityDetector::new(settings.vad);
    let mut buf = Vec::new();

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.recv() => frame,
        };
        let frame = match frame {
            Ok(f) => f,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!(peer = %peer_id, skipped = n, "Audio node lagging");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if !connected.load(Ordering::Acquire) {
            break;
        }

        let level = analyser.feed(&frame);
        if let Some(active) = vad.process(level) {
            let _ = events.send(EngineEvent::VoiceActivity {
                peer_id: peer_id.clone(),
                active,
            });
        }

        let g = gain.load();
        buf.clear();
        buf.extend(frame.iter().map(|s| (s * g).clamp(-1.0, 1.0)));
        output.play(&peer_id, &buf);
    }

    if vad.reset() {
        let _ = events.send(EngineEvent::VoiceActivity {
            peer_id: peer_id.clone(),
            active: false,
        });
    }
    debug!(peer = %peer_id, "Audio node task stopped");
}
