//! Events flowing out of the session, and the internal ones its background
//! tasks feed back into the session loop.

use nexus_common::models::MediaType;
use serde::Serialize;
use uuid::Uuid;

use crate::error::ErrorCategory;

/// Broadcast to whoever drives the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    Joined { room_id: Uuid },
    Left { room_id: Uuid },
    PeerJoined { peer_id: String },
    PeerLeft { peer_id: String },
    /// Mute, audio-enabled or volume changed.
    PeerUpdated { peer_id: String },
    PeerSpeaking { peer_id: String, speaking: bool },
    LocalSpeaking { speaking: bool },
    LocalMuted { muted: bool },
    LocalAudioEnabled { enabled: bool },
    RemoteVideo { peer_id: String, media_type: MediaType, active: bool },
    /// A local producer's track ended on its own (e.g. capture revoked).
    LocalMediaEnded { media_type: MediaType },
    ConnectionLost { transport_id: String },
    ConsumerRecovered { consumer_id: String },
    ConsumerStalled { consumer_id: String },
    SignalingReconnected,
    Error { category: ErrorCategory, message: String },
}

/// Fed back to the session loop by transport pumps, watchers and audio tasks.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum EngineEvent {
    /// Remote analyser output; informational.
    VoiceActivity { peer_id: String, active: bool },
    /// Local microphone VAD transition.
    LocalVoiceActivity { speaking: bool },
    LocalTrackEnded { media_type: MediaType, producer_id: String },
    ConsumerTrackEnded { producer_id: String },
    ConnectionLost { transport_id: String },
    ConsumerRecovered { consumer_id: String },
    ConsumerStalled { consumer_id: String },
    /// Pause/resume and the ICE restart both failed.
    ConsumerUnrecovered { consumer_id: String },
}
