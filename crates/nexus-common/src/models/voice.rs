//! SFU session models: peers, producers and the media tags carried in `appData`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of a media stream as negotiated with the SFU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// What a producer carries. Receivers route consumers by this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Mic,
    Screen,
    Webcam,
}

impl MediaType {
    pub fn kind(self) -> MediaKind {
        match self {
            Self::Mic => MediaKind::Audio,
            Self::Screen | Self::Webcam => MediaKind::Video,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mic => "mic",
            Self::Screen => "screen",
            Self::Webcam => "webcam",
        }
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `appData` attached to every producer we publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerAppData {
    pub media_type: MediaType,
}

/// A remote participant as announced by the SFU (`peerJoined`, join ack roster).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDescriptor {
    /// Signaling socket id of the peer; unique within a room.
    pub id: String,
    #[serde(default)]
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_muted: bool,
    #[serde(default = "default_true")]
    pub is_audio_enabled: bool,
}

impl PeerDescriptor {
    /// Key used for locally persisted per-user preferences.
    pub fn preference_key(&self) -> String {
        self.user_id
            .map(|u| u.to_string())
            .unwrap_or_else(|| self.id.clone())
    }
}

/// A remote producer announcement (`newProducer`, join ack producer list).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub producer_id: String,
    /// Socket id of the peer that owns the producer.
    pub producer_socket_id: String,
    pub kind: MediaKind,
    #[serde(default)]
    pub media_type: Option<MediaType>,
}

/// Payload of a server-side `producerClosed` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerClosedInfo {
    pub producer_id: String,
    #[serde(default)]
    pub producer_socket_id: Option<String>,
    #[serde(default)]
    pub media_type: Option<MediaType>,
}

/// Noise suppression chain applied to the local microphone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoiseSuppressionMode {
    Off,
    /// RNNoise recurrent-network denoiser.
    #[default]
    Rnnoise,
    /// Noise-floor tracking power subtraction.
    Spectral,
    /// Threshold gate with attack/release.
    Gate,
    /// RNNoise followed by the gate.
    Combined,
}

impl NoiseSuppressionMode {
    pub fn is_enabled(self) -> bool {
        !matches!(self, Self::Off)
    }
}

fn default_true() -> bool {
    true
}
