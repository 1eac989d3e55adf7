//! Voice signaling: the bidirectional event channel to the media server.
//!
//! Two message styles travel over it:
//! - request/acknowledgement calls (`join`, `createWebRtcTransport`, `consume`, ...)
//! - fire-and-forget events in both directions (`muteState`, `peerJoined`, ...)
//!
//! [`SignalingChannel`] abstracts the transport; [`SignalingClient`] layers the
//! typed protocol on top; [`ServerEvent`] decodes inbound notifications.

mod client;
mod ws;

pub use client::*;
pub use ws::WsSignaling;

use std::time::Duration;

use async_trait::async_trait;
use nexus_common::models::{
    PeerDescriptor, PresenceEntry, PresenceLeave, PresenceSnapshot, PresenceStateChange,
    ProducerClosedInfo, ProducerInfo,
};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::SignalingError;

/// Event names used on the wire.
pub mod names {
    // Synthetic, raised by the channel itself.
    pub const CONNECT: &str = "connect";
    pub const DISCONNECT: &str = "disconnect";
    pub const RECONNECT: &str = "reconnect";

    // Client → Server requests
    pub const JOIN: &str = "join";
    pub const LEAVE: &str = "leave";
    pub const CREATE_WEBRTC_TRANSPORT: &str = "createWebRtcTransport";
    pub const CONNECT_TRANSPORT: &str = "connectTransport";
    pub const PRODUCE: &str = "produce";
    pub const CONSUME: &str = "consume";
    pub const RESUME_CONSUMER: &str = "resumeConsumer";
    pub const PAUSE_CONSUMER: &str = "pauseConsumer";
    pub const RESUME_PRODUCER: &str = "resumeProducer";
    pub const RESTART_ICE: &str = "restartIce";

    // Client → Server notifications
    pub const MUTE_STATE: &str = "muteState";
    pub const AUDIO_STATE: &str = "audioState";
    pub const SPEAKING: &str = "speaking";
    pub const STOP_SCREEN_SHARING: &str = "stopScreenSharing";

    // Server → Client notifications
    pub const PEER_JOINED: &str = "peerJoined";
    pub const PEER_LEFT: &str = "peerLeft";
    pub const NEW_PRODUCER: &str = "newProducer";
    pub const PRODUCER_CLOSED: &str = "producerClosed";
    pub const PEER_MUTE_STATE_CHANGED: &str = "peerMuteStateChanged";
    pub const PEER_AUDIO_STATE_CHANGED: &str = "peerAudioStateChanged";
    pub const SPEAKING_STATE_CHANGED: &str = "speakingStateChanged";

    // Presence (both directions)
    pub const USER_JOINED_VOICE_CHANNEL: &str = "userJoinedVoiceChannel";
    pub const USER_LEFT_VOICE_CHANNEL: &str = "userLeftVoiceChannel";
    pub const VOICE_CHANNEL_PARTICIPANT_STATE_CHANGED: &str = "voiceChannelParticipantStateChanged";
    pub const VOICE_CHANNEL_PARTICIPANTS: &str = "voiceChannelParticipants";
}

/// An inbound notification as delivered by the channel.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalingEvent {
    pub name: String,
    pub data: Value,
}

impl SignalingEvent {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

/// Bidirectional event channel to the media server.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Send a request and wait for its acknowledgement.
    async fn request(
        &self,
        method: &str,
        data: Value,
        timeout: Duration,
    ) -> Result<Value, SignalingError>;

    /// Fire-and-forget event.
    async fn notify(&self, event: &str, data: Value) -> Result<(), SignalingError>;

    /// Inbound notifications, including the synthetic connect/disconnect ones.
    fn subscribe(&self) -> broadcast::Receiver<SignalingEvent>;

    fn is_connected(&self) -> bool;
}

/// `{peerId, value}` state-sync payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerFlag {
    #[serde(alias = "id", alias = "socketId")]
    pub peer_id: String,
    #[serde(
        alias = "isMuted",
        alias = "isAudioEnabled",
        alias = "isSpeaking",
        alias = "speaking"
    )]
    pub value: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PeerRef {
    #[serde(alias = "id", alias = "socketId")]
    peer_id: String,
}

/// Decoded inbound notification.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Connected,
    Disconnected,
    Reconnected,
    PeerJoined(PeerDescriptor),
    PeerLeft { peer_id: String },
    NewProducer(ProducerInfo),
    ProducerClosed(ProducerClosedInfo),
    PeerMuteStateChanged(PeerFlag),
    PeerAudioStateChanged(PeerFlag),
    SpeakingStateChanged(PeerFlag),
    UserJoinedVoiceChannel(PresenceEntry),
    UserLeftVoiceChannel(PresenceLeave),
    ParticipantStateChanged(PresenceStateChange),
    Participants(PresenceSnapshot),
    Other(String),
}

impl ServerEvent {
    pub fn parse(event: &SignalingEvent) -> Result<Self, SignalingError> {
        fn decode<T: serde::de::DeserializeOwned>(
            event: &SignalingEvent,
        ) -> Result<T, SignalingError> {
            serde_json::from_value(event.data.clone())
                .map_err(|e| SignalingError::malformed(&event.name, e))
        }

        let parsed = match event.name.as_str() {
            names::CONNECT => Self::Connected,
            names::DISCONNECT => Self::Disconnected,
            names::RECONNECT => Self::Reconnected,
            names::PEER_JOINED => Self::PeerJoined(decode(event)?),
            names::PEER_LEFT => Self::PeerLeft {
                peer_id: decode::<PeerRef>(event)?.peer_id,
            },
            names::NEW_PRODUCER => Self::NewProducer(decode(event)?),
            names::PRODUCER_CLOSED => Self::ProducerClosed(decode(event)?),
            names::PEER_MUTE_STATE_CHANGED => Self::PeerMuteStateChanged(decode(event)?),
            names::PEER_AUDIO_STATE_CHANGED => Self::PeerAudioStateChanged(decode(event)?),
            names::SPEAKING_STATE_CHANGED => Self::SpeakingStateChanged(decode(event)?),
            names::USER_JOINED_VOICE_CHANNEL => Self::UserJoinedVoiceChannel(decode(event)?),
            names::USER_LEFT_VOICE_CHANNEL => Self::UserLeftVoiceChannel(decode(event)?),
            names::VOICE_CHANNEL_PARTICIPANT_STATE_CHANGED => {
                Self::ParticipantStateChanged(decode(event)?)
            }
            names::VOICE_CHANNEL_PARTICIPANTS => Self::Participants(decode(event)?),
            other => Self::Other(other.to_owned()),
        };
        Ok(parsed)
    }

    /// Presence events are consumed by the room presence tracker, not the session.
    pub fn is_presence(&self) -> bool {
        matches!(
            self,
            Self::UserJoinedVoiceChannel(_)
                | Self::UserLeftVoiceChannel(_)
                | Self::ParticipantStateChanged(_)
                | Self::Participants(_)
        )
    }
}
