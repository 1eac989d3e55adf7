//! Voice-channel presence: who sits in which voice channel, independent of any
//! open SFU session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One user's presence in a voice channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub channel_id: Uuid,
    pub user_id: Uuid,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub is_muted: bool,
    #[serde(default)]
    pub is_speaking: bool,
    #[serde(default = "Utc::now")]
    pub joined_at: DateTime<Utc>,
}

/// `userLeftVoiceChannel` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceLeave {
    pub channel_id: Uuid,
    pub user_id: Uuid,
}

/// `voiceChannelParticipantStateChanged` payload. Absent fields are left untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceStateChange {
    pub channel_id: Uuid,
    pub user_id: Uuid,
    #[serde(default)]
    pub is_muted: Option<bool>,
    #[serde(default)]
    pub is_speaking: Option<bool>,
}

/// `voiceChannelParticipants` payload: full membership of one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceSnapshot {
    pub channel_id: Uuid,
    #[serde(default)]
    pub participants: Vec<PresenceEntry>,
}
