//! Peer roster: the authoritative per-peer state of the current room.
//!
//! Mute/speaking/audio-enabled come from the server. Volume and individual
//! mute are local-only and never leave this process. Individual mute is not
//! stored separately: a peer is individually muted exactly when its volume is 0.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use nexus_common::models::PeerDescriptor;
use serde::Serialize;
use uuid::Uuid;

pub const DEFAULT_VOLUME: u8 = 100;
pub const MAX_VOLUME: u8 = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Peer {
    pub id: String,
    pub user_id: Option<Uuid>,
    pub name: String,
    pub is_muted: bool,
    pub is_speaking: bool,
    /// Whether *they* have their output enabled.
    pub is_audio_enabled: bool,
    pub volume: u8,
    /// Last non-zero volume, restored on individual unmute.
    pub previous_volume: Option<u8>,
    /// Local analyser sees signal on their stream. Informational only.
    pub voice_activity: bool,
    pub joined_at: DateTime<Utc>,
}

impl Peer {
    fn new(desc: &PeerDescriptor, volume: u8) -> Self {
        let volume = volume.min(MAX_VOLUME);
        Self {
            id: desc.id.clone(),
            user_id: desc.user_id,
            name: desc.name.clone(),
            is_muted: desc.is_muted,
            is_speaking: false,
            is_audio_enabled: desc.is_audio_enabled,
            volume,
            previous_volume: (volume > 0).then_some(volume),
            voice_activity: false,
            joined_at: Utc::now(),
        }
    }

    pub fn individually_muted(&self) -> bool {
        self.volume == 0
    }

    pub fn preference_key(&self) -> String {
        self.user_id
            .map(|u| u.to_string())
            .unwrap_or_else(|| self.id.clone())
    }
}

/// Peers of the current room keyed by socket id.
#[derive(Debug, Default)]
pub struct PeerRoster {
    peers: HashMap<String, Peer>,
}

impl PeerRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a peer. A new record starts from `stored_volume`
    /// (default 100); an existing one keeps its local volume.
    pub fn upsert(&mut self, desc: &PeerDescriptor, stored_volume: Option<u8>) -> &Peer {
        let peer = self
            .peers
            .entry(desc.id.clone())
            .and_modify(|p| {
                p.name = desc.name.clone();
                p.user_id = desc.user_id.or(p.user_id);
                p.is_audio_enabled = desc.is_audio_enabled;
                p.is_muted = desc.is_muted;
                if p.is_muted {
                    p.is_speaking = false;
                }
            })
            .or_insert_with(|| Peer::new(desc, stored_volume.unwrap_or(DEFAULT_VOLUME)));

        tracing::debug!(peer = %peer.id, name = %peer.name, "Peer present");
        peer
    }

    pub fn remove(&mut self, peer_id: &str) -> Option<Peer> {
        let removed = self.peers.remove(peer_id);
        if removed.is_some() {
            tracing::debug!(peer = %peer_id, "Peer removed");
        }
        removed
    }

    pub fn get(&self, peer_id: &str) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    /// Mute forces speaking off; a muted source cannot be speaking.
    pub fn set_muted(&mut self, peer_id: &str, muted: bool) -> Option<&Peer> {
        let peer = self.peers.get_mut(peer_id)?;
        peer.is_muted = muted;
        if muted {
            peer.is_speaking = false;
        }
        Some(peer)
    }

    pub fn set_audio_enabled(&mut self, peer_id: &str, enabled: bool) -> Option<&Peer> {
        let peer = self.peers.get_mut(peer_id)?;
        peer.is_audio_enabled = enabled;
        Some(peer)
    }

    /// Server-confirmed speaking state, gated by mute.
    pub fn set_speaking(&mut self, peer_id: &str, speaking: bool) -> Option<&Peer> {
        let peer = self.peers.get_mut(peer_id)?;
        peer.is_speaking = speaking && !peer.is_muted;
        Some(peer)
    }

    pub fn set_voice_activity(&mut self, peer_id: &str, active: bool) -> Option<&Peer> {
        let peer = self.peers.get_mut(peer_id)?;
        peer.voice_activity = active && !peer.is_muted;
        Some(peer)
    }

    /// Slider change. Zero is the same as individual mute.
    pub fn set_volume(&mut self, peer_id: &str, volume: u8) -> Option<&Peer> {
        let peer = self.peers.get_mut(peer_id)?;
        let volume = volume.min(MAX_VOLUME);
        if volume > 0 {
            peer.previous_volume = Some(volume);
        }
        peer.volume = volume;
        Some(peer)
    }

    /// Flip individual mute: mute drops volume to 0, unmute restores the last
    /// non-zero volume or 100 if there never was one.
    pub fn toggle_individual_mute(&mut self, peer_id: &str) -> Option<&Peer> {
        let peer = self.peers.get_mut(peer_id)?;
        if peer.individually_muted() {
            peer.volume = peer.previous_volume.unwrap_or(DEFAULT_VOLUME);
        } else {
            peer.previous_volume = Some(peer.volume);
            peer.volume = 0;
        }
        Some(peer)
    }

    pub fn ids(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    /// Peers sorted by join time, then id.
    pub fn snapshot(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.id.cmp(&b.id)));
        peers
    }
}
