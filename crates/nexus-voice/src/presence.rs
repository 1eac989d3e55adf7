//! Room presence: tracks who's in which voice channel.
//!
//! Fed by server-confirmed presence events, independently of whether an SFU
//! session for that channel is open, so the rest of the application can show
//! "N people in this channel" without joining it.

use std::collections::HashMap;
use std::sync::Arc;

use nexus_common::models::{PresenceEntry, PresenceLeave, PresenceSnapshot, PresenceStateChange};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::signaling::{ServerEvent, SignalingChannel};

/// Two indexes for fast lookups:
/// - `by_user`: user_id → entry (quick "where is this user?")
/// - `by_channel`: channel_id → [user_id] (quick "who's in this channel?")
#[derive(Clone, Default)]
pub struct RoomPresence {
    by_user: Arc<RwLock<HashMap<Uuid, PresenceEntry>>>,
    by_channel: Arc<RwLock<HashMap<Uuid, Vec<Uuid>>>>,
}

impl RoomPresence {
    pub fn new() -> Self {
        Self::default()
    }

    /// User joins a voice channel. If already in another channel, leaves it first.
    /// Returns the channel they were moved out of, if any.
    pub async fn join(&self, entry: PresenceEntry) -> Option<Uuid> {
        let old_channel = self.leave(entry.user_id).await;
        let (user_id, channel_id) = (entry.user_id, entry.channel_id);

        self.by_user.write().await.insert(user_id, entry);
        self.by_channel
            .write()
            .await
            .entry(channel_id)
            .or_default()
            .push(user_id);

        tracing::debug!(user = %user_id, channel = %channel_id, "Presence: user joined voice channel");
        old_channel.filter(|old| *old != channel_id)
    }

    /// User leaves their current voice channel. Returns the channel they left.
    pub async fn leave(&self, user_id: Uuid) -> Option<Uuid> {
        let entry = self.by_user.write().await.remove(&user_id)?;

        let mut channels = self.by_channel.write().await;
        if let Some(members) = channels.get_mut(&entry.channel_id) {
            members.retain(|u| *u != user_id);
            if members.is_empty() {
                channels.remove(&entry.channel_id);
            }
        }

        tracing::debug!(user = %user_id, channel = %entry.channel_id, "Presence: user left voice channel");
        Some(entry.channel_id)
    }

    /// Leave only if the user is still recorded in `channel_id`; a late leave
    /// for a channel they already moved away from is ignored.
    pub async fn leave_channel(&self, leave: &PresenceLeave) -> bool {
        let in_channel = self
            .by_user
            .read()
            .await
            .get(&leave.user_id)
            .is_some_and(|e| e.channel_id == leave.channel_id);
        if in_channel {
            self.leave(leave.user_id).await;
        }
        in_channel
    }

    pub async fn update_state(&self, change: &PresenceStateChange) -> Option<PresenceEntry> {
        let mut users = self.by_user.write().await;
        let entry = users
            .get_mut(&change.user_id)
            .filter(|e| e.channel_id == change.channel_id)?;
        if let Some(m) = change.is_muted {
            entry.is_muted = m;
            if m {
                entry.is_speaking = false;
            }
        }
        if let Some(s) = change.is_speaking {
            entry.is_speaking = s && !entry.is_muted;
        }
        Some(entry.clone())
    }

    /// Replace a channel's membership with a full snapshot.
    pub async fn replace_channel(&self, snapshot: PresenceSnapshot) {
        for user_id in self.clear_channel(snapshot.channel_id).await {
            tracing::trace!(user = %user_id, "Presence: dropped by snapshot");
        }
        for mut entry in snapshot.participants {
            entry.channel_id = snapshot.channel_id;
            self.join(entry).await;
        }
    }

    /// Drop everyone from a channel. Returns who was removed.
    pub async fn clear_channel(&self, channel_id: Uuid) -> Vec<Uuid> {
        let members = self
            .by_channel
            .write()
            .await
            .remove(&channel_id)
            .unwrap_or_default();
        let mut users = self.by_user.write().await;
        for uid in &members {
            users.remove(uid);
        }
        members
    }

    /// Apply a decoded presence event. Returns `false` for non-presence events.
    pub async fn apply(&self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::UserJoinedVoiceChannel(entry) => {
                self.join(entry.clone()).await;
            }
            ServerEvent::UserLeftVoiceChannel(leave) => {
                self.leave_channel(leave).await;
            }
            ServerEvent::ParticipantStateChanged(change) => {
                self.update_state(change).await;
            }
            ServerEvent::Participants(snapshot) => {
                self.replace_channel(snapshot.clone()).await;
            }
            _ => return false,
        }
        true
    }

    pub async fn get_user(&self, user_id: Uuid) -> Option<PresenceEntry> {
        self.by_user.read().await.get(&user_id).cloned()
    }

    /// Members of a channel in join order.
    pub async fn channel_members(&self, channel_id: Uuid) -> Vec<PresenceEntry> {
        let channels = self.by_channel.read().await;
        let users = self.by_user.read().await;

        channels
            .get(&channel_id)
            .map(|ids| ids.iter().filter_map(|uid| users.get(uid).cloned()).collect())
            .unwrap_or_default()
    }

    pub async fn channel_count(&self, channel_id: Uuid) -> usize {
        self.by_channel
            .read()
            .await
            .get(&channel_id)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    pub async fn channels(&self) -> Vec<(Uuid, usize)> {
        let mut out: Vec<_> = self
            .by_channel
            .read()
            .await
            .iter()
            .map(|(id, members)| (*id, members.len()))
            .collect();
        out.sort();
        out
    }

    /// Keep this tracker in sync with `channel` until `cancel` fires.
    pub fn spawn_listener(
        &self,
        channel: Arc<dyn SignalingChannel>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let presence = self.clone();
        let mut events = channel.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) => match ServerEvent::parse(&event) {
                        Ok(parsed) => {
                            presence.apply(&parsed).await;
                        }
                        Err(e) => tracing::warn!(error = %e, "Presence: dropping event"),
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "Presence listener lagging");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::names;
    use crate::testing::FakeSignaling;
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;

    fn entry(channel: Uuid, user: Uuid) -> PresenceEntry {
        PresenceEntry {
            channel_id: channel,
            user_id: user,
            user_name: "ana".into(),
            is_muted: false,
            is_speaking: false,
            joined_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn joining_elsewhere_moves_the_user() {
        let presence = RoomPresence::new();
        let (a, b, user) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        assert_eq!(presence.join(entry(a, user)).await, None);
        assert_eq!(presence.join(entry(b, user)).await, Some(a));
        assert_eq!(presence.channel_count(a).await, 0);
        assert_eq!(presence.channel_count(b).await, 1);
    }

    #[tokio::test]
    async fn stale_leave_is_ignored() {
        let presence = RoomPresence::new();
        let (a, b, user) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        presence.join(entry(a, user)).await;
        presence.join(entry(b, user)).await;

        let left = presence
            .leave_channel(&PresenceLeave {
                channel_id: a,
                user_id: user,
            })
            .await;
        assert!(!left);
        assert_eq!(presence.get_user(user).await.unwrap().channel_id, b);
    }

    #[tokio::test]
    async fn muting_clears_speaking() {
        let presence = RoomPresence::new();
        let (a, user) = (Uuid::new_v4(), Uuid::new_v4());
        presence.join(entry(a, user)).await;
        presence
            .update_state(&PresenceStateChange {
                channel_id: a,
                user_id: user,
                is_muted: None,
                is_speaking: Some(true),
            })
            .await;
        let updated = presence
            .update_state(&PresenceStateChange {
                channel_id: a,
                user_id: user,
                is_muted: Some(true),
                is_speaking: None,
            })
            .await
            .unwrap();
        assert!(updated.is_muted);
        assert!(!updated.is_speaking);
    }

    #[tokio::test]
    async fn snapshot_replaces_membership() {
        let presence = RoomPresence::new();
        let (a, u1, u2) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        presence.join(entry(a, u1)).await;
        presence
            .replace_channel(PresenceSnapshot {
                channel_id: a,
                participants: vec![entry(a, u2)],
            })
            .await;
        let members = presence.channel_members(a).await;
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].user_id, u2);
        assert!(presence.get_user(u1).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn listener_follows_signaling() {
        let signaling = Arc::new(FakeSignaling::default());
        let presence = RoomPresence::new();
        let cancel = CancellationToken::new();
        let handle = presence.spawn_listener(signaling.clone(), cancel.clone());

        let (channel, user) = (Uuid::new_v4(), Uuid::new_v4());
        signaling.emit(
            names::USER_JOINED_VOICE_CHANNEL,
            json!({ "channelId": channel, "userId": user, "userName": "bo" }),
        );
        signaling.emit(names::PEER_JOINED, json!({ "id": "s1" }));
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(presence.channel_count(channel).await, 1);

        signaling.emit(
            names::USER_LEFT_VOICE_CHANNEL,
            json!({ "channelId": channel, "userId": user }),
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(presence.channel_count(channel).await, 0);

        cancel.cancel();
        handle.await.unwrap();
    }
}
