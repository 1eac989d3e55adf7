//! Typed protocol on top of a [`SignalingChannel`].

use std::sync::Arc;
use std::time::Duration;

use nexus_common::models::{MediaKind, MediaType, PeerDescriptor, ProducerInfo};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{SignalingChannel, SignalingEvent, names};
use crate::error::SignalingError;
use crate::media::{
    ConsumerOptions, Direction, DtlsParameters, IceParameters, RtpCapabilities, RtpParameters,
    TransportOptions,
};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub room_id: Uuid,
    pub name: String,
    pub initial_muted: bool,
    pub initial_audio_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResponse {
    /// Router capabilities; missing means the room cannot host media.
    #[serde(default)]
    pub rtp_capabilities: Option<RtpCapabilities>,
    /// Our own socket id, used to filter our producers out of announcements.
    #[serde(default)]
    pub peer_id: Option<String>,
    #[serde(default)]
    pub peers: Vec<PeerDescriptor>,
    #[serde(default)]
    pub producers: Vec<ProducerInfo>,
}

#[derive(Debug, Deserialize)]
struct ProducedAck {
    #[serde(alias = "producerId")]
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IceRestartAck {
    ice_parameters: IceParameters,
}

/// Typed signaling calls with a uniform request timeout.
#[derive(Clone)]
pub struct SignalingClient {
    channel: Arc<dyn SignalingChannel>,
    timeout: Duration,
}

impl SignalingClient {
    pub fn new(channel: Arc<dyn SignalingChannel>, timeout: Duration) -> Self {
        Self { channel, timeout }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.channel.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        data: Value,
        timeout: Duration,
    ) -> Result<T, SignalingError> {
        let ack = self.channel.request(method, data, timeout).await?;
        serde_json::from_value(ack).map_err(|e| SignalingError::malformed(method, e))
    }

    async fn call_unit(&self, method: &str, data: Value) -> Result<(), SignalingError> {
        self.channel.request(method, data, self.timeout).await?;
        Ok(())
    }

    pub async fn join(&self, request: &JoinRequest) -> Result<JoinResponse, SignalingError> {
        let data = serde_json::to_value(request)
            .map_err(|e| SignalingError::malformed(names::JOIN, e))?;
        self.call(names::JOIN, data, self.timeout).await
    }

    pub async fn leave(&self, room_id: Uuid) -> Result<(), SignalingError> {
        self.channel
            .notify(names::LEAVE, json!({ "roomId": room_id }))
            .await
    }

    pub async fn create_webrtc_transport(
        &self,
        direction: Direction,
    ) -> Result<TransportOptions, SignalingError> {
        let data = json!({
            "producing": direction == Direction::Send,
            "consuming": direction == Direction::Receive,
        });
        self.call(names::CREATE_WEBRTC_TRANSPORT, data, self.timeout)
            .await
    }

    pub async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), SignalingError> {
        self.call_unit(
            names::CONNECT_TRANSPORT,
            json!({ "transportId": transport_id, "dtlsParameters": dtls_parameters }),
        )
        .await
    }

    pub async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: Value,
    ) -> Result<String, SignalingError> {
        let data = json!({
            "transportId": transport_id,
            "kind": kind,
            "rtpParameters": rtp_parameters,
            "appData": app_data,
        });
        let ack: ProducedAck = self.call(names::PRODUCE, data, self.timeout).await?;
        Ok(ack.id)
    }

    pub async fn consume(
        &self,
        rtp_capabilities: &RtpCapabilities,
        remote_producer_id: &str,
        transport_id: &str,
    ) -> Result<ConsumerOptions, SignalingError> {
        let data = json!({
            "rtpCapabilities": rtp_capabilities,
            "remoteProducerId": remote_producer_id,
            "transportId": transport_id,
        });
        self.call(names::CONSUME, data, self.timeout).await
    }

    pub async fn resume_consumer(
        &self,
        consumer_id: &str,
        timeout: Duration,
    ) -> Result<(), SignalingError> {
        self.channel
            .request(
                names::RESUME_CONSUMER,
                json!({ "consumerId": consumer_id }),
                timeout,
            )
            .await
            .map(|_| ())
    }

    pub async fn pause_consumer(&self, consumer_id: &str) -> Result<(), SignalingError> {
        self.call_unit(names::PAUSE_CONSUMER, json!({ "consumerId": consumer_id }))
            .await
    }

    pub async fn resume_producer(
        &self,
        producer_id: &str,
        timeout: Duration,
    ) -> Result<(), SignalingError> {
        self.channel
            .request(
                names::RESUME_PRODUCER,
                json!({ "producerId": producer_id }),
                timeout,
            )
            .await
            .map(|_| ())
    }

    pub async fn restart_ice(&self, transport_id: &str) -> Result<IceParameters, SignalingError> {
        let ack: IceRestartAck = self
            .call(
                names::RESTART_ICE,
                json!({ "transportId": transport_id }),
                self.timeout,
            )
            .await?;
        Ok(ack.ice_parameters)
    }

    pub async fn mute_state(&self, muted: bool) -> Result<(), SignalingError> {
        self.channel
            .notify(names::MUTE_STATE, json!({ "isMuted": muted }))
            .await
    }

    pub async fn audio_state(&self, enabled: bool) -> Result<(), SignalingError> {
        self.channel
            .notify(names::AUDIO_STATE, json!({ "isAudioEnabled": enabled }))
            .await
    }

    pub async fn speaking(&self, speaking: bool) -> Result<(), SignalingError> {
        self.channel
            .notify(names::SPEAKING, json!({ "speaking": speaking }))
            .await
    }

    pub async fn producer_closed(
        &self,
        producer_id: &str,
        media_type: MediaType,
    ) -> Result<(), SignalingError> {
        self.channel
            .notify(
                names::PRODUCER_CLOSED,
                json!({ "producerId": producer_id, "mediaType": media_type }),
            )
            .await
    }

    pub async fn stop_screen_sharing(&self, producer_id: &str) -> Result<(), SignalingError> {
        self.channel
            .notify(
                names::STOP_SCREEN_SHARING,
                json!({ "producerId": producer_id, "mediaType": MediaType::Screen }),
            )
            .await
    }

    pub async fn announce_presence_join(
        &self,
        channel_id: Uuid,
        user_id: Uuid,
        user_name: &str,
        is_muted: bool,
    ) -> Result<(), SignalingError> {
        self.channel
            .notify(
                names::USER_JOINED_VOICE_CHANNEL,
                json!({
                    "channelId": channel_id,
                    "userId": user_id,
                    "userName": user_name,
                    "isMuted": is_muted,
                    "isSpeaking": false,
                }),
            )
            .await
    }

    pub async fn announce_presence_leave(
        &self,
        channel_id: Uuid,
        user_id: Uuid,
    ) -> Result<(), SignalingError> {
        self.channel
            .notify(
                names::USER_LEFT_VOICE_CHANNEL,
                json!({ "channelId": channel_id, "userId": user_id }),
            )
            .await
    }

    pub async fn announce_presence_state(
        &self,
        channel_id: Uuid,
        user_id: Uuid,
        is_muted: Option<bool>,
        is_speaking: Option<bool>,
    ) -> Result<(), SignalingError> {
        self.channel
            .notify(
                names::VOICE_CHANNEL_PARTICIPANT_STATE_CHANGED,
                json!({
                    "channelId": channel_id,
                    "userId": user_id,
                    "isMuted": is_muted,
                    "isSpeaking": is_speaking,
                }),
            )
            .await
    }
}
