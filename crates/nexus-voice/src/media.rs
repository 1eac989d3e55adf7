//! Seam between the session engine and the platform media stack.
//!
//! The WebRTC engine (device, transports, producers, consumers), the capture
//! devices and the speaker output live outside this crate. The engine drives
//! them only through the traits below, so any WebRTC implementation can be
//! plugged in.
//!
//! Transport callbacks (`connect`, `produce`, connection-state changes) arrive
//! as a [`TransportEvent`] stream; each request-style event carries a
//! `oneshot` reply channel the engine must answer.

use std::sync::Arc;

use async_trait::async_trait;
use nexus_common::models::MediaKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::error::MediaError;

/// Mono PCM frame, 48 kHz, samples in `-1.0..=1.0`.
pub type AudioFrame = Arc<[f32]>;

/// Opaque SFU blobs; the engine understands them, we only shuttle them.
pub type RtpCapabilities = Value;
pub type RtpParameters = Value;
pub type DtlsParameters = Value;
pub type IceParameters = Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Failed,
    Disconnected,
    Closed,
}

impl ConnectionState {
    /// States that call for an ICE restart.
    pub fn needs_ice_restart(self) -> bool {
        matches!(self, Self::Failed | Self::Disconnected)
    }
}

/// Parameters returned by `createWebRtcTransport`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportOptions {
    pub id: String,
    #[serde(default)]
    pub ice_parameters: IceParameters,
    #[serde(default)]
    pub ice_candidates: Value,
    #[serde(default)]
    pub dtls_parameters: DtlsParameters,
}

/// Parameters returned by `consume`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerOptions {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    #[serde(default)]
    pub rtp_parameters: RtpParameters,
    #[serde(default)]
    pub app_data: Value,
}

/// Codec switches passed along with `produce`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CodecOptions {
    pub opus_stereo: bool,
    pub opus_dtx: bool,
    pub opus_fec: bool,
    pub opus_nack: bool,
}

impl CodecOptions {
    /// Options used for the microphone producer.
    pub fn voice() -> Self {
        Self {
            opus_stereo: true,
            opus_dtx: true,
            opus_fec: true,
            opus_nack: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProduceOptions {
    pub codec_options: Option<CodecOptions>,
    pub app_data: Value,
}

/// Callback-style events raised by a local transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// First use of the transport: DTLS parameters must reach the server.
    Connect {
        dtls_parameters: DtlsParameters,
        reply: oneshot::Sender<Result<(), String>>,
    },
    /// A producer needs a server-side id.
    Produce {
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: Value,
        reply: oneshot::Sender<Result<String, String>>,
    },
    ConnectionStateChange(ConnectionState),
}

/// A freshly opened transport and the stream of its callbacks.
pub struct TransportHandle {
    pub transport: Arc<dyn LocalTransport>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Inbound RTP counters used for stall detection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub bytes_received: u64,
    pub packets_received: u64,
}

/// The local WebRTC device.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Load the device against the router's capabilities.
    async fn load(&self, router_capabilities: &RtpCapabilities) -> Result<(), MediaError>;

    /// Local receive capabilities; `None` until [`MediaEngine::load`] succeeded.
    fn rtp_capabilities(&self) -> Option<RtpCapabilities>;

    fn can_produce(&self, kind: MediaKind) -> bool;

    async fn create_send_transport(
        &self,
        options: TransportOptions,
    ) -> Result<TransportHandle, MediaError>;

    async fn create_recv_transport(
        &self,
        options: TransportOptions,
    ) -> Result<TransportHandle, MediaError>;
}

#[async_trait]
pub trait LocalTransport: Send + Sync {
    fn id(&self) -> String;

    fn direction(&self) -> Direction;

    fn connection_state(&self) -> ConnectionState;

    async fn produce(
        &self,
        track: Arc<dyn MediaTrack>,
        options: ProduceOptions,
    ) -> Result<Arc<dyn LocalProducer>, MediaError>;

    async fn consume(&self, options: ConsumerOptions) -> Result<Arc<dyn LocalConsumer>, MediaError>;

    async fn restart_ice(&self, ice_parameters: IceParameters) -> Result<(), MediaError>;

    fn close(&self) -> Result<(), MediaError>;
}

#[async_trait]
pub trait LocalProducer: Send + Sync {
    fn id(&self) -> String;

    fn kind(&self) -> MediaKind;

    fn track(&self) -> Arc<dyn MediaTrack>;

    /// Swap the outgoing track without renegotiating.
    async fn replace_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), MediaError>;

    fn close(&self) -> Result<(), MediaError>;
}

#[async_trait]
pub trait LocalConsumer: Send + Sync {
    fn id(&self) -> String;

    fn producer_id(&self) -> String;

    fn kind(&self) -> MediaKind;

    fn track(&self) -> Arc<dyn MediaTrack>;

    fn app_data(&self) -> Value;

    async fn resume(&self) -> Result<(), MediaError>;

    async fn pause(&self) -> Result<(), MediaError>;

    async fn stats(&self) -> Result<ConsumerStats, MediaError>;

    fn close(&self) -> Result<(), MediaError>;
}

/// A capture or receive track.
pub trait MediaTrack: Send + Sync {
    fn id(&self) -> String;

    fn kind(&self) -> MediaKind;

    fn enabled(&self) -> bool;

    fn set_enabled(&self, enabled: bool);

    /// Stop the underlying source. Idempotent.
    fn stop(&self);

    /// Flips to `true` once the track ended, whether stopped locally or by the
    /// platform (e.g. screen capture revoked from the OS).
    fn ended(&self) -> watch::Receiver<bool>;

    /// PCM frames of an audio track; `None` while the track is not producing yet.
    fn subscribe_audio(&self) -> Option<broadcast::Receiver<AudioFrame>>;
}

/// Resolves once the watched track has ended, or its sender is gone.
pub(crate) async fn wait_ended(mut ended: watch::Receiver<bool>) {
    let _ = ended.wait_for(|ended| *ended).await;
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub auto_gain_control: bool,
    /// Platform noise suppression; off when our own chain runs.
    pub noise_suppression: bool,
    pub sample_rate: u32,
    pub channel_count: u16,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            auto_gain_control: true,
            noise_suppression: false,
            sample_rate: 48_000,
            channel_count: 1,
        }
    }
}

/// Capture devices (microphone permission prompts, screen pickers, cameras).
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn microphone(
        &self,
        constraints: &AudioConstraints,
    ) -> Result<Arc<dyn MediaTrack>, MediaError>;

    async fn screen(&self) -> Result<Arc<dyn MediaTrack>, MediaError>;

    async fn webcam(&self) -> Result<Arc<dyn MediaTrack>, MediaError>;
}

/// Where per-peer audio ends up after the gain stage.
pub trait AudioOutput: Send + Sync {
    fn play(&self, peer_id: &str, frame: &[f32]);
}

/// Output that drops everything; used when playback is handled elsewhere.
#[derive(Debug, Default)]
pub struct NullOutput;

impl AudioOutput for NullOutput {
    fn play(&self, _peer_id: &str, _frame: &[f32]) {}
}
