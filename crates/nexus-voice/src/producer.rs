//! Producer manager: local microphone, screen and webcam producers.
//!
//! At most one producer per [`MediaType`]. Ending a producer closes it, stops
//! the captured track and tells the server; a track that ends on its own
//! raises [`EngineEvent::LocalTrackEnded`] so the session runs the same path.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use nexus_common::config::AudioConfig;
use nexus_common::models::{MediaType, NoiseSuppressionMode, ProducerAppData};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::audio::vad::{VadSettings, spawn_local_vad};
use crate::audio::NoiseSuppressionPipeline;
use crate::error::{MediaError, VoiceError, VoiceResult};
use crate::events::EngineEvent;
use crate::media::{
    AudioConstraints, CodecOptions, LocalProducer, MediaDevices, MediaTrack, ProduceOptions,
    wait_ended,
};
use crate::retry::RetryPolicy;
use crate::signaling::SignalingClient;
use crate::transport::ManagedTransport;

/// A live local producer and everything hanging off it.
pub struct ActiveProducer {
    producer: Arc<dyn LocalProducer>,
    media_type: MediaType,
    /// The captured device track (raw microphone for audio).
    source: Arc<dyn MediaTrack>,
    pipeline: Option<NoiseSuppressionPipeline>,
    tasks: CancellationToken,
}

impl ActiveProducer {
    pub fn id(&self) -> String {
        self.producer.id()
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn source(&self) -> &Arc<dyn MediaTrack> {
        &self.source
    }

    pub fn noise_suppression(&self) -> NoiseSuppressionMode {
        self.pipeline
            .as_ref()
            .map(NoiseSuppressionPipeline::mode)
            .unwrap_or(NoiseSuppressionMode::Off)
    }

    /// Enable or disable what goes out on the wire.
    pub fn set_enabled(&self, enabled: bool) {
        self.source.set_enabled(enabled);
        if let Some(pipeline) = &self.pipeline {
            pipeline.output_track().set_enabled(enabled);
        }
    }

    /// Switch noise suppression on a live microphone producer.
    ///
    /// Between enabled modes the stage chain is swapped in place. Turning it
    /// on or off swaps the producer's outgoing track, never the producer.
    /// Returns whether the outgoing track was replaced.
    pub async fn set_noise_suppression(
        &mut self,
        mode: NoiseSuppressionMode,
        gate_threshold: f32,
        acquire: RetryPolicy,
    ) -> VoiceResult<bool> {
        match (self.pipeline.is_some(), mode.is_enabled()) {
            (true, true) => {
                if let Some(pipeline) = self.pipeline.as_mut() {
                    pipeline.set_mode(mode);
                }
                Ok(false)
            }
            (true, false) => {
                self.producer.replace_track(self.source.clone()).await?;
                if let Some(pipeline) = self.pipeline.take() {
                    pipeline.stop();
                }
                info!(producer = %self.producer.id(), "Noise suppression disabled");
                Ok(true)
            }
            (false, true) => {
                let pipeline = NoiseSuppressionPipeline::start(
                    self.source.clone(),
                    mode,
                    gate_threshold,
                    acquire,
                    self.tasks.child_token(),
                );
                let output = pipeline.output_track();
                output.set_enabled(self.source.enabled());
                if let Err(e) = self.producer.replace_track(output).await {
                    pipeline.stop();
                    return Err(e.into());
                }
                self.pipeline = Some(pipeline);
                Ok(true)
            }
            (false, false) => Ok(false),
        }
    }

    /// Close the producer and stop its tracks. Errors are logged, not returned.
    pub fn shutdown(&mut self) {
        self.tasks.cancel();
        if let Err(e) = self.producer.close() {
            warn!(producer = %self.producer.id(), error = %e, "Failed to close producer");
        }
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.stop();
        }
        self.source.stop();
        debug!(producer = %self.producer.id(), media = %self.media_type, "Producer shut down");
    }

    /// Tell the server (and through it, the peers) the producer is gone.
    pub async fn announce_closed(client: &SignalingClient, producer_id: &str, media_type: MediaType) {
        if media_type == MediaType::Screen {
            if let Err(e) = client.stop_screen_sharing(producer_id).await {
                warn!(producer = %producer_id, error = %e, "stopScreenSharing not delivered");
            }
        }
        if let Err(e) = client.producer_closed(producer_id, media_type).await {
            warn!(producer = %producer_id, error = %e, "producerClosed not delivered");
        }
    }
}

/// Mic/screen/webcam slots.
#[derive(Default)]
pub struct LocalProducers {
    mic: Option<ActiveProducer>,
    screen: Option<ActiveProducer>,
    webcam: Option<ActiveProducer>,
}

impl LocalProducers {
    fn slot(&mut self, media_type: MediaType) -> &mut Option<ActiveProducer> {
        match media_type {
            MediaType::Mic => &mut self.mic,
            MediaType::Screen => &mut self.screen,
            MediaType::Webcam => &mut self.webcam,
        }
    }

    pub fn get(&self, media_type: MediaType) -> Option<&ActiveProducer> {
        match media_type {
            MediaType::Mic => self.mic.as_ref(),
            MediaType::Screen => self.screen.as_ref(),
            MediaType::Webcam => self.webcam.as_ref(),
        }
    }

    pub fn get_mut(&mut self, media_type: MediaType) -> Option<&mut ActiveProducer> {
        self.slot(media_type).as_mut()
    }

    /// Fill a slot; the previous occupant is handed back for teardown.
    pub fn insert(&mut self, producer: ActiveProducer) -> Option<ActiveProducer> {
        self.slot(producer.media_type).replace(producer)
    }

    pub fn take(&mut self, media_type: MediaType) -> Option<ActiveProducer> {
        self.slot(media_type).take()
    }

    /// Take the producer only if it is still the one with `producer_id`.
    pub fn take_if(&mut self, media_type: MediaType, producer_id: &str) -> Option<ActiveProducer> {
        let slot = self.slot(media_type);
        if slot.as_ref().is_some_and(|p| p.id() == producer_id) {
            return slot.take();
        }
        None
    }

    pub fn owns(&self, producer_id: &str) -> bool {
        self.iter().any(|p| p.id() == producer_id)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActiveProducer> {
        self.mic.iter().chain(self.screen.iter()).chain(self.webcam.iter())
    }

    pub fn take_all(&mut self) -> Vec<ActiveProducer> {
        [self.mic.take(), self.screen.take(), self.webcam.take()]
            .into_iter()
            .flatten()
            .collect()
    }
}

/// Creates producers. Cheap to clone.
#[derive(Clone)]
pub struct ProducerManager {
    devices: Arc<dyn MediaDevices>,
    events: mpsc::UnboundedSender<EngineEvent>,
    audio: AudioConfig,
    acquire: RetryPolicy,
    timers: TaskTracker,
}

impl ProducerManager {
    /// The local VAD runs on `timers`.
    pub(crate) fn new(
        devices: Arc<dyn MediaDevices>,
        events: mpsc::UnboundedSender<EngineEvent>,
        audio: AudioConfig,
        acquire: RetryPolicy,
        timers: TaskTracker,
    ) -> Self {
        Self {
            devices,
            events,
            audio,
            acquire,
            timers,
        }
    }

    /// Capture the microphone, run it through noise suppression, attach the
    /// local VAD and publish it.
    ///
    /// Honours `cancel` while waiting on the device or the server; whatever was
    /// acquired by then is released before returning [`VoiceError::Cancelled`].
    pub async fn create_local_audio(
        &self,
        transport: &ManagedTransport,
        muted: Arc<AtomicBool>,
        mode: NoiseSuppressionMode,
        cancel: &CancellationToken,
    ) -> VoiceResult<ActiveProducer> {
        let constraints = AudioConstraints {
            noise_suppression: !mode.is_enabled(),
            ..AudioConstraints::default()
        };
        let source = self.devices.microphone(&constraints).await?;
        if cancel.is_cancelled() {
            source.stop();
            return Err(VoiceError::Cancelled);
        }

        let tasks = cancel.child_token();
        let pipeline = mode.is_enabled().then(|| {
            NoiseSuppressionPipeline::start(
                source.clone(),
                mode,
                self.audio.gate_threshold,
                self.acquire.clone(),
                tasks.child_token(),
            )
        });
        let outgoing = pipeline
            .as_ref()
            .map(NoiseSuppressionPipeline::output_track)
            .unwrap_or_else(|| source.clone());
        let enabled = !muted.load(std::sync::atomic::Ordering::Acquire);
        source.set_enabled(enabled);
        outgoing.set_enabled(enabled);

        spawn_local_vad(
            source.clone(),
            VadSettings::from(&self.audio),
            self.acquire.clone(),
            muted,
            self.events.clone(),
            tasks.child_token(),
            &self.timers,
        );

        let options = ProduceOptions {
            codec_options: Some(CodecOptions::voice()),
            app_data: app_data(MediaType::Mic),
        };
        let produced = tokio::select! {
            _ = cancel.cancelled() => Err(VoiceError::Cancelled),
            r = transport.produce(outgoing, options) => r.map_err(VoiceError::from),
        };
        let producer = match produced {
            Ok(p) => p,
            Err(e) => {
                tasks.cancel();
                if let Some(pipeline) = pipeline {
                    pipeline.stop();
                }
                source.stop();
                return Err(e);
            }
        };

        let active = ActiveProducer {
            producer,
            media_type: MediaType::Mic,
            source,
            pipeline,
            tasks,
        };
        self.watch_ended(&active);
        info!(producer = %active.id(), enabled, mode = ?active.noise_suppression(), "Microphone producing");
        Ok(active)
    }

    /// Start a screen share or webcam producer.
    pub async fn start_video(
        &self,
        transport: &ManagedTransport,
        media_type: MediaType,
        cancel: &CancellationToken,
    ) -> VoiceResult<ActiveProducer> {
        let source = match media_type {
            MediaType::Screen => self.devices.screen().await?,
            MediaType::Webcam => self.devices.webcam().await?,
            MediaType::Mic => return Err(MediaError::Engine("mic is not a video source".into()).into()),
        };
        if cancel.is_cancelled() {
            source.stop();
            return Err(VoiceError::Cancelled);
        }

        let options = ProduceOptions {
            codec_options: None,
            app_data: app_data(media_type),
        };
        let produced = tokio::select! {
            _ = cancel.cancelled() => Err(VoiceError::Cancelled),
            r = transport.produce(source.clone(), options) => r.map_err(VoiceError::from),
        };
        let producer = match produced {
            Ok(p) => p,
            Err(e) => {
                source.stop();
                return Err(e);
            }
        };

        let active = ActiveProducer {
            producer,
            media_type,
            source,
            pipeline: None,
            tasks: cancel.child_token(),
        };
        self.watch_ended(&active);
        info!(producer = %active.id(), media = %media_type, "Video producing");
        Ok(active)
    }

    fn watch_ended(&self, active: &ActiveProducer) {
        let ended = active.source.ended();
        let cancel = active.tasks.child_token();
        let events = self.events.clone();
        let (media_type, producer_id) = (active.media_type, active.id());
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = wait_ended(ended) => {
                    info!(producer = %producer_id, media = %media_type, "Local track ended");
                    let _ = events.send(EngineEvent::LocalTrackEnded { media_type, producer_id });
                }
            }
        });
    }
}

fn app_data(media_type: MediaType) -> serde_json::Value {
    serde_json::to_value(ProducerAppData { media_type }).unwrap_or_default()
}
