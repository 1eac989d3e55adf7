//! Microphone noise suppression.
//!
//! A pipeline subscribes to the raw microphone and publishes the cleaned
//! signal as a [`ProcessedTrack`]. Switching between enabled modes swaps the
//! stage chain in place; the output track (and therefore the producer using
//! it) stays the same.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use nexus_common::models::{MediaKind, NoiseSuppressionMode};
use nnnoiseless::{DenoiseState, FRAME_SIZE};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{acquire_frames, calculate_rms};
use crate::media::{AudioFrame, MediaTrack, wait_ended};
use crate::retry::RetryPolicy;

const MAX_I16_F32: f32 = i16::MAX as f32;

/// One denoising step. Stages may buffer, so output length can differ from input.
pub trait NoiseStage: Send {
    fn name(&self) -> &'static str;

    fn process(&mut self, input: &[f32], out: &mut Vec<f32>);
}

/// RNNoise. Works on 480-sample frames in the i16 range.
pub struct RnnoiseStage {
    state: Box<DenoiseState<'static>>,
    pending: Vec<f32>,
    in_buf: [f32; FRAME_SIZE],
    out_buf: [f32; FRAME_SIZE],
}

impl RnnoiseStage {
    pub fn new() -> Self {
        Self {
            state: DenoiseState::new(),
            pending: Vec::with_capacity(FRAME_SIZE * 2),
            in_buf: [0.0; FRAME_SIZE],
            out_buf: [0.0; FRAME_SIZE],
        }
    }
}

impl Default for RnnoiseStage {
    fn default() -> Self {
        Self::new()
    }
}

impl NoiseStage for RnnoiseStage {
    fn name(&self) -> &'static str {
        "rnnoise"
    }

    fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        self.pending.extend_from_slice(input);

        let mut consumed = 0;
        while self.pending.len() - consumed >= FRAME_SIZE {
            let frame = &self.pending[consumed..consumed + FRAME_SIZE];
            for (dst, src) in self.in_buf.iter_mut().zip(frame) {
                *dst = src * MAX_I16_F32;
            }
            self.state.process_frame(&mut self.out_buf, &self.in_buf);
            out.extend(
                self.out_buf
                    .iter()
                    .map(|s| (s / MAX_I16_F32).clamp(-1.0, 1.0)),
            );
            consumed += FRAME_SIZE;
        }
        self.pending.drain(..consumed);
    }
}

/// Broadband Wiener-style suppressor: tracks the noise floor and attenuates
/// each block by its estimated signal-to-noise ratio.
pub struct SpectralStage {
    noise_floor: Option<f32>,
    gain: f32,
    min_gain: f32,
}

impl SpectralStage {
    /// Per-block rise of the floor estimate while the signal stays above it.
    const FLOOR_RISE: f32 = 0.002;
    const FLOOR_FALL: f32 = 0.1;
    const SMOOTHING: f32 = 0.7;

    pub fn new() -> Self {
        Self {
            noise_floor: None,
            gain: 1.0,
            min_gain: 0.1,
        }
    }
}

impl Default for SpectralStage {
    fn default() -> Self {
        Self::new()
    }
}

impl NoiseStage for SpectralStage {
    fn name(&self) -> &'static str {
        "spectral"
    }

    fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        if input.is_empty() {
            return;
        }
        let power = calculate_rms(input).powi(2);
        let floor = match self.noise_floor {
            None => power,
            Some(f) if power < f => f + (power - f) * Self::FLOOR_FALL,
            Some(f) => f * (1.0 + Self::FLOOR_RISE),
        };
        self.noise_floor = Some(floor);

        let target = if power <= f32::EPSILON {
            self.min_gain
        } else {
            (1.0 - floor / power).max(self.min_gain)
        };
        self.gain = Self::SMOOTHING * self.gain + (1.0 - Self::SMOOTHING) * target;

        out.extend(input.iter().map(|s| s * self.gain));
    }
}

/// Noise gate with attack/release smoothing.
pub struct NoiseGate {
    threshold: f32,
    attack: f32,
    release: f32,
    gain: f32,
}

impl NoiseGate {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            attack: 0.05,
            release: 0.001,
            gain: 0.0,
        }
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }
}

impl NoiseStage for NoiseGate {
    fn name(&self) -> &'static str {
        "gate"
    }

    fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        let target = if calculate_rms(input) >= self.threshold {
            1.0
        } else {
            0.0
        };
        let rate = if target > self.gain {
            self.attack
        } else {
            self.release
        };
        out.extend(input.iter().map(|s| {
            self.gain += (target - self.gain) * rate;
            s * self.gain
        }));
    }
}

/// Stage chain for a mode; empty for [`NoiseSuppressionMode::Off`].
pub fn build_chain(mode: NoiseSuppressionMode, gate_threshold: f32) -> Vec<Box<dyn NoiseStage>> {
    match mode {
        NoiseSuppressionMode::Off => Vec::new(),
        NoiseSuppressionMode::Rnnoise => vec![Box::new(RnnoiseStage::new())],
        NoiseSuppressionMode::Spectral => vec![Box::new(SpectralStage::new())],
        NoiseSuppressionMode::Gate => vec![Box::new(NoiseGate::new(gate_threshold))],
        NoiseSuppressionMode::Combined => vec![
            Box::new(RnnoiseStage::new()),
            Box::new(NoiseGate::new(gate_threshold)),
        ],
    }
}

fn run_chain(chain: &mut [Box<dyn NoiseStage>], input: &[f32]) -> Vec<f32> {
    let mut data = input.to_vec();
    for stage in chain.iter_mut() {
        let mut out = Vec::with_capacity(data.len());
        stage.process(&data, &mut out);
        data = out;
    }
    data
}

/// Output of a [`NoiseSuppressionPipeline`], usable as a producer track.
pub struct ProcessedTrack {
    id: String,
    source: Arc<dyn MediaTrack>,
    enabled: AtomicBool,
    frames: broadcast::Sender<AudioFrame>,
    ended: watch::Sender<bool>,
    cancel: CancellationToken,
}

impl MediaTrack for ProcessedTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        MediaKind::Audio
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Also gates the raw source, so nothing leaves the device while muted.
    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        self.source.set_enabled(enabled);
    }

    /// Stops processing only; the raw source belongs to whoever captured it.
    fn stop(&self) {
        self.cancel.cancel();
        self.ended.send_replace(true);
    }

    fn ended(&self) -> watch::Receiver<bool> {
        self.ended.subscribe()
    }

    fn subscribe_audio(&self) -> Option<broadcast::Receiver<AudioFrame>> {
        Some(self.frames.subscribe())
    }
}

pub struct NoiseSuppressionPipeline {
    mode: NoiseSuppressionMode,
    gate_threshold: f32,
    chain: Arc<Mutex<Vec<Box<dyn NoiseStage>>>>,
    output: Arc<ProcessedTrack>,
}

impl NoiseSuppressionPipeline {
    /// Start processing `source` with `mode` (which must not be `Off`).
    pub fn start(
        source: Arc<dyn MediaTrack>,
        mode: NoiseSuppressionMode,
        gate_threshold: f32,
        acquire: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        let chain = Arc::new(Mutex::new(build_chain(mode, gate_threshold)));
        let (frames, _) = broadcast::channel(64);
        let (ended, _) = watch::channel(false);
        let output = Arc::new(ProcessedTrack {
            id: format!("{}-ns", source.id()),
            enabled: AtomicBool::new(source.enabled()),
            source,
            frames,
            ended,
            cancel,
        });

        tokio::spawn(run_pipeline(output.clone(), chain.clone(), acquire));
        info!(track = %output.id, ?mode, "Noise suppression started");

        Self {
            mode,
            gate_threshold,
            chain,
            output,
        }
    }

    pub fn mode(&self) -> NoiseSuppressionMode {
        self.mode
    }

    pub fn output_track(&self) -> Arc<dyn MediaTrack> {
        self.output.clone()
    }

    pub fn source(&self) -> &Arc<dyn MediaTrack> {
        &self.output.source
    }

    /// Swap the stage chain without touching the output track.
    ///
    /// Returns `false` (and changes nothing) for `Off`; turning suppression
    /// off means dropping the pipeline and routing the raw track.
    pub fn set_mode(&mut self, mode: NoiseSuppressionMode) -> bool {
        if !mode.is_enabled() {
            return false;
        }
        if mode != self.mode {
            *lock_chain(&self.chain) = build_chain(mode, self.gate_threshold);
            debug!(track = %self.output.id, from = ?self.mode, to = ?mode, "Noise suppression chain swapped");
            self.mode = mode;
        }
        true
    }

    pub fn stop(&self) {
        self.output.stop();
    }
}

fn lock_chain(
    chain: &Mutex<Vec<Box<dyn NoiseStage>>>,
) -> std::sync::MutexGuard<'_, Vec<Box<dyn NoiseStage>>> {
    chain.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn run_pipeline(
    output: Arc<ProcessedTrack>,
    chain: Arc<Mutex<Vec<Box<dyn NoiseStage>>>>,
    acquire: RetryPolicy,
) {
    let cancel = output.cancel.clone();
    let mut frames = match acquire_frames(&output.source, &acquire, &cancel).await {
        Ok(rx) => rx,
        Err(e) => {
            warn!(track = %output.id, error = ?e, "Noise suppression: microphone frames unavailable");
            output.ended.send_replace(true);
            return;
        }
    };
    let source_ended = wait_ended(output.source.ended());
    tokio::pin!(source_ended);

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = &mut source_ended => {
                debug!(track = %output.id, "Noise suppression source ended");
                break;
            }
            frame = frames.recv() => frame,
        };
        let frame = match frame {
            Ok(f) => f,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!(track = %output.id, skipped = n, "Noise suppression lagging");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let cleaned = run_chain(&mut lock_chain(&chain), &frame);
        if !cleaned.is_empty() {
            let _ = output.frames.send(Arc::from(cleaned));
        }
    }

    output.ended.send_replace(true);
}
