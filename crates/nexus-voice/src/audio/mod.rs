//! Audio processing: per-peer playback graph, voice-activity detection and the
//! microphone noise suppression chain.
//!
//! All processing works on mono `f32` frames at 48 kHz as delivered by
//! [`MediaTrack::subscribe_audio`](crate::media::MediaTrack::subscribe_audio).

pub mod graph;
pub mod noise;
pub mod vad;

pub use graph::{AudioContext, AudioNodeView, effective_gain};
pub use noise::{NoiseSuppressionPipeline, ProcessedTrack};
pub use vad::{VadSettings, VoiceActivityDetector};

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::MediaError;
use crate::media::{AudioFrame, MediaTrack};
use crate::retry::{RetryError, RetryPolicy};

/// Root mean square of a frame (unrolled by four).
pub fn calculate_rms(data: &[f32]) -> f32 {
    if data.is_empty() {
        return 0.0;
    }

    let mut sums = [0.0_f32; 4];
    let mut chunks = data.chunks_exact(4);
    for c in &mut chunks {
        sums[0] += c[0] * c[0];
        sums[1] += c[1] * c[1];
        sums[2] += c[2] * c[2];
        sums[3] += c[3] * c[3];
    }
    let tail: f32 = chunks.remainder().iter().map(|s| s * s).sum();

    let mean_of_squares = (sums.iter().sum::<f32>() + tail) / data.len() as f32;
    mean_of_squares.sqrt()
}

/// Subscribe to a track's PCM frames, retrying while the track is not ready.
///
/// Consumers routinely resolve a little after their producer was announced,
/// so a missing stream is retried with `policy` instead of failing outright.
pub(crate) async fn acquire_frames(
    track: &Arc<dyn MediaTrack>,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<broadcast::Receiver<AudioFrame>, RetryError<MediaError>> {
    policy
        .retry(cancel, "acquire audio track", |_| {
            let track = track.clone();
            async move {
                track
                    .subscribe_audio()
                    .ok_or_else(|| MediaError::TrackNotReady(track.id()))
            }
        })
        .await
}
