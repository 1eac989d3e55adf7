//! Voice activity detection on frame RMS levels.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use nexus_common::config::AudioConfig;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use super::{acquire_frames, calculate_rms};
use crate::events::EngineEvent;
use crate::media::MediaTrack;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadSettings {
    pub threshold: f32,
    /// Consecutive voiced frames before reporting speech.
    pub attack_frames: u32,
    /// Consecutive quiet frames before reporting silence.
    pub hangover_frames: u32,
}

impl From<&AudioConfig> for VadSettings {
    fn from(cfg: &AudioConfig) -> Self {
        Self {
            threshold: cfg.vad_threshold,
            attack_frames: cfg.vad_attack_frames.max(1),
            hangover_frames: cfg.vad_hangover_frames.max(1),
        }
    }
}

impl Default for VadSettings {
    fn default() -> Self {
        Self::from(&AudioConfig::default())
    }
}

/// Threshold detector with attack and hangover.
///
/// Only transitions are reported, so callers can forward them verbatim.
#[derive(Debug, Clone)]
pub struct VoiceActivityDetector {
    settings: VadSettings,
    voiced_run: u32,
    quiet_run: u32,
    speaking: bool,
}

impl VoiceActivityDetector {
    pub fn new(settings: VadSettings) -> Self {
        Self {
            settings,
            voiced_run: 0,
            quiet_run: 0,
            speaking: false,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Feed one frame level; returns `Some(new_state)` on a transition.
    pub fn process(&mut self, level: f32) -> Option<bool> {
        if level >= self.settings.threshold {
            self.voiced_run += 1;
            self.quiet_run = 0;
            if !self.speaking && self.voiced_run >= self.settings.attack_frames {
                self.speaking = true;
                return Some(true);
            }
        } else {
            self.quiet_run += 1;
            self.voiced_run = 0;
            if self.speaking && self.quiet_run >= self.settings.hangover_frames {
                self.speaking = false;
                return Some(false);
            }
        }
        None
    }

    /// Drop any accumulated state; returns `true` if it was speaking.
    pub fn reset(&mut self) -> bool {
        let was = self.speaking;
        self.voiced_run = 0;
        self.quiet_run = 0;
        self.speaking = false;
        was
    }
}

/// Run VAD over the local microphone until `cancel` fires.
///
/// While `muted` is set frames are discarded and the detector stays reset, so
/// the mic can never report speech while muted.
pub(crate) fn spawn_local_vad(
    track: Arc<dyn MediaTrack>,
    settings: VadSettings,
    acquire: RetryPolicy,
    muted: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<EngineEvent>,
    cancel: CancellationToken,
    timers: &TaskTracker,
) {
    timers.spawn(async move {
        let mut frames = match acquire_frames(&track, &acquire, &cancel).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(track = %track.id(), error = ?e, "Local VAD: microphone frames unavailable");
                return;
            }
        };
        let mut vad = VoiceActivityDetector::new(settings);

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = frames.recv() => frame,
            };
            let frame = match frame {
                Ok(f) => f,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Local VAD lagging");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            if muted.load(Ordering::Acquire) {
                vad.reset();
                continue;
            }
            if let Some(speaking) = vad.process(calculate_rms(&frame)) {
                let _ = events.send(EngineEvent::LocalVoiceActivity { speaking });
            }
        }
        debug!(track = %track.id(), "Local VAD stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTrack;
    use std::time::Duration;

    fn settings() -> VadSettings {
        VadSettings {
            threshold: 0.1,
            attack_frames: 2,
            hangover_frames: 3,
        }
    }

    #[test]
    fn needs_attack_frames_before_speaking() {
        let mut vad = VoiceActivityDetector::new(settings());
        assert_eq!(vad.process(0.5), None);
        assert_eq!(vad.process(0.5), Some(true));
        assert_eq!(vad.process(0.5), None);
    }

    #[test]
    fn hangover_bridges_short_gaps() {
        let mut vad = VoiceActivityDetector::new(settings());
        vad.process(0.5);
        vad.process(0.5);
        assert_eq!(vad.process(0.0), None);
        assert_eq!(vad.process(0.0), None);
        assert_eq!(vad.process(0.5), None);
        assert!(vad.is_speaking());

        vad.process(0.0);
        vad.process(0.0);
        assert_eq!(vad.process(0.0), Some(false));
    }

    #[test]
    fn reset_reports_previous_state() {
        let mut vad = VoiceActivityDetector::new(settings());
        vad.process(0.5);
        vad.process(0.5);
        assert!(vad.reset());
        assert!(!vad.is_speaking());
        assert!(!vad.reset());
    }

    #[tokio::test(start_paused = true)]
    async fn muted_mic_never_reports_speech() {
        let fake = FakeTrack::audio("mic");
        let muted = Arc::new(AtomicBool::new(true));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        spawn_local_vad(
            fake.clone(),
            settings(),
            RetryPolicy::default(),
            muted.clone(),
            tx,
            cancel.clone(),
            &TaskTracker::new(),
        );
        while fake.subscriber_count() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        for _ in 0..5 {
            fake.push(&[0.8; 480]);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(rx.try_recv().is_err());

        muted.store(false, Ordering::Release);
        fake.push(&[0.8; 480]);
        fake.push(&[0.8; 480]);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(
            rx.try_recv().unwrap(),
            EngineEvent::LocalVoiceActivity { speaking: true }
        );
        cancel.cancel();
    }
}
