//! Voice client configuration loaded from defaults, an optional config file and
//! environment variables.
//!
//! Config precedence: env vars > .env file > voice.toml > defaults

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;

use crate::models::NoiseSuppressionMode;

static CONFIG: OnceLock<VoiceClientConfig> = OnceLock::new();

/// Get the global voice client configuration, falling back to defaults when
/// [`init`] was never called.
pub fn get() -> &'static VoiceClientConfig {
    CONFIG.get_or_init(VoiceClientConfig::default)
}

/// Initialize the global configuration from `voice.toml` and the environment.
///
/// Should be called once at startup, before any other code accesses config.
pub fn init() -> Result<&'static VoiceClientConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let cfg = load()?;
    Ok(CONFIG.get_or_init(|| cfg))
}

/// Build a configuration without touching the global.
pub fn load() -> Result<VoiceClientConfig, config::ConfigError> {
    config::Config::builder()
        .add_source(config::Config::try_from(&VoiceClientConfig::default())?)
        .add_source(config::File::with_name("voice").required(false))
        // Environment variables (NEXUS_VOICE__SIGNALING__URL, NEXUS_VOICE__AUDIO__MAX_BOOST, ...)
        .add_source(
            config::Environment::with_prefix("NEXUS_VOICE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VoiceClientConfig {
    pub signaling: SignalingConfig,
    pub transport: TransportConfig,
    pub consumer: ConsumerConfig,
    pub audio: AudioConfig,
    pub hotkeys: HotkeyConfig,
    pub preferences: PreferencesConfig,
}

/// Backoff parameters shared by every retrying flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl BackoffConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// WebSocket URL of the media server's signaling endpoint.
    pub url: String,
    /// Upper bound for any request/acknowledgement round-trip.
    pub request_timeout_ms: u64,
    pub reconnect: BackoffConfig,
}

impl SignalingConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8082/voice".into(),
            request_timeout_ms: 10_000,
            reconnect: BackoffConfig {
                max_attempts: 10,
                initial_delay_ms: 1_000,
                max_delay_ms: 30_000,
                multiplier: 2.0,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// ICE restarts attempted before the session reports the connection lost.
    pub ice_restart: BackoffConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ice_restart: BackoffConfig {
                max_attempts: 3,
                initial_delay_ms: 500,
                max_delay_ms: 4_000,
                multiplier: 2.0,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Interval between inbound-stats samples for stall detection.
    pub stats_interval_ms: u64,
    /// Consecutive polls without new bytes before recovery kicks in.
    pub stall_polls: u32,
    /// Budget for the best-effort server resume round-trip.
    pub resume_timeout_ms: u64,
    /// Retry policy for grabbing a consumer track that is not ready yet.
    pub track_acquire: BackoffConfig,
}

impl ConsumerConfig {
    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    pub fn resume_timeout(&self) -> Duration {
        Duration::from_millis(self.resume_timeout_ms)
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            stats_interval_ms: 5_000,
            stall_polls: 2,
            resume_timeout_ms: 5_000,
            track_acquire: BackoffConfig {
                max_attempts: 5,
                initial_delay_ms: 200,
                max_delay_ms: 2_000,
                multiplier: 2.0,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Gain applied at volume 100.
    pub max_boost: f32,
    /// RMS level (0.0-1.0 full scale) above which a frame counts as voice.
    pub vad_threshold: f32,
    /// Frames of voice needed before reporting speaking.
    pub vad_attack_frames: u32,
    /// Frames of silence tolerated before reporting silence.
    pub vad_hangover_frames: u32,
    pub noise_suppression: NoiseSuppressionMode,
    /// RMS level below which the noise gate closes.
    pub gate_threshold: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            max_boost: 2.0,
            vad_threshold: 0.02,
            vad_attack_frames: 2,
            vad_hangover_frames: 15,
            noise_suppression: NoiseSuppressionMode::default(),
            gate_threshold: 0.01,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotkeyConfig {
    pub toggle_mic: String,
    pub toggle_audio: String,
}

impl Default for HotkeyConfig {
    fn default() -> Self {
        Self {
            toggle_mic: "Ctrl+Shift+M".into(),
            toggle_audio: "Ctrl+Shift+D".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreferencesConfig {
    /// JSON file holding per-user volumes. In-memory only when unset.
    pub path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_loader() {
        let cfg = load().expect("defaults must deserialize");
        assert_eq!(cfg.signaling.request_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.audio.noise_suppression, NoiseSuppressionMode::Rnnoise);
        assert_eq!(cfg.consumer.stall_polls, 2);
        assert!(cfg.preferences.path.is_none());
    }
}
