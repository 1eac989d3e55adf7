//! # nexus-voice
//!
//! Client-side voice/video session engine for Nexus.
//!
//! The SFU forwards media; everything here runs on the participant's side:
//! - Signaling over WebSocket with request/ack and server notifications
//! - One send transport per session, one pooled receive transport per peer
//! - Microphone publishing through noise suppression, with local VAD
//! - Per-peer playback graph with client-side volume (0-100, up to 2x boost)
//! - Screen share and webcam as separate producers
//! - Consumer stall detection and ICE-restart recovery
//! - Voice-channel presence for users who have not joined the call
//!
//! The platform media stack (device, transports, tracks, speaker) sits behind
//! the traits in [`media`]; [`session::VoiceSession`] drives it.

pub mod audio;
pub mod consumer;
pub mod error;
pub mod events;
pub mod hotkeys;
pub mod media;
pub mod negotiator;
pub mod peers;
pub mod prefs;
pub mod presence;
pub mod producer;
pub mod retry;
pub mod session;
pub mod signaling;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{ErrorCategory, MediaError, SignalingError, VoiceError, VoiceResult};
pub use events::SessionEvent;
pub use hotkeys::HotkeyAction;
pub use presence::RoomPresence;
pub use session::{LocalUser, SessionDeps, SessionDiagnostics, SessionSnapshot, VoiceSession};
pub use signaling::{SignalingClient, WsSignaling};
