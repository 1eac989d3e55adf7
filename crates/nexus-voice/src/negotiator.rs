//! Capability negotiation: load the local device against the router's
//! capabilities before any transport exists.
//!
//! Failure here is terminal for the join attempt; retrying is the caller's call.

use nexus_common::models::MediaKind;

use crate::error::{VoiceError, VoiceResult};
use crate::media::{MediaEngine, RtpCapabilities};

/// What the device ended up supporting.
#[derive(Debug, Clone, PartialEq)]
pub struct NegotiatedCapabilities {
    pub local: RtpCapabilities,
    pub can_produce_audio: bool,
    pub can_produce_video: bool,
}

pub async fn negotiate(
    engine: &dyn MediaEngine,
    router_capabilities: Option<&RtpCapabilities>,
) -> VoiceResult<NegotiatedCapabilities> {
    let router = router_capabilities
        .filter(|caps| !caps.is_null())
        .ok_or_else(|| VoiceError::Negotiation("server sent no router capabilities".into()))?;

    engine
        .load(router)
        .await
        .map_err(|e| VoiceError::Negotiation(format!("device load failed: {e}")))?;

    let local = engine
        .rtp_capabilities()
        .ok_or_else(|| VoiceError::Negotiation("device reported no capabilities".into()))?;

    let negotiated = NegotiatedCapabilities {
        local,
        can_produce_audio: engine.can_produce(MediaKind::Audio),
        can_produce_video: engine.can_produce(MediaKind::Video),
    };

    if !negotiated.can_produce_audio {
        tracing::warn!("Device cannot produce audio; joining listen-only");
    }
    tracing::debug!(
        audio = negotiated.can_produce_audio,
        video = negotiated.can_produce_video,
        "Media capabilities negotiated"
    );

    Ok(negotiated)
}
