//! Codec / backend capability negotiation.
//!
//! Runs once before either pipeline exists. The receiver's preference
//! order decides the codec; the sender's enumeration order (hardware
//! before software) decides the backend.

use tracing::{debug, warn};

use crate::error::StreamError;
use crate::media::types::{CodecType, DisplayMode, EncodeAbility, NegotiatedParams};

/// Pick one (codec, backend) pair, or `None` if the two sides share no
/// codec.
pub fn negotiate(sender: &[EncodeAbility], receiver: &[CodecType]) -> Option<EncodeAbility> {
    receiver
        .iter()
        .find_map(|codec| sender.iter().find(|a| a.codec == *codec))
        .copied()
}

/// Negotiate and build the parameters both pipelines are created with.
pub fn negotiate_params(
    mode: DisplayMode,
    sender: &[EncodeAbility],
    receiver: &[CodecType],
    stretch: bool,
) -> Result<NegotiatedParams, StreamError> {
    match negotiate(sender, receiver) {
        Some(ability) => {
            debug!(codec = %ability.codec, backend = %ability.backend, %mode, "negotiated");
            Ok(NegotiatedParams::new(mode, ability, stretch))
        }
        None => {
            warn!(?sender, ?receiver, "no common codec");
            Err(StreamError::NegotiationFailure {
                preferred: receiver.to_vec(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::types::BackendKind;

    fn hw(codec: CodecType) -> EncodeAbility {
        EncodeAbility::new(codec, BackendKind::Nvidia)
    }

    #[test]
    fn receiver_preference_decides_codec() {
        let sender = [hw(CodecType::H264), hw(CodecType::H265)];
        let picked = negotiate(&sender, &[CodecType::H265, CodecType::H264]).unwrap();
        assert_eq!(picked.codec, CodecType::H265);
    }

    #[test]
    fn no_common_codec_fails() {
        let err = negotiate_params(
            DisplayMode::new(1920, 1080, 60),
            &[hw(CodecType::H265)],
            &[CodecType::H264],
            false,
        )
        .unwrap_err();
        assert!(matches!(err, StreamError::NegotiationFailure { .. }));
    }

    #[test]
    fn sender_order_breaks_backend_ties() {
        let sender = [
            EncodeAbility::new(CodecType::H264, BackendKind::Intel),
            EncodeAbility::new(CodecType::H264, BackendKind::Software),
        ];
        let picked = negotiate(&sender, &[CodecType::H264]).unwrap();
        assert_eq!(picked.backend, BackendKind::Intel);
    }

    #[test]
    fn params_carry_mode_and_stretch() {
        let mode = DisplayMode::new(1280, 720, 30);
        let params = negotiate_params(
            mode,
            &[EncodeAbility::new(CodecType::Zstd, BackendKind::Software)],
            &[CodecType::H264, CodecType::Zstd],
            true,
        )
        .unwrap();
        assert_eq!(params.display_mode(), mode);
        assert_eq!(params.codec, CodecType::Zstd);
        assert!(params.stretch);
    }
}
