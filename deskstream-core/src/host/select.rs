//! Encoder selection with hardware-first fallback.
//!
//! For every codec in the client's preference order, each hardware
//! backend is tried in host order; the first encoder that comes up wins.
//! Only when no hardware combination works is the software encoder
//! tried, over the same codec list, at a reduced frame-rate ceiling.

use tracing::{debug, info, warn};

use crate::error::StreamError;
use crate::media::encoder::{Encoder, EncoderFactory, EncoderParams};
use crate::media::types::{BackendKind, CodecType, EncodeAbility};

/// The encoder a host pipeline ended up with.
pub struct SelectedEncoder {
    pub encoder: Box<dyn Encoder>,
    pub ability: EncodeAbility,
    /// Frame rate the encoder was created for; lower than requested on
    /// the software path.
    pub fps: u32,
}

impl std::fmt::Debug for SelectedEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectedEncoder")
            .field("ability", &self.ability)
            .field("fps", &self.fps)
            .finish_non_exhaustive()
    }
}

pub fn select_encoder(
    factory: &dyn EncoderFactory,
    preferences: &[CodecType],
    base: &EncoderParams,
    soft_fps_ceiling: u32,
) -> Result<SelectedEncoder, StreamError> {
    let backends = factory.hardware_backends();
    for &codec in preferences {
        let params = EncoderParams {
            codec,
            ..base.clone()
        };
        for &backend in backends.iter().filter(|b| b.is_hardware()) {
            match factory.create_hard(backend, &params) {
                Some(encoder) => {
                    info!(%codec, %backend, fps = params.fps, "hardware encoder selected");
                    return Ok(SelectedEncoder {
                        encoder,
                        ability: EncodeAbility::new(codec, backend),
                        fps: params.fps,
                    });
                }
                None => debug!(%codec, %backend, "hardware encoder unavailable"),
            }
        }
    }

    let fps = base.fps.min(soft_fps_ceiling.max(1));
    warn!(fps, "no hardware encoder, falling back to software");
    for &codec in preferences {
        let params = EncoderParams {
            codec,
            fps,
            ..base.clone()
        };
        if let Some(encoder) = factory.create_soft(&params) {
            info!(%codec, fps, "software encoder selected");
            return Ok(SelectedEncoder {
                encoder,
                ability: EncodeAbility::new(codec, BackendKind::Software),
                fps,
            });
        }
    }

    Err(StreamError::EncoderCreateFailure(format!(
        "no hardware or software encoder for {preferences:?}"
    )))
}
