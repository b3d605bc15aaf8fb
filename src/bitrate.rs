//! Video bitrate allocation for each attempt.

use crate::controller::AttemptResult;
use crate::media::MediaProfile;
use crate::settings::Settings;

/// Used whenever the computed bitrate is not positive; the bpp search then
/// shrinks resolution and frame rate instead.
pub const FALLBACK_BITRATE: u32 = 1;

/// Video bitrate in Kbps for the next attempt.
///
/// Without a previous attempt the bitrate is derived from the size budget:
/// `target * 8 / (1000 * duration) - audio_bitrate`. Afterwards it scales
/// with `target / last_output_size`. Any decrease is pinned to
/// `last * min_bitrate_ratio`, so one attempt never cuts more than that
/// fraction and small corrections still make progress. A previous attempt
/// without a measured size (failed encode) decays by the same ratio.
pub fn compute_video_bitrate(
    settings: &Settings,
    profile: &MediaProfile,
    audio_bitrate: u32,
    last: Option<&AttemptResult>,
) -> u32 {
    let target = settings.target_size_bytes() as f64;

    let bitrate = match last {
        None => {
            if profile.duration <= 0.0 {
                return FALLBACK_BITRATE;
            }
            target * 8.0 / (1000.0 * profile.duration) - audio_bitrate as f64
        }
        Some(last) => {
            let last_bitrate = last.video_bitrate as f64;
            match last.output_size.filter(|size| *size > 0) {
                Some(size) => {
                    let scaled = last_bitrate * (target / size as f64);
                    if scaled < last_bitrate {
                        last_bitrate * settings.min_bitrate_ratio
                    } else {
                        scaled
                    }
                }
                None => last_bitrate * settings.min_bitrate_ratio,
            }
        }
    };

    if bitrate < FALLBACK_BITRATE as f64 {
        FALLBACK_BITRATE
    } else {
        bitrate as u32
    }
}
