//! Output height / frame rate planning from a bits-per-pixel threshold.

use crate::media::MediaProfile;
use crate::settings::Settings;

const HEIGHT_STEP: u32 = 10;

/// Stage multipliers for the minimum height. The first pass keeps at least
/// twice the minimum so a frame rate drop gets a chance before the height
/// goes all the way down.
const STAGES: [u32; 2] = [2, 1];

pub fn bits_per_pixel(bitrate: u32, fps: f64, ratio: f64, height: u32) -> f64 {
    let height = height as f64;
    bitrate as f64 * 1000.0 / (fps * ratio * height * height)
}

/// Largest height on the input's 10 px grid whose bpp reaches the threshold,
/// clamped to `[min_height * stage, max_height]` and never above the input.
pub fn downscale_height(
    settings: &Settings,
    profile: &MediaProfile,
    bitrate: u32,
    fps: f64,
    stage: u32,
) -> u32 {
    let in_height = profile.height;
    let min_height = settings.min_height * stage;

    if settings.user_scale() || in_height < min_height {
        return in_height;
    }

    let mut height = in_height;
    while height > min_height
        && bits_per_pixel(bitrate, fps, profile.ratio, height) < settings.bpp_threshold
    {
        height = height.saturating_sub(HEIGHT_STEP);
    }

    height
        .max(min_height)
        .min(settings.max_height)
        .min(in_height)
}

/// First frame rate (input rate, then the ladder entries below it) whose bpp
/// reaches half the threshold, clamped to `[min_fps, max_fps]` and never above the input.
pub fn drop_framerate(settings: &Settings, profile: &MediaProfile, bitrate: u32, height: u32) -> f64 {
    let in_fps = profile.fps;

    if settings.user_fps() || in_fps < settings.min_fps {
        return in_fps;
    }

    let threshold = settings.bpp_threshold / 2.0;
    let candidates = std::iter::once(in_fps).chain(
        settings
            .fps_ladder
            .iter()
            .copied()
            .filter(|fps| *fps < in_fps),
    );

    let mut out_fps = in_fps;
    for fps in candidates {
        out_fps = fps;
        if bits_per_pixel(bitrate, fps, profile.ratio, height) >= threshold {
            break;
        }
    }

    out_fps
        .clamp(settings.min_fps, settings.max_fps)
        .min(in_fps)
}

/// Output `(height, fps)` for a bitrate: height then frame rate, twice, so
/// neither dimension absorbs the whole reduction.
pub fn compute_output_height_and_fps(
    settings: &Settings,
    profile: &MediaProfile,
    bitrate: u32,
) -> (u32, f64) {
    let mut fps = profile.fps;
    let mut height = profile.height;
    for stage in STAGES {
        height = downscale_height(settings, profile, bitrate, fps, stage);
        fps = drop_framerate(settings, profile, bitrate, height);
    }
    (height, fps)
}

/// `-vf` value for the planned output, or `None` when it matches the input.
pub fn filter_string(profile: &MediaProfile, height: u32, fps: f64) -> Option<String> {
    let mut filters = Vec::new();
    if height != profile.height {
        filters.push(format!("scale=-2:{}:flags=lanczos", height));
    }
    if fps != profile.fps {
        filters.push(format!("fps={}", fps));
    }
    if filters.is_empty() {
        None
    } else {
        Some(filters.join(","))
    }
}
