//! Audio bitrate allocation and ffmpeg audio arguments.

use crate::media::{AudioStream, MediaProfile};
use crate::settings::Settings;

/// Slack (Kbps) allowed when comparing an input stream's bitrate with the planned one.
const COPY_BITRATE_SLACK: u32 = 5;

/// Size-pressure thresholds and the per-channel bitrate (Kbps) picked below each.
/// Tuned for music on ~4 MiB outputs.
const CHANNEL_LADDER: &[(f64, u32)] = &[(1.0, 24), (2.0, 32), (7.0, 48), (14.0, 64), (30.0, 80)];
const CHANNEL_LADDER_TOP: u32 = 96;

fn ladder_bitrate(factor: f64) -> u32 {
    CHANNEL_LADDER
        .iter()
        .find(|(limit, _)| factor < *limit)
        .map(|(_, bitrate)| *bitrate)
        .unwrap_or(CHANNEL_LADDER_TOP)
}

/// Uniform per-channel bitrate in Kbps, or 0 when the output carries no audio.
pub fn channel_bitrate(settings: &Settings, profile: &MediaProfile) -> u32 {
    let channels = profile.audio_channel_total(settings);
    if channels == 0 || profile.duration <= 0.0 {
        return 0;
    }

    let factor = settings.size_mib * 8.0 * 1000.0
        / (profile.duration * channels as f64 * settings.audio_factor * 16.0);

    ladder_bitrate(factor).clamp(settings.min_audio, settings.max_audio)
}

/// Planned bitrate of one output stream in Kbps.
pub fn stream_bitrate(settings: &Settings, profile: &MediaProfile, stream: &AudioStream) -> u32 {
    profile.output_channels(settings, stream) * channel_bitrate(settings, profile)
}

/// Whether the input stream can go into the output untouched.
pub fn copy_stream(settings: &Settings, profile: &MediaProfile, stream: &AudioStream) -> bool {
    if settings.no_copy || settings.audio_filters() || settings.is_trimmed() || settings.force_stereo
    {
        return false;
    }
    if !settings
        .audio_codec
        .copyable_codecs()
        .iter()
        .any(|codec| stream.codec.contains(codec))
    {
        return false;
    }
    if settings.force_copy {
        return true;
    }
    match stream.bitrate {
        Some(in_bitrate) => {
            in_bitrate.saturating_sub(COPY_BITRATE_SLACK) <= stream_bitrate(settings, profile, stream)
        }
        None => false,
    }
}

/// Total audio bitrate (Kbps) of the output across all kept streams.
pub fn compute_audio_bitrate(settings: &Settings, profile: &MediaProfile) -> u32 {
    profile
        .output_audio(settings)
        .iter()
        .map(|stream| match (copy_stream(settings, profile, stream), stream.bitrate) {
            (true, Some(in_bitrate)) => in_bitrate,
            _ => stream_bitrate(settings, profile, stream),
        })
        .sum()
}

/// Arguments for the final encode's audio streams.
pub fn audio_args(settings: &Settings, profile: &MediaProfile) -> Vec<String> {
    let mut args = Vec::new();
    let streams = profile.output_audio(settings);
    if streams.is_empty() {
        args.push("-an".to_string());
        return args;
    }

    for (index, stream) in streams.iter().enumerate() {
        args.push(format!("-c:a:{}", index));
        if copy_stream(settings, profile, stream) {
            args.push("copy".to_string());
        } else {
            args.push(settings.audio_codec.ffmpeg_name().to_string());
            args.push(format!("-b:a:{}", index));
            args.push(format!("{}K", stream_bitrate(settings, profile, stream)));
        }
    }

    if settings.force_stereo {
        args.extend(["-ac".to_string(), "2".to_string()]);
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::AudioCodec;
    use std::path::PathBuf;

    fn profile(duration: f64, audio: Vec<AudioStream>) -> MediaProfile {
        MediaProfile {
            path: PathBuf::from("in.mkv"),
            duration,
            start: 0.0,
            cut_end: false,
            height: 720,
            fps: 30.0,
            ratio: 16.0 / 9.0,
            audio,
        }
    }

    fn stereo(codec: &str, bitrate: Option<u32>) -> AudioStream {
        AudioStream {
            channels: 2,
            bitrate,
            codec: codec.to_string(),
        }
    }

    fn audio_on() -> Settings {
        Settings {
            audio: true,
            ..Settings::default()
        }
    }

    #[test]
    fn ladder_steps() {
        assert_eq!(ladder_bitrate(0.5), 24);
        assert_eq!(ladder_bitrate(1.0), 32);
        assert_eq!(ladder_bitrate(6.9), 48);
        assert_eq!(ladder_bitrate(13.0), 64);
        assert_eq!(ladder_bitrate(29.0), 80);
        assert_eq!(ladder_bitrate(30.0), 96);
    }

    #[test]
    fn channel_bitrate_depends_on_pressure() {
        let settings = audio_on();
        // 3 MiB over 10 s with one stereo stream: factor = 24000 / (10 * 2 * 88) ~ 13.6
        let p = profile(10.0, vec![stereo("aac", None)]);
        assert_eq!(channel_bitrate(&settings, &p), 64);
        // Long input, much more pressure.
        let p = profile(600.0, vec![stereo("aac", None)]);
        assert_eq!(channel_bitrate(&settings, &p), 24);
    }

    #[test]
    fn channel_bitrate_is_clamped() {
        let settings = Settings {
            max_audio: 40,
            ..audio_on()
        };
        let p = profile(10.0, vec![stereo("aac", None)]);
        assert_eq!(channel_bitrate(&settings, &p), 40);
    }

    #[test]
    fn no_audio_means_zero() {
        let p = profile(10.0, vec![stereo("aac", None)]);
        assert_eq!(compute_audio_bitrate(&Settings::default(), &p), 0);
        assert_eq!(audio_args(&Settings::default(), &p), vec!["-an"]);
        assert_eq!(compute_audio_bitrate(&audio_on(), &profile(10.0, vec![])), 0);
    }

    #[test]
    fn sum_is_per_channel_times_channels() {
        let settings = audio_on();
        let p = profile(
            10.0,
            vec![
                stereo("aac", None),
                AudioStream {
                    channels: 6,
                    bitrate: None,
                    codec: "ac3".to_string(),
                },
            ],
        );
        let per_channel = channel_bitrate(&settings, &p);
        assert_eq!(compute_audio_bitrate(&settings, &p), per_channel * 8);
    }

    #[test]
    fn vorbis_within_budget_is_copied() {
        let settings = audio_on();
        let p = profile(10.0, vec![stereo("vorbis", Some(100))]);
        // planned: 2 * 64 = 128 Kbps, input 100 Kbps
        assert!(copy_stream(&settings, &p, &p.audio[0]));
        assert_eq!(compute_audio_bitrate(&settings, &p), 100);
        assert_eq!(audio_args(&settings, &p), vec!["-c:a:0", "copy"]);

        let no_copy = Settings {
            no_copy: true,
            ..audio_on()
        };
        assert!(!copy_stream(&no_copy, &p, &p.audio[0]));
    }

    #[test]
    fn expensive_or_foreign_streams_are_reencoded() {
        let settings = audio_on();
        let p = profile(10.0, vec![stereo("vorbis", Some(320)), stereo("opus", Some(64))]);
        assert!(!copy_stream(&settings, &p, &p.audio[0]));
        assert!(!copy_stream(&settings, &p, &p.audio[1]));

        let opus = Settings {
            audio_codec: AudioCodec::Opus,
            ..audio_on()
        };
        assert!(copy_stream(&opus, &p, &p.audio[1]));

        let forced = Settings {
            force_copy: true,
            ..audio_on()
        };
        assert!(copy_stream(&forced, &p, &p.audio[0]));
    }

    #[test]
    fn encoder_args_per_stream() {
        let settings = Settings {
            force_stereo: true,
            ..audio_on()
        };
        let p = profile(10.0, vec![stereo("aac", None)]);
        assert_eq!(
            audio_args(&settings, &p),
            vec!["-c:a:0", "libvorbis", "-b:a:0", "128K", "-ac", "2"]
        );
    }
}
