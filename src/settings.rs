//! Immutable run configuration shared by every attempt of every input.

use anyhow::{bail, Result};
use clap::ValueEnum;
use serde::Deserialize;
use strum::IntoEnumIterator;
use strum_macros::Display;

use crate::encoder::Mode;

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// Lowest per-channel audio bitrate (Kbps) the Vorbis/Opus encoders accept.
pub const MIN_AUDIO_CHANNEL_BITRATE: u32 = 24;

/// Candidate frame rates tried after the input's own rate, highest first.
pub const DEFAULT_FPS_LADDER: &[f64] = &[
    60.0, 30.0, 24.0, 22.0, 20.0, 18.0, 16.0, 14.0, 12.0, 10.0, 8.0, 6.0, 4.0, 2.0, 1.0,
];

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[value(name = "vp8", alias = "libvpx")]
    #[strum(serialize = "libvpx")]
    Vp8,
    #[value(name = "vp9", alias = "libvpx-vp9")]
    #[strum(serialize = "libvpx-vp9")]
    Vp9,
}

impl VideoCodec {
    pub fn ffmpeg_name(self) -> &'static str {
        match self {
            VideoCodec::Vp8 => "libvpx",
            VideoCodec::Vp9 => "libvpx-vp9",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    #[strum(serialize = "libvorbis")]
    Vorbis,
    #[strum(serialize = "libopus")]
    Opus,
}

impl AudioCodec {
    pub fn ffmpeg_name(self) -> &'static str {
        match self {
            AudioCodec::Vorbis => "libvorbis",
            AudioCodec::Opus => "libopus",
        }
    }

    /// Input codec names (ffprobe `codec_name`) that can be copied into the output as-is.
    pub fn copyable_codecs(self) -> &'static [&'static str] {
        match self {
            AudioCodec::Vorbis => &["vorbis"],
            AudioCodec::Opus => &["vorbis", "opus"],
        }
    }
}

/// A user supplied `-filter_complex` graph and what kind of streams it touches.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UserFilter {
    pub graph: String,
    pub has_video: bool,
    pub has_audio: bool,
}

impl UserFilter {
    pub fn forces_scale(&self) -> bool {
        self.graph.contains("scale")
    }

    pub fn forces_fps(&self) -> bool {
        self.graph.contains("fps")
    }
}

/// Byte window the output has to land in.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SizeLimits {
    pub lower: u64,
    pub upper: u64,
}

impl SizeLimits {
    pub fn contains(&self, size: u64) -> bool {
        self.lower <= size && size <= self.upper
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    /// Output size limit in MiB.
    pub size_mib: f64,
    /// Fraction of the limit below which an output counts as too small.
    pub undershoot: f64,
    pub iterations: u32,
    pub min_bitrate_ratio: f64,
    pub skip_threshold: f64,
    pub bpp_threshold: f64,
    pub min_height: u32,
    pub max_height: u32,
    pub min_fps: f64,
    pub max_fps: f64,
    pub fps_ladder: Vec<f64>,
    pub user_filter: Option<UserFilter>,
    pub audio: bool,
    pub audio_codec: AudioCodec,
    /// Per-channel audio bitrate bounds in Kbps.
    pub min_audio: u32,
    pub max_audio: u32,
    pub audio_factor: f64,
    pub force_stereo: bool,
    pub basic_format: bool,
    pub no_copy: bool,
    pub force_copy: bool,
    pub video_codec: VideoCodec,
    pub passes: u8,
    pub threads: Option<u32>,
    pub transparency: bool,
    pub start: Option<f64>,
    pub end: Option<f64>,
    pub skip_qmax: bool,
    pub skip_cbr: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            size_mib: 3.0,
            undershoot: 0.75,
            iterations: 3,
            min_bitrate_ratio: 0.9,
            skip_threshold: 0.01,
            bpp_threshold: 0.075,
            min_height: 240,
            max_height: 9999,
            min_fps: 24.0,
            max_fps: 9999.0,
            fps_ladder: DEFAULT_FPS_LADDER.to_vec(),
            user_filter: None,
            audio: false,
            audio_codec: AudioCodec::Vorbis,
            min_audio: MIN_AUDIO_CHANNEL_BITRATE,
            max_audio: 9999,
            audio_factor: 5.5,
            force_stereo: false,
            basic_format: false,
            no_copy: false,
            force_copy: false,
            video_codec: VideoCodec::Vp8,
            passes: 2,
            threads: None,
            transparency: false,
            start: None,
            end: None,
            skip_qmax: false,
            skip_cbr: false,
        }
    }
}

impl Settings {
    pub fn target_size_bytes(&self) -> u64 {
        (self.size_mib * BYTES_PER_MIB) as u64
    }

    pub fn limits(&self) -> SizeLimits {
        let upper = self.target_size_bytes();
        SizeLimits {
            lower: (upper as f64 * self.undershoot) as u64,
            upper,
        }
    }

    /// Rate-control modes in the order the shrink phase walks them.
    pub fn modes(&self) -> Vec<Mode> {
        Mode::iter()
            .filter(|mode| match mode {
                Mode::Qmax => !self.skip_qmax,
                Mode::Vbr => true,
                Mode::Cbr => !self.skip_cbr,
            })
            .collect()
    }

    pub fn user_scale(&self) -> bool {
        self.user_filter.as_ref().is_some_and(UserFilter::forces_scale)
    }

    pub fn user_fps(&self) -> bool {
        self.user_filter.as_ref().is_some_and(UserFilter::forces_fps)
    }

    pub fn video_filters(&self) -> bool {
        self.user_filter.as_ref().is_some_and(|f| f.has_video)
    }

    pub fn audio_filters(&self) -> bool {
        self.user_filter.as_ref().is_some_and(|f| f.has_audio)
    }

    pub fn is_trimmed(&self) -> bool {
        self.start.is_some_and(|s| s > 0.0) || self.end.is_some()
    }

    /// Whether the input has to be decoded to a raw intermediate before the final encode.
    pub fn needs_raw_stage(&self) -> bool {
        self.user_filter.is_some() || self.is_trimmed()
    }

    pub fn validate(&self) -> Result<()> {
        let floats = [
            ("--size", Some(self.size_mib)),
            ("--undershoot", Some(self.undershoot)),
            ("--min-bitrate-ratio", Some(self.min_bitrate_ratio)),
            ("--skip-threshold", Some(self.skip_threshold)),
            ("--bpp", Some(self.bpp_threshold)),
            ("--min-fps", Some(self.min_fps)),
            ("--max-fps", Some(self.max_fps)),
            ("--audio-factor", Some(self.audio_factor)),
            ("--start", self.start),
            ("--end", self.end),
        ];
        if let Some((flag, _)) = floats
            .iter()
            .find(|(_, value)| value.is_some_and(|v| !v.is_finite()))
        {
            bail!("{} must be a finite number!", flag);
        }
        if self.size_mib <= 0.0 {
            bail!("--size must be greater than 0!");
        }
        if self.iterations < 1 {
            bail!("--iterations must be at least 1!");
        }
        if self.min_audio < MIN_AUDIO_CHANNEL_BITRATE || self.max_audio < MIN_AUDIO_CHANNEL_BITRATE {
            bail!(
                "Max/min audio bitrate too low (must be >= {} Kbps)!",
                MIN_AUDIO_CHANNEL_BITRATE
            );
        }
        if self.min_audio > self.max_audio {
            bail!("--min-audio can't be greater than --max-audio!");
        }
        if self.start.is_some_and(|s| s < 0.0) || self.end.is_some_and(|e| e < 0.0) {
            bail!("--start/--end can't be less than 0!");
        }
        if let (Some(end), start) = (self.end, self.start.unwrap_or(0.0)) {
            if end <= start {
                bail!("--end can't be less or equal than --start!");
            }
        }
        if self.no_copy && self.force_copy {
            bail!("--no-copy/--force-copy are mutually exclusive!");
        }
        if !(0.0..=1.0).contains(&self.undershoot) {
            bail!("--undershoot must be in the range [0, 1]!");
        }
        if self.min_bitrate_ratio <= 0.0 || self.min_bitrate_ratio > 1.0 {
            bail!("--min-bitrate-ratio must be in the range (0, 1]!");
        }
        if self.skip_threshold < 0.0 {
            bail!("--skip-threshold can't be negative!");
        }
        if self.bpp_threshold <= 0.0 {
            bail!("--bpp must be greater than 0!");
        }
        if self.min_height == 0 {
            bail!("--min-height must be greater than 0!");
        }
        if self.max_height == 0 {
            bail!("--max-height must be greater than 0!");
        }
        if self.min_height > self.max_height {
            bail!("--min-height can't be greater than --max-height!");
        }
        if self.min_fps < 1.0 {
            bail!("--min-fps can't be less than 1!");
        }
        if self.min_fps > self.max_fps {
            bail!("--max-fps can't be less than --min-fps!");
        }
        if !matches!(self.passes, 1 | 2) {
            bail!("--passes must be 1 or 2!");
        }
        Ok(())
    }
}
