//! Input inspection: the ffprobe adapter and the `MediaProfile` snapshot built from it.

use log::{debug, warn};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::error::FitError;
use crate::settings::{Settings, UserFilter};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StreamKind {
    Video,
    Audio,
    Subtitle,
    Other,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StreamInfo {
    pub kind: StreamKind,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub channels: Option<u32>,
    /// Bits per second, as reported by the container.
    pub bitrate: Option<u64>,
    pub codec: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProbeReport {
    pub duration: Option<f64>,
    pub streams: Vec<StreamInfo>,
}

impl ProbeReport {
    pub fn first_video(&self) -> Option<&StreamInfo> {
        self.streams.iter().find(|s| s.kind == StreamKind::Video)
    }

    pub fn audio_streams(&self) -> impl Iterator<Item = &StreamInfo> {
        self.streams.iter().filter(|s| s.kind == StreamKind::Audio)
    }
}

/// Source of stream information for inputs and intermediate files.
pub trait Prober {
    fn probe(&self, path: &Path) -> Result<ProbeReport, FitError>;

    /// Duration measured by encoding the input, for images and animated GIFs
    /// whose containers carry no duration.
    fn brute_duration(&self, path: &Path) -> Result<f64, FitError>;

    /// Probe of a short trial encode with the user filter graph applied.
    fn probe_filtered(&self, path: &Path, graph: &str) -> Result<ProbeReport, FitError>;
}

#[derive(Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    channels: Option<u32>,
    bit_rate: Option<String>,
}

#[derive(Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

/// Parses `ffprobe -show_format -show_streams -of json` output.
pub fn parse_probe_json(json: &str) -> serde_json::Result<ProbeReport> {
    let raw: FfprobeOutput = serde_json::from_str(json)?;
    let duration = raw
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0);

    let streams = raw
        .streams
        .into_iter()
        .map(|s| StreamInfo {
            kind: match s.codec_type.as_deref() {
                Some("video") => StreamKind::Video,
                Some("audio") => StreamKind::Audio,
                Some("subtitle") => StreamKind::Subtitle,
                _ => StreamKind::Other,
            },
            width: s.width,
            height: s.height,
            fps: s.avg_frame_rate.as_deref().and_then(parse_frame_rate),
            channels: s.channels,
            bitrate: s.bit_rate.and_then(|b| b.trim().parse::<u64>().ok()),
            codec: s.codec_name.map(|c| c.to_ascii_lowercase()),
        })
        .collect();

    Ok(ProbeReport { duration, streams })
}

/// ffprobe reports frame rates as `num/den`; still images report `0/0`.
pub fn parse_frame_rate(value: &str) -> Option<f64> {
    let value = value.trim();
    if let Some((num, den)) = value.split_once('/') {
        let num = num.trim().parse::<f64>().ok()?;
        let den = den.trim().parse::<f64>().ok()?;
        if den == 0.0 || num == 0.0 {
            return Some(1.0);
        }
        Some(num / den)
    } else {
        value.parse::<f64>().ok()
    }
}

/// Prober backed by the `ffprobe`/`ffmpeg` command line tools.
#[derive(Clone, Debug)]
pub struct FfprobeProber {
    scratch_dir: PathBuf,
}

impl Default for FfprobeProber {
    fn default() -> Self {
        Self::new(std::env::temp_dir())
    }
}

impl FfprobeProber {
    pub fn new(scratch_dir: PathBuf) -> Self {
        Self { scratch_dir }
    }

    fn scratch_file(&self, tag: &str) -> PathBuf {
        self.scratch_dir
            .join(format!("webm_fit-{}-{}.mkv", std::process::id(), tag))
    }

    fn run_trial(&self, args: &[&str], out_path: &Path) -> Result<(), FitError> {
        let status = Command::new("ffmpeg")
            .args(["-y", "-v", "error"])
            .args(args)
            .arg(out_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .status()
            .map_err(|e| FitError::probe(out_path, format!("failed to launch ffmpeg: {}", e)))?;
        if !status.success() {
            let _ = fs::remove_file(out_path);
            return Err(FitError::probe(
                out_path,
                format!("trial encode exited with {}", status),
            ));
        }
        Ok(())
    }
}

impl Prober for FfprobeProber {
    fn probe(&self, path: &Path) -> Result<ProbeReport, FitError> {
        let output = Command::new("ffprobe")
            .args(["-v", "error", "-show_format", "-show_streams", "-of", "json"])
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| FitError::probe(path, format!("failed to launch ffprobe: {}", e)))?;

        if !output.status.success() {
            return Err(FitError::probe(
                path,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        parse_probe_json(&String::from_utf8_lossy(&output.stdout))
            .map_err(|e| FitError::probe(path, format!("unreadable ffprobe output: {}", e)))
    }

    fn brute_duration(&self, path: &Path) -> Result<f64, FitError> {
        let out_path = self.scratch_file("length");
        let input = path.to_string_lossy();
        self.run_trial(
            &[
                "-i", &input, "-map", "0:v", "-c:v", "libx264", "-preset", "ultrafast", "-crf",
                "51",
            ],
            &out_path,
        )?;
        let report = self.probe(&out_path);
        let _ = fs::remove_file(&out_path);
        report?
            .duration
            .ok_or_else(|| FitError::probe(path, "no duration even after a trial encode"))
    }

    fn probe_filtered(&self, path: &Path, graph: &str) -> Result<ProbeReport, FitError> {
        let out_path = self.scratch_file("filtered");
        let input = path.to_string_lossy();
        self.run_trial(
            &[
                "-i",
                &input,
                "-t",
                "0.1",
                "-map",
                "0:v",
                "-c:v",
                "rawvideo",
                "-filter_complex",
                graph,
                "-strict",
                "-2",
            ],
            &out_path,
        )?;
        let report = self.probe(&out_path);
        let _ = fs::remove_file(&out_path);
        report
    }
}

/// Works out which stream types a user filter graph touches by running it on
/// ffmpeg's null sources with stream copy: copying fails only when the graph
/// needs that stream type.
pub fn classify_user_filter(graph: &str) -> UserFilter {
    let touches = |source: &str, map: &str, codec: &str| -> bool {
        let status = Command::new("ffmpeg")
            .args(["-v", "panic", "-f", "lavfi", "-i", source, "-t", "0.1"])
            .args(["-map", map, codec, "copy", "-filter_complex", graph])
            .args(["-f", "null", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match status {
            Ok(status) => !status.success(),
            Err(err) => {
                warn!("Unable to classify filter graph '{}': {}", graph, err);
                true
            }
        }
    };

    let filter = UserFilter {
        graph: graph.to_string(),
        has_video: touches("nullsrc", "0:v", "-c:v"),
        has_audio: touches("anullsrc", "0:a?", "-c:a"),
    };
    debug!(
        "Filter graph '{}': video filters={}, audio filters={}",
        graph, filter.has_video, filter.has_audio
    );
    filter
}

#[derive(Clone, Debug, PartialEq)]
pub struct AudioStream {
    pub channels: u32,
    /// Kbps, when the container reports it.
    pub bitrate: Option<u32>,
    pub codec: String,
}

/// Immutable snapshot of everything the controller needs to know about one input.
#[derive(Clone, Debug, PartialEq)]
pub struct MediaProfile {
    pub path: PathBuf,
    /// Duration of the section being encoded, in seconds.
    pub duration: f64,
    /// Seek offset applied before encoding.
    pub start: f64,
    /// Whether the encoded section ends before the input does.
    pub cut_end: bool,
    pub height: u32,
    pub fps: f64,
    /// Width / height.
    pub ratio: f64,
    pub audio: Vec<AudioStream>,
}

impl MediaProfile {
    pub fn from_input(
        prober: &dyn Prober,
        settings: &Settings,
        path: &Path,
    ) -> Result<MediaProfile, FitError> {
        if !path.exists() {
            return Err(FitError::MissingInput);
        }

        let report = prober.probe(path)?;
        let in_duration = match report.duration {
            Some(duration) => duration,
            None => {
                debug!(
                    "'{}' reports no duration; measuring with a trial encode",
                    path.display()
                );
                prober.brute_duration(path)?
            }
        };
        let (start, duration, cut_end) = resolve_trim(settings, in_duration)?;

        let video_report;
        let video = match settings.user_filter.as_ref().filter(|f| f.has_video) {
            Some(filter) => {
                video_report = prober.probe_filtered(path, &filter.graph)?;
                video_report.first_video()
            }
            None => report.first_video(),
        }
        .ok_or_else(|| FitError::probe(path, "no video stream"))?;

        let height = video
            .height
            .filter(|h| *h > 0)
            .ok_or_else(|| FitError::probe(path, "video stream has no height"))?;
        let width = video
            .width
            .filter(|w| *w > 0)
            .ok_or_else(|| FitError::probe(path, "video stream has no width"))?;

        let audio = report
            .audio_streams()
            .map(|s| AudioStream {
                channels: s.channels.unwrap_or(2),
                bitrate: s.bitrate.map(|b| (b / 1000) as u32),
                codec: s.codec.clone().unwrap_or_default(),
            })
            .collect();

        Ok(MediaProfile {
            path: path.to_path_buf(),
            duration,
            start,
            cut_end,
            height,
            fps: video.fps.unwrap_or(1.0),
            ratio: width as f64 / height as f64,
            audio,
        })
    }

    /// Audio streams that end up in the output.
    pub fn output_audio(&self, settings: &Settings) -> &[AudioStream] {
        if !settings.audio {
            &[]
        } else if settings.basic_format {
            &self.audio[..self.audio.len().min(1)]
        } else {
            &self.audio
        }
    }

    pub fn output_channels(&self, settings: &Settings, stream: &AudioStream) -> u32 {
        if settings.force_stereo {
            2
        } else {
            stream.channels
        }
    }

    pub fn audio_channel_total(&self, settings: &Settings) -> u32 {
        self.output_audio(settings)
            .iter()
            .map(|s| self.output_channels(settings, s))
            .sum()
    }

    pub fn audio_stream_bitrates(&self) -> Vec<Option<u32>> {
        self.audio.iter().map(|s| s.bitrate).collect()
    }
}

/// Returns `(start, encoded duration, cut_end)` after validating the trim against the input.
pub fn resolve_trim(settings: &Settings, in_duration: f64) -> Result<(f64, f64, bool), FitError> {
    let start = settings.start.unwrap_or(0.0);
    if start > 0.0 && start >= in_duration {
        return Err(FitError::InvalidTrim(format!(
            "--start {} is greater than or equal the input duration {:.3}",
            start, in_duration
        )));
    }
    let end = match settings.end {
        Some(end) if end > in_duration => {
            return Err(FitError::InvalidTrim(format!(
                "--end {} is greater than the input duration {:.3}",
                end, in_duration
            )));
        }
        Some(end) => end,
        None => in_duration,
    };
    Ok((start, end - start, end < in_duration))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"{
        "streams": [
            {"index": 0, "codec_name": "h264", "codec_type": "video", "width": 1280, "height": 720, "avg_frame_rate": "30000/1001"},
            {"index": 1, "codec_name": "vorbis", "codec_type": "audio", "channels": 2, "bit_rate": "128000"},
            {"index": 2, "codec_name": "AAC", "codec_type": "audio", "channels": 6}
        ],
        "format": {"duration": "12.500000", "size": "1048576"}
    }"#;

    struct FakeProber {
        report: ProbeReport,
        brute: f64,
    }

    impl Prober for FakeProber {
        fn probe(&self, _path: &Path) -> Result<ProbeReport, FitError> {
            Ok(self.report.clone())
        }

        fn brute_duration(&self, _path: &Path) -> Result<f64, FitError> {
            Ok(self.brute)
        }

        fn probe_filtered(&self, _path: &Path, _graph: &str) -> Result<ProbeReport, FitError> {
            let mut report = self.report.clone();
            report.streams[0].height = Some(360);
            report.streams[0].width = Some(640);
            Ok(report)
        }
    }

    #[test]
    fn parses_ffprobe_json() {
        let report = parse_probe_json(SAMPLE).unwrap();
        assert_eq!(report.duration, Some(12.5));
        let video = report.first_video().unwrap();
        assert_eq!(video.height, Some(720));
        assert!((video.fps.unwrap() - 29.97).abs() < 0.01);
        let audio: Vec<_> = report.audio_streams().collect();
        assert_eq!(audio.len(), 2);
        assert_eq!(audio[0].bitrate, Some(128_000));
        assert_eq!(audio[1].codec.as_deref(), Some("aac"));
    }

    #[test]
    fn missing_duration_is_none() {
        let report =
            parse_probe_json(r#"{"streams": [], "format": {"duration": "N/A"}}"#).unwrap();
        assert_eq!(report.duration, None);
    }

    #[test]
    fn frame_rates() {
        assert_eq!(parse_frame_rate("24/1"), Some(24.0));
        assert_eq!(parse_frame_rate("0/0"), Some(1.0));
        assert_eq!(parse_frame_rate("25"), Some(25.0));
        assert_eq!(parse_frame_rate("x"), None);
    }

    #[test]
    fn profile_from_probe() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.mkv");
        fs::write(&input, b"x").unwrap();
        let prober = FakeProber {
            report: parse_probe_json(SAMPLE).unwrap(),
            brute: 0.0,
        };
        let settings = Settings {
            audio: true,
            ..Settings::default()
        };
        let profile = MediaProfile::from_input(&prober, &settings, &input).unwrap();
        assert_eq!(profile.height, 720);
        assert!((profile.ratio - 16.0 / 9.0).abs() < 1e-9);
        assert_eq!(profile.duration, 12.5);
        assert_eq!(profile.audio_channel_total(&settings), 8);
        assert_eq!(profile.audio_stream_bitrates(), vec![Some(128), None]);

        let basic = Settings {
            basic_format: true,
            force_stereo: true,
            ..settings.clone()
        };
        assert_eq!(profile.audio_channel_total(&basic), 2);
        assert_eq!(profile.audio_channel_total(&Settings::default()), 0);
    }

    #[test]
    fn profile_falls_back_to_brute_duration_and_filtered_video() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.gif");
        fs::write(&input, b"x").unwrap();
        let mut report = parse_probe_json(SAMPLE).unwrap();
        report.duration = None;
        let prober = FakeProber {
            report,
            brute: 3.0,
        };
        let settings = Settings {
            user_filter: Some(UserFilter {
                graph: "scale=-2:360".to_string(),
                has_video: true,
                has_audio: false,
            }),
            ..Settings::default()
        };
        let profile = MediaProfile::from_input(&prober, &settings, &input).unwrap();
        assert_eq!(profile.duration, 3.0);
        assert_eq!(profile.height, 360);
    }

    #[test]
    fn missing_input_is_reported() {
        let prober = FakeProber {
            report: ProbeReport::default(),
            brute: 0.0,
        };
        let err = MediaProfile::from_input(
            &prober,
            &Settings::default(),
            Path::new("/nonexistent/input.mkv"),
        )
        .unwrap_err();
        assert!(matches!(err, FitError::MissingInput));
    }

    #[test]
    fn trim_resolution() {
        let settings = Settings {
            start: Some(2.0),
            end: Some(8.0),
            ..Settings::default()
        };
        assert_eq!(resolve_trim(&settings, 10.0).unwrap(), (2.0, 6.0, true));
        assert!(resolve_trim(&settings, 7.0).is_err());

        let settings = Settings {
            start: Some(10.0),
            ..Settings::default()
        };
        assert!(matches!(
            resolve_trim(&settings, 10.0),
            Err(FitError::InvalidTrim(_))
        ));
        assert_eq!(
            resolve_trim(&Settings::default(), 4.0).unwrap(),
            (0.0, 4.0, false)
        );
    }
}
