//! Encoder invocation: ffmpeg argument assembly, the `Encoder` and
//! `OutputSizer` collaborators, and the `AttemptExecutor` tying them together.

use log::{debug, info};
use std::collections::VecDeque;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use strum_macros::{Display, EnumIter};

use crate::audio::audio_args;
use crate::error::EncodeError;
use crate::filter::filter_string;
use crate::media::MediaProfile;
use crate::settings::Settings;

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;
const QMAX_CEILING: &str = "50";

/// Rate-control strategy of one attempt.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Display, EnumIter)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Mode {
    /// Variable bitrate with a quantizer ceiling.
    Qmax,
    Vbr,
    /// Bitrate pinned through min/max rate; the encoder may drop frames.
    Cbr,
}

impl Mode {
    pub fn video_args(self, bitrate: u32) -> Vec<String> {
        let rate = format!("{}K", bitrate);
        let mut args = vec!["-b:v".to_string(), rate.clone()];
        match self {
            Mode::Qmax => args.extend(["-qmax".to_string(), QMAX_CEILING.to_string()]),
            Mode::Vbr => {}
            Mode::Cbr => args.extend([
                "-minrate:v".to_string(),
                rate.clone(),
                "-maxrate:v".to_string(),
                rate,
            ]),
        }
        args
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Pass {
    Single,
    First,
    Second,
}

/// Bitrate, dimensions and mode chosen for one attempt.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct AttemptPlan {
    pub bitrate: u32,
    pub height: u32,
    pub fps: f64,
    pub mode: Mode,
}

/// Everything needed to invoke the encoder once.
#[derive(Clone, Debug)]
pub struct EncodeJob<'a> {
    pub settings: &'a Settings,
    pub profile: &'a MediaProfile,
    pub plan: AttemptPlan,
    pub filter: Option<String>,
    pub out_path: PathBuf,
    pub passlog: PathBuf,
    /// Skip pass 1 and encode from the statistics already in `passlog`.
    pub reuse_stats: bool,
}

fn strings<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl<'a> EncodeJob<'a> {
    pub fn new(
        settings: &'a Settings,
        profile: &'a MediaProfile,
        plan: AttemptPlan,
        out_path: &Path,
    ) -> Self {
        Self {
            settings,
            profile,
            plan,
            filter: filter_string(profile, plan.height, plan.fps),
            out_path: out_path.to_path_buf(),
            passlog: passlog_prefix(out_path),
            reuse_stats: false,
        }
    }

    pub fn passes(&self) -> &'static [Pass] {
        if self.settings.passes == 2 && self.reuse_stats {
            &[Pass::Second]
        } else if self.settings.passes == 2 {
            &[Pass::First, Pass::Second]
        } else {
            &[Pass::Single]
        }
    }

    fn map_args(&self) -> Vec<String> {
        let mut args = strings(["-map", "0:v"]);
        for index in 0..self.profile.output_audio(self.settings).len() {
            args.push("-map".to_string());
            args.push(format!("0:a:{}", index));
        }
        args
    }

    fn trim_input_args(&self) -> (Vec<String>, Vec<String>) {
        let mut before = Vec::new();
        let mut after = Vec::new();
        if self.profile.start > 0.0 {
            before.extend(["-ss".to_string(), self.profile.start.to_string()]);
        }
        if self.profile.cut_end {
            after.extend(["-t".to_string(), self.profile.duration.to_string()]);
        }
        (before, after)
    }

    /// First stage: decode (and apply user filters / trim) into a Matroska stream on stdout.
    pub fn raw_stage_args(&self, pass: Pass) -> Vec<String> {
        let settings = self.settings;
        let mut args = strings(["-hide_banner", "-v", "panic"]);

        let (before, after) = self.trim_input_args();
        args.extend(before);
        args.push("-i".to_string());
        args.push(self.profile.path.to_string_lossy().into_owned());
        args.extend(after);
        args.extend(self.map_args());

        if settings.video_filters() || settings.is_trimmed() {
            args.extend(strings(["-c:v", "rawvideo"]));
        } else {
            args.extend(strings(["-c:v", "copy"]));
        }

        if pass == Pass::First || !settings.audio {
            args.push("-an".to_string());
        } else if settings.audio_filters() || settings.is_trimmed() {
            args.extend(strings(["-c:a", "pcm_s16le"]));
        } else {
            args.extend(strings(["-c:a", "copy"]));
        }

        if let Some(filter) = &settings.user_filter {
            args.push("-filter_complex".to_string());
            args.push(filter.graph.clone());
        }

        args.extend(strings(["-strict", "-2", "-f", "matroska", "-"]));
        args
    }

    /// Final stage producing the WebM (or the first-pass log).
    pub fn final_args(&self, pass: Pass) -> Vec<String> {
        let settings = self.settings;
        let mut args = strings(["-hide_banner", "-v", "error", "-stats", "-y"]);

        if settings.needs_raw_stage() {
            args.extend(strings(["-i", "-", "-map", "0"]));
        } else {
            args.push("-i".to_string());
            args.push(self.profile.path.to_string_lossy().into_owned());
            args.extend(self.map_args());
        }

        args.push("-c:v".to_string());
        args.push(settings.video_codec.ffmpeg_name().to_string());
        args.extend(self.plan.mode.video_args(self.plan.bitrate));

        if settings.transparency {
            args.extend(strings(["-pix_fmt", "yuva420p", "-auto-alt-ref", "0"]));
        } else {
            args.extend(strings([
                "-pix_fmt",
                "yuv420p",
                "-auto-alt-ref",
                "1",
                "-lag-in-frames",
                "25",
                "-arnr-maxframes",
                "15",
                "-arnr-strength",
                "6",
            ]));
        }

        if let Some(threads) = settings.threads {
            args.push("-threads".to_string());
            args.push(threads.to_string());
        }

        if let Some(filter) = &self.filter {
            args.push("-vf".to_string());
            args.push(filter.clone());
        }

        let cpu_used = if pass == Pass::First { "5" } else { "0" };
        args.extend(strings(["-deadline", "good", "-cpu-used", cpu_used]));

        if pass == Pass::First {
            args.push("-an".to_string());
        } else {
            args.extend(audio_args(settings, self.profile));
        }

        let pass_number = match pass {
            Pass::Single => None,
            Pass::First => Some("1"),
            Pass::Second => Some("2"),
        };
        if let Some(number) = pass_number {
            args.extend(strings(["-pass", number, "-passlogfile"]));
            args.push(self.passlog.to_string_lossy().into_owned());
        }

        if pass == Pass::First {
            args.extend(strings(["-f", "null", "-"]));
        } else {
            args.push(self.out_path.to_string_lossy().into_owned());
        }
        args
    }
}

/// Prefix ffmpeg uses for two-pass statistics next to `out_path`.
pub fn passlog_prefix(out_path: &Path) -> PathBuf {
    out_path.with_extension("passlog")
}

/// Files ffmpeg leaves behind for a pass-log prefix.
pub fn passlog_files(prefix: &Path) -> Vec<PathBuf> {
    let base = prefix.to_string_lossy();
    vec![
        PathBuf::from(format!("{}-0.log", base)),
        PathBuf::from(format!("{}-0.log.mbtree", base)),
    ]
}

fn display_command(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        if arg.contains(' ') || arg.is_empty() {
            line.push('"');
            line.push_str(arg);
            line.push('"');
        } else {
            line.push_str(arg);
        }
    }
    line
}

/// Produces the output file described by a job.
pub trait Encoder {
    fn encode(&mut self, job: &EncodeJob<'_>) -> Result<(), EncodeError>;
}

/// Runs ffmpeg, piping through a raw intermediate stage when user filters or trimming are active.
#[derive(Debug, Default)]
pub struct FfmpegEncoder;

impl FfmpegEncoder {
    fn run_pass(&self, job: &EncodeJob<'_>, pass: Pass) -> Result<(), EncodeError> {
        let final_args = job.final_args(pass);

        if !job.settings.needs_raw_stage() {
            debug!("{}", display_command("ffmpeg", &final_args));
            let status = Command::new("ffmpeg")
                .args(&final_args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .status()
                .map_err(|source| EncodeError::Spawn {
                    program: "ffmpeg",
                    source,
                })?;
            if !status.success() {
                return Err(EncodeError::Exit {
                    program: "ffmpeg",
                    status: status.to_string(),
                });
            }
            return Ok(());
        }

        let raw_args = job.raw_stage_args(pass);
        debug!(
            "{} | {}",
            display_command("ffmpeg", &raw_args),
            display_command("ffmpeg", &final_args)
        );

        let mut raw = Command::new("ffmpeg")
            .args(&raw_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| EncodeError::Spawn {
                program: "ffmpeg",
                source,
            })?;

        let raw_out = match raw.stdout.take() {
            Some(out) => out,
            None => {
                let _ = raw.kill();
                let _ = raw.wait();
                return Err(EncodeError::Spawn {
                    program: "ffmpeg",
                    source: io::Error::new(io::ErrorKind::BrokenPipe, "raw stage has no stdout"),
                });
            }
        };

        let encode_status = Command::new("ffmpeg")
            .args(&final_args)
            .stdin(Stdio::from(raw_out))
            .stdout(Stdio::null())
            .status();

        let encode_status = match encode_status {
            Ok(status) => status,
            Err(source) => {
                let _ = raw.kill();
                let _ = raw.wait();
                return Err(EncodeError::Spawn {
                    program: "ffmpeg",
                    source,
                });
            }
        };
        let raw_status = raw.wait().map_err(|source| EncodeError::Spawn {
            program: "ffmpeg",
            source,
        })?;

        if !encode_status.success() {
            return Err(EncodeError::Exit {
                program: "ffmpeg",
                status: encode_status.to_string(),
            });
        }
        if !raw_status.success() {
            return Err(EncodeError::Exit {
                program: "ffmpeg",
                status: format!("{} (raw stage)", raw_status),
            });
        }
        Ok(())
    }
}

impl Encoder for FfmpegEncoder {
    fn encode(&mut self, job: &EncodeJob<'_>) -> Result<(), EncodeError> {
        for pass in job.passes() {
            self.run_pass(job, *pass)?;
        }
        Ok(())
    }
}

/// Prints the commands that would run instead of running them.
#[derive(Debug, Default)]
pub struct DryRunEncoder;

impl Encoder for DryRunEncoder {
    fn encode(&mut self, job: &EncodeJob<'_>) -> Result<(), EncodeError> {
        for pass in job.passes() {
            let final_args = job.final_args(*pass);
            if job.settings.needs_raw_stage() {
                println!(
                    "{} | {}",
                    display_command("ffmpeg", &job.raw_stage_args(*pass)),
                    display_command("ffmpeg", &final_args)
                );
            } else {
                println!("{}", display_command("ffmpeg", &final_args));
            }
        }
        Ok(())
    }
}

/// Measures what an attempt produced.
pub trait OutputSizer {
    fn output_size(&mut self, job: &EncodeJob<'_>) -> Result<u64, EncodeError>;
}

/// Size of the file on disk.
#[derive(Debug, Default)]
pub struct FileSizer;

impl OutputSizer for FileSizer {
    fn output_size(&mut self, job: &EncodeJob<'_>) -> Result<u64, EncodeError> {
        fs::metadata(&job.out_path)
            .map(|meta| meta.len())
            .map_err(|err| EncodeError::Measure(format!("{}: {}", job.out_path.display(), err)))
    }
}

/// Pre-recorded sizes, consumed one per attempt.
#[derive(Debug, Default)]
pub struct ScriptedSizes {
    sizes: VecDeque<u64>,
}

impl ScriptedSizes {
    pub fn new(sizes: impl IntoIterator<Item = u64>) -> Self {
        Self {
            sizes: sizes.into_iter().collect(),
        }
    }

    pub fn from_mib(sizes: &[f64]) -> Self {
        Self::new(sizes.iter().map(|mib| (mib * BYTES_PER_MIB) as u64))
    }
}

impl OutputSizer for ScriptedSizes {
    fn output_size(&mut self, _job: &EncodeJob<'_>) -> Result<u64, EncodeError> {
        self.sizes
            .pop_front()
            .ok_or_else(|| EncodeError::Measure("no scripted size left".to_string()))
    }
}

/// Asks the user for each attempt's size in MiB.
#[derive(Debug, Default)]
pub struct PromptedSize;

impl OutputSizer for PromptedSize {
    fn output_size(&mut self, _job: &EncodeJob<'_>) -> Result<u64, EncodeError> {
        print!("Output size in MiB: ");
        io::stdout()
            .flush()
            .map_err(|err| EncodeError::Measure(err.to_string()))?;
        let mut line = String::new();
        io::stdin()
            .lock()
            .read_line(&mut line)
            .map_err(|err| EncodeError::Measure(err.to_string()))?;
        let mib: f64 = line
            .trim()
            .parse()
            .map_err(|_| EncodeError::Measure(format!("'{}' is not a number", line.trim())))?;
        if mib < 0.0 {
            return Err(EncodeError::Measure("size can't be negative".to_string()));
        }
        Ok((mib * BYTES_PER_MIB) as u64)
    }
}

/// Runs one attempt: builds the job, encodes and measures.
pub struct AttemptExecutor {
    encoder: Box<dyn Encoder>,
    sizer: Box<dyn OutputSizer>,
    // Height and fps bits of the frames the current pass log describes.
    stats_for: Option<(u32, u64)>,
}

impl AttemptExecutor {
    pub fn new(encoder: Box<dyn Encoder>, sizer: Box<dyn OutputSizer>) -> Self {
        Self {
            encoder,
            sizer,
            stats_for: None,
        }
    }

    pub fn ffmpeg() -> Self {
        Self::new(Box::new(FfmpegEncoder), Box::new(FileSizer))
    }

    pub fn dry_run(sizes: Option<&[f64]>) -> Self {
        let sizer: Box<dyn OutputSizer> = match sizes {
            Some(sizes) => Box::new(ScriptedSizes::from_mib(sizes)),
            None => Box::new(PromptedSize),
        };
        Self::new(Box::new(DryRunEncoder), sizer)
    }

    pub fn run(
        &mut self,
        settings: &Settings,
        profile: &MediaProfile,
        plan: AttemptPlan,
        out_path: &Path,
    ) -> Result<u64, EncodeError> {
        let mut job = EncodeJob::new(settings, profile, plan, out_path);
        let frames = (plan.height, plan.fps.to_bits());
        job.reuse_stats = settings.passes == 2
            && self.stats_for == Some(frames)
            && passlog_files(&job.passlog)[0].is_file();
        if job.reuse_stats {
            debug!("Reusing first pass statistics from {}", job.passlog.display());
        }
        info!(
            "Encoding {} at {}K, {}p @ {:.3} fps{}",
            plan.mode,
            plan.bitrate,
            plan.height,
            plan.fps,
            job.filter
                .as_deref()
                .map(|f| format!(" ({})", f))
                .unwrap_or_default()
        );
        self.stats_for = None;
        self.encoder.encode(&job)?;
        if settings.passes == 2 {
            self.stats_for = Some(frames);
        }
        self.sizer.output_size(&job)
    }
}
