use anyhow::{bail, Context, Result};
use clap::parser::ValueSource;
use clap::{value_parser, ArgMatches, CommandFactory, FromArgMatches, Parser};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use webm_fit::config::{self, Config, ConfigSource};
use webm_fit::controller::{ConvergenceController, FitReport};
use webm_fit::encoder::AttemptExecutor;
use webm_fit::error::FitError;
use webm_fit::logging::{init_logging, ErrorLog, DEFAULT_ERROR_LOG};
use webm_fit::media::{classify_user_filter, FfprobeProber, MediaProfile};
use webm_fit::settings::{AudioCodec, Settings, UserFilter, VideoCodec, DEFAULT_FPS_LADDER};
use webm_fit::workspace::Workspace;

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;
const DEFAULT_OUTPUT_DIR: &str = "webm_done";

#[derive(Parser, Clone, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Video files to convert
    #[arg(required = true, value_parser = value_parser!(PathBuf))]
    inputs: Vec<PathBuf>,

    /// Path to the configuration file
    #[arg(short, long, value_parser = value_parser!(PathBuf))]
    config_file: Option<PathBuf>,

    /// Output size limit in MiB
    #[arg(short, long, default_value_t = 3.0)]
    size: f64,

    /// Fraction of the size limit below which an output counts as too small
    #[arg(short, long, default_value_t = 0.75)]
    undershoot: f64,

    /// Attempts per rate-control mode (and for the grow phase)
    #[arg(short, long, default_value_t = 3)]
    iterations: u32,

    /// Smallest factor a bitrate may be reduced to between two attempts
    #[arg(long, default_value_t = 0.9)]
    min_bitrate_ratio: f64,

    /// Leave a mode early when the output size changes by less than this fraction
    #[arg(long, default_value_t = 0.01)]
    skip_threshold: f64,

    /// Bits per pixel below which resolution and frame rate get reduced
    #[arg(long, default_value_t = 0.075)]
    bpp: f64,

    #[arg(long, default_value_t = 240)]
    min_height: u32,

    #[arg(long, default_value_t = 9999)]
    max_height: u32,

    #[arg(long, default_value_t = 24.0)]
    min_fps: f64,

    #[arg(long, default_value_t = 9999.0)]
    max_fps: f64,

    /// Keep the audio streams
    #[arg(short, long, default_value_t = false)]
    audio: bool,

    #[arg(long, value_enum, default_value_t = AudioCodec::Vorbis)]
    audio_codec: AudioCodec,

    /// Lowest per-channel audio bitrate in Kbps
    #[arg(long, default_value_t = 24)]
    min_audio: u32,

    /// Highest per-channel audio bitrate in Kbps
    #[arg(long, default_value_t = 9999)]
    max_audio: u32,

    /// Divisor controlling how much of the size goes to audio
    #[arg(long, default_value_t = 5.5)]
    audio_factor: f64,

    /// Downmix every audio stream to stereo
    #[arg(long, default_value_t = false)]
    force_stereo: bool,

    /// Only keep the first audio stream
    #[arg(long, default_value_t = false)]
    basic_format: bool,

    /// Always re-encode audio
    #[arg(long, default_value_t = false)]
    no_copy: bool,

    /// Copy compatible audio streams regardless of their bitrate
    #[arg(long, default_value_t = false)]
    force_copy: bool,

    #[arg(long, value_enum, default_value_t = VideoCodec::Vp8)]
    video_codec: VideoCodec,

    /// Encoder passes per attempt (1 or 2)
    #[arg(short, long, default_value_t = 2, value_parser = value_parser!(u8).range(1..=2))]
    passes: u8,

    #[arg(long)]
    threads: Option<u32>,

    /// ffmpeg filter graph applied before encoding (-filter_complex syntax)
    #[arg(short, long)]
    filter: Option<String>,

    /// Start time in seconds
    #[arg(long)]
    start: Option<f64>,

    /// End time in seconds
    #[arg(long)]
    end: Option<f64>,

    /// Keep the alpha channel
    #[arg(long, default_value_t = false)]
    transparency: bool,

    /// Skip the quantizer-capped VBR mode
    #[arg(long, default_value_t = false)]
    no_qmax: bool,

    /// Skip the constant bitrate mode
    #[arg(long, default_value_t = false)]
    no_cbr: bool,

    /// Output directory (defaults to 'webm_done' next to each input)
    #[arg(short, long, value_parser = value_parser!(PathBuf))]
    output_dir: Option<PathBuf>,

    /// File failed inputs are recorded in
    #[arg(long, default_value = DEFAULT_ERROR_LOG, value_parser = value_parser!(PathBuf))]
    error_log: PathBuf,

    /// Print the ffmpeg commands instead of running them
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Output sizes (MiB) reported for each dry-run attempt; prompts when absent
    #[arg(long, value_delimiter = ',', requires = "dry_run")]
    dry_run_sizes: Option<Vec<f64>>,
}

impl Args {
    fn settings(&self, user_filter: Option<UserFilter>) -> Settings {
        Settings {
            size_mib: self.size,
            undershoot: self.undershoot,
            iterations: self.iterations,
            min_bitrate_ratio: self.min_bitrate_ratio,
            skip_threshold: self.skip_threshold,
            bpp_threshold: self.bpp,
            min_height: self.min_height,
            max_height: self.max_height,
            min_fps: self.min_fps,
            max_fps: self.max_fps,
            fps_ladder: DEFAULT_FPS_LADDER.to_vec(),
            user_filter,
            audio: self.audio,
            audio_codec: self.audio_codec,
            min_audio: self.min_audio,
            max_audio: self.max_audio,
            audio_factor: self.audio_factor,
            force_stereo: self.force_stereo,
            basic_format: self.basic_format,
            no_copy: self.no_copy,
            force_copy: self.force_copy,
            video_codec: self.video_codec,
            passes: self.passes,
            threads: self.threads,
            transparency: self.transparency,
            start: self.start,
            end: self.end,
            skip_qmax: self.no_qmax,
            skip_cbr: self.no_cbr,
        }
    }

    fn output_dir_for(&self, input: &Path) -> PathBuf {
        match &self.output_dir {
            Some(dir) => dir.clone(),
            None => input
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."))
                .join(DEFAULT_OUTPUT_DIR),
        }
    }
}

fn cli_value_provided(matches: &ArgMatches, id: &str) -> bool {
    matches!(matches.value_source(id), Some(ValueSource::CommandLine))
}

fn apply_config_overrides(args: &mut Args, cfg: &Config, matches: &ArgMatches) {
    macro_rules! from_config {
        ($($field:ident),+ $(,)?) => {
            $(if !cli_value_provided(matches, stringify!($field)) {
                if let Some(value) = cfg.$field.clone() {
                    args.$field = value;
                }
            })+
        };
    }

    from_config!(
        size,
        undershoot,
        iterations,
        min_bitrate_ratio,
        skip_threshold,
        bpp,
        min_height,
        max_height,
        min_fps,
        max_fps,
        audio,
        audio_codec,
        min_audio,
        max_audio,
        audio_factor,
        force_stereo,
        basic_format,
        no_copy,
        force_copy,
        video_codec,
        passes,
        transparency,
        no_qmax,
        no_cbr,
        error_log,
    );

    if args.threads.is_none() {
        args.threads = cfg.threads;
    }
    if args.output_dir.is_none() {
        args.output_dir = cfg.output_dir.clone();
    }
}

fn process_file(
    args: &Args,
    settings: &Settings,
    prober: &FfprobeProber,
    input: &Path,
    interrupt: &Arc<AtomicBool>,
) -> Result<FitReport, FitError> {
    let profile = MediaProfile::from_input(prober, settings, input)?;
    info!(
        "'{}': {:.2}s, {}p @ {:.3} fps, {} audio stream(s)",
        input.display(),
        profile.duration,
        profile.height,
        profile.fps,
        profile.output_audio(settings).len()
    );

    let workspace = Workspace::prepare(&args.output_dir_for(input), input, args.dry_run)?;
    let mut executor = if args.dry_run {
        AttemptExecutor::dry_run(args.dry_run_sizes.as_deref())
    } else {
        AttemptExecutor::ffmpeg()
    };

    let report = ConvergenceController::new(settings, &mut executor)
        .with_interrupt(Arc::clone(interrupt))
        .fit(&profile, &workspace)?;

    match report.error(settings.limits()) {
        Some(err) => Err(err),
        None => {
            info!(
                "Wrote '{}' ({:.2} MiB, {} attempt(s))",
                workspace.out_path().display(),
                report.best_size() as f64 / BYTES_PER_MIB,
                report.attempts.len()
            );
            Ok(report)
        }
    }
}

fn main() -> Result<()> {
    init_logging();

    let mut matches = Args::command().get_matches();
    let mut args = Args::from_arg_matches_mut(&mut matches)?;

    let loaded_config = config::load(args.config_file.as_deref())?;
    if let Some((cfg, source)) = &loaded_config {
        match source {
            ConfigSource::Cli(path) => {
                info!("Loaded configuration from '{}'.", path.display());
            }
            ConfigSource::Env(path) => {
                info!(
                    "Loaded configuration from '{}' (via {}).",
                    path.display(),
                    config::CONFIG_ENV_VAR
                );
            }
            ConfigSource::Default(path) => {
                info!("Loaded configuration from '{}'.", path.display());
            }
        }
        apply_config_overrides(&mut args, cfg, &matches);
    }

    let user_filter = args.filter.as_deref().map(classify_user_filter);
    let settings = args.settings(user_filter);
    settings.validate()?;

    let interrupt = Arc::new(AtomicBool::new(false));
    let interrupt_handler = Arc::clone(&interrupt);
    ctrlc::set_handler(move || {
        if interrupt_handler.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        warn!("Interrupted, stopping after the current attempt (Ctrl+C again to quit now)");
    })
    .context("Failed to set Ctrl+C handler")?;

    let error_log = ErrorLog::new(&args.error_log);
    let prober = FfprobeProber::default();
    let total = args.inputs.len();
    let mut failures = 0usize;

    for (index, input) in args.inputs.iter().enumerate() {
        info!("[{}/{}] {}", index + 1, total, input.display());
        match process_file(&args, &settings, &prober, input, &interrupt) {
            Ok(_) => {}
            Err(err) if err.is_fatal() => {
                error_log.record(input, &err.to_string());
                bail!(err);
            }
            Err(err) => {
                error!("'{}': {}", input.display(), err);
                error_log.record(input, &err.to_string());
                failures += 1;
            }
        }
    }

    if failures > 0 {
        bail!(
            "{} of {} file(s) could not be converted (see '{}')",
            failures,
            total,
            error_log.path().display()
        );
    }
    info!("Converted {} file(s).", total);
    Ok(())
}
