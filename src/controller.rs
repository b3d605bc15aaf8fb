//! The attempt loop: shrink through the rate-control modes until the output
//! fits, then grow back toward the limit if it came out too small.

use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use strum_macros::Display;

use crate::audio::compute_audio_bitrate;
use crate::bitrate::compute_video_bitrate;
use crate::encoder::{AttemptExecutor, AttemptPlan, Mode};
use crate::error::FitError;
use crate::filter::compute_output_height_and_fps;
use crate::media::MediaProfile;
use crate::settings::{Settings, SizeLimits};
use crate::tracker::SizeTracker;
use crate::workspace::Workspace;

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Display)]
pub enum Phase {
    Shrink,
    Grow,
}

/// One encoder invocation and what it produced. `output_size` is `None`
/// when the encode failed.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct AttemptResult {
    pub video_bitrate: u32,
    pub output_height: u32,
    pub output_fps: f64,
    pub output_size: Option<u64>,
    pub mode: Mode,
    pub phase: Phase,
}

/// The attempt currently kept as the output.
#[derive(Clone, Debug, Default)]
pub struct BestCandidate {
    attempt: Option<AttemptResult>,
}

impl BestCandidate {
    pub fn attempt(&self) -> Option<&AttemptResult> {
        self.attempt.as_ref()
    }

    pub fn size(&self) -> Option<u64> {
        self.attempt.and_then(|a| a.output_size)
    }

    /// Whether a new attempt of `size` replaces the current best.
    ///
    /// While shrinking, anything smaller wins as long as the best is still
    /// over the limit; once under it, only larger sizes that stay under do.
    /// Growing only ever takes larger sizes that stay under the limit.
    pub fn accepts(&self, phase: Phase, size: u64, limits: SizeLimits) -> bool {
        let best = match self.size() {
            Some(best) => best,
            None => return true,
        };
        match phase {
            Phase::Shrink if best > limits.upper => size < best,
            Phase::Shrink | Phase::Grow => size <= limits.upper && size > best,
        }
    }

    /// Takes `attempt` if it qualifies; returns whether it did.
    pub fn offer(&mut self, attempt: &AttemptResult, limits: SizeLimits) -> bool {
        match attempt.output_size {
            Some(size) if self.accepts(attempt.phase, size, limits) => {
                self.attempt = Some(*attempt);
                true
            }
            _ => false,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Display)]
pub enum Outcome {
    Fits,
    TooLarge,
    TooSmall,
}

#[derive(Clone, Debug)]
pub struct FitReport {
    pub outcome: Outcome,
    pub best: AttemptResult,
    pub attempts: Vec<AttemptResult>,
}

impl FitReport {
    pub fn best_size(&self) -> u64 {
        self.best.output_size.unwrap_or_default()
    }

    /// The per-file error for outcomes that missed the window.
    pub fn error(&self, limits: SizeLimits) -> Option<FitError> {
        match self.outcome {
            Outcome::Fits => None,
            Outcome::TooLarge => Some(FitError::TooLarge {
                best: self.best_size(),
                limit: limits.upper,
            }),
            Outcome::TooSmall => Some(FitError::TooSmall {
                best: self.best_size(),
                limit: limits.lower,
            }),
        }
    }
}

pub struct ConvergenceController<'a> {
    settings: &'a Settings,
    executor: &'a mut AttemptExecutor,
    interrupt: Option<Arc<AtomicBool>>,
}

struct Run<'p> {
    profile: &'p MediaProfile,
    limits: SizeLimits,
    audio_bitrate: u32,
    best: BestCandidate,
    attempts: Vec<AttemptResult>,
}

impl<'a> ConvergenceController<'a> {
    pub fn new(settings: &'a Settings, executor: &'a mut AttemptExecutor) -> Self {
        Self {
            settings,
            executor,
            interrupt: None,
        }
    }

    /// Flag checked before every attempt; once set the run stops with `FitError::Interrupted`.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    fn interrupted(&self) -> bool {
        self.interrupt
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    pub fn fit(
        &mut self,
        profile: &MediaProfile,
        workspace: &Workspace,
    ) -> Result<FitReport, FitError> {
        let settings = self.settings;
        let mut run = Run {
            profile,
            limits: settings.limits(),
            audio_bitrate: compute_audio_bitrate(settings, profile),
            best: BestCandidate::default(),
            attempts: Vec::new(),
        };
        let modes = settings.modes();
        let mut tracker = SizeTracker::new();
        let mut shrink_mode = None;

        'modes: for mode in &modes {
            tracker.restart();
            shrink_mode = Some(*mode);
            let mut last: Option<AttemptResult> = None;
            for _ in 0..settings.iterations {
                let attempt =
                    self.attempt(&mut run, workspace, &mut tracker, last.as_ref(), *mode, Phase::Shrink)?;
                last = Some(attempt);

                if run.best.size().is_some_and(|best| best <= run.limits.upper) {
                    break 'modes;
                }
                if tracker.stalled(settings.skip_threshold) {
                    info!("{} stopped changing the output size, moving on", mode);
                    break;
                }
            }
        }

        let grow_from = match run.best.attempt() {
            Some(best) if best.output_size.is_some_and(|size| size < run.limits.lower) => Some(*best),
            _ => None,
        };
        if let (Some(seed), Some(mode)) = (grow_from, shrink_mode) {
            info!("Output is below the undershoot limit, raising the bitrate");
            tracker.restart();
            let mut last = Some(seed);
            for _ in 0..settings.iterations {
                let attempt =
                    self.attempt(&mut run, workspace, &mut tracker, last.as_ref(), mode, Phase::Grow)?;
                last = Some(attempt);

                if run.best.size().is_some_and(|best| run.limits.contains(best)) {
                    break;
                }
                if tracker.stalled(settings.skip_threshold) {
                    info!("Output size stopped changing, giving up on growing it");
                    break;
                }
            }
        }

        let best = *run.best.attempt().ok_or(FitError::NoUsableAttempt)?;
        let size = best.output_size.unwrap_or_default();
        let outcome = if size > run.limits.upper {
            Outcome::TooLarge
        } else if size < run.limits.lower {
            Outcome::TooSmall
        } else {
            Outcome::Fits
        };

        Ok(FitReport {
            outcome,
            best,
            attempts: run.attempts,
        })
    }

    fn attempt(
        &mut self,
        run: &mut Run<'_>,
        workspace: &Workspace,
        tracker: &mut SizeTracker,
        last: Option<&AttemptResult>,
        mode: Mode,
        phase: Phase,
    ) -> Result<AttemptResult, FitError> {
        if self.interrupted() {
            return Err(FitError::Interrupted);
        }

        let settings = self.settings;
        let bitrate = compute_video_bitrate(settings, run.profile, run.audio_bitrate, last);
        let (height, fps) = compute_output_height_and_fps(settings, run.profile, bitrate);
        let plan = AttemptPlan {
            bitrate,
            height,
            fps,
            mode,
        };
        let number = run.attempts.len() + 1;

        let output_size = match self
            .executor
            .run(settings, run.profile, plan, workspace.attempt_path())
        {
            Ok(size) => Some(size),
            Err(_) if self.interrupted() => return Err(FitError::Interrupted),
            Err(err) => {
                warn!("Attempt {} ({} {}) failed: {}", number, phase, mode, err);
                None
            }
        };

        let attempt = AttemptResult {
            video_bitrate: bitrate,
            output_height: height,
            output_fps: fps,
            output_size,
            mode,
            phase,
        };
        run.attempts.push(attempt);

        if let Some(size) = output_size {
            tracker.record(size);
            let accepted = run.best.offer(&attempt, run.limits);
            info!(
                "Attempt {} ({} {}): {:.2} MiB{}",
                number,
                phase,
                mode,
                size as f64 / BYTES_PER_MIB,
                if accepted { ", new best" } else { "" }
            );
            if accepted {
                tracker.set_best(size);
                workspace.promote()?;
            }
        }

        Ok(attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UPPER: u64 = 3_145_728;

    fn limits() -> SizeLimits {
        SizeLimits {
            lower: 2_359_296,
            upper: UPPER,
        }
    }

    fn attempt(size: Option<u64>, phase: Phase) -> AttemptResult {
        AttemptResult {
            video_bitrate: 1000,
            output_height: 480,
            output_fps: 30.0,
            output_size: size,
            mode: Mode::Vbr,
            phase,
        }
    }

    #[test]
    fn first_measured_attempt_is_always_best() {
        let mut best = BestCandidate::default();
        assert!(!best.offer(&attempt(None, Phase::Shrink), limits()));
        assert!(best.offer(&attempt(Some(10 * UPPER), Phase::Shrink), limits()));
        assert_eq!(best.size(), Some(10 * UPPER));
    }

    #[test]
    fn shrink_over_limit_takes_smaller() {
        let mut best = BestCandidate::default();
        best.offer(&attempt(Some(UPPER + 500), Phase::Shrink), limits());
        assert!(!best.accepts(Phase::Shrink, UPPER + 600, limits()));
        assert!(best.accepts(Phase::Shrink, UPPER + 100, limits()));
        assert!(best.accepts(Phase::Shrink, 1_000, limits()));
    }

    #[test]
    fn shrink_under_limit_takes_larger_under_limit() {
        let mut best = BestCandidate::default();
        best.offer(&attempt(Some(2_000_000), Phase::Shrink), limits());
        assert!(!best.accepts(Phase::Shrink, 1_900_000, limits()));
        assert!(!best.accepts(Phase::Shrink, UPPER + 1, limits()));
        assert!(best.accepts(Phase::Shrink, UPPER, limits()));
    }

    #[test]
    fn grow_only_takes_strictly_larger_fitting_sizes() {
        let mut best = BestCandidate::default();
        best.offer(&attempt(Some(1_000_000), Phase::Shrink), limits());
        assert!(!best.accepts(Phase::Grow, 1_000_000, limits()));
        assert!(!best.accepts(Phase::Grow, UPPER + 1, limits()));
        assert!(best.accepts(Phase::Grow, 2_500_000, limits()));
    }

    #[test]
    fn replaying_an_attempt_is_a_no_op() {
        for size in [UPPER + 10, 2_800_000, 1_000_000] {
            let mut best = BestCandidate::default();
            let a = attempt(Some(size), Phase::Shrink);
            assert!(best.offer(&a, limits()));
            assert!(!best.offer(&a, limits()));
            assert_eq!(best.attempt(), Some(&a));
        }
    }

    #[test]
    fn replaying_a_sequence_keeps_the_same_best() {
        let sizes = [
            (UPPER * 2, Phase::Shrink),
            (UPPER + 10, Phase::Shrink),
            (1_000_000, Phase::Shrink),
            (UPPER + 1, Phase::Grow),
            (2_800_000, Phase::Grow),
            (2_500_000, Phase::Grow),
        ];
        let mut best = BestCandidate::default();
        for (size, phase) in sizes {
            best.offer(&attempt(Some(size), phase), limits());
        }
        let first = best.size();
        assert_eq!(first, Some(2_800_000));
        for (size, phase) in sizes {
            assert!(!best.offer(&attempt(Some(size), phase), limits()));
        }
        assert_eq!(best.size(), first);
    }

    #[test]
    fn report_errors_match_outcome() {
        let report = FitReport {
            outcome: Outcome::TooLarge,
            best: attempt(Some(UPPER + 1), Phase::Shrink),
            attempts: Vec::new(),
        };
        assert!(matches!(
            report.error(limits()),
            Some(FitError::TooLarge { best, limit }) if best == UPPER + 1 && limit == UPPER
        ));
        let report = FitReport {
            outcome: Outcome::Fits,
            ..report
        };
        assert!(report.error(limits()).is_none());
    }
}
