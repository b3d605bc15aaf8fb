//! Per-file failure taxonomy.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FitError {
    /// Every shrink attempt stayed above the upper limit.
    #[error("Couldn't fit video within the file size limit! (best: {best} bytes, limit: {limit} bytes)")]
    TooLarge { best: u64, limit: u64 },
    /// Every grow attempt stayed below the undershoot limit.
    #[error("Couldn't raise file size above the undershoot limit! (best: {best} bytes, limit: {limit} bytes)")]
    TooSmall { best: u64, limit: u64 },
    /// ffprobe could not describe the input.
    #[error("Unable to probe '{path}': {reason}")]
    Probe { path: PathBuf, reason: String },
    #[error("Input file doesn't exist!")]
    MissingInput,
    #[error("Invalid start and/or end time specified! ({0})")]
    InvalidTrim(String),
    /// No attempt produced a measurable output.
    #[error("Every encode attempt failed; no output was produced")]
    NoUsableAttempt,
    #[error("Interrupted by user")]
    Interrupted,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl FitError {
    pub fn probe(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        FitError::Probe {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Failures that end the whole batch instead of just the current file.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FitError::Interrupted)
    }
}

/// A single encoder invocation that did not produce an output.
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("{program} exited with {status}")]
    Exit {
        program: &'static str,
        status: String,
    },
    #[error("unable to measure output size: {0}")]
    Measure(String),
}
