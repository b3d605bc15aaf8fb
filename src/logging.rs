use chrono::Local;
use log::warn;
use std::env;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const DEFAULT_ERROR_LOG: &str = "webm_error.log";

/// Stderr logger, `info` unless `RUST_LOG` says otherwise.
pub fn init_logging() {
    if env::var_os("RUST_LOG").is_none() {
        env::set_var("RUST_LOG", "info");
    }
    let _ = env_logger::Builder::from_default_env()
        .format_timestamp(None)
        .target(env_logger::Target::Stderr)
        .try_init();
}

/// Append-only record of inputs that could not be converted.
#[derive(Clone, Debug)]
pub struct ErrorLog {
    path: PathBuf,
}

impl ErrorLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `<timestamp>` / `File: <input>` / `Error: <description>` followed by
    /// a blank line. Failing to write only produces a warning.
    pub fn record(&self, input: &Path, description: &str) {
        let entry = format!(
            "{}\nFile: {}\nError: {}\n\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            input.display(),
            description
        );
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(entry.as_bytes()));
        if let Err(err) = result {
            warn!(
                "Unable to write to error log '{}': {}",
                self.path.display(),
                err
            );
        }
    }
}
