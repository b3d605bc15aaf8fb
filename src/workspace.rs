//! Output paths for one input: the attempt file every encode writes to and
//! the final `.webm` the best attempt gets promoted to.

use log::{debug, warn};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::encoder::{passlog_files, passlog_prefix};
use crate::error::FitError;

#[derive(Debug)]
pub struct Workspace {
    out_path: PathBuf,
    attempt_path: PathBuf,
    dry_run: bool,
}

impl Workspace {
    /// Creates `out_dir` when needed and derives `<out_dir>/<stem>.webm`.
    pub fn prepare(out_dir: &Path, input: &Path, dry_run: bool) -> Result<Self, FitError> {
        if !dry_run {
            fs::create_dir_all(out_dir)?;
        }
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());
        let out_path = out_dir.join(format!("{}.webm", stem));
        let attempt_path = out_dir.join(format!(".{}.{}.attempt.webm", stem, std::process::id()));
        Ok(Self {
            out_path,
            attempt_path,
            dry_run,
        })
    }

    pub fn out_path(&self) -> &Path {
        &self.out_path
    }

    pub fn attempt_path(&self) -> &Path {
        &self.attempt_path
    }

    /// Moves the last attempt into place as the new output.
    pub fn promote(&self) -> Result<(), FitError> {
        if self.dry_run {
            return Ok(());
        }
        if cfg!(windows) && self.out_path.exists() {
            fs::remove_file(&self.out_path)?;
        }
        fs::rename(&self.attempt_path, &self.out_path)?;
        debug!(
            "Promoted '{}' to '{}'",
            self.attempt_path.display(),
            self.out_path.display()
        );
        Ok(())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.dry_run {
            return;
        }
        let mut leftovers = passlog_files(&passlog_prefix(&self.attempt_path));
        leftovers.push(self.attempt_path.clone());
        for path in leftovers {
            match fs::remove_file(&path) {
                Ok(()) => debug!("Removed '{}'", path.display()),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => warn!("Failed to remove '{}': {}", path.display(), err),
            }
        }
    }
}
