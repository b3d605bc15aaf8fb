use anyhow::{Context, Result};
use log::debug;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::settings::{AudioCodec, VideoCodec};

pub const CONFIG_ENV_VAR: &str = "WEBM_FIT_CONFIG";
const CONFIG_DIR_NAME: &str = "webm-fit";
const CONFIG_FILE_NAME: &str = "webm-fit.toml";

/// Defaults read from a TOML file. Every key is optional and is only used
/// when the matching command line option was not given.
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    pub size: Option<f64>,
    pub undershoot: Option<f64>,
    pub iterations: Option<u32>,
    pub min_bitrate_ratio: Option<f64>,
    pub skip_threshold: Option<f64>,
    pub bpp: Option<f64>,
    pub min_height: Option<u32>,
    pub max_height: Option<u32>,
    pub min_fps: Option<f64>,
    pub max_fps: Option<f64>,
    pub audio: Option<bool>,
    pub audio_codec: Option<AudioCodec>,
    pub min_audio: Option<u32>,
    pub max_audio: Option<u32>,
    pub audio_factor: Option<f64>,
    pub force_stereo: Option<bool>,
    pub basic_format: Option<bool>,
    pub no_copy: Option<bool>,
    pub force_copy: Option<bool>,
    pub video_codec: Option<VideoCodec>,
    pub passes: Option<u8>,
    pub threads: Option<u32>,
    pub transparency: Option<bool>,
    pub no_qmax: Option<bool>,
    pub no_cbr: Option<bool>,
    pub output_dir: Option<PathBuf>,
    pub error_log: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ConfigSource {
    Cli(PathBuf),
    Env(PathBuf),
    Default(PathBuf),
}

pub fn parse(contents: &str, path: &Path) -> Result<Config> {
    toml::from_str(contents)
        .with_context(|| format!("Invalid configuration file at {}", path.display()))
}

fn read(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read configuration file at {}", path.display()))?;
    parse(&contents, path)
}

/// Loads the configuration from `--config-file`, then `$WEBM_FIT_CONFIG`, then
/// the first default location that exists. An explicitly named file must exist.
pub fn load(path_override: Option<&Path>) -> Result<Option<(Config, ConfigSource)>> {
    if let Some(path) = path_override {
        return Ok(Some((read(path)?, ConfigSource::Cli(path.to_path_buf()))));
    }

    if let Some(env_path) = env::var_os(CONFIG_ENV_VAR).filter(|value| !value.is_empty()) {
        let path = PathBuf::from(env_path);
        return Ok(Some((read(&path)?, ConfigSource::Env(path))));
    }

    for candidate in default_config_candidates() {
        if candidate.is_file() {
            return Ok(Some((read(&candidate)?, ConfigSource::Default(candidate))));
        }
        debug!("No configuration at {}", candidate.display());
    }

    Ok(None)
}

fn default_config_candidates() -> Vec<PathBuf> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();

    let mut push_unique = |path: PathBuf, out: &mut Vec<PathBuf>| {
        if !path.as_os_str().is_empty() && seen.insert(path.clone()) {
            out.push(path);
        }
    };

    if let Some(xdg_config) = env::var_os("XDG_CONFIG_HOME").filter(|val| !val.is_empty()) {
        let mut path = PathBuf::from(xdg_config);
        path.push(CONFIG_DIR_NAME);
        path.push("config.toml");
        push_unique(path, &mut out);
    }

    if let Some(home) = env::var_os("HOME").filter(|val| !val.is_empty()) {
        let home = PathBuf::from(home);
        let mut path = home.join(".config");
        path.push(CONFIG_DIR_NAME);
        path.push("config.toml");
        push_unique(path, &mut out);

        push_unique(home.join(CONFIG_FILE_NAME), &mut out);
    }

    if let Ok(current_dir) = env::current_dir() {
        push_unique(current_dir.join(CONFIG_FILE_NAME), &mut out);
    }

    if let Ok(exe_path) = env::current_exe() {
        if let Some(parent) = exe_path.parent() {
            push_unique(parent.join(CONFIG_FILE_NAME), &mut out);
        }
    }

    push_unique(
        PathBuf::from("/etc").join(CONFIG_DIR_NAME).join("config.toml"),
        &mut out,
    );

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_kebab_case_keys() {
        let cfg = parse(
            r#"
            size = 4.0
            undershoot = 0.8
            audio = true
            audio-codec = "opus"
            video-codec = "vp9"
            min-height = 360
            no-qmax = true
            output-dir = "/tmp/out"
            "#,
            Path::new("test.toml"),
        )
        .unwrap();
        assert_eq!(cfg.size, Some(4.0));
        assert_eq!(cfg.undershoot, Some(0.8));
        assert_eq!(cfg.audio, Some(true));
        assert_eq!(cfg.audio_codec, Some(AudioCodec::Opus));
        assert_eq!(cfg.video_codec, Some(VideoCodec::Vp9));
        assert_eq!(cfg.min_height, Some(360));
        assert_eq!(cfg.no_qmax, Some(true));
        assert_eq!(cfg.output_dir, Some(PathBuf::from("/tmp/out")));
        assert_eq!(cfg.iterations, None);
    }

    #[test]
    fn rejects_unknown_keys() {
        let err = parse("sizee = 3.0", Path::new("bad.toml")).unwrap_err();
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn explicit_path_wins() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cfg.toml");
        fs::write(&path, "iterations = 5\n").unwrap();
        let (cfg, source) = load(Some(&path)).unwrap().unwrap();
        assert_eq!(cfg.iterations, Some(5));
        assert_eq!(source, ConfigSource::Cli(path));
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(load(Some(&dir.path().join("missing.toml"))).is_err());
    }

    #[test]
    fn candidates_are_unique() {
        let candidates = default_config_candidates();
        let unique: BTreeSet<_> = candidates.iter().collect();
        assert_eq!(unique.len(), candidates.len());
    }
}
