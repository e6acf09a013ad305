use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::detector::MATCH_THRESHOLD;

pub const NEEDLES_DIR: &str = "needles";
pub const HAYSTACKS_DIR: &str = "haystacks";
pub const RESULTS_DIR: &str = "results";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to locate the program directory: {0}")]
    ExecutableDir(#[source] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory the three folders live in (the executable's own directory by default)
    pub base_dir: PathBuf,
    pub needles_dir: PathBuf,
    pub haystacks_dir: PathBuf,
    pub results_dir: PathBuf,
    /// Minimum peak correlation for a needle to count as found
    pub threshold: f32,
}

impl Config {
    /// The fixed folder layout next to the running executable.
    pub fn load() -> Result<Self, ConfigError> {
        Ok(Config::with_base_dir(executable_dir()?))
    }

    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Config {
            needles_dir: base_dir.join(NEEDLES_DIR),
            haystacks_dir: base_dir.join(HAYSTACKS_DIR),
            results_dir: base_dir.join(RESULTS_DIR),
            base_dir,
            threshold: MATCH_THRESHOLD,
        }
    }
}

fn executable_dir() -> Result<PathBuf, ConfigError> {
    let exe = std::env::current_exe().map_err(ConfigError::ExecutableDir)?;
    Ok(exe.parent().map(Path::to_path_buf).unwrap_or_default())
}
