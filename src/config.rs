use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Engine configuration.
///
/// Every policy knob is an explicit, defaulted field — nothing is looked up
/// dynamically at runtime.
///
/// # Loading
///
/// ```rust,no_run
/// use metastamp::config::Config;
///
/// // From a JSON file
/// let config = Config::load(Some("config.json".as_ref())).unwrap();
///
/// // Or use defaults and customize
/// let mut config = Config::default();
/// config.concurrency = 4;
/// config.batching_enabled = false;
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum per-file pipelines in flight at once (slice size).
    pub concurrency: usize,
    /// When disabled, every tool write is an immediate single-file call.
    pub batching_enabled: bool,
    /// Process formats in the unsupported set anyway.
    pub force_unsupported: bool,
    /// Suppress the per-file warning for skipped unsupported formats.
    pub silence_unsupported: bool,
    /// Hard cap on a pending image batch; excess is drained before more is
    /// queued.
    pub max_image_batch: usize,
    /// Hard cap on a pending video batch.
    pub max_video_batch: usize,
    /// Path to the exiftool binary. `None` means resolve from PATH.
    pub exiftool_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: 8,
            batching_enabled: true,
            force_unsupported: false,
            silence_unsupported: false,
            max_image_batch: 100,
            max_video_batch: 24,
            exiftool_path: None,
        }
    }
}

impl Config {
    /// Resolve the config file path — same directory as the executable.
    pub fn config_path() -> Result<PathBuf> {
        let exe_path = std::env::current_exe().context("Failed to get executable path")?;
        let exe_dir = exe_path
            .parent()
            .context("Failed to get executable directory")?;
        Ok(exe_dir.join("config.json"))
    }

    /// Load config from the given path, or from the default location.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        if !config_path.exists() {
            log::warn!(
                "Config file not found at {}. Using defaults.",
                config_path.display()
            );
            return Ok(Self::default());
        }

        let contents =
            std::fs::read_to_string(&config_path).context("Failed to read config file")?;
        let config: Config =
            serde_json::from_str(&contents).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Save config to the given path, or to the default location.
    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_path, contents).context("Failed to write config file")?;
        log::info!("Config saved to {}", config_path.display());
        Ok(())
    }

    /// Per-key cap for a queue (videos get the smaller cap).
    pub fn batch_cap(&self, contains_video: bool) -> usize {
        if contains_video {
            self.max_video_batch.max(1)
        } else {
            self.max_image_batch.max(1)
        }
    }
}
