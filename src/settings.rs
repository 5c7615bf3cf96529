//! Settings persistence
//!
//! Playback, preload and visualizer tuning, stored as JSON under the
//! platform config directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub playback: PlaybackSettings,
    #[serde(default)]
    pub preload: PreloadSettings,
    #[serde(default)]
    pub visualizer: VisualizerSettings,
    #[serde(default)]
    pub network: NetworkSettings,
}

/// Coordinator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackSettings {
    /// Progress sampling period while playing
    pub progress_interval_ms: u64,
    /// Volume applied to the first session (0.0 to 1.0)
    pub initial_volume: f32,
}

impl PlaybackSettings {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms.max(10))
    }
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            progress_interval_ms: 100,
            initial_volume: 1.0,
        }
    }
}

/// Preload cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreloadSettings {
    /// How long `preload` waits for can-play-through before settling anyway
    pub timeout_ms: u64,
    /// Concurrent loads per batch
    pub batch_size: usize,
    /// Entries read ahead of the current article
    pub proximity_window: usize,
    /// Maximum cached URLs before least recently used entries are evicted
    pub cache_capacity: usize,
}

impl PreloadSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for PreloadSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            batch_size: 5,
            proximity_window: 5,
            cache_capacity: 32,
        }
    }
}

/// Spectrum visualizer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualizerSettings {
    /// Number of bars rendered
    pub bars: usize,
    /// Spectrum decay (0.0 = instant, 0.99 = very slow)
    pub decay: f32,
}

impl Default for VisualizerSettings {
    fn default() -> Self {
        Self {
            bars: 32,
            decay: 0.85,
        }
    }
}

/// HTTP settings for audio fetches
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    /// Longest silence tolerated while a response body is streaming
    pub read_timeout_secs: u64,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            user_agent: concat!("lexaudio/", env!("CARGO_PKG_VERSION")).to_string(),
            connect_timeout_secs: 10,
            read_timeout_secs: 30,
        }
    }
}

/// Failure reading or writing the settings file
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("no config directory on this platform")]
    NoConfigDir,
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl Settings {
    /// `settings.json` in the platform config directory
    pub fn default_path() -> Result<PathBuf, SettingsError> {
        directories::ProjectDirs::from("org", "lexaudio", "lexaudio")
            .map(|dirs| dirs.config_dir().join("settings.json"))
            .ok_or(SettingsError::NoConfigDir)
    }

    /// Settings from the default path. A missing file is not an error; a
    /// broken one is logged and replaced by defaults.
    pub fn load() -> Self {
        let loaded = Self::default_path().and_then(|path| Self::load_from_file(&path));
        match loaded {
            Ok(settings) => settings,
            Err(SettingsError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Ignoring settings: {}", e);
                Self::default()
            }
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self, SettingsError> {
        let bytes = fs::read(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self) -> Result<(), SettingsError> {
        self.save_to_file(&Self::default_path()?)
    }

    /// Write through a sibling temp file so a crash never leaves half a file
    pub fn save_to_file(&self, path: &Path) -> Result<(), SettingsError> {
        let io_err = |source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        };
        let json = serde_json::to_vec_pretty(self).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(io_err)?;
        }
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, json).map_err(io_err)?;
        fs::rename(&staging, path).map_err(io_err)?;
        tracing::debug!("Saved settings to {}", path.display());
        Ok(())
    }
}
