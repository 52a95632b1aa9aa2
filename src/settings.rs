//! Optional `alchemy.toml` at the project root.
//!
//! Every section and field has a default, so a missing file, an empty file
//! and a partial file are all valid:
//!
//! ```toml
//! [build]
//! timeout_minutes = 180
//!
//! [recording]
//! capture_retries = 10
//!
//! [viewer]
//! enabled = false
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{BuildError, Result};
use crate::paths::ProjectDirs;
use crate::process::ProcessOverrides;

pub const SETTINGS_FILE: &str = "alchemy.toml";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub build: BuildSettings,
    pub recording: RecordingSettings,
    pub viewer: ViewerSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BuildSettings {
    /// Deadline for one primary build process.
    pub timeout_minutes: u64,
    /// Finer-grained deadline; wins over `timeout_minutes` when set.
    pub timeout_secs: Option<u64>,
    /// Concurrent builds for `build all`.
    pub parallel: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RecordingSettings {
    pub enabled: bool,
    /// VNC password the build scripts configure on the guest display.
    pub password: String,
    pub capture_tool: String,
    pub encode_tool: String,
    pub capture_retries: u32,
    pub capture_retry_interval_secs: u64,
    /// Give the VM time to bring up its VNC server before the first capture.
    pub capture_delay_secs: u64,
    pub encode_timeout_minutes: u64,
    /// How long to wait for the capture to stop by itself once the build
    /// is over, before killing it.
    pub stop_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ViewerSettings {
    pub enabled: bool,
    pub timeout_minutes: u64,
    pub retries: u32,
    pub retry_interval_secs: u64,
    pub delay_secs: u64,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            timeout_minutes: 240,
            timeout_secs: None,
            parallel: 1,
        }
    }
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            password: "packer".to_string(),
            capture_tool: "vncsnapshot".to_string(),
            encode_tool: "ffmpeg".to_string(),
            capture_retries: 30,
            capture_retry_interval_secs: 10,
            capture_delay_secs: 60,
            encode_timeout_minutes: 10,
            stop_grace_secs: 30,
        }
    }
}

impl Default for ViewerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_minutes: 5,
            retries: 5,
            retry_interval_secs: 60,
            delay_secs: 60,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Settings {
    /// Load `<root>/alchemy.toml`, falling back to defaults when it does not
    /// exist.
    pub fn load(dirs: &ProjectDirs) -> Result<Self> {
        Self::load_from(&dirs.project_dir.join(SETTINGS_FILE))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                info!(path = %path.display(), "Loaded settings");
                Self::from_toml(&content).map_err(|e| BuildError::Settings {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

impl BuildSettings {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        match self.timeout_secs {
            Some(secs) => Duration::from_secs(secs),
            None => Duration::from_secs(self.timeout_minutes * 60),
        }
    }
}

impl RecordingSettings {
    /// Overrides layered onto the screenshot tool's defaults. The capture may
    /// run as long as the build itself.
    #[must_use]
    pub fn capture_overrides(&self, build_timeout: Duration) -> ProcessOverrides {
        ProcessOverrides {
            executable: Some(self.capture_tool.clone()),
            timeout: Some(build_timeout),
            retries: Some(self.capture_retries),
            retry_interval: Some(Duration::from_secs(self.capture_retry_interval_secs)),
            delay_before_start: Some(Duration::from_secs(self.capture_delay_secs)),
            ..ProcessOverrides::default()
        }
    }

    #[must_use]
    pub fn encode_overrides(&self) -> ProcessOverrides {
        ProcessOverrides {
            executable: Some(self.encode_tool.clone()),
            timeout: Some(Duration::from_secs(self.encode_timeout_minutes * 60)),
            ..ProcessOverrides::default()
        }
    }

    #[must_use]
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

impl ViewerSettings {
    #[must_use]
    pub fn overrides(&self) -> ProcessOverrides {
        ProcessOverrides {
            timeout: Some(Duration::from_secs(self.timeout_minutes * 60)),
            retries: Some(self.retries),
            retry_interval: Some(Duration::from_secs(self.retry_interval_secs)),
            delay_before_start: Some(Duration::from_secs(self.delay_secs)),
            ..ProcessOverrides::default()
        }
    }
}
