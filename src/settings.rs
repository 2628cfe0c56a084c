// ============================================================================
// ENGINE SETTINGS: JSON file in the platform config directory
// ============================================================================

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::components::brush::BrushConfig;
use crate::error::EngineResult;
use crate::gpu::GpuPower;
use crate::ops::mask::MaskParams;

const SETTINGS_FILE: &str = "settings.json";

pub const LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    /// Brush used until the toolbar changes it.
    pub brush: BrushConfig,
    pub mask: MaskParams,
    pub gpu_enabled: bool,
    pub gpu_power: GpuPower,
    /// Save on a background worker; off means saves run inline on commit.
    pub save_queue: bool,
    pub log_level: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            brush: BrushConfig::default(),
            mask: MaskParams::default(),
            gpu_enabled: true,
            gpu_power: GpuPower::default(),
            save_queue: true,
            log_level: "info".to_string(),
        }
    }
}

impl EngineSettings {
    /// `$XDG_CONFIG_HOME/layerbrush/settings.json` on Linux, the usual
    /// per-user locations elsewhere.
    pub fn settings_path() -> Option<PathBuf> {
        #[cfg(target_os = "windows")]
        {
            let appdata = std::env::var("APPDATA").or_else(|_| std::env::var("USERPROFILE")).ok()?;
            return Some(PathBuf::from(appdata).join("layerbrush").join(SETTINGS_FILE));
        }
        #[cfg(target_os = "macos")]
        {
            let home = std::env::var("HOME").ok()?;
            return Some(
                PathBuf::from(home)
                    .join("Library")
                    .join("Application Support")
                    .join("layerbrush")
                    .join(SETTINGS_FILE),
            );
        }
        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        {
            let config_dir = std::env::var("XDG_CONFIG_HOME")
                .map(PathBuf::from)
                .or_else(|_| std::env::var("HOME").map(|h| PathBuf::from(h).join(".config")))
                .ok()?;
            Some(config_dir.join("layerbrush").join(SETTINGS_FILE))
        }
    }

    /// Settings from the default location. Never fails: a missing or broken
    /// file yields defaults.
    pub fn load() -> Self {
        let Some(path) = Self::settings_path() else {
            return Self::default();
        };
        match Self::load_from(&path) {
            Ok(s) => s,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "settings unreadable, using defaults");
                Self::default()
            }
        }
    }

    /// Settings from `path`. A missing file is not an error; a malformed
    /// one is.
    pub fn load_from(path: &Path) -> EngineResult<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no settings file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        let parsed: Self = serde_json::from_str(&content)?;
        Ok(parsed.clamped())
    }

    pub fn save_to(&self, path: &Path) -> EngineResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Bring every value into its valid range.
    pub fn clamped(mut self) -> Self {
        self.brush = self.brush.validated().unwrap_or_else(|e| {
            warn!(error = %e, "invalid default brush in settings, using built-in brush");
            BrushConfig::default()
        });
        self.mask = self.mask.clamped();
        let level = self.log_level.trim().to_lowercase();
        self.log_level = if LOG_LEVELS.contains(&level.as_str()) { level } else { "info".to_string() };
        self
    }
}
