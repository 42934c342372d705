// Engine settings
// Loaded from ~/.config/livegrid/engine.json

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// What the recalculation engine does when it drops a re-entrant request
/// for a cell that is already executing further up the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CyclePolicy {
    /// Drop the request silently (only counted in stats)
    #[default]
    Ignore,
    /// Drop the request and record a cycle report
    Report,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    // Recalculation
    #[serde(rename = "recalc.populateOnBind")]
    pub populate_on_bind: bool,

    #[serde(rename = "recalc.watchOwnLocation")]
    pub watch_own_location: bool,

    #[serde(rename = "recalc.cyclePolicy")]
    pub cycle_policy: CyclePolicy,

    #[serde(rename = "recalc.maxCycleReports")]
    pub max_cycle_reports: usize,

    // References
    #[serde(rename = "refs.maxRangeCells")]
    pub max_range_cells: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            populate_on_bind: true,
            watch_own_location: true,
            cycle_policy: CyclePolicy::Ignore,
            max_cycle_reports: 100,
            max_range_cells: 10_000,
        }
    }
}

impl EngineSettings {
    /// Get the settings file path
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("livegrid");
        config_dir.join("engine.json")
    }

    /// Load settings from the default location, falling back to defaults
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    /// Load settings from `path`, falling back to defaults.
    ///
    /// A missing file is not an error. Lines starting with `//` are
    /// treated as comments.
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(contents) => match Self::parse(&contents) {
                Ok(settings) => settings,
                Err(e) => {
                    log::warn!("Error parsing {}: {}", path.display(), e);
                    log::warn!("Using default engine settings");
                    Self::default()
                }
            },
            Err(e) => {
                log::warn!("Error reading {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Parse settings JSON, ignoring `//` comment lines.
    pub fn parse(contents: &str) -> Result<Self, String> {
        let cleaned: String = contents
            .lines()
            .filter(|line| !line.trim().starts_with("//"))
            .collect::<Vec<_>>()
            .join("\n");

        serde_json::from_str(&cleaned).map_err(|e| e.to_string())
    }

    /// Save current settings to the default location
    pub fn save(&self) -> Result<(), String> {
        self.save_to(&Self::config_path())
    }

    /// Save current settings to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }

        let json = serde_json::to_string_pretty(self).map_err(|e| e.to_string())?;

        fs::write(path, json).map_err(|e| e.to_string())
    }

    /// Get the config file path for display
    pub fn config_path_display() -> String {
        Self::config_path().to_string_lossy().to_string()
    }
}
