// Persistent configuration: link port, tempo, listen flag, flash image
// location. Stored as JSON in <config_dir>/corvid/config.json, or in the
// file named by --config. Missing file or unknown fields fall back to
// defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// TCP port for the emulated CDC link.
    pub port: u16,
    /// Internal clock tempo at boot.
    pub bpm: f64,
    /// Mirror the audio-range outputs to the host sound card.
    pub listen: bool,
    /// Emit the `^^pubview` monitoring stream.
    pub public_view: bool,
    /// Override for the flash image path (default: config dir).
    pub flash_path: Option<String>,
    /// Where this config was loaded from; `save` writes back there.
    #[serde(skip)]
    source_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 6666,
            bpm: 120.0,
            listen: false,
            public_view: false,
            flash_path: None,
            source_path: None,
        }
    }
}

impl Config {
    pub fn default_path() -> Option<PathBuf> {
        config_dir().map(|d| d.join("config.json"))
    }

    /// The file this config reads from and saves to: the `--config`
    /// override when given, otherwise the platform config dir.
    pub fn config_path(&self) -> Option<PathBuf> {
        self.source_path.clone().or_else(Self::default_path)
    }

    /// Load config, honoring an optional `--config` path override.
    /// Missing or invalid files fall back to defaults (which still
    /// remember the override so a later `save` lands there).
    pub fn load(override_path: Option<&Path>) -> Self {
        let path = match override_path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::default_path(),
        };
        let mut config = match &path {
            Some(p) if p.exists() => match std::fs::read_to_string(p) {
                Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                    log::warn!("config parse failed ({e}), using defaults");
                    Self::default()
                }),
                Err(e) => {
                    log::warn!("cannot read config: {e}");
                    Self::default()
                }
            },
            _ => Self::default(),
        };
        config.source_path = override_path.map(Path::to_path_buf);
        config
    }

    pub fn save(&self) {
        let path = match self.config_path() {
            Some(p) => p,
            None => return,
        };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(self) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&path, json) {
                    log::warn!("cannot save config: {e}");
                }
            }
            Err(e) => log::warn!("cannot serialize config: {e}"),
        }
    }

    /// Resolved flash image path, unless running fully in memory.
    pub fn flash_file(&self) -> Option<PathBuf> {
        match &self.flash_path {
            Some(p) => Some(PathBuf::from(p)),
            None => config_dir().map(|d| d.join("flash.bin")),
        }
    }
}

/// Get the application config directory.
fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        let home = std::env::var("HOME").ok()?;
        Some(
            PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("corvid"),
        )
    }

    #[cfg(target_os = "windows")]
    {
        let appdata = std::env::var("APPDATA").ok()?;
        Some(PathBuf::from(appdata).join("corvid"))
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        let home = std::env::var("HOME").ok()?;
        Some(PathBuf::from(home).join(".config").join("corvid"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let cfg: Config = serde_json::from_str("{\"port\": 7777}").unwrap();
        assert_eq!(cfg.port, 7777);
        assert_eq!(cfg.bpm, 120.0);
        assert!(!cfg.listen);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let cfg: Config =
            serde_json::from_str("{\"port\": 1234, \"someday_maybe\": true}").unwrap();
        assert_eq!(cfg.port, 1234);
    }

    #[test]
    fn round_trip_preserves_values() {
        let mut cfg = Config::default();
        cfg.listen = true;
        cfg.flash_path = Some("/tmp/flash.bin".into());
        let json = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert!(back.listen);
        assert_eq!(back.flash_path.as_deref(), Some("/tmp/flash.bin"));
    }

    #[test]
    fn override_path_is_loaded_and_remembered() {
        let mut path = std::env::temp_dir();
        path.push(format!("corvid-test-{}-config.json", std::process::id()));
        std::fs::write(&path, "{\"port\": 9999, \"bpm\": 90.0}").unwrap();

        let cfg = Config::load(Some(path.as_path()));
        assert_eq!(cfg.port, 9999);
        assert_eq!(cfg.bpm, 90.0);
        assert_eq!(cfg.config_path().as_deref(), Some(path.as_path()));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn missing_override_file_still_targets_it() {
        let path = Path::new("/nonexistent/corvid-config.json");
        let cfg = Config::load(Some(path));
        assert_eq!(cfg.port, 6666);
        assert_eq!(cfg.config_path().as_deref(), Some(path));
    }
}
