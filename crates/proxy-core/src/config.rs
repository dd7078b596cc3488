use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::{fs, io};

use anyhow::{Context, Result};
use log::*;
use serde::{Deserialize, Serialize};

/// The name of the config file, which lives in the addon directory.
pub const CONFIG_FILE: &str = "addons_config.toml";

/// Which addons are enabled, plus a few global debug switches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where this config is saved. Not part of the file itself.
    #[serde(skip)]
    path: PathBuf,

    /// Addon display name to enabled flag. Addons not listed here are
    /// enabled.
    addons: BTreeMap<String, bool>,

    debug: DebugOptions,
}

/// Global switches for debug visualizations drawn by the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugOptions {
    pub show_fps_counter: bool,
    pub show_custom_shader_border: bool,
}

impl Config {
    /// Loads the config at `path`, or returns the defaults if it doesn't
    /// exist yet.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut config = match fs::read_to_string(&path) {
            Ok(text) => toml::from_str::<Config>(&text)
                .with_context(|| format!("failed to parse {}", path.display()))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Config::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        config.path = path;
        Ok(config)
    }

    /// Like [Config::load], but a file that can't be read or parsed is
    /// logged and replaced by the defaults. The next save overwrites it.
    pub fn load_or_default(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Config::load(&path).unwrap_or_else(|e| {
            warn!("Using the default addon config: {e:#}");
            Config {
                path,
                ..Config::default()
            }
        })
    }

    /// Writes this config back to the path it was loaded from.
    pub fn save(&self) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&self.path, toml::to_string_pretty(self)?)
            .with_context(|| format!("failed to write {}", self.path.display()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns whether the addon with the given display name is enabled.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.addons.get(name).copied().unwrap_or(true)
    }

    pub fn set_enabled(&mut self, name: impl Into<String>, enabled: bool) {
        self.addons.insert(name.into(), enabled);
    }

    pub fn debug(&self) -> DebugOptions {
        self.debug
    }

    pub fn debug_mut(&mut self) -> &mut DebugOptions {
        &mut self.debug
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(dir.path().join(CONFIG_FILE)).unwrap();
        assert!(config.is_enabled("Anything"));
        assert_eq!(config.debug(), DebugOptions::default());
    }

    #[test]
    fn saved_state_is_loaded_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("addons").join(CONFIG_FILE);

        let mut config = Config::load(&path).unwrap();
        config.set_enabled("Custom Shaders", false);
        config.set_enabled("Other", true);
        config.debug_mut().show_fps_counter = true;
        config.save().unwrap();

        let loaded = Config::load(&path).unwrap();
        assert!(!loaded.is_enabled("Custom Shaders"));
        assert!(loaded.is_enabled("Other"));
        assert!(loaded.debug().show_fps_counter);
        assert!(!loaded.debug().show_custom_shader_border);
        assert_eq!(loaded, config);
    }

    #[test]
    fn hand_written_file_is_accepted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(
            &path,
            "[addons]\n\"LS Custom Shaders\" = false\n\n[debug]\nshow_custom_shader_border = true\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert!(!config.is_enabled("LS Custom Shaders"));
        assert!(config.debug().show_custom_shader_border);
        assert!(!config.debug().show_fps_counter);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "[addons\n").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "[addons\n\"LS Custom Shaders\" = false\n").unwrap();

        let config = Config::load_or_default(&path);
        assert!(config.is_enabled("LS Custom Shaders"));
        assert_eq!(config.debug(), DebugOptions::default());
        assert_eq!(config.path(), path);

        // Saving replaces the broken file with one that parses.
        config.save().unwrap();
        assert_eq!(Config::load(&path).unwrap(), config);
    }
}
