//! Configuration accessors: per-site settings, enable flags and global values.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use crate::{IndexerError, Result};

/// Section holding settings that apply to the whole process.
pub const GLOBAL_SECTION: &str = "global";

type Sections = BTreeMap<String, BTreeMap<String, String>>;

/// Sectioned key/value store. Each site's settings live in a section named
/// after its key; credentials are read from there.
pub trait Config: Send + Sync {
    /// Reads one value.
    fn get(&self, section: &str, key: &str) -> Result<Option<String>>;

    /// Writes one value and persists it.
    fn set(&self, section: &str, key: &str, value: &str) -> Result<()>;

    /// Reads a whole section; missing sections are empty.
    fn section(&self, section: &str) -> Result<BTreeMap<String, String>>;
}

/// Whether a site section has `enabled` set to a truthy value.
pub fn is_section_enabled(key: &str, config: &dyn Config) -> bool {
    match config.get(key, "enabled") {
        Ok(Some(value)) => matches!(value.trim(), "true" | "1" | "yes"),
        _ => false,
    }
}

/// Reads a value from the global section, falling back to a default.
pub fn global_setting(config: &dyn Config, key: &str, default: &str) -> Result<String> {
    Ok(config
        .get(GLOBAL_SECTION, key)?
        .unwrap_or_else(|| default.to_string()))
}

/// Config kept in memory only.
#[derive(Debug, Default)]
pub struct MemoryConfig {
    sections: Mutex<Sections>,
}

impl MemoryConfig {
    /// Creates an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter, useful in tests.
    pub fn with(self, section: &str, key: &str, value: &str) -> Self {
        if let Ok(mut sections) = self.sections.lock() {
            sections
                .entry(section.to_string())
                .or_default()
                .insert(key.to_string(), value.to_string());
        }
        self
    }
}

impl Config for MemoryConfig {
    fn get(&self, section: &str, key: &str) -> Result<Option<String>> {
        let sections = lock(&self.sections)?;
        Ok(sections.get(section).and_then(|s| s.get(key)).cloned())
    }

    fn set(&self, section: &str, key: &str, value: &str) -> Result<()> {
        let mut sections = lock(&self.sections)?;
        sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn section(&self, section: &str) -> Result<BTreeMap<String, String>> {
        let sections = lock(&self.sections)?;
        Ok(sections.get(section).cloned().unwrap_or_default())
    }
}

/// Config persisted as a JSON object of sections.
///
/// ```json
/// { "global": { "port": "5060" }, "demo": { "enabled": "true", "username": "me" } }
/// ```
#[derive(Debug)]
pub struct JsonConfig {
    path: PathBuf,
    sections: Mutex<Sections>,
}

impl JsonConfig {
    /// Opens a config file; a missing file is an empty config.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let sections = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            if raw.trim().is_empty() {
                Sections::new()
            } else {
                serde_json::from_str(&raw)?
            }
        } else {
            Sections::new()
        };
        debug!(path = %path.display(), sections = sections.len(), "Read config");
        Ok(Self {
            path,
            sections: Mutex::new(sections),
        })
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, sections: &Sections) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(sections)?)?;
        Ok(())
    }
}

impl Config for JsonConfig {
    fn get(&self, section: &str, key: &str) -> Result<Option<String>> {
        let sections = lock(&self.sections)?;
        Ok(sections.get(section).and_then(|s| s.get(key)).cloned())
    }

    fn set(&self, section: &str, key: &str, value: &str) -> Result<()> {
        let mut sections = lock(&self.sections)?;
        sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        self.save(&sections)
    }

    fn section(&self, section: &str) -> Result<BTreeMap<String, String>> {
        let sections = lock(&self.sections)?;
        Ok(sections.get(section).cloned().unwrap_or_default())
    }
}

fn lock(sections: &Mutex<Sections>) -> Result<std::sync::MutexGuard<'_, Sections>> {
    sections
        .lock()
        .map_err(|_| IndexerError::Transport("config lock poisoned".to_string()))
}

/// Default config file: `$TRACKER_PROXY_CONFIG`, else
/// `<config dir>/tracker-proxy/config.json`.
pub fn default_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("TRACKER_PROXY_CONFIG") {
        return Ok(PathBuf::from(path));
    }
    Ok(config_dir()?.join("config.json"))
}

/// Directory holding the config file and user definitions.
pub fn config_dir() -> Result<PathBuf> {
    base_dir("XDG_CONFIG_HOME", ".config")
}

/// Directory where debug page caches are written.
pub fn cache_dir() -> Result<PathBuf> {
    base_dir("XDG_CACHE_HOME", ".cache")
}

fn base_dir(xdg_var: &str, home_fallback: &str) -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(xdg_var) {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir).join("tracker-proxy"));
        }
    }
    let home = std::env::var("HOME")
        .map_err(|_| IndexerError::validation("HOME", "cannot locate home directory"))?;
    Ok(PathBuf::from(home).join(home_fallback).join("tracker-proxy"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_config_get_set() {
        let config = MemoryConfig::new();
        assert_eq!(config.get("demo", "username").unwrap(), None);
        config.set("demo", "username", "me").unwrap();
        assert_eq!(config.get("demo", "username").unwrap(), Some("me".to_string()));
    }

    #[test]
    fn test_memory_config_with() {
        let config = MemoryConfig::new().with("demo", "enabled", "true").with("demo", "a", "b");
        let section = config.section("demo").unwrap();
        assert_eq!(section.len(), 2);
        assert!(config.section("missing").unwrap().is_empty());
    }

    #[test]
    fn test_is_section_enabled() {
        let config = MemoryConfig::new()
            .with("on", "enabled", "true")
            .with("off", "enabled", "false")
            .with("one", "enabled", "1");
        assert!(is_section_enabled("on", &config));
        assert!(is_section_enabled("one", &config));
        assert!(!is_section_enabled("off", &config));
        assert!(!is_section_enabled("absent", &config));
    }

    #[test]
    fn test_global_setting_default() {
        let config = MemoryConfig::new().with(GLOBAL_SECTION, "port", "9117");
        assert_eq!(global_setting(&config, "port", "5060").unwrap(), "9117");
        assert_eq!(global_setting(&config, "bind", "0.0.0.0").unwrap(), "0.0.0.0");
    }

    #[test]
    fn test_json_config_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = JsonConfig::open(&path).unwrap();
        config.set("demo", "username", "me").unwrap();
        config.set("demo", "enabled", "true").unwrap();

        let reopened = JsonConfig::open(&path).unwrap();
        assert_eq!(reopened.get("demo", "username").unwrap(), Some("me".to_string()));
        assert!(is_section_enabled("demo", &reopened));
        assert_eq!(reopened.path(), path.as_path());
    }

    #[test]
    fn test_json_config_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config = JsonConfig::open(dir.path().join("none.json")).unwrap();
        assert!(config.section(GLOBAL_SECTION).unwrap().is_empty());
    }

    #[test]
    fn test_json_config_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(JsonConfig::open(&path), Err(IndexerError::Json(_))));
    }
}
