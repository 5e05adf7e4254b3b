//! Definition store: built-in documents and user directories.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::{self, is_section_enabled, Config};
use crate::definition::{load_definition_file, parse_definition, Definition};
use crate::definitions::BUILTIN;
use crate::{IndexerError, Result};

/// Environment variable naming an extra definitions directory.
pub const DEFINITIONS_ENV: &str = "TRACKER_PROXY_DEFINITIONS";

/// Source of site definitions.
pub trait DefinitionLoader: Send + Sync {
    /// Keys of every definition this loader can load, sorted.
    fn list(&self) -> Result<Vec<String>>;

    /// Loads and validates one definition.
    fn load(&self, key: &str) -> Result<Definition>;
}

/// Keys of the definitions whose config section is enabled.
pub fn list_enabled(loader: &dyn DefinitionLoader, config: &dyn Config) -> Result<Vec<String>> {
    Ok(loader
        .list()?
        .into_iter()
        .filter(|key| is_section_enabled(key, config))
        .collect())
}

fn check_key(key: &str) -> Result<()> {
    if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
        return Err(IndexerError::validation("key", format!("'{}' is not a definition key", key)));
    }
    Ok(())
}

/// Serves the definitions compiled into the binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinLoader;

impl DefinitionLoader for BuiltinLoader {
    fn list(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = BUILTIN.iter().map(|(key, _)| key.to_string()).collect();
        keys.sort();
        Ok(keys)
    }

    fn load(&self, key: &str) -> Result<Definition> {
        let (_, source) = BUILTIN
            .iter()
            .find(|(k, _)| *k == key)
            .ok_or_else(|| IndexerError::NotFound(key.to_string()))?;
        parse_definition(source)
    }
}

/// Reads `<dir>/<key>.yml` or `<dir>/<key>.yaml`.
#[derive(Debug, Clone)]
pub struct DirectoryLoader {
    dir: PathBuf,
}

impl DirectoryLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Option<PathBuf> {
        ["yml", "yaml"]
            .iter()
            .map(|ext| self.dir.join(format!("{}.{}", key, ext)))
            .find(|path| path.is_file())
    }
}

impl DefinitionLoader for DirectoryLoader {
    /// A missing directory lists nothing.
    fn list(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = BTreeSet::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let is_yaml = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yml") | Some("yaml")
            );
            if !is_yaml || !path.is_file() {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                keys.insert(stem.to_string());
            }
        }
        Ok(keys.into_iter().collect())
    }

    fn load(&self, key: &str) -> Result<Definition> {
        check_key(key)?;
        let path = self
            .path_for(key)
            .ok_or_else(|| IndexerError::NotFound(key.to_string()))?;
        debug!(key, path = %path.display(), "Loading definition");
        let definition = load_definition_file(&path)?;
        if definition.site != key {
            warn!(key, site = %definition.site, "Definition file name and site key differ");
        }
        Ok(definition)
    }
}

/// Consults its loaders in order; the first one holding a key wins.
pub struct LayeredLoader {
    loaders: Vec<Box<dyn DefinitionLoader>>,
}

impl LayeredLoader {
    pub fn new() -> Self {
        Self { loaders: Vec::new() }
    }

    pub fn with<L: DefinitionLoader + 'static>(mut self, loader: L) -> Self {
        self.loaders.push(Box::new(loader));
        self
    }

    pub fn len(&self) -> usize {
        self.loaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }
}

impl Default for LayeredLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl DefinitionLoader for LayeredLoader {
    fn list(&self) -> Result<Vec<String>> {
        let mut keys = BTreeSet::new();
        for loader in &self.loaders {
            keys.extend(loader.list()?);
        }
        Ok(keys.into_iter().collect())
    }

    fn load(&self, key: &str) -> Result<Definition> {
        for loader in &self.loaders {
            match loader.load(key) {
                Err(IndexerError::NotFound(_)) => continue,
                other => return other,
            }
        }
        Err(IndexerError::NotFound(key.to_string()))
    }
}

/// User directories first (`$TRACKER_PROXY_DEFINITIONS`,
/// `<config dir>/definitions`, `./definitions`), then the built-ins.
pub fn default_loader() -> Result<LayeredLoader> {
    let mut loader = LayeredLoader::new();
    if let Ok(dir) = std::env::var(DEFINITIONS_ENV) {
        if !dir.is_empty() {
            loader = loader.with(DirectoryLoader::new(dir));
        }
    }
    loader = loader
        .with(DirectoryLoader::new(config::config_dir()?.join("definitions")))
        .with(DirectoryLoader::new("definitions"))
        .with(BuiltinLoader);
    Ok(loader)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::definition::ResponseKind;

    const USER_DEMO: &str = r#"
site: demo
name: My Demo
links: [https://mine.test/]
search:
  path: /s
  rows: { selector: tr }
  fields:
    title: { selector: a }
    download: { selector: a, attribute: href }
"#;

    #[test]
    fn test_builtins_parse() {
        let loader = BuiltinLoader;
        let keys = loader.list().unwrap();
        assert_eq!(keys, vec!["demo", "demo-rss"]);
        for key in keys {
            let def = loader.load(&key).unwrap();
            assert_eq!(def.site, key);
        }
        assert_eq!(loader.load("demo-rss").unwrap().search.response, ResponseKind::Xml);
    }

    #[test]
    fn test_builtin_not_found() {
        assert!(matches!(BuiltinLoader.load("nope"), Err(IndexerError::NotFound(_))));
    }

    #[test]
    fn test_directory_loader() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("demo.yaml"), USER_DEMO).unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let loader = DirectoryLoader::new(dir.path());
        assert_eq!(loader.list().unwrap(), vec!["demo"]);
        assert_eq!(loader.load("demo").unwrap().name, "My Demo");
        assert!(matches!(loader.load("other"), Err(IndexerError::NotFound(_))));
        assert!(matches!(
            loader.load("../demo"),
            Err(IndexerError::Validation { .. })
        ));
    }

    #[test]
    fn test_directory_loader_invalid_definition() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bad.yml"), "site: bad\nlinks: [https://bad.test/]\n").unwrap();
        let loader = DirectoryLoader::new(dir.path());
        assert!(matches!(loader.load("bad"), Err(IndexerError::Validation { .. })));
    }

    #[test]
    fn test_missing_directory_lists_nothing() {
        let loader = DirectoryLoader::new("/nonexistent/tracker-proxy/definitions");
        assert!(loader.list().unwrap().is_empty());
    }

    #[test]
    fn test_layered_user_wins() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("demo.yml"), USER_DEMO).unwrap();

        let loader = LayeredLoader::new()
            .with(DirectoryLoader::new(dir.path()))
            .with(BuiltinLoader);
        assert_eq!(loader.list().unwrap(), vec!["demo", "demo-rss"]);
        assert_eq!(loader.load("demo").unwrap().name, "My Demo");
        assert_eq!(loader.load("demo-rss").unwrap().name, "Demo RSS");
        assert!(matches!(loader.load("x"), Err(IndexerError::NotFound(_))));
    }

    #[test]
    fn test_list_enabled() {
        let config = MemoryConfig::new().with("demo-rss", "enabled", "true");
        let keys = list_enabled(&BuiltinLoader, &config).unwrap();
        assert_eq!(keys, vec!["demo-rss"]);
    }
}
