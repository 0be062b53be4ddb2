//! # Migration Discovery
//!
//! Lists a migrations directory, keeps the files named
//! `<YYYYMMDDHHmmss>-<name>.<ext>` for an extension the loader understands,
//! and resolves each one into runnable code.
//!
//! Files that do not match the pattern are skipped without error.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use super::errors::{MigrationError, MigrationResult};
use super::{MigrationCode, MigrationDescriptor, MigrationFile, MigrationTimestamp};

static MIGRATION_FILENAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{14})-(.*)\.([^.]+)$").expect("valid regex"));

/// Resolves a migration file into its code
pub trait MigrationLoader: Send + Sync {
    /// Extensions (without the dot) this loader handles
    fn extensions(&self) -> Vec<String>;

    fn load(&self, file: &MigrationFile) -> MigrationResult<Arc<dyn MigrationCode>>;
}

/// Loader for migrations compiled into the binary
///
/// Files on disk only mark the migration's timestamp and name; the code is
/// looked up by name among the registered implementations.
pub struct RegistryLoader {
    migrations: HashMap<String, Arc<dyn MigrationCode>>,
    extensions: Vec<String>,
}

impl RegistryLoader {
    /// Registry matching `.rs` files
    pub fn new() -> Self {
        Self::with_extensions(&["rs"])
    }

    pub fn with_extensions(extensions: &[&str]) -> Self {
        Self {
            migrations: HashMap::new(),
            extensions: extensions.iter().map(|e| e.to_string()).collect(),
        }
    }

    /// Register the code for the migration called `name`
    pub fn register(mut self, name: impl Into<String>, code: Arc<dyn MigrationCode>) -> Self {
        self.migrations.insert(name.into(), code);
        self
    }
}

impl Default for RegistryLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl MigrationLoader for RegistryLoader {
    fn extensions(&self) -> Vec<String> {
        self.extensions.clone()
    }

    fn load(&self, file: &MigrationFile) -> MigrationResult<Arc<dyn MigrationCode>> {
        self.migrations
            .get(&file.name)
            .cloned()
            .ok_or_else(|| MigrationError::LoadFailed {
                filename: file.filename.clone(),
                reason: format!("no migration registered under '{}'", file.name),
            })
    }
}

/// Migration discovery over one directory
pub struct Discovery {
    directory: PathBuf,
    loader: Arc<dyn MigrationLoader>,
}

impl Discovery {
    pub fn new(directory: PathBuf, loader: Arc<dyn MigrationLoader>) -> Self {
        Self { directory, loader }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Parse one filename.
    ///
    /// `Ok(None)` when the name is not a migration filename; an error when it
    /// is one but its timestamp names no real instant.
    pub fn parse_filename(&self, filename: &str) -> MigrationResult<Option<MigrationFile>> {
        let Some(captures) = MIGRATION_FILENAME.captures(filename) else {
            return Ok(None);
        };

        let extension = &captures[3];
        if !self.loader.extensions().iter().any(|e| e == extension) {
            return Ok(None);
        }

        let raw_timestamp = &captures[1];
        let timestamp = MigrationTimestamp::from_filename_component(raw_timestamp).ok_or_else(
            || MigrationError::InvalidTimestamp {
                filename: filename.to_string(),
                value: raw_timestamp.to_string(),
            },
        )?;

        Ok(Some(MigrationFile {
            timestamp,
            name: captures[2].to_string(),
            filename: filename.to_string(),
            path: self.directory.join(filename),
        }))
    }

    /// Every migration file in the directory, oldest first
    pub fn scan(&self) -> MigrationResult<Vec<MigrationFile>> {
        let read_error = |source: std::io::Error| MigrationError::DirectoryRead {
            path: self.directory.clone(),
            source,
        };

        let mut files = Vec::new();
        for entry in fs::read_dir(&self.directory).map_err(read_error)? {
            let entry = entry.map_err(read_error)?;
            if !entry.file_type().map_err(read_error)?.is_file() {
                continue;
            }

            let Some(filename) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            match self.parse_filename(&filename)? {
                Some(file) => files.push(file),
                None => tracing::debug!(file = %filename, "skipping non-migration file"),
            }
        }

        sort_ascending(&mut files);
        tracing::debug!(
            directory = %self.directory.display(),
            count = files.len(),
            "scanned migrations directory"
        );
        Ok(files)
    }

    /// Resolve a file's code
    pub fn load(&self, file: MigrationFile) -> MigrationResult<MigrationDescriptor> {
        let code = self.loader.load(&file)?;
        Ok(MigrationDescriptor::new(file, code))
    }

    pub fn load_all(&self, files: Vec<MigrationFile>) -> MigrationResult<Vec<MigrationDescriptor>> {
        files.into_iter().map(|file| self.load(file)).collect()
    }

    /// Scan and load every migration, oldest first
    pub fn discover(&self) -> MigrationResult<Vec<MigrationDescriptor>> {
        let files = self.scan()?;
        self.load_all(files)
    }
}

/// Order by timestamp, then name, so equal timestamps still sort deterministically
pub fn sort_ascending(files: &mut [MigrationFile]) {
    files.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.name.cmp(&b.name)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::script::ScriptLoader;
    use std::fs;
    use tempfile::TempDir;

    const EMPTY_SCRIPT: &str = "up: []\ndown: []\n";

    fn discovery(dir: &Path) -> Discovery {
        Discovery::new(dir.to_path_buf(), Arc::new(ScriptLoader::new()))
    }

    #[test]
    fn test_parse_filename() {
        let temp_dir = TempDir::new().unwrap();
        let discovery = discovery(temp_dir.path());

        let file = discovery
            .parse_filename("20200101000000-create-table.yaml")
            .unwrap()
            .unwrap();
        assert_eq!(file.name, "create-table");
        assert_eq!(file.timestamp.to_filename_component(), "20200101000000");
        assert_eq!(file.path, temp_dir.path().join("20200101000000-create-table.yaml"));

        let dotted = discovery
            .parse_filename("20200101000000-add.v2.fields.json")
            .unwrap()
            .unwrap();
        assert_eq!(dotted.name, "add.v2.fields");
    }

    #[test]
    fn test_non_matching_names_are_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let discovery = discovery(temp_dir.path());

        for name in [
            "not-a-migration.js",
            "2020010100000-short.yaml",
            "20200101000000_underscore.yaml",
            "20200101000000-create-table.js",
            "README.md",
        ] {
            assert!(discovery.parse_filename(name).unwrap().is_none(), "{}", name);
        }
    }

    #[test]
    fn test_invalid_calendar_timestamp_fails() {
        let temp_dir = TempDir::new().unwrap();
        let discovery = discovery(temp_dir.path());

        let result = discovery.parse_filename("20201301000000-bad-month.yaml");
        assert!(matches!(
            result,
            Err(MigrationError::InvalidTimestamp { .. })
        ));
    }

    #[test]
    fn test_scan_sorts_and_filters() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        fs::write(dir.join("20200102000000-seed-data.yaml"), EMPTY_SCRIPT).unwrap();
        fs::write(dir.join("20200101000000-create-table.yaml"), EMPTY_SCRIPT).unwrap();
        fs::write(dir.join("not-a-migration.js"), "garbage").unwrap();
        fs::create_dir(dir.join("20200103000000-a-directory.yaml")).unwrap();

        let files = discovery(dir).scan().unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["create-table", "seed-data"]);
    }

    #[test]
    fn test_empty_directory_is_not_an_error() {
        let temp_dir = TempDir::new().unwrap();
        assert!(discovery(temp_dir.path()).discover().unwrap().is_empty());
    }

    #[test]
    fn test_missing_directory_fails() {
        let temp_dir = TempDir::new().unwrap();
        let result = discovery(&temp_dir.path().join("missing")).scan();
        assert!(matches!(result, Err(MigrationError::DirectoryRead { .. })));
    }

    #[test]
    fn test_load_failure_fails_discovery() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        fs::write(dir.join("20200101000000-broken.yaml"), "up: [ { no_such_query: {} } ]").unwrap();

        let result = discovery(dir).discover();
        assert!(matches!(result, Err(MigrationError::LoadFailed { .. })));
    }

    #[test]
    fn test_registry_loader() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        fs::write(dir.join("20200101000000-known.rs"), "").unwrap();
        fs::write(dir.join("20200102000000-unknown.rs"), "").unwrap();

        let script: Arc<dyn MigrationCode> =
            Arc::new(crate::migrations::script::MigrationScript::default());
        let loader = RegistryLoader::new().register("known", script);
        let discovery = Discovery::new(dir.to_path_buf(), Arc::new(loader));

        let files = discovery.scan().unwrap();
        assert_eq!(files.len(), 2);
        assert!(discovery.load(files[0].clone()).is_ok());
        assert!(matches!(
            discovery.load(files[1].clone()),
            Err(MigrationError::LoadFailed { .. })
        ));
    }
}
