//! # Migration Generator
//!
//! Scaffolds new script migration files named after the current UTC time.

use std::fs;
use std::path::{Path, PathBuf};

use super::errors::{MigrationError, MigrationResult};
use super::MigrationTimestamp;

/// Body written into every new migration
const TEMPLATE: &str = r#"# Queries run in order; the first failure aborts the migration.
#
# up:
#   - table_create:
#       table: companies
#   - index_create:
#       table: companies
#       field: name
# down:
#   - table_drop:
#       table: companies
up: []
down: []
"#;

/// Migration generator
pub struct MigrationGenerator {
    migrations_dir: PathBuf,
}

impl MigrationGenerator {
    pub fn new(migrations_dir: PathBuf) -> Self {
        Self { migrations_dir }
    }

    pub fn directory(&self) -> &Path {
        &self.migrations_dir
    }

    /// Write `<YYYYMMDDHHmmss>-<name>.yaml` stamped with the current time
    pub fn create(&self, name: &str) -> MigrationResult<PathBuf> {
        self.create_at(name, MigrationTimestamp::now())
    }

    /// Write a new migration stamped with `timestamp`, creating the
    /// directory if needed
    pub fn create_at(&self, name: &str, timestamp: MigrationTimestamp) -> MigrationResult<PathBuf> {
        validate_name(name)?;

        fs::create_dir_all(&self.migrations_dir).map_err(|e| MigrationError::FileWrite {
            path: self.migrations_dir.clone(),
            source: e,
        })?;

        let filename = format!("{}-{}.yaml", timestamp.to_filename_component(), name);
        let file_path = self.migrations_dir.join(filename);

        if file_path.exists() {
            return Err(MigrationError::InvalidName {
                name: name.to_string(),
                reason: format!("{} already exists", file_path.display()),
            });
        }

        fs::write(&file_path, Self::template()).map_err(|e| MigrationError::FileWrite {
            path: file_path.clone(),
            source: e,
        })?;

        tracing::info!(path = %file_path.display(), "created migration");
        Ok(file_path)
    }

    pub fn template() -> &'static str {
        TEMPLATE
    }
}

fn validate_name(name: &str) -> MigrationResult<()> {
    let invalid = |reason: &str| MigrationError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.trim().is_empty() {
        return Err(invalid("name cannot be empty"));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(invalid("name cannot contain path separators"));
    }
    if name.chars().any(char::is_control) {
        return Err(invalid("name cannot contain control characters"));
    }

    Ok(())
}
