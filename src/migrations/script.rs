//! # Script Migrations
//!
//! Declarative migrations: a YAML or JSON file listing the queries to run in
//! each direction. Queries run one after another through the driver; the
//! first failing query fails the migration.

use std::fs;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::discovery::MigrationLoader;
use super::errors::{MigrationError, MigrationResult};
use super::{MigrationCode, MigrationFile};
use crate::driver::{Driver, Query};

/// Queries to run in each direction
///
/// Each query is a single-key map naming the operation, in YAML and JSON
/// alike (`- table_create: { table: companies }`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationScript {
    #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
    pub up: Vec<Query>,

    #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
    pub down: Vec<Query>,
}

impl MigrationScript {
    /// Parse script content; `json` selects JSON, anything else YAML
    pub fn parse(content: &str, extension: &str) -> Result<Self, String> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        match extension {
            "json" => serde_json::from_str(content).map_err(|e| e.to_string()),
            _ => serde_yaml::from_str(content).map_err(|e| e.to_string()),
        }
    }

    async fn run_all(queries: &[Query], driver: &dyn Driver) -> MigrationResult<()> {
        for (i, query) in queries.iter().enumerate() {
            tracing::debug!(step = i, query = query.name(), table = ?query.table(), "script query");
            let output = driver.run_query(query.clone()).await?;
            driver.to_array(output).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MigrationCode for MigrationScript {
    async fn up(&self, driver: &dyn Driver) -> MigrationResult<()> {
        Self::run_all(&self.up, driver).await
    }

    async fn down(&self, driver: &dyn Driver) -> MigrationResult<()> {
        Self::run_all(&self.down, driver).await
    }
}

/// Loader for `.yaml`, `.yml` and `.json` script files
#[derive(Debug, Default)]
pub struct ScriptLoader;

impl ScriptLoader {
    pub fn new() -> Self {
        Self
    }
}

impl MigrationLoader for ScriptLoader {
    fn extensions(&self) -> Vec<String> {
        vec!["yaml".to_string(), "yml".to_string(), "json".to_string()]
    }

    fn load(&self, file: &MigrationFile) -> MigrationResult<Arc<dyn MigrationCode>> {
        let content = fs::read_to_string(&file.path).map_err(|e| MigrationError::FileRead {
            path: file.path.clone(),
            source: e,
        })?;

        let extension = file
            .path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        let script = MigrationScript::parse(&content, extension).map_err(|reason| {
            MigrationError::LoadFailed {
                filename: file.filename.clone(),
                reason,
            }
        })?;

        Ok(Arc::new(script))
    }
}
