//! # Migration Ledger
//!
//! The table recording which migrations have been applied: one document per
//! applied migration, holding its ISO-8601 `timestamp`, `name` and
//! `filename`. A secondary index on `timestamp` gives the authoritative order.
//!
//! The table and its index are created on first use.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::{MigrationError, MigrationResult};
use super::{MigrationDescriptor, MigrationFile, MigrationTimestamp};
use crate::driver::{Document, Driver, DriverError, Query};

/// Default ledger table name
pub const DEFAULT_TABLE: &str = "_migrations";

/// Field the ledger is ordered by
pub const TIMESTAMP_INDEX: &str = "timestamp";

/// Record of one applied migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub timestamp: MigrationTimestamp,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl LedgerEntry {
    /// Whether this entry records `file`. Entries written without a filename
    /// are matched on timestamp and name.
    pub fn matches(&self, file: &MigrationFile) -> bool {
        match &self.filename {
            Some(filename) => *filename == file.filename,
            None => self.timestamp == file.timestamp && self.name == file.name,
        }
    }

    fn to_document(&self) -> Result<Document, DriverError> {
        match serde_json::to_value(self) {
            Ok(Value::Object(document)) => Ok(document),
            Ok(other) => Err(DriverError::InvalidQuery(format!("entry encoded as {}", other))),
            Err(e) => Err(DriverError::InvalidQuery(e.to_string())),
        }
    }

    /// Filter selecting this entry's document
    fn identity_filter(&self) -> Document {
        let mut filter = Document::new();
        match &self.filename {
            Some(filename) => {
                filter.insert("filename".to_string(), Value::String(filename.clone()));
            }
            None => {
                filter.insert("name".to_string(), Value::String(self.name.clone()));
                filter.insert(
                    "timestamp".to_string(),
                    Value::String(self.timestamp.to_iso_string()),
                );
            }
        }
        filter
    }
}

impl From<&MigrationDescriptor> for LedgerEntry {
    fn from(migration: &MigrationDescriptor) -> Self {
        Self {
            timestamp: migration.timestamp,
            name: migration.name.clone(),
            filename: Some(migration.filename.clone()),
        }
    }
}

/// Ledger table accessed through a driver
pub struct Ledger<'a> {
    driver: &'a dyn Driver,
    table: String,
}

impl<'a> Ledger<'a> {
    pub fn new(driver: &'a dyn Driver, table: impl Into<String>) -> Self {
        Self {
            driver,
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn error(&self, source: DriverError) -> MigrationError {
        MigrationError::ledger(&self.table, source)
    }

    /// Create the table and its timestamp index if missing, then wait for
    /// the index to be usable. Safe to call any number of times.
    pub async fn ensure_exists(&self) -> MigrationResult<()> {
        let tables = self.driver.list_tables().await.map_err(|e| self.error(e))?;
        if !tables.iter().any(|t| *t == self.table) {
            tracing::info!(table = %self.table, "creating migrations table");
            self.driver
                .create_table(&self.table)
                .await
                .map_err(|e| self.error(e))?;
        }

        let indexes = self
            .driver
            .list_indexes(&self.table)
            .await
            .map_err(|e| self.error(e))?;
        if !indexes.iter().any(|i| i == TIMESTAMP_INDEX) {
            tracing::debug!(table = %self.table, "creating timestamp index");
            self.driver
                .create_index(&self.table, TIMESTAMP_INDEX)
                .await
                .map_err(|e| self.error(e))?;
        }

        self.driver
            .wait_for_index(&self.table, TIMESTAMP_INDEX)
            .await
            .map_err(|e| self.error(e))
    }

    /// Every entry, ordered by timestamp
    pub async fn all(&self, descending: bool) -> MigrationResult<Vec<LedgerEntry>> {
        let output = self
            .driver
            .run_query(Query::OrderBy {
                table: self.table.clone(),
                index: TIMESTAMP_INDEX.to_string(),
                descending,
            })
            .await
            .map_err(|e| self.error(e))?;
        let rows = self.driver.to_array(output).await.map_err(|e| self.error(e))?;

        rows.into_iter()
            .map(|row| {
                serde_json::from_value(row).map_err(|e| MigrationError::MalformedEntry {
                    table: self.table.clone(),
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    /// Most recently applied entry
    pub async fn latest(&self) -> MigrationResult<Option<LedgerEntry>> {
        Ok(self.all(true).await?.into_iter().next())
    }

    /// Timestamp of the most recently applied entry, [`MigrationTimestamp::EPOCH`]
    /// when nothing has been applied
    pub async fn latest_timestamp(&self) -> MigrationResult<MigrationTimestamp> {
        Ok(self
            .latest()
            .await?
            .map_or(MigrationTimestamp::EPOCH, |entry| entry.timestamp))
    }

    /// Record an applied migration
    pub async fn record(&self, entry: &LedgerEntry) -> MigrationResult<()> {
        let document = entry.to_document().map_err(|e| self.error(e))?;

        let output = self
            .driver
            .run_query(Query::Insert {
                table: self.table.clone(),
                documents: vec![document],
            })
            .await
            .map_err(|e| self.error(e))?;
        self.driver.to_array(output).await.map_err(|e| self.error(e))?;

        tracing::debug!(table = %self.table, migration = %entry.name, "recorded migration");
        Ok(())
    }

    /// Remove a reverted migration's entry
    pub async fn unrecord(&self, entry: &LedgerEntry) -> MigrationResult<()> {
        let output = self
            .driver
            .run_query(Query::Delete {
                table: self.table.clone(),
                filter: entry.identity_filter(),
            })
            .await
            .map_err(|e| self.error(e))?;
        self.driver.to_array(output).await.map_err(|e| self.error(e))?;

        tracing::debug!(table = %self.table, migration = %entry.name, "removed migration record");
        Ok(())
    }
}
