//! # Migration Executor
//!
//! Runs a batch of migrations in one direction against a live driver.
//!
//! - `up` applies pending migrations oldest first. A migration is pending
//!   when it is newer than the latest ledger entry.
//! - `down` reverts applied migrations newest first, in ledger order.
//!
//! Migrations run strictly one at a time. The first failure aborts the rest
//! of the batch; migrations that already succeeded keep their ledger state.

use std::sync::Arc;

use super::discovery::Discovery;
use super::errors::{MigrationError, MigrationResult};
use super::ledger::{Ledger, LedgerEntry, DEFAULT_TABLE};
use super::{Direction, MigrationDescriptor, MigrationFile};
use crate::driver::Driver;
use crate::progress::{migrations_count, ProgressNotifier};

/// Migration executor
pub struct Executor<'a> {
    driver: &'a dyn Driver,
    discovery: Arc<Discovery>,
    table: String,
    step: Option<usize>,
    ignore_timestamp: bool,
    notifier: ProgressNotifier,
}

impl<'a> Executor<'a> {
    pub fn new(driver: &'a dyn Driver, discovery: Arc<Discovery>) -> Self {
        Self {
            driver,
            discovery,
            table: DEFAULT_TABLE.to_string(),
            step: None,
            ignore_timestamp: false,
            notifier: ProgressNotifier::global(),
        }
    }

    /// Ledger table name
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Process at most `step` migrations; `None` processes all
    pub fn step(mut self, step: Option<usize>) -> Self {
        self.step = step;
        self
    }

    /// Treat every discovered migration not yet in the ledger as pending,
    /// even when older than the latest applied one
    pub fn ignore_timestamp(mut self, ignore: bool) -> Self {
        self.ignore_timestamp = ignore;
        self
    }

    pub fn notifier(mut self, notifier: ProgressNotifier) -> Self {
        self.notifier = notifier;
        self
    }

    pub async fn run(&self, direction: Direction) -> MigrationResult<MigrationRunReport> {
        match direction {
            Direction::Up => self.up().await,
            Direction::Down => self.down().await,
        }
    }

    /// Apply pending migrations, oldest first
    pub async fn up(&self) -> MigrationResult<MigrationRunReport> {
        let ledger = Ledger::new(self.driver, &self.table);
        ledger.ensure_exists().await?;

        let pending = self.pending(&ledger).await?;
        let batch = limit_to_steps(pending, self.step);
        tracing::debug!(count = batch.len(), step = ?self.step, "running up batch");

        let mut report = MigrationRunReport::new(Direction::Up);
        for migration in &batch {
            self.execute(migration, Direction::Up).await?;
            ledger.record(&LedgerEntry::from(migration)).await?;
            report.migrations.push(migration.name.clone());
        }

        self.notifier.info(report.message());
        Ok(report)
    }

    /// Revert applied migrations, newest first
    pub async fn down(&self) -> MigrationResult<MigrationRunReport> {
        let ledger = Ledger::new(self.driver, &self.table);
        ledger.ensure_exists().await?;

        let applied = limit_to_steps(ledger.all(true).await?, self.step);
        let batch = self.correlate(applied)?;
        tracing::debug!(count = batch.len(), step = ?self.step, "running down batch");

        let mut report = MigrationRunReport::new(Direction::Down);
        for (entry, migration) in &batch {
            self.execute(migration, Direction::Down).await?;
            ledger.unrecord(entry).await?;
            report.migrations.push(migration.name.clone());
        }

        self.notifier.info(report.message());
        Ok(report)
    }

    /// Discovered migrations not yet applied, oldest first. Only these are
    /// loaded, so an applied file that no longer loads does not block `up`.
    async fn pending(&self, ledger: &Ledger<'_>) -> MigrationResult<Vec<MigrationDescriptor>> {
        let files = self.discovery.scan()?;

        let pending: Vec<MigrationFile> = if self.ignore_timestamp {
            let applied = ledger.all(false).await?;
            files
                .into_iter()
                .filter(|f| !applied.iter().any(|e| e.matches(f)))
                .collect()
        } else {
            let latest = ledger.latest_timestamp().await?;
            tracing::debug!(latest = %latest, "latest applied migration");
            files.into_iter().filter(|f| f.timestamp > latest).collect()
        };

        self.discovery.load_all(pending)
    }

    /// Pair ledger entries with their files and load them, keeping ledger order
    fn correlate(
        &self,
        entries: Vec<LedgerEntry>,
    ) -> MigrationResult<Vec<(LedgerEntry, MigrationDescriptor)>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let files = self.discovery.scan()?;
        entries
            .into_iter()
            .map(|entry| -> MigrationResult<(LedgerEntry, MigrationDescriptor)> {
                let file = files
                    .iter()
                    .find(|f| entry.matches(f))
                    .cloned()
                    .ok_or_else(|| MigrationError::MigrationNotFound {
                        name: entry.filename.clone().unwrap_or_else(|| entry.name.clone()),
                    })?;
                let migration = self.discovery.load(file)?;
                Ok((entry, migration))
            })
            .collect()
    }

    async fn execute(
        &self,
        migration: &MigrationDescriptor,
        direction: Direction,
    ) -> MigrationResult<()> {
        tracing::debug!(migration = %migration.filename, %direction, "executing migration");

        migration
            .code
            .run(direction, self.driver)
            .await
            .map_err(|e| MigrationError::ExecutionFailed {
                name: migration.name.clone(),
                direction,
                reason: e.to_string(),
            })?;

        self.notifier
            .info(format!("Executed migration {} {}", migration.name, direction));
        Ok(())
    }
}

/// Keep the first `step` items, or all of them without a limit
pub fn limit_to_steps<T>(mut items: Vec<T>, step: Option<usize>) -> Vec<T> {
    if let Some(step) = step {
        items.truncate(step);
    }
    items
}

/// Report from a migration run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRunReport {
    pub direction: Direction,
    /// Names of the migrations run, in execution order
    pub migrations: Vec<String>,
}

impl MigrationRunReport {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            migrations: Vec::new(),
        }
    }

    pub fn count(&self) -> usize {
        self.migrations.len()
    }

    /// Batch summary line
    pub fn message(&self) -> String {
        match (self.direction, self.count()) {
            (Direction::Up, 0) => "No migrations executed.".to_string(),
            (Direction::Up, n) => format!("Executed {}.", migrations_count(n)),
            (Direction::Down, 0) => "Migrations table already clear.".to_string(),
            (Direction::Down, n) => format!("Cleared {} from table.", migrations_count(n)),
        }
    }
}
