//! # Run Lifecycle
//!
//! Sequences one invocation:
//!
//! 1. Validate options
//! 2. Build the driver and connect (a pool over an explicit server list
//!    connects lazily instead)
//! 3. Create the target database if missing, then select it
//! 4. Run the requested direction
//! 5. Close the connection, or drain the pool
//!
//! The first failing stage ends the run with its error. The connection is
//! still closed on the way out.

use std::sync::Arc;

use crate::driver::{Connector, DirectDriver, Driver, DriverKind, PoolDriver};
use crate::migrations::{
    Direction, Discovery, Executor, MigrationLoader, MigrationResult, MigrationRunReport,
    ScriptLoader,
};
use crate::options::RunOptions;
use crate::progress::ProgressNotifier;

/// Runs migrations against a database reached through a [`Connector`]
pub struct Migrator {
    options: RunOptions,
    connector: Arc<dyn Connector>,
    loader: Arc<dyn MigrationLoader>,
    notifier: ProgressNotifier,
}

impl Migrator {
    /// Script migrations, progress on the process-wide notifier
    pub fn new(options: RunOptions, connector: Arc<dyn Connector>) -> Self {
        Self {
            options,
            connector,
            loader: Arc::new(ScriptLoader::new()),
            notifier: ProgressNotifier::global(),
        }
    }

    pub fn with_loader(mut self, loader: Arc<dyn MigrationLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn with_notifier(mut self, notifier: ProgressNotifier) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    pub fn into_options(self) -> RunOptions {
        self.options
    }

    pub async fn run(&self) -> MigrationResult<MigrationRunReport> {
        let notifier = if self.options.silent {
            self.notifier.silenced()
        } else {
            self.notifier.clone()
        };

        notifier.info("Validating options");
        self.options.validate()?;
        let direction = self.options.operation()?;

        notifier.info("Connecting to database");
        let driver = self.connect().await?;

        let result = self.execute(driver.as_ref(), direction, &notifier).await;
        match result {
            Ok(report) => {
                notifier.info("Closing connection");
                driver.close().await?;
                Ok(report)
            }
            Err(e) => {
                if let Err(close_error) = driver.close().await {
                    tracing::warn!(error = %close_error, "failed to close connection after error");
                }
                Err(e)
            }
        }
    }

    async fn connect(&self) -> MigrationResult<Box<dyn Driver>> {
        let options = &self.options;
        let driver: Box<dyn Driver> = match options.driver {
            DriverKind::Direct => Box::new(
                DirectDriver::connect(self.connector.as_ref(), &options.connect_params()).await?,
            ),
            DriverKind::Pool if options.servers.is_some() && options.uses_pool() => {
                tracing::debug!("deferring pool connections to first query");
                Box::new(PoolDriver::lazy(
                    Arc::clone(&self.connector),
                    options.pool_config(),
                ))
            }
            DriverKind::Pool => Box::new(
                PoolDriver::connect(Arc::clone(&self.connector), options.pool_config()).await?,
            ),
        };

        tracing::debug!(driver = %driver.kind(), db = %options.db, "driver ready");
        Ok(driver)
    }

    async fn execute(
        &self,
        driver: &dyn Driver,
        direction: Direction,
        notifier: &ProgressNotifier,
    ) -> MigrationResult<MigrationRunReport> {
        let db = &self.options.db;
        let databases = driver.list_databases().await?;
        if !databases.iter().any(|d| d == db) {
            notifier.info(format!("Creating db {}", db));
            driver.create_database(db).await?;
        }
        driver.use_database(db).await?;

        notifier.info("Executing Migrations");
        let discovery = Discovery::new(self.options.migrations_path(), Arc::clone(&self.loader));

        Executor::new(driver, Arc::new(discovery))
            .table(self.options.migrations_table.clone())
            .step(self.options.step)
            .ignore_timestamp(self.options.ignore_timestamp)
            .notifier(notifier.clone())
            .run(direction)
            .await
    }
}

/// Run one invocation and hand the options back for chaining
pub async fn migrate(
    options: RunOptions,
    connector: Arc<dyn Connector>,
) -> MigrationResult<RunOptions> {
    let migrator = Migrator::new(options, connector);
    migrator.run().await?;
    Ok(migrator.into_options())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverError, MemoryConnector, ServerAddr};
    use crate::migrations::MigrationError;
    use serde_json::{json, Value};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn write_companies_migrations(dir: &Path) {
        fs::write(
            dir.join("20200101000000-create-table.yaml"),
            "up:\n  - table_create: { table: companies }\ndown:\n  - table_drop: { table: companies }\n",
        )
        .unwrap();
        fs::write(
            dir.join("20200102000000-seed-data.yaml"),
            "up:\n  - insert: { table: companies, documents: [ { id: acme, name: ACME } ] }\n\
             down:\n  - delete: { table: companies, filter: { id: acme } }\n",
        )
        .unwrap();
        fs::write(dir.join("not-a-migration.js"), "module.exports = {}").unwrap();
    }

    fn options(op: Direction, dir: &TempDir) -> RunOptions {
        RunOptions::new(op, "app")
            .relative_to(dir.path())
            .migrations_directory(".")
    }

    fn drain(receiver: &mut tokio::sync::broadcast::Receiver<crate::progress::Progress>) -> Vec<String> {
        let mut messages = Vec::new();
        while let Ok(progress) = receiver.try_recv() {
            messages.push(progress.message);
        }
        messages
    }

    #[tokio::test]
    async fn test_up_then_down_scenario() {
        let temp_dir = TempDir::new().unwrap();
        write_companies_migrations(temp_dir.path());
        let connector = Arc::new(MemoryConnector::new());
        let server = connector.server();
        let notifier = ProgressNotifier::new();
        let mut progress = notifier.subscribe();

        let report = Migrator::new(options(Direction::Up, &temp_dir), connector.clone())
            .with_notifier(notifier.clone())
            .run()
            .await
            .unwrap();
        assert_eq!(report.migrations, vec!["create-table", "seed-data"]);
        assert_eq!(
            drain(&mut progress),
            vec![
                "Validating options",
                "Connecting to database",
                "Creating db app",
                "Executing Migrations",
                "Executed migration create-table up",
                "Executed migration seed-data up",
                "Executed 2 migrations.",
                "Closing connection",
            ]
        );

        let companies = server.documents("app", "companies").await.unwrap();
        assert_eq!(companies.len(), 1);
        assert_eq!(companies[0]["id"], json!("acme"));
        let ledger = server.documents("app", "_migrations").await.unwrap();
        let names: Vec<&Value> = ledger.iter().map(|e| &e["name"]).collect();
        assert_eq!(names, vec![&json!("create-table"), &json!("seed-data")]);

        let report = Migrator::new(options(Direction::Down, &temp_dir), connector)
            .with_notifier(notifier)
            .run()
            .await
            .unwrap();
        assert_eq!(report.migrations, vec!["seed-data", "create-table"]);
        assert_eq!(server.tables("app").await.unwrap(), vec!["_migrations".to_string()]);
        assert!(server.documents("app", "_migrations").await.unwrap().is_empty());

        let messages = drain(&mut progress);
        assert!(!messages.iter().any(|m| m.starts_with("Creating db")));
        assert!(messages.contains(&"Cleared 2 migrations from table.".to_string()));
    }

    #[tokio::test]
    async fn test_invalid_options_touch_nothing() {
        let connector = Arc::new(MemoryConnector::new());

        let result = Migrator::new(RunOptions::new(Direction::Up, ""), connector.clone())
            .with_notifier(ProgressNotifier::new())
            .run()
            .await;

        let err = result.unwrap_err();
        assert!(err.is_config_error());
        assert!(connector.opened().await.is_empty());
        assert!(connector.server().databases().await.is_empty());
    }

    #[tokio::test]
    async fn test_connection_error_runs_nothing() {
        let temp_dir = TempDir::new().unwrap();
        write_companies_migrations(temp_dir.path());
        let connector = Arc::new(
            MemoryConnector::new().with_unreachable(ServerAddr::new("localhost", 28015)),
        );

        let result = Migrator::new(options(Direction::Up, &temp_dir), connector.clone())
            .with_notifier(ProgressNotifier::new())
            .run()
            .await;

        assert!(matches!(
            result,
            Err(MigrationError::Driver(DriverError::Connection { .. }))
        ));
        assert!(connector.server().databases().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_migration_propagates() {
        let temp_dir = TempDir::new().unwrap();
        write_companies_migrations(temp_dir.path());
        fs::write(
            temp_dir.path().join("20200103000000-broken.yaml"),
            "up:\n  - table_drop: { table: missing }\n",
        )
        .unwrap();
        let connector = Arc::new(MemoryConnector::new());

        let result = Migrator::new(options(Direction::Up, &temp_dir), connector.clone())
            .with_notifier(ProgressNotifier::new())
            .run()
            .await;

        assert!(matches!(result, Err(MigrationError::ExecutionFailed { .. })));
        let ledger = connector.server().documents("app", "_migrations").await.unwrap();
        assert_eq!(ledger.len(), 2);
    }

    #[tokio::test]
    async fn test_lazy_pool_over_explicit_servers() {
        let temp_dir = TempDir::new().unwrap();
        write_companies_migrations(temp_dir.path());
        let connector = Arc::new(MemoryConnector::new());

        let options = options(Direction::Up, &temp_dir)
            .driver(DriverKind::Pool)
            .pool(true)
            .cursor(false)
            .servers(vec![
                ServerAddr::new("db1", 28015),
                ServerAddr::new("db2", 28016),
            ]);
        let report = Migrator::new(options, connector.clone())
            .with_notifier(ProgressNotifier::new())
            .run()
            .await
            .unwrap();

        assert_eq!(report.count(), 2);
        assert_eq!(connector.opened().await.len(), 2);
        assert_eq!(connector.server().databases().await, vec!["app".to_string()]);
    }

    #[tokio::test]
    async fn test_eager_pool_defaults_to_host() {
        let temp_dir = TempDir::new().unwrap();
        write_companies_migrations(temp_dir.path());
        let connector = Arc::new(MemoryConnector::new());

        let options = options(Direction::Up, &temp_dir).driver(DriverKind::Pool);
        let report = Migrator::new(options, connector.clone())
            .with_notifier(ProgressNotifier::new())
            .run()
            .await
            .unwrap();

        assert_eq!(report.count(), 2);
        assert_eq!(
            connector.opened().await,
            vec![ServerAddr::new("localhost", 28015)]
        );
    }

    #[tokio::test]
    async fn test_silent_run_emits_nothing() {
        let temp_dir = TempDir::new().unwrap();
        write_companies_migrations(temp_dir.path());
        let notifier = ProgressNotifier::new();
        let mut progress = notifier.subscribe();

        Migrator::new(
            options(Direction::Up, &temp_dir).silent(true),
            Arc::new(MemoryConnector::new()),
        )
        .with_notifier(notifier)
        .run()
        .await
        .unwrap();

        assert!(drain(&mut progress).is_empty());
    }

    #[tokio::test]
    async fn test_migrate_returns_options() {
        let temp_dir = TempDir::new().unwrap();
        write_companies_migrations(temp_dir.path());
        let options = options(Direction::Up, &temp_dir).step(1).silent(true);

        let returned = migrate(options.clone(), Arc::new(MemoryConnector::new()))
            .await
            .unwrap();
        assert_eq!(returned, options);
    }
}
