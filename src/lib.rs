//! docmigrate - ordered, ledger-tracked migrations for document databases
//!
//! Migration files named `<YYYYMMDDHHmmss>-<name>.<ext>` are applied oldest
//! first (`up`) or reverted newest first (`down`). A ledger table in the
//! target database records what has been applied.
//!
//! ```no_run
//! use std::sync::Arc;
//! use docmigrate::{migrate, Direction, MemoryConnector, RunOptions};
//!
//! # async fn example() -> docmigrate::MigrationResult<()> {
//! let options = RunOptions::new(Direction::Up, "app").step(1);
//! migrate(options, Arc::new(MemoryConnector::new())).await?;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod driver;
pub mod lifecycle;
pub mod migrations;
pub mod options;
pub mod progress;

pub use driver::{
    ConnectParams, Connector, DirectDriver, Driver, DriverError, DriverKind, DriverResult,
    MemoryConnector, MemoryServer, PoolDriver, Query, QueryOutput, ServerAddr, Session,
};
pub use lifecycle::{migrate, Migrator};
pub use migrations::{
    Direction, MigrationCode, MigrationError, MigrationGenerator, MigrationResult,
    MigrationRunReport, MigrationScript, MigrationTimestamp, RegistryLoader, ScriptLoader,
};
pub use options::{OptionError, RunOptions};
pub use progress::{Progress, ProgressNotifier};
