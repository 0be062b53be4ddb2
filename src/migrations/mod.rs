//! # Migrations
//!
//! Ordered, ledger-tracked schema and data evolution.
//!
//! # Design Principles
//!
//! 1. **Ordered**: `up` applies oldest first, `down` reverts newest first
//! 2. **Exactly once**: the ledger records a migration only after its code succeeded
//! 3. **Forward only**: a failed batch is never compensated automatically
//! 4. **Sequential**: one migration at a time, the next starts after the previous finished
//!
//! # Migration Files
//!
//! Files are named `<YYYYMMDDHHmmss>-<name>.<ext>`; anything else in the
//! directory is ignored. Script migrations hold the queries to run:
//!
//! ```yaml
//! up:
//!   - table_create:
//!       table: companies
//! down:
//!   - table_drop:
//!       table: companies
//! ```

pub mod discovery;
pub mod errors;
pub mod executor;
pub mod generator;
pub mod ledger;
pub mod script;

pub use discovery::{Discovery, MigrationLoader, RegistryLoader};
pub use errors::{MigrationError, MigrationResult};
pub use executor::{Executor, MigrationRunReport};
pub use generator::MigrationGenerator;
pub use ledger::{Ledger, LedgerEntry};
pub use script::{MigrationScript, ScriptLoader};

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::driver::Driver;

/// Direction a migration runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// UTC instant used to order migrations
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MigrationTimestamp(DateTime<Utc>);

impl MigrationTimestamp {
    /// Older than any real migration. Reported as the latest applied
    /// timestamp when the ledger is empty.
    pub const EPOCH: Self = Self(DateTime::<Utc>::MIN_UTC);

    /// Width of the timestamp component of a migration filename
    pub const FILENAME_WIDTH: usize = 14;

    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Parse the `YYYYMMDDHHmmss` component of a filename.
    ///
    /// Returns `None` for anything that is not exactly 14 digits naming a
    /// real calendar instant.
    pub fn from_filename_component(value: &str) -> Option<Self> {
        if value.len() != Self::FILENAME_WIDTH || !value.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }

        let field = |range: std::ops::Range<usize>| value[range].parse::<u32>().ok();
        let year = i32::try_from(field(0..4)?).ok()?;
        let datetime = NaiveDate::from_ymd_opt(year, field(4..6)?, field(6..8)?)?
            .and_hms_opt(field(8..10)?, field(10..12)?, field(12..14)?)?;

        Some(Self(datetime.and_utc()))
    }

    /// `YYYYMMDDHHmmss` rendering used in filenames
    pub fn to_filename_component(&self) -> String {
        self.0.format("%Y%m%d%H%M%S").to_string()
    }

    /// Parse an ISO-8601 timestamp as stored in the ledger
    pub fn parse_iso(value: &str) -> Result<Self, chrono::ParseError> {
        DateTime::parse_from_rfc3339(value).map(|dt| Self(dt.with_timezone(&Utc)))
    }

    /// ISO-8601 rendering with millisecond precision, e.g. `2020-01-01T00:00:00.000Z`
    pub fn to_iso_string(&self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn is_epoch(&self) -> bool {
        *self == Self::EPOCH
    }
}

impl From<DateTime<Utc>> for MigrationTimestamp {
    fn from(value: DateTime<Utc>) -> Self {
        Self(value)
    }
}

impl fmt::Display for MigrationTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_iso_string())
    }
}

impl Serialize for MigrationTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_iso_string())
    }
}

impl<'de> Deserialize<'de> for MigrationTimestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Self::parse_iso(&value).map_err(serde::de::Error::custom)
    }
}

/// Executable logic of one migration
#[async_trait]
pub trait MigrationCode: Send + Sync {
    /// Apply the migration
    async fn up(&self, driver: &dyn Driver) -> MigrationResult<()>;

    /// Revert the migration
    async fn down(&self, driver: &dyn Driver) -> MigrationResult<()>;

    async fn run(&self, direction: Direction, driver: &dyn Driver) -> MigrationResult<()> {
        match direction {
            Direction::Up => self.up(driver).await,
            Direction::Down => self.down(driver).await,
        }
    }
}

/// A migration file found on disk, before its code is loaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    pub timestamp: MigrationTimestamp,
    pub name: String,
    pub filename: String,
    pub path: PathBuf,
}

/// A migration ready to run
#[derive(Clone)]
pub struct MigrationDescriptor {
    pub timestamp: MigrationTimestamp,
    pub name: String,
    pub filename: String,
    pub code: Arc<dyn MigrationCode>,
}

impl MigrationDescriptor {
    pub fn new(file: MigrationFile, code: Arc<dyn MigrationCode>) -> Self {
        Self {
            timestamp: file.timestamp,
            name: file.name,
            filename: file.filename,
            code,
        }
    }
}

impl fmt::Debug for MigrationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationDescriptor")
            .field("timestamp", &self.timestamp)
            .field("name", &self.name)
            .field("filename", &self.filename)
            .finish_non_exhaustive()
    }
}
