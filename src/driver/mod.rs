//! # Driver Adapter
//!
//! One capability set over two ways of talking to the database:
//!
//! - [`DirectDriver`]: a single session with a selected default database.
//! - [`PoolDriver`]: one session per server, routed per query, with the
//!   target database named on every call.
//!
//! The migration engine only sees [`Driver`]. Neither the ledger nor the
//! executor branches on which backend is in use.
//!
//! The wire protocol lives behind [`Connector`] and [`Session`]. The crate
//! ships [`MemoryConnector`], an in-process document server.

pub mod direct;
pub mod errors;
pub mod memory;
pub mod pool;
pub mod query;

pub use direct::DirectDriver;
pub use errors::{DriverError, DriverResult};
pub use memory::{MemoryConnector, MemoryServer};
pub use pool::{PoolConfig, PoolDriver};
pub use query::{Cursor, Document, Query, QueryOutput};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Port used when a server address does not name one
pub const DEFAULT_PORT: u16 = 28015;

/// How long to wait for a database to report ready-for-writes
pub const READY_TIMEOUT: Duration = Duration::from_secs(20);

/// Backend selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Single connection
    #[default]
    Direct,
    /// Connection pool over one or more servers
    Pool,
}

impl DriverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverKind::Direct => "direct",
            DriverKind::Pool => "pool",
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of one database server
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerAddr {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl ServerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Whether the address uses a non-default port
    pub fn is_custom_port(&self) -> bool {
        self.port != DEFAULT_PORT
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parameters for opening one session
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectParams {
    pub address: ServerAddr,
    /// Database selected by default on the session
    pub db: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub ssl: bool,
}

impl ConnectParams {
    pub fn new(address: ServerAddr) -> Self {
        Self {
            address,
            db: None,
            user: None,
            password: None,
            ssl: false,
        }
    }

    /// Same credentials against another server
    pub fn for_server(&self, address: ServerAddr) -> Self {
        Self {
            address,
            ..self.clone()
        }
    }
}

/// An open session with one server
///
/// Implemented by wire-protocol clients. Queries always name their target
/// database; default-database bookkeeping belongs to the driver.
#[async_trait]
pub trait Session: Send + Sync {
    /// Address the session is connected to
    fn address(&self) -> &ServerAddr;

    async fn db_list(&self) -> DriverResult<Vec<String>>;

    async fn db_create(&self, name: &str) -> DriverResult<()>;

    /// Run a query against `db`, returning every result row
    async fn run(&self, db: &str, query: &Query) -> DriverResult<Vec<Value>>;

    /// Block until `db` accepts writes
    async fn wait_ready(&self, db: &str, timeout: Duration) -> DriverResult<()>;

    async fn close(&self) -> DriverResult<()>;
}

/// Opens sessions
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, params: &ConnectParams) -> DriverResult<Arc<dyn Session>>;
}

/// The capability set the migration engine needs from a database
#[async_trait]
pub trait Driver: Send + Sync {
    fn kind(&self) -> DriverKind;

    async fn list_databases(&self) -> DriverResult<Vec<String>>;

    async fn create_database(&self, name: &str) -> DriverResult<()>;

    /// Select the default database; a no-op for per-call targeting backends
    async fn use_database(&self, name: &str) -> DriverResult<()>;

    async fn list_tables(&self) -> DriverResult<Vec<String>>;

    async fn create_table(&self, name: &str) -> DriverResult<()>;

    async fn list_indexes(&self, table: &str) -> DriverResult<Vec<String>>;

    async fn create_index(&self, table: &str, field: &str) -> DriverResult<()>;

    async fn wait_for_index(&self, table: &str, field: &str) -> DriverResult<()>;

    async fn run_query(&self, query: Query) -> DriverResult<QueryOutput>;

    /// Materialize a query result, whichever shape the backend returned
    async fn to_array(&self, output: QueryOutput) -> DriverResult<Vec<Value>> {
        output.into_array().await
    }

    /// Close the connection, or drain the pool
    async fn close(&self) -> DriverResult<()>;
}

/// Rows of a listing query as strings
pub(crate) fn rows_to_names(rows: Vec<Value>) -> DriverResult<Vec<String>> {
    rows.into_iter()
        .map(|row| match row {
            Value::String(name) => Ok(name),
            other => Err(DriverError::InvalidQuery(format!(
                "expected a name, got {}",
                other
            ))),
        })
        .collect()
}
