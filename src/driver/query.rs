//! # Queries
//!
//! The query language shared by the ledger and by declarative migration
//! scripts. Queries are plain data so that scripts can be written in YAML or
//! JSON, each query a single-key map naming the operation:
//!
//! ```yaml
//! - table_create:
//!     table: companies
//! - insert:
//!     table: companies
//!     documents:
//!       - { id: acme, name: ACME }
//! ```

use std::fmt;

use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::errors::DriverResult;

/// A stored document
pub type Document = Map<String, Value>;

/// A single query against the selected database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Query {
    /// Create a table
    TableCreate { table: String },

    /// Drop a table with all of its documents and indexes
    TableDrop { table: String },

    /// List table names
    TableList,

    /// Create a secondary index on a single field
    IndexCreate { table: String, field: String },

    /// Drop a secondary index
    IndexDrop { table: String, field: String },

    /// List secondary index names of a table
    IndexList { table: String },

    /// Wait for one index (or all of them when `field` is absent) to be usable
    IndexWait {
        table: String,
        #[serde(default)]
        field: Option<String>,
    },

    /// Insert documents; documents without an `id` get a generated one
    Insert {
        table: String,
        documents: Vec<Document>,
    },

    /// Return documents matching every field of `filter`
    Filter {
        table: String,
        #[serde(default)]
        filter: Document,
    },

    /// Merge `patch` into documents matching `filter`
    Update {
        table: String,
        #[serde(default)]
        filter: Document,
        patch: Document,
    },

    /// Delete documents matching `filter`
    Delete {
        table: String,
        #[serde(default)]
        filter: Document,
    },

    /// Return documents ordered by a secondary index
    OrderBy {
        table: String,
        index: String,
        #[serde(default)]
        descending: bool,
    },
}

impl Query {
    /// Table the query targets, if any
    pub fn table(&self) -> Option<&str> {
        match self {
            Self::TableList => None,
            Self::TableCreate { table }
            | Self::TableDrop { table }
            | Self::IndexCreate { table, .. }
            | Self::IndexDrop { table, .. }
            | Self::IndexList { table }
            | Self::IndexWait { table, .. }
            | Self::Insert { table, .. }
            | Self::Filter { table, .. }
            | Self::Update { table, .. }
            | Self::Delete { table, .. }
            | Self::OrderBy { table, .. } => Some(table),
        }
    }

    /// Whether the query mutates server state
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Self::TableCreate { .. }
                | Self::TableDrop { .. }
                | Self::IndexCreate { .. }
                | Self::IndexDrop { .. }
                | Self::Insert { .. }
                | Self::Update { .. }
                | Self::Delete { .. }
        )
    }

    /// Short operation name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::TableCreate { .. } => "table_create",
            Self::TableDrop { .. } => "table_drop",
            Self::TableList => "table_list",
            Self::IndexCreate { .. } => "index_create",
            Self::IndexDrop { .. } => "index_drop",
            Self::IndexList { .. } => "index_list",
            Self::IndexWait { .. } => "index_wait",
            Self::Insert { .. } => "insert",
            Self::Filter { .. } => "filter",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
            Self::OrderBy { .. } => "order_by",
        }
    }
}

/// Whether `doc` carries every field of `filter` with an equal value.
/// An empty filter matches everything.
pub fn matches_filter(doc: &Document, filter: &Document) -> bool {
    filter
        .iter()
        .all(|(key, expected)| doc.get(key).is_some_and(|actual| actual == expected))
}

/// Lazily consumed query result
pub struct Cursor {
    rows: BoxStream<'static, DriverResult<Value>>,
}

impl Cursor {
    /// Cursor over already fetched rows
    pub fn from_rows(rows: Vec<Value>) -> Self {
        Self::from_stream(stream::iter(rows.into_iter().map(Ok)).boxed())
    }

    /// Cursor over an arbitrary row stream
    pub fn from_stream(rows: BoxStream<'static, DriverResult<Value>>) -> Self {
        Self { rows }
    }

    /// Next row, `None` once exhausted
    pub async fn next(&mut self) -> Option<DriverResult<Value>> {
        self.rows.next().await
    }

    /// Drain the cursor
    pub async fn to_array(self) -> DriverResult<Vec<Value>> {
        self.rows.try_collect().await
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor").finish_non_exhaustive()
    }
}

/// Result of `Driver::run_query`: backends either stream rows or hand back
/// a materialized array.
#[derive(Debug)]
pub enum QueryOutput {
    Cursor(Cursor),
    Array(Vec<Value>),
}

impl QueryOutput {
    /// Materialize the output regardless of its shape
    pub async fn into_array(self) -> DriverResult<Vec<Value>> {
        match self {
            Self::Cursor(cursor) => cursor.to_array().await,
            Self::Array(rows) => Ok(rows),
        }
    }

    pub fn is_cursor(&self) -> bool {
        matches!(self, Self::Cursor(_))
    }
}
