//! # Direct Driver
//!
//! A single session with a selected default database. Query results are
//! handed back as lazy cursors.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::errors::{DriverError, DriverResult};
use super::query::{Cursor, Query, QueryOutput};
use super::{rows_to_names, ConnectParams, Connector, Driver, DriverKind, Session};

/// Single-connection driver
pub struct DirectDriver {
    session: Arc<dyn Session>,
    default_db: RwLock<Option<String>>,
}

impl DirectDriver {
    /// Open the connection. The database named in `params` becomes the
    /// default until [`Driver::use_database`] selects another one.
    pub async fn connect(connector: &dyn Connector, params: &ConnectParams) -> DriverResult<Self> {
        let session = connector.open(params).await?;
        tracing::debug!(address = %params.address, "direct connection established");

        Ok(Self {
            session,
            default_db: RwLock::new(params.db.clone()),
        })
    }

    async fn database(&self) -> DriverResult<String> {
        self.default_db
            .read()
            .await
            .clone()
            .ok_or(DriverError::NoDatabaseSelected)
    }

    async fn run(&self, query: &Query) -> DriverResult<Vec<serde_json::Value>> {
        let db = self.database().await?;
        tracing::debug!(db = %db, query = query.name(), table = ?query.table(), "running query");
        self.session.run(&db, query).await
    }
}

#[async_trait]
impl Driver for DirectDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Direct
    }

    async fn list_databases(&self) -> DriverResult<Vec<String>> {
        self.session.db_list().await
    }

    async fn create_database(&self, name: &str) -> DriverResult<()> {
        self.session.db_create(name).await
    }

    async fn use_database(&self, name: &str) -> DriverResult<()> {
        *self.default_db.write().await = Some(name.to_string());
        Ok(())
    }

    async fn list_tables(&self) -> DriverResult<Vec<String>> {
        rows_to_names(self.run(&Query::TableList).await?)
    }

    async fn create_table(&self, name: &str) -> DriverResult<()> {
        self.run(&Query::TableCreate {
            table: name.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn list_indexes(&self, table: &str) -> DriverResult<Vec<String>> {
        rows_to_names(
            self.run(&Query::IndexList {
                table: table.to_string(),
            })
            .await?,
        )
    }

    async fn create_index(&self, table: &str, field: &str) -> DriverResult<()> {
        self.run(&Query::IndexCreate {
            table: table.to_string(),
            field: field.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn wait_for_index(&self, table: &str, field: &str) -> DriverResult<()> {
        self.run(&Query::IndexWait {
            table: table.to_string(),
            field: Some(field.to_string()),
        })
        .await
        .map(|_| ())
    }

    async fn run_query(&self, query: Query) -> DriverResult<QueryOutput> {
        let rows = self.run(&query).await?;
        Ok(QueryOutput::Cursor(Cursor::from_rows(rows)))
    }

    async fn close(&self) -> DriverResult<()> {
        tracing::debug!(address = %self.session.address(), "closing direct connection");
        self.session.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{MemoryConnector, ServerAddr};

    fn params(db: Option<&str>) -> ConnectParams {
        let mut params = ConnectParams::new(ServerAddr::new("localhost", 28015));
        params.db = db.map(str::to_string);
        params
    }

    #[tokio::test]
    async fn test_results_arrive_as_cursors() {
        let connector = MemoryConnector::new();
        let driver = DirectDriver::connect(&connector, &params(Some("app")))
            .await
            .unwrap();
        driver.create_database("app").await.unwrap();
        driver.create_table("companies").await.unwrap();

        let output = driver.run_query(Query::TableList).await.unwrap();
        assert!(output.is_cursor());
        let rows = driver.to_array(output).await.unwrap();
        assert_eq!(rows, vec![serde_json::json!("companies")]);
    }

    #[tokio::test]
    async fn test_use_database_switches_target() {
        let connector = MemoryConnector::new();
        let driver = DirectDriver::connect(&connector, &params(None)).await.unwrap();

        assert!(matches!(
            driver.list_tables().await,
            Err(DriverError::NoDatabaseSelected)
        ));

        driver.create_database("other").await.unwrap();
        driver.use_database("other").await.unwrap();
        driver.create_table("t").await.unwrap();
        assert_eq!(driver.list_tables().await.unwrap(), vec!["t".to_string()]);
    }

    #[tokio::test]
    async fn test_index_creation_and_wait() {
        let connector = MemoryConnector::new();
        let driver = DirectDriver::connect(&connector, &params(Some("app")))
            .await
            .unwrap();
        driver.create_database("app").await.unwrap();
        driver.create_table("t").await.unwrap();

        assert!(driver.wait_for_index("t", "timestamp").await.is_err());
        driver.create_index("t", "timestamp").await.unwrap();
        driver.wait_for_index("t", "timestamp").await.unwrap();
        assert_eq!(
            driver.list_indexes("t").await.unwrap(),
            vec!["timestamp".to_string()]
        );
    }

    #[tokio::test]
    async fn test_close() {
        let connector = MemoryConnector::new();
        let driver = DirectDriver::connect(&connector, &params(Some("app")))
            .await
            .unwrap();

        driver.close().await.unwrap();
        assert!(matches!(
            driver.list_databases().await,
            Err(DriverError::Closed)
        ));
    }
}
