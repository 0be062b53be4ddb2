//! # Pool Driver
//!
//! One session per configured server, queries routed round-robin. Every
//! query names its target database, so there is no default database to
//! select. Results come back as arrays unless cursors are requested.
//!
//! With an explicit server list the pool connects lazily on the first query.
//! Closing drains every session in the pool.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::errors::{DriverError, DriverResult};
use super::query::{Cursor, Query, QueryOutput};
use super::{
    rows_to_names, ConnectParams, Connector, Driver, DriverKind, ServerAddr, Session,
    READY_TIMEOUT,
};

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Servers to open sessions to
    pub servers: Vec<ServerAddr>,
    /// Credentials shared by every session
    pub params: ConnectParams,
    /// Database every query targets
    pub db: String,
    /// Return lazy cursors instead of arrays
    pub cursor: bool,
}

impl PoolConfig {
    /// Whether database creation must wait for ready-for-writes
    pub fn waits_for_ready(&self) -> bool {
        self.servers.iter().any(ServerAddr::is_custom_port)
    }
}

/// Pooled, multi-server driver
pub struct PoolDriver {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    sessions: Mutex<Option<Vec<Arc<dyn Session>>>>,
    next: AtomicUsize,
    drained: AtomicBool,
}

impl PoolDriver {
    /// Pool that opens its sessions on first use
    pub fn lazy(connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        Self {
            connector,
            config,
            sessions: Mutex::new(None),
            next: AtomicUsize::new(0),
            drained: AtomicBool::new(false),
        }
    }

    /// Pool with every session opened up front
    pub async fn connect(connector: Arc<dyn Connector>, config: PoolConfig) -> DriverResult<Self> {
        let driver = Self::lazy(connector, config);
        driver.acquire().await?;
        Ok(driver)
    }

    /// Number of open sessions
    pub async fn size(&self) -> usize {
        self.sessions.lock().await.as_ref().map_or(0, Vec::len)
    }

    async fn open_all(&self) -> DriverResult<Vec<Arc<dyn Session>>> {
        let mut sessions = Vec::with_capacity(self.config.servers.len());
        let mut last_error = None;

        for server in &self.config.servers {
            match self
                .connector
                .open(&self.config.params.for_server(server.clone()))
                .await
            {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    tracing::warn!(address = %server, error = %e, "server unavailable, skipping");
                    last_error = Some(e);
                }
            }
        }

        if sessions.is_empty() {
            return Err(last_error.unwrap_or_else(|| DriverError::Connection {
                address: "<none>".to_string(),
                reason: "no servers configured".to_string(),
            }));
        }

        tracing::debug!(size = sessions.len(), "connection pool filled");
        Ok(sessions)
    }

    async fn acquire(&self) -> DriverResult<Arc<dyn Session>> {
        if self.drained.load(Ordering::SeqCst) {
            return Err(DriverError::Closed);
        }

        let mut guard = self.sessions.lock().await;
        if guard.is_none() {
            *guard = Some(self.open_all().await?);
        }
        let sessions = guard.as_ref().ok_or(DriverError::Closed)?;

        let index = self.next.fetch_add(1, Ordering::SeqCst) % sessions.len();
        Ok(Arc::clone(&sessions[index]))
    }

    async fn run(&self, query: &Query) -> DriverResult<Vec<Value>> {
        let session = self.acquire().await?;
        tracing::debug!(
            address = %session.address(),
            db = %self.config.db,
            query = query.name(),
            table = ?query.table(),
            "running query"
        );

        let result = session.run(&self.config.db, query).await;
        if let Err(e) = &result {
            if e.is_connection_error() {
                tracing::warn!(address = %session.address(), error = %e, "pooled session lost");
            }
        }
        result
    }
}

#[async_trait]
impl Driver for PoolDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Pool
    }

    async fn list_databases(&self) -> DriverResult<Vec<String>> {
        self.acquire().await?.db_list().await
    }

    async fn create_database(&self, name: &str) -> DriverResult<()> {
        let session = self.acquire().await?;
        session.db_create(name).await?;

        if self.config.waits_for_ready() {
            tracing::debug!(db = %name, "waiting for database to accept writes");
            session.wait_ready(name, READY_TIMEOUT).await?;
        }
        Ok(())
    }

    async fn use_database(&self, name: &str) -> DriverResult<()> {
        tracing::debug!(db = %name, "pool targets its database per query");
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
        if self.config.cursor {
            Ok(QueryOutput::Cursor(Cursor::from_rows(rows)))
        } else {
            Ok(QueryOutput::Array(rows))
        }
    }

    async fn close(&self) -> DriverResult<()> {
        self.drained.store(true, Ordering::SeqCst);
        let sessions = self.sessions.lock().await.take().unwrap_or_default();
        tracing::debug!(size = sessions.len(), "draining connection pool");

        let mut first_error = None;
        for session in sessions {
            if let Err(e) = session.close().await {
                tracing::warn!(address = %session.address(), error = %e, "failed to close session");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
