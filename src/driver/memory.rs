//! # In-Process Document Server
//!
//! A small document database that lives inside the process. Every address a
//! [`MemoryConnector`] is asked for reaches the same [`MemoryServer`], the way
//! every node of a cluster serves the same data.
//!
//! State can optionally be persisted to a JSON file. Writes go to a temporary
//! file first and are then renamed over the previous state.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::errors::{DriverError, DriverResult};
use super::query::{matches_filter, Document, Query};
use super::{ConnectParams, Connector, ServerAddr, Session};

#[derive(Debug, Default, Serialize, Deserialize)]
struct ServerState {
    databases: BTreeMap<String, DatabaseState>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DatabaseState {
    tables: BTreeMap<String, TableState>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TableState {
    documents: Vec<Document>,
    indexes: BTreeSet<String>,
}

impl ServerState {
    fn database(&self, db: &str) -> DriverResult<&DatabaseState> {
        self.databases
            .get(db)
            .ok_or_else(|| DriverError::DatabaseNotFound(db.to_string()))
    }

    fn database_mut(&mut self, db: &str) -> DriverResult<&mut DatabaseState> {
        self.databases
            .get_mut(db)
            .ok_or_else(|| DriverError::DatabaseNotFound(db.to_string()))
    }
}

impl DatabaseState {
    fn table(&self, db: &str, table: &str) -> DriverResult<&TableState> {
        self.tables.get(table).ok_or_else(|| DriverError::TableNotFound {
            database: db.to_string(),
            table: table.to_string(),
        })
    }

    fn table_mut(&mut self, db: &str, table: &str) -> DriverResult<&mut TableState> {
        self.tables
            .get_mut(table)
            .ok_or_else(|| DriverError::TableNotFound {
                database: db.to_string(),
                table: table.to_string(),
            })
    }
}

/// In-process document server
#[derive(Debug)]
pub struct MemoryServer {
    state: Mutex<ServerState>,
    state_file: Option<PathBuf>,
    credentials: Option<(String, String)>,
}

impl MemoryServer {
    /// Create an empty, non-persistent server
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ServerState::default()),
            state_file: None,
            credentials: None,
        }
    }

    /// Create a server persisted to `state_file`, loading it if present
    pub fn persistent(state_file: PathBuf) -> DriverResult<Self> {
        let state = if state_file.exists() {
            let content =
                std::fs::read_to_string(&state_file).map_err(|e| DriverError::Persistence {
                    path: state_file.clone(),
                    reason: e.to_string(),
                })?;
            serde_json::from_str(&content).map_err(|e| DriverError::Persistence {
                path: state_file.clone(),
                reason: format!("invalid state file: {}", e),
            })?
        } else {
            ServerState::default()
        };

        Ok(Self {
            state: Mutex::new(state),
            state_file: Some(state_file),
            credentials: None,
        })
    }

    /// Require these credentials on every connection
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((user.into(), password.into()));
        self
    }

    /// Names of all databases
    pub async fn databases(&self) -> Vec<String> {
        self.state.lock().await.databases.keys().cloned().collect()
    }

    /// Names of all tables of `db`
    pub async fn tables(&self, db: &str) -> DriverResult<Vec<String>> {
        let state = self.state.lock().await;
        Ok(state.database(db)?.tables.keys().cloned().collect())
    }

    /// Every document of a table, in insertion order
    pub async fn documents(&self, db: &str, table: &str) -> DriverResult<Vec<Document>> {
        let state = self.state.lock().await;
        Ok(state.database(db)?.table(db, table)?.documents.clone())
    }

    fn authenticate(&self, params: &ConnectParams) -> DriverResult<()> {
        let Some((user, password)) = &self.credentials else {
            return Ok(());
        };

        let given_user = params.user.as_deref().unwrap_or("admin");
        let given_password = params.password.as_deref().unwrap_or("");
        if given_user != user.as_str() || given_password != password.as_str() {
            return Err(DriverError::Authentication {
                user: given_user.to_string(),
            });
        }
        Ok(())
    }

    async fn db_list(&self) -> Vec<String> {
        self.databases().await
    }

    async fn db_create(&self, name: &str) -> DriverResult<()> {
        let mut state = self.state.lock().await;
        if state.databases.contains_key(name) {
            return Err(DriverError::DatabaseExists(name.to_string()));
        }
        state
            .databases
            .insert(name.to_string(), DatabaseState::default());
        self.save(&state).await
    }

    async fn has_database(&self, db: &str) -> bool {
        self.state.lock().await.databases.contains_key(db)
    }

    async fn execute(&self, db: &str, query: &Query) -> DriverResult<Vec<Value>> {
        let mut state = self.state.lock().await;
        let rows = apply(&mut state, db, query)?;
        if query.is_write() {
            self.save(&state).await?;
        }
        Ok(rows)
    }

    /// Persist state, write-then-rename
    async fn save(&self, state: &ServerState) -> DriverResult<()> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };

        let content = serde_json::to_vec_pretty(state).map_err(|e| persistence(path, e))?;
        let temp_file = path.with_extension("json.tmp");
        tokio::fs::write(&temp_file, &content)
            .await
            .map_err(|e| persistence(&temp_file, e))?;
        tokio::fs::rename(&temp_file, path)
            .await
            .map_err(|e| persistence(path, e))?;
        Ok(())
    }
}

impl Default for MemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

fn persistence(path: &Path, err: impl std::fmt::Display) -> DriverError {
    DriverError::Persistence {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

fn apply(state: &mut ServerState, db: &str, query: &Query) -> DriverResult<Vec<Value>> {
    match query {
        Query::TableList => {
            let database = state.database(db)?;
            Ok(database.tables.keys().map(|t| json!(t)).collect())
        }
        Query::TableCreate { table } => {
            let database = state.database_mut(db)?;
            if database.tables.contains_key(table) {
                return Err(DriverError::TableExists {
                    database: db.to_string(),
                    table: table.clone(),
                });
            }
            database.tables.insert(table.clone(), TableState::default());
            Ok(vec![json!({ "tables_created": 1 })])
        }
        Query::TableDrop { table } => {
            let database = state.database_mut(db)?;
            if database.tables.remove(table).is_none() {
                return Err(DriverError::TableNotFound {
                    database: db.to_string(),
                    table: table.clone(),
                });
            }
            Ok(vec![json!({ "tables_dropped": 1 })])
        }
        Query::IndexCreate { table, field } => {
            let target = state.database_mut(db)?.table_mut(db, table)?;
            if !target.indexes.insert(field.clone()) {
                return Err(DriverError::IndexExists {
                    table: table.clone(),
                    index: field.clone(),
                });
            }
            Ok(vec![json!({ "created": 1 })])
        }
        Query::IndexDrop { table, field } => {
            let target = state.database_mut(db)?.table_mut(db, table)?;
            if !target.indexes.remove(field) {
                return Err(DriverError::IndexNotFound {
                    table: table.clone(),
                    index: field.clone(),
                });
            }
            Ok(vec![json!({ "dropped": 1 })])
        }
        Query::IndexList { table } => {
            let target = state.database(db)?.table(db, table)?;
            Ok(target.indexes.iter().map(|i| json!(i)).collect())
        }
        Query::IndexWait { table, field } => {
            let target = state.database(db)?.table(db, table)?;
            let indexes: Vec<&String> = match field {
                Some(field) if !target.indexes.contains(field) => {
                    return Err(DriverError::IndexNotFound {
                        table: table.clone(),
                        index: field.clone(),
                    })
                }
                Some(field) => vec![field],
                None => target.indexes.iter().collect(),
            };
            // Indexes are built synchronously, so they are ready as soon as they exist.
            Ok(indexes
                .into_iter()
                .map(|index| json!({ "index": index, "ready": true }))
                .collect())
        }
        Query::Insert { table, documents } => {
            let target = state.database_mut(db)?.table_mut(db, table)?;
            let mut generated_keys = Vec::new();
            let mut batch: Vec<Document> = Vec::with_capacity(documents.len());
            for document in documents {
                let mut document = document.clone();
                if !document.contains_key("id") {
                    let id = Uuid::new_v4().to_string();
                    generated_keys.push(json!(id));
                    document.insert("id".to_string(), json!(id));
                }
                let id = document.get("id").cloned().unwrap_or(Value::Null);
                let taken = |d: &Document| d.get("id") == Some(&id);
                if target.documents.iter().any(taken) || batch.iter().any(taken) {
                    return Err(DriverError::DuplicateKey {
                        table: table.clone(),
                        id: id.to_string(),
                    });
                }
                batch.push(document);
            }
            // Nothing is written unless every key is free
            target.documents.extend(batch);
            Ok(vec![json!({
                "inserted": documents.len(),
                "generated_keys": generated_keys,
            })])
        }
        Query::Filter { table, filter } => {
            let target = state.database(db)?.table(db, table)?;
            Ok(target
                .documents
                .iter()
                .filter(|d| matches_filter(d, filter))
                .map(|d| Value::Object(d.clone()))
                .collect())
        }
        Query::Update {
            table,
            filter,
            patch,
        } => {
            let target = state.database_mut(db)?.table_mut(db, table)?;
            let mut replaced = 0;
            for document in target.documents.iter_mut() {
                if matches_filter(document, filter) {
                    for (key, value) in patch {
                        document.insert(key.clone(), value.clone());
                    }
                    replaced += 1;
                }
            }
            Ok(vec![json!({ "replaced": replaced })])
        }
        Query::Delete { table, filter } => {
            let target = state.database_mut(db)?.table_mut(db, table)?;
            let before = target.documents.len();
            target.documents.retain(|d| !matches_filter(d, filter));
            Ok(vec![json!({ "deleted": before - target.documents.len() })])
        }
        Query::OrderBy {
            table,
            index,
            descending,
        } => {
            let target = state.database(db)?.table(db, table)?;
            if !target.indexes.contains(index) {
                return Err(DriverError::IndexNotFound {
                    table: table.clone(),
                    index: index.clone(),
                });
            }
            // Documents without the indexed field are not part of the index.
            let mut rows: Vec<&Document> = target
                .documents
                .iter()
                .filter(|d| d.contains_key(index))
                .collect();
            rows.sort_by(|a, b| compare_values(&a[index.as_str()], &b[index.as_str()]));
            if *descending {
                rows.reverse();
            }
            Ok(rows.into_iter().map(|d| Value::Object(d.clone())).collect())
        }
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Session against a [`MemoryServer`]
#[derive(Debug)]
pub struct MemorySession {
    server: Arc<MemoryServer>,
    address: ServerAddr,
    closed: AtomicBool,
}

impl MemorySession {
    fn ensure_open(&self) -> DriverResult<()> {
        if self.is_closed() {
            return Err(DriverError::Closed);
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::SeqCst)
    }
}

#[async_trait]
impl Session for MemorySession {
    fn address(&self) -> &ServerAddr {
        &self.address
    }

    async fn db_list(&self) -> DriverResult<Vec<String>> {
        self.ensure_open()?;
        Ok(self.server.db_list().await)
    }

    async fn db_create(&self, name: &str) -> DriverResult<()> {
        self.ensure_open()?;
        self.server.db_create(name).await
    }

    async fn run(&self, db: &str, query: &Query) -> DriverResult<Vec<Value>> {
        self.ensure_open()?;
        self.server.execute(db, query).await
    }

    async fn wait_ready(&self, db: &str, timeout: Duration) -> DriverResult<()> {
        self.ensure_open()?;
        let poll = async {
            while !self.server.has_database(db).await {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| DriverError::Timeout {
                what: format!("database '{}' to be ready for writes", db),
                seconds: timeout.as_secs(),
            })
    }

    async fn close(&self) -> DriverResult<()> {
        self.closed.store(true, AtomicOrdering::SeqCst);
        Ok(())
    }
}

/// Connector whose every address reaches one shared [`MemoryServer`]
#[derive(Debug)]
pub struct MemoryConnector {
    server: Arc<MemoryServer>,
    unreachable: HashSet<ServerAddr>,
    opened: Mutex<Vec<ServerAddr>>,
}

impl MemoryConnector {
    /// Connector over a fresh, empty server
    pub fn new() -> Self {
        Self::with_server(Arc::new(MemoryServer::new()))
    }

    /// Connector over an existing server
    pub fn with_server(server: Arc<MemoryServer>) -> Self {
        Self {
            server,
            unreachable: HashSet::new(),
            opened: Mutex::new(Vec::new()),
        }
    }

    /// Connector over a server persisted to `state_file`
    pub fn persistent(state_file: PathBuf) -> DriverResult<Self> {
        Ok(Self::with_server(Arc::new(MemoryServer::persistent(
            state_file,
        )?)))
    }

    /// Refuse connections to `address`
    pub fn with_unreachable(mut self, address: ServerAddr) -> Self {
        self.unreachable.insert(address);
        self
    }

    /// The server behind every address
    pub fn server(&self) -> Arc<MemoryServer> {
        Arc::clone(&self.server)
    }

    /// Addresses sessions were opened to, in order
    pub async fn opened(&self) -> Vec<ServerAddr> {
        self.opened.lock().await.clone()
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, params: &ConnectParams) -> DriverResult<Arc<dyn Session>> {
        if self.unreachable.contains(&params.address) {
            return Err(DriverError::Connection {
                address: params.address.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        self.server.authenticate(params)?;

        self.opened.lock().await.push(params.address.clone());
        tracing::debug!(address = %params.address, "opened in-process session");

        Ok(Arc::new(MemorySession {
            server: Arc::clone(&self.server),
            address: params.address.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    async fn session(connector: &MemoryConnector) -> Arc<dyn Session> {
        connector
            .open(&ConnectParams::new(ServerAddr::new("localhost", 28015)))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_table_lifecycle() {
        let connector = MemoryConnector::new();
        let session = session(&connector).await;
        session.db_create("app").await.unwrap();

        session
            .run("app", &Query::TableCreate { table: "companies".to_string() })
            .await
            .unwrap();
        let tables = session.run("app", &Query::TableList).await.unwrap();
        assert_eq!(tables, vec![json!("companies")]);

        let result = session
            .run("app", &Query::TableCreate { table: "companies".to_string() })
            .await;
        assert!(matches!(result, Err(DriverError::TableExists { .. })));

        session
            .run("app", &Query::TableDrop { table: "companies".to_string() })
            .await
            .unwrap();
        assert!(connector.server().tables("app").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_database() {
        let connector = MemoryConnector::new();
        let session = session(&connector).await;

        let result = session.run("missing", &Query::TableList).await;
        assert!(matches!(result, Err(DriverError::DatabaseNotFound(_))));
    }

    #[tokio::test]
    async fn test_insert_generates_ids_and_rejects_duplicates() {
        let connector = MemoryConnector::new();
        let session = session(&connector).await;
        session.db_create("app").await.unwrap();
        session
            .run("app", &Query::TableCreate { table: "t".to_string() })
            .await
            .unwrap();

        let rows = session
            .run(
                "app",
                &Query::Insert {
                    table: "t".to_string(),
                    documents: vec![doc(json!({ "name": "a" })), doc(json!({ "id": 1 }))],
                },
            )
            .await
            .unwrap();
        assert_eq!(rows[0]["inserted"], json!(2));
        assert_eq!(rows[0]["generated_keys"].as_array().unwrap().len(), 1);

        let result = session
            .run(
                "app",
                &Query::Insert {
                    table: "t".to_string(),
                    documents: vec![doc(json!({ "id": 1 }))],
                },
            )
            .await;
        assert!(matches!(result, Err(DriverError::DuplicateKey { .. })));
    }

    #[tokio::test]
    async fn test_insert_with_duplicate_writes_nothing() {
        let connector = MemoryConnector::new();
        let session = session(&connector).await;
        session.db_create("app").await.unwrap();
        session
            .run("app", &Query::TableCreate { table: "t".to_string() })
            .await
            .unwrap();
        session
            .run(
                "app",
                &Query::Insert {
                    table: "t".to_string(),
                    documents: vec![doc(json!({ "id": 1 }))],
                },
            )
            .await
            .unwrap();

        let clashing = session
            .run(
                "app",
                &Query::Insert {
                    table: "t".to_string(),
                    documents: vec![doc(json!({ "id": 2 })), doc(json!({ "id": 1 }))],
                },
            )
            .await;
        assert!(matches!(clashing, Err(DriverError::DuplicateKey { .. })));

        let repeated = session
            .run(
                "app",
                &Query::Insert {
                    table: "t".to_string(),
                    documents: vec![doc(json!({ "id": 3 })), doc(json!({ "id": 3 }))],
                },
            )
            .await;
        assert!(matches!(repeated, Err(DriverError::DuplicateKey { .. })));

        let documents = connector.server().documents("app", "t").await.unwrap();
        assert_eq!(documents.len(), 1);
    }

    #[tokio::test]
    async fn test_order_by_requires_index() {
        let connector = MemoryConnector::new();
        let session = session(&connector).await;
        session.db_create("app").await.unwrap();
        session
            .run("app", &Query::TableCreate { table: "t".to_string() })
            .await
            .unwrap();
        session
            .run(
                "app",
                &Query::Insert {
                    table: "t".to_string(),
                    documents: vec![
                        doc(json!({ "ts": "2020-01-02" })),
                        doc(json!({ "ts": "2020-01-03" })),
                        doc(json!({ "other": true })),
                        doc(json!({ "ts": "2020-01-01" })),
                    ],
                },
            )
            .await
            .unwrap();

        let order = Query::OrderBy {
            table: "t".to_string(),
            index: "ts".to_string(),
            descending: true,
        };
        assert!(matches!(
            session.run("app", &order).await,
            Err(DriverError::IndexNotFound { .. })
        ));

        session
            .run(
                "app",
                &Query::IndexCreate {
                    table: "t".to_string(),
                    field: "ts".to_string(),
                },
            )
            .await
            .unwrap();
        let rows = session.run("app", &order).await.unwrap();
        let stamps: Vec<&str> = rows.iter().map(|r| r["ts"].as_str().unwrap()).collect();
        assert_eq!(stamps, vec!["2020-01-03", "2020-01-02", "2020-01-01"]);
    }

    #[tokio::test]
    async fn test_update_and_delete_by_filter() {
        let connector = MemoryConnector::new();
        let session = session(&connector).await;
        session.db_create("app").await.unwrap();
        session
            .run("app", &Query::TableCreate { table: "t".to_string() })
            .await
            .unwrap();
        session
            .run(
                "app",
                &Query::Insert {
                    table: "t".to_string(),
                    documents: vec![
                        doc(json!({ "id": 1, "kind": "a" })),
                        doc(json!({ "id": 2, "kind": "b" })),
                    ],
                },
            )
            .await
            .unwrap();

        let rows = session
            .run(
                "app",
                &Query::Update {
                    table: "t".to_string(),
                    filter: doc(json!({ "kind": "a" })),
                    patch: doc(json!({ "seen": true })),
                },
            )
            .await
            .unwrap();
        assert_eq!(rows[0]["replaced"], json!(1));

        let rows = session
            .run(
                "app",
                &Query::Delete {
                    table: "t".to_string(),
                    filter: doc(json!({ "kind": "b" })),
                },
            )
            .await
            .unwrap();
        assert_eq!(rows[0]["deleted"], json!(1));

        let documents = connector.server().documents("app", "t").await.unwrap();
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0]["seen"], json!(true));
    }

    #[tokio::test]
    async fn test_closed_session_rejects_queries() {
        let connector = MemoryConnector::new();
        let session = session(&connector).await;
        session.close().await.unwrap();

        assert!(matches!(session.db_list().await, Err(DriverError::Closed)));
    }

    #[tokio::test]
    async fn test_unreachable_and_credentials() {
        let addr = ServerAddr::new("down", 28015);
        let connector = MemoryConnector::with_server(Arc::new(
            MemoryServer::new().with_credentials("admin", "secret"),
        ))
        .with_unreachable(addr.clone());

        let result = connector.open(&ConnectParams::new(addr)).await;
        assert!(matches!(result, Err(DriverError::Connection { .. })));

        let mut params = ConnectParams::new(ServerAddr::new("up", 28015));
        params.password = Some("wrong".to_string());
        assert!(matches!(
            connector.open(&params).await,
            Err(DriverError::Authentication { .. })
        ));

        params.password = Some("secret".to_string());
        assert!(connector.open(&params).await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_ready_times_out_for_missing_database() {
        let connector = MemoryConnector::new();
        let session = session(&connector).await;

        let result = session
            .wait_ready("missing", Duration::from_millis(120))
            .await;
        assert!(matches!(result, Err(DriverError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_persistent_state_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let state_file = temp_dir.path().join("state.json");

        {
            let connector = MemoryConnector::persistent(state_file.clone()).unwrap();
            let session = session(&connector).await;
            session.db_create("app").await.unwrap();
            session
                .run("app", &Query::TableCreate { table: "t".to_string() })
                .await
                .unwrap();
        }

        assert!(state_file.exists());
        let connector = MemoryConnector::persistent(state_file).unwrap();
        assert_eq!(connector.server().databases().await, vec!["app".to_string()]);
        assert_eq!(
            connector.server().tables("app").await.unwrap(),
            vec!["t".to_string()]
        );
    }
}
