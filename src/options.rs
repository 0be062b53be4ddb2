//! # Run Options
//!
//! Everything one `up`/`down` invocation needs: the operation, connection
//! parameters and where the migrations live. Options can be built in code
//! or loaded from a TOML or JSON file.
//!
//! [`RunOptions::validate`] checks every field at once and reports all
//! violations together, before anything touches the database.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::driver::{ConnectParams, DriverKind, PoolConfig, ServerAddr, DEFAULT_PORT};
use crate::migrations::ledger::DEFAULT_TABLE;
use crate::migrations::{Direction, MigrationError, MigrationResult};

/// One invalid option
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionError {
    pub field: String,
    pub value: String,
    pub message: String,
}

impl OptionError {
    pub fn new(field: &str, value: impl fmt::Display, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            value: value.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for OptionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Invalid option '{}': {} (value: {})",
            self.field, self.message, self.value
        )
    }
}

impl std::error::Error for OptionError {}

/// Collects option errors
#[derive(Debug, Default)]
pub struct OptionValidator {
    errors: Vec<OptionError>,
}

impl OptionValidator {
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    fn error(&mut self, field: &str, value: impl fmt::Display, message: &str) {
        self.errors.push(OptionError::new(field, value, message));
    }

    /// Validate port number (1-65535)
    pub fn validate_port(&mut self, field: &str, port: u16) -> &mut Self {
        if port == 0 {
            self.error(field, port, "Port must be between 1 and 65535");
        }
        self
    }

    pub fn validate_positive(&mut self, field: &str, value: usize) -> &mut Self {
        if value == 0 {
            self.error(field, value, "Value must be positive");
        }
        self
    }

    pub fn validate_non_empty(&mut self, field: &str, value: &str) -> &mut Self {
        if value.trim().is_empty() {
            self.error(field, value, "Value cannot be empty");
        }
        self
    }

    pub fn validate_required<T>(&mut self, field: &str, value: Option<&T>) -> &mut Self {
        if value.is_none() {
            self.error(field, "<missing>", "Value is required");
        }
        self
    }

    /// At most one of the two may be set
    pub fn validate_exclusive(&mut self, first: (&str, bool), second: (&str, bool)) -> &mut Self {
        if first.1 && second.1 {
            self.error(
                first.0,
                format!("{} and {}", first.0, second.0),
                &format!("'{}' cannot be combined with '{}'", first.0, second.0),
            );
        }
        self
    }

    /// `field` must not be set under `context`
    pub fn validate_forbidden(&mut self, field: &str, is_set: bool, context: &str) -> &mut Self {
        if is_set {
            self.error(field, "<set>", &format!("Not allowed {}", context));
        }
        self
    }

    pub fn finish(self) -> Result<(), Vec<OptionError>> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self.errors)
        }
    }
}

fn default_migrations_table() -> String {
    DEFAULT_TABLE.to_string()
}
fn default_migrations_directory() -> String {
    "migrations".to_string()
}
fn default_host() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}

/// Options of one migration run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    /// `up` or `down` (required)
    #[serde(default)]
    pub op: Option<Direction>,

    /// Maximum number of migrations to process
    #[serde(default)]
    pub step: Option<usize>,

    #[serde(default)]
    pub driver: DriverKind,

    /// Ledger table
    #[serde(default = "default_migrations_table")]
    pub migrations_table: String,

    /// Run older migrations missing from the ledger too
    #[serde(default)]
    pub ignore_timestamp: bool,

    #[serde(default = "default_migrations_directory")]
    pub migrations_directory: String,

    /// Base path `migrations_directory` is resolved against (default: cwd)
    #[serde(default)]
    pub relative_to: Option<PathBuf>,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Target database (required)
    #[serde(default)]
    pub db: String,

    #[serde(default)]
    pub user: Option<String>,

    /// Alias of `user`
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Alias of `password`
    #[serde(default)]
    pub auth_key: Option<String>,

    /// Suppress progress output
    #[serde(default)]
    pub silent: bool,

    #[serde(default)]
    pub ssl: bool,

    /// Pool driver only. Accepted so existing configs keep loading; the
    /// pool always uses exactly the configured servers.
    #[serde(default)]
    pub discovery: Option<bool>,

    /// Connect lazily to an explicit server list
    #[serde(default)]
    pub pool: Option<bool>,

    /// Return cursors instead of arrays (default: true)
    #[serde(default)]
    pub cursor: Option<bool>,

    #[serde(default)]
    pub servers: Option<Vec<ServerAddr>>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            op: None,
            step: None,
            driver: DriverKind::default(),
            migrations_table: default_migrations_table(),
            ignore_timestamp: false,
            migrations_directory: default_migrations_directory(),
            relative_to: None,
            host: default_host(),
            port: default_port(),
            db: String::new(),
            user: None,
            username: None,
            password: None,
            auth_key: None,
            silent: false,
            ssl: false,
            discovery: None,
            pool: None,
            cursor: None,
            servers: None,
        }
    }
}

impl RunOptions {
    pub fn new(op: Direction, db: impl Into<String>) -> Self {
        Self {
            op: Some(op),
            db: db.into(),
            ..Self::default()
        }
    }

    /// Load options from a `.toml` file, or JSON for any other extension
    pub fn load(path: &Path) -> MigrationResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| MigrationError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        let parsed = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str::<Self>(&content).map_err(|e| e.to_string()),
            _ => serde_json::from_str::<Self>(&content).map_err(|e| e.to_string()),
        };

        parsed.map_err(|message| MigrationError::InvalidOptions {
            errors: vec![OptionError::new("config", path.display(), message)],
        })
    }

    pub fn step(mut self, step: usize) -> Self {
        self.step = Some(step);
        self
    }

    pub fn driver(mut self, driver: DriverKind) -> Self {
        self.driver = driver;
        self
    }

    pub fn migrations_table(mut self, table: impl Into<String>) -> Self {
        self.migrations_table = table.into();
        self
    }

    pub fn migrations_directory(mut self, directory: impl Into<String>) -> Self {
        self.migrations_directory = directory.into();
        self
    }

    pub fn relative_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.relative_to = Some(path.into());
        self
    }

    pub fn ignore_timestamp(mut self, ignore: bool) -> Self {
        self.ignore_timestamp = ignore;
        self
    }

    pub fn host(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    pub fn servers(mut self, servers: Vec<ServerAddr>) -> Self {
        self.servers = Some(servers);
        self
    }

    pub fn pool(mut self, pool: bool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn cursor(mut self, cursor: bool) -> Self {
        self.cursor = Some(cursor);
        self
    }

    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    /// Check every option, reporting all violations together
    pub fn validate(&self) -> MigrationResult<()> {
        let mut validator = OptionValidator::new();

        validator
            .validate_required("op", self.op.as_ref())
            .validate_non_empty("db", &self.db)
            .validate_non_empty("migrations_table", &self.migrations_table)
            .validate_non_empty("migrations_directory", &self.migrations_directory)
            .validate_non_empty("host", &self.host)
            .validate_port("port", self.port)
            .validate_exclusive(
                ("user", self.user.is_some()),
                ("username", self.username.is_some()),
            )
            .validate_exclusive(
                ("password", self.password.is_some()),
                ("auth_key", self.auth_key.is_some()),
            );

        if let Some(step) = self.step {
            validator.validate_positive("step", step);
        }

        if self.driver == DriverKind::Direct {
            let context = "with the direct driver";
            validator
                .validate_forbidden("discovery", self.discovery.is_some(), context)
                .validate_forbidden("pool", self.pool.is_some(), context)
                .validate_forbidden("cursor", self.cursor.is_some(), context)
                .validate_forbidden("servers", self.servers.is_some(), context);
        }

        for (i, server) in self.servers.iter().flatten().enumerate() {
            let field = format!("servers[{}]", i);
            validator
                .validate_non_empty(&format!("{}.host", field), &server.host)
                .validate_port(&format!("{}.port", field), server.port);
        }

        validator
            .finish()
            .map_err(|errors| MigrationError::InvalidOptions { errors })
    }

    /// The operation; only `None` before validation
    pub fn operation(&self) -> MigrationResult<Direction> {
        self.op.ok_or_else(|| MigrationError::InvalidOptions {
            errors: vec![OptionError::new("op", "<missing>", "Value is required")],
        })
    }

    /// `relative_to` joined with `migrations_directory`
    pub fn migrations_path(&self) -> PathBuf {
        let base = self
            .relative_to
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_default();
        base.join(&self.migrations_directory)
    }

    pub fn uses_pool(&self) -> bool {
        self.pool.unwrap_or(false)
    }

    pub fn uses_cursor(&self) -> bool {
        self.cursor.unwrap_or(true)
    }

    /// Session parameters for `host:port`
    pub fn connect_params(&self) -> ConnectParams {
        ConnectParams {
            address: ServerAddr::new(self.host.clone(), self.port),
            db: Some(self.db.clone()),
            user: self.user.clone().or_else(|| self.username.clone()),
            password: self.password.clone().or_else(|| self.auth_key.clone()),
            ssl: self.ssl,
        }
    }

    /// Pool configuration; without a server list the pool covers `host:port`
    pub fn pool_config(&self) -> PoolConfig {
        let params = self.connect_params();
        let servers = self
            .servers
            .clone()
            .unwrap_or_else(|| vec![params.address.clone()]);

        PoolConfig {
            servers,
            params,
            db: self.db.clone(),
            cursor: self.uses_cursor(),
        }
    }
}
