//! CLI argument definitions using clap
//!
//! Commands:
//! - docmigrate up [--config <path>] [options]
//! - docmigrate down [--config <path>] [options]
//! - docmigrate create <name> [--migrations-directory <dir>]
//!
//! Flags override values loaded from `--config`.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::driver::{DriverKind, ServerAddr, DEFAULT_PORT};

/// docmigrate - ordered, ledger-tracked migrations for document databases
#[derive(Parser, Debug)]
#[command(name = "docmigrate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Apply pending migrations, oldest first
    Up(RunArgs),

    /// Revert applied migrations, newest first
    Down(RunArgs),

    /// Create a new migration file stamped with the current UTC time
    Create {
        /// Migration name
        name: String,

        /// Directory where migration files are saved
        #[arg(long, default_value = "migrations")]
        migrations_directory: String,

        /// Base path the migrations directory is resolved against
        #[arg(long)]
        relative_to: Option<PathBuf>,
    },
}

/// Options shared by `up` and `down`
#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Load options from a TOML or JSON file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Local document server state file
    #[arg(long, env = "DOCMIGRATE_STATE_FILE", default_value = ".docmigrate/state.json")]
    pub state_file: PathBuf,

    /// Number of migrations to process
    #[arg(long)]
    pub step: Option<usize>,

    #[arg(long, value_enum)]
    pub driver: Option<DriverKind>,

    /// Table where applied migrations are recorded
    #[arg(long)]
    pub migrations_table: Option<String>,

    /// Apply older migrations missing from the ledger too
    #[arg(long)]
    pub ignore_timestamp: bool,

    #[arg(long)]
    pub migrations_directory: Option<String>,

    #[arg(long)]
    pub relative_to: Option<PathBuf>,

    #[arg(long)]
    pub host: Option<String>,

    #[arg(long)]
    pub port: Option<u16>,

    /// Target database
    #[arg(long, env = "DOCMIGRATE_DB")]
    pub db: Option<String>,

    #[arg(long)]
    pub user: Option<String>,

    #[arg(long, env = "DOCMIGRATE_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    #[arg(long)]
    pub ssl: bool,

    /// Suppress progress output
    #[arg(long, short = 's')]
    pub silent: bool,

    /// Pool driver: connect lazily to the listed servers
    #[arg(long)]
    pub pool: bool,

    /// Pool driver: materialize results as arrays
    #[arg(long)]
    pub no_cursor: bool,

    /// Pool driver: server as `host[:port]`, repeatable
    #[arg(long = "server", value_parser = parse_server)]
    pub servers: Vec<ServerAddr>,
}

/// Parse `host` or `host:port`
pub fn parse_server(value: &str) -> Result<ServerAddr, String> {
    match value.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|e| format!("invalid port '{}': {}", port, e))?;
            if host.is_empty() {
                return Err("host cannot be empty".to_string());
            }
            Ok(ServerAddr::new(host, port))
        }
        None if value.is_empty() => Err("host cannot be empty".to_string()),
        None => Ok(ServerAddr::new(value, DEFAULT_PORT)),
    }
}
