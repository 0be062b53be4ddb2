//! CLI command implementations
//!
//! `up` and `down` run against the in-process document server, persisted to
//! `--state-file` so successive invocations see the same databases.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::EnvFilter;

use super::args::{Cli, Command, RunArgs};
use super::errors::{CliError, CliResult};
use crate::driver::{Connector, MemoryConnector};
use crate::lifecycle::Migrator;
use crate::migrations::{Direction, MigrationGenerator};
use crate::options::RunOptions;
use crate::progress::{Progress, ProgressNotifier};

/// Main CLI entry point
///
/// Parses arguments and dispatches to the appropriate command.
/// This is the only function that main.rs should call.
pub async fn run() -> CliResult<()> {
    init_logging()?;
    let cli = Cli::parse_args();
    run_command(cli.command).await
}

/// Run the appropriate command based on CLI args
pub async fn run_command(cmd: Command) -> CliResult<()> {
    match cmd {
        Command::Up(args) => migrate(Direction::Up, args).await,
        Command::Down(args) => migrate(Direction::Down, args).await,
        Command::Create {
            name,
            migrations_directory,
            relative_to,
        } => create(&name, &migrations_directory, relative_to),
    }
}

/// Logs go to stderr; `RUST_LOG` overrides the default `warn` level
fn init_logging() -> CliResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("warn"))
        .map_err(|e| CliError::Logging(e.to_string()))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| CliError::Logging(e.to_string()))
}

/// Merge the config file (if any) with command-line flags
pub fn build_options(op: Direction, args: &RunArgs) -> CliResult<RunOptions> {
    let mut options = match &args.config {
        Some(path) => RunOptions::load(path)?,
        None => RunOptions::default(),
    };

    options.op = Some(op);
    if let Some(step) = args.step {
        options.step = Some(step);
    }
    if let Some(driver) = args.driver {
        options.driver = driver;
    }
    if let Some(table) = &args.migrations_table {
        options.migrations_table = table.clone();
    }
    if let Some(directory) = &args.migrations_directory {
        options.migrations_directory = directory.clone();
    }
    if let Some(relative_to) = &args.relative_to {
        options.relative_to = Some(relative_to.clone());
    }
    if let Some(host) = &args.host {
        options.host = host.clone();
    }
    if let Some(port) = args.port {
        options.port = port;
    }
    if let Some(db) = &args.db {
        options.db = db.clone();
    }
    if let Some(user) = &args.user {
        options.user = Some(user.clone());
    }
    if let Some(password) = &args.password {
        options.password = Some(password.clone());
    }
    if !args.servers.is_empty() {
        options.servers = Some(args.servers.clone());
    }
    if args.pool {
        options.pool = Some(true);
    }
    if args.no_cursor {
        options.cursor = Some(false);
    }
    options.ignore_timestamp |= args.ignore_timestamp;
    options.ssl |= args.ssl;
    options.silent |= args.silent;

    Ok(options)
}

async fn migrate(op: Direction, args: RunArgs) -> CliResult<()> {
    let options = build_options(op, &args)?;
    let connector = open_connector(&args.state_file)?;

    let notifier = ProgressNotifier::new();
    let printer = tokio::spawn(print_progress(notifier.subscribe()));

    let migrator = Migrator::new(options, connector).with_notifier(notifier);
    let result = migrator.run().await;

    // Dropping the last sender ends the printer
    drop(migrator);
    if let Err(e) = printer.await {
        tracing::warn!(error = %e, "progress printer stopped");
    }

    result?;
    Ok(())
}

async fn print_progress(mut receiver: broadcast::Receiver<Progress>) {
    loop {
        match receiver.recv().await {
            Ok(progress) => println!("{}", progress.message),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "progress output fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn open_connector(state_file: &Path) -> CliResult<Arc<dyn Connector>> {
    if let Some(parent) = state_file.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| CliError::StateFile {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    let connector = MemoryConnector::persistent(state_file.to_path_buf())?;
    tracing::debug!(state_file = %state_file.display(), "using local document server");
    Ok(Arc::new(connector))
}

fn create(
    name: &str,
    migrations_directory: &str,
    relative_to: Option<PathBuf>,
) -> CliResult<()> {
    let options = RunOptions {
        migrations_directory: migrations_directory.to_string(),
        relative_to,
        ..RunOptions::default()
    };

    let path = MigrationGenerator::new(options.migrations_path()).create(name)?;
    println!("{}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverKind, ServerAddr};
    use tempfile::TempDir;

    #[test]
    fn test_flags_override_config_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("migrate.json");
        fs::write(
            &config_path,
            r#"{ "db": "from_file", "migrations_table": "_history", "step": 3 }"#,
        )
        .unwrap();

        let args = RunArgs {
            config: Some(config_path),
            db: Some("from_flag".to_string()),
            driver: Some(DriverKind::Pool),
            servers: vec![ServerAddr::new("db1", 28015)],
            pool: true,
            ..RunArgs::default()
        };

        let options = build_options(Direction::Down, &args).unwrap();
        assert_eq!(options.op, Some(Direction::Down));
        assert_eq!(options.db, "from_flag");
        assert_eq!(options.migrations_table, "_history");
        assert_eq!(options.step, Some(3));
        assert!(options.uses_pool());
        assert!(options.validate().is_ok());
    }

    #[tokio::test]
    async fn test_up_and_down_share_state_file() {
        let temp_dir = TempDir::new().unwrap();
        let migrations_dir = temp_dir.path().join("migrations");
        fs::create_dir_all(&migrations_dir).unwrap();
        fs::write(
            migrations_dir.join("20200101000000-create-table.yaml"),
            "up:\n  - table_create: { table: companies }\ndown:\n  - table_drop: { table: companies }\n",
        )
        .unwrap();
        let state_file = temp_dir.path().join("state").join("db.json");

        let args = || RunArgs {
            db: Some("app".to_string()),
            relative_to: Some(temp_dir.path().to_path_buf()),
            state_file: state_file.clone(),
            silent: true,
            ..RunArgs::default()
        };

        run_command(Command::Up(args())).await.unwrap();
        let server = MemoryConnector::persistent(state_file.clone()).unwrap().server();
        assert_eq!(
            server.tables("app").await.unwrap(),
            vec!["_migrations".to_string(), "companies".to_string()]
        );

        run_command(Command::Down(args())).await.unwrap();
        let server = MemoryConnector::persistent(state_file).unwrap().server();
        assert_eq!(server.tables("app").await.unwrap(), vec!["_migrations".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_db_is_a_config_error() {
        let temp_dir = TempDir::new().unwrap();
        let args = RunArgs {
            state_file: temp_dir.path().join("state.json"),
            ..RunArgs::default()
        };

        let err = run_command(Command::Up(args)).await.unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_create_writes_migration() {
        let temp_dir = TempDir::new().unwrap();

        create("add-index", "db/migrations", Some(temp_dir.path().to_path_buf())).unwrap();

        let entries: Vec<_> = fs::read_dir(temp_dir.path().join("db/migrations"))
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 1);
    }
}
