//! Command-line interface

pub mod args;
pub mod commands;
pub mod errors;

pub use args::{Cli, Command, RunArgs};
pub use commands::run;
pub use errors::{CliError, CliResult};
