use thiserror::Error;

use crate::cli::CliError;
use crate::client::ClientError;
use crate::config::ConfigError;
use crate::daemon::DaemonError;

/// Crate-level convenience error.
///
/// Not a "god error": a thin wrapper over the subsystem errors, for callers
/// that cross subsystem boundaries (mainly the CLI).
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Cli(#[from] CliError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Daemon(#[from] DaemonError),
}
