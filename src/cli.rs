//! CLI surface: one binary that runs a replica or speaks to the cluster.

use std::ffi::OsString;
use std::io::Write as _;
use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use thiserror::Error;

use crate::client::{load_lines, Client};
use crate::config;
use crate::core::HostId;
use crate::{daemon, Result};

#[derive(Parser, Debug)]
#[command(
    name = "decree",
    version,
    about = "Replicated key-value store serialized by per-key Paxos",
    arg_required_else_help = true
)]
pub struct Cli {
    /// Config file (default: built-in local five-replica cluster).
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Debug output (repeat for more).
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one replica until a shutdown signal.
    Daemon {
        /// Which of the five fixed identities to assume (A..E).
        #[arg(value_name = "HOST")]
        host: String,
    },

    /// Bulk-load `key value` lines from stdin.
    Load,

    /// Write one key.
    Put { key: String, value: String },

    /// Read one key.
    Get { key: String },
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("host must be a single letter A..E, got {0:?}")]
    BadHost(String),
    #[error("not found")]
    NotFound,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub fn parse_from<I, T>(args: I) -> Cli
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Cli::parse_from(args)
}

pub fn run(cli: Cli) -> Result<()> {
    let config = config::load(cli.config.as_deref()).map_err(crate::Error::from)?;

    match cli.command {
        Commands::Daemon { host } => {
            let host = parse_host(&host)?;
            daemon::run(&config, host)?;
        }
        Commands::Load => {
            let mut client = Client::new(&config)?;
            let stdin = std::io::stdin();
            let loaded = load_lines(&mut client, stdin.lock(), &mut std::io::stderr())?;
            tracing::info!(loaded, "bulk load complete");
        }
        Commands::Put { key, value } => {
            let mut client = Client::new(&config)?;
            client.put(key.as_bytes(), value.as_bytes())?;
        }
        Commands::Get { key } => {
            let mut client = Client::new(&config)?;
            match client.get(key.as_bytes())? {
                Some(value) => {
                    let mut stdout = std::io::stdout();
                    stdout.write_all(&value).map_err(CliError::from)?;
                    writeln!(stdout).map_err(CliError::from)?;
                }
                None => return Err(CliError::NotFound.into()),
            }
        }
    }
    Ok(())
}

fn parse_host(raw: &str) -> std::result::Result<HostId, CliError> {
    let mut chars = raw.chars();
    match (chars.next(), chars.next()) {
        (Some(letter), None) => {
            HostId::from_letter(letter).ok_or_else(|| CliError::BadHost(raw.to_string()))
        }
        _ => Err(CliError::BadHost(raw.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_letters_parse_strictly() {
        assert_eq!(parse_host("A").unwrap(), HostId::A);
        assert_eq!(parse_host("E").unwrap(), HostId::E);
        assert!(parse_host("F").is_err());
        assert!(parse_host("a").is_err());
        assert!(parse_host("AB").is_err());
        assert!(parse_host("").is_err());
    }

    #[test]
    fn command_tree_parses() {
        let cli = parse_from(["decree", "daemon", "C"]);
        assert!(matches!(cli.command, Commands::Daemon { ref host } if host == "C"));

        let cli = parse_from(["decree", "-vv", "put", "k", "v"]);
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Put { .. }));

        let cli = parse_from(["decree", "get", "k", "--config", "/tmp/decree.toml"]);
        assert!(cli.config.is_some());
        assert!(matches!(cli.command, Commands::Get { .. }));
    }
}
