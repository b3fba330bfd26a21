//! Logging initialization.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Install the global subscriber. Precedence: `RUST_LOG` if set, otherwise
/// the verbosity flag, with config directives layered on top. Calling this
/// twice is harmless; the second call loses.
pub fn init(verbose: u8, logging: &LoggingConfig) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let mut filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    if let Some(directives) = &logging.filter {
        for directive in directives.split(',') {
            match directive.trim().parse() {
                Ok(directive) => filter = filter.add_directive(directive),
                Err(err) => eprintln!("ignoring log directive {directive:?}: {err}"),
            }
        }
    }

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
