use decree::{cli, config, telemetry};

fn main() {
    let cli = cli::parse_from(std::env::args_os());

    // The logging section is the only config the subscriber needs; run()
    // reloads the file and will surface any error properly.
    let logging = config::load(cli.config.as_deref())
        .map(|config| config.logging)
        .unwrap_or_default();
    telemetry::init(cli.verbose, &logging);

    if let Err(e) = cli::run(cli) {
        tracing::error!("error: {}", e);
        std::process::exit(1);
    }
}
