// ABOUTME: Logging setup for the launcher daemon.
// ABOUTME: Configures tracing to output structured logs to stderr.

use tracing_subscriber::EnvFilter;

pub fn init(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
