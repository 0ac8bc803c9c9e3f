// ABOUTME: Application launcher daemon entry point.
// ABOUTME: Keeps pre-initialized booster processes ready to exec into requested applications.

mod args;
mod booster;
mod config;
mod daemon;
mod daemonize;
mod logging;
mod report;
mod signals;
mod single_instance;
mod socket_manager;
mod state;

use std::path::Path;

use tracing::{debug, error};

use crate::booster::AppBooster;
use crate::daemon::Daemon;

fn main() {
    let args = args::parse();
    logging::init(args.debug);
    debug!("starting");

    let config = match config::load(Path::new(config::DEFAULT_CONFIG_PATH)) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            std::process::exit(1);
        }
    };

    let mut daemon = match Daemon::new(&args, config) {
        Ok(daemon) => daemon,
        Err(err) => {
            error!(error = %err, "failed to initialize supervisor");
            std::process::exit(1);
        }
    };

    if let Err(err) = daemon.run(Box::new(AppBooster::new())) {
        error!(error = %err, "supervisor failed");
        std::process::exit(1);
    }
}
