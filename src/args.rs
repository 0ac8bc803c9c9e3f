// ABOUTME: Command line parsing for the launcher daemon.
// ABOUTME: Maps the flag surface onto typed options with the daemon's exit-code conventions.

use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};

#[derive(Parser, Debug)]
#[command(name = "launcherd", about = "Start the application launcher daemon.")]
pub struct Args {
    /// Start in boot mode: boosters skip cache initialization and the
    /// respawn delay is zero. Normal mode is restored by sending SIGUSR1
    /// to the daemon; boot mode can also be entered by sending SIGUSR2.
    #[arg(short = 'b', long = "boot-mode")]
    pub boot_mode: bool,

    /// Detach from the terminal and run as a daemon.
    #[arg(short = 'd', long)]
    pub daemon: bool,

    /// Enable debug logging.
    #[arg(long)]
    pub debug: bool,

    /// Notify the service manager when initialization is done.
    #[arg(long)]
    pub systemd: bool,

    /// Internal: restore state saved by a previous generation before
    /// entering the event loop.
    #[arg(long = "re-exec", hide = true)]
    pub re_exec: bool,

    // A re-exec'd generation carries a whitespace padding argument that
    // reserves argv space for process title rewrites. Accepted and ignored.
    #[arg(hide = true)]
    padding: Vec<String>,
}

impl Args {
    /// Only whitespace-only positionals are tolerated; anything else is a
    /// usage error.
    fn stray_positional(&self) -> Option<&str> {
        self.padding
            .iter()
            .map(String::as_str)
            .find(|arg| !arg.trim().is_empty())
    }
}

/// Parse the process arguments, exiting on help or usage errors.
///
/// Exit codes follow the daemon convention: 0 for `--help`, 1 for any
/// malformed invocation.
pub fn parse() -> Args {
    match Args::try_parse() {
        Ok(args) => {
            if let Some(stray) = args.stray_positional() {
                eprintln!("unexpected argument '{stray}'\n");
                let _ = Args::command().print_help();
                std::process::exit(1);
            }
            args
        }
        Err(err) if err.kind() == ErrorKind::DisplayHelp => {
            print!("{err}");
            std::process::exit(0);
        }
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    }
}
