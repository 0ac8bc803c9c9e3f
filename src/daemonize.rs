// ABOUTME: Classic double-fork daemonization.
// ABOUTME: Detaches the supervisor from its terminal at initial startup.

use anyhow::{Context, Result};
use nix::fcntl::{open, OFlag};
use nix::sys::stat::{umask, Mode};
use nix::unistd::{self, dup2, ForkResult};

/// Detach from the controlling terminal: fork (parent exits), new session,
/// fork again (parent exits), root working directory, clear umask, standard
/// streams onto /dev/null. Runs only at initial startup, never on re-exec.
pub fn daemonize() -> Result<()> {
    // SAFETY: single-threaded startup path; the parent exits immediately.
    match unsafe { unistd::fork() }.context("first daemonize fork")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    unistd::setsid().context("creating daemon session")?;

    // SAFETY: as above; the session leader parent exits so the daemon can
    // never reacquire a controlling terminal.
    match unsafe { unistd::fork() }.context("second daemonize fork")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    unistd::chdir("/").context("changing working directory to /")?;
    umask(Mode::empty());

    // Failure to redirect a stream is tolerated, same as losing it.
    if let Ok(fd) = open("/dev/null", OFlag::O_RDONLY, Mode::empty()) {
        let _ = dup2(fd, libc::STDIN_FILENO);
        let _ = unistd::close(fd);
    }
    if let Ok(fd) = open("/dev/null", OFlag::O_WRONLY, Mode::empty()) {
        let _ = dup2(fd, libc::STDOUT_FILENO);
        let _ = dup2(fd, libc::STDERR_FILENO);
        let _ = unistd::close(fd);
    }

    Ok(())
}
