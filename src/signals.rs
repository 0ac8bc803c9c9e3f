// ABOUTME: Self-pipe signal plumbing for the launcher daemon.
// ABOUTME: Serializes async signal delivery onto a readable fd and keeps the saved handler table.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use anyhow::{Context, Result};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd;

/// Signals routed through the self-pipe into the event loop.
pub const HANDLED_SIGNALS: [Signal; 6] = [
    Signal::SIGCHLD,
    Signal::SIGTERM,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGPIPE,
    Signal::SIGHUP,
];

// Write end of the self-pipe, reachable from the async handler. -1 until a
// pipe has been published; a write to -1 simply fails and is ignored.
static PIPE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

// The only code that runs in signal context. One async-signal-safe write of
// the signal number; if the pipe is full the signal stays pending in the
// kernel mask and fires again after drain, so the result is ignored.
extern "C" fn forward_to_pipe(signum: libc::c_int) {
    let fd = PIPE_WRITE_FD.load(Ordering::Relaxed);
    let byte = signum as u8;
    // SAFETY: write(2) is async-signal-safe; the buffer outlives the call.
    unsafe {
        libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
    }
}

/// The pipe that converts signal delivery into fd readiness.
///
/// Both fds are plain (not close-on-exec): they are inherited verbatim
/// across a re-exec and their numeric values go into the state file.
#[derive(Debug)]
pub struct SignalPipe {
    pub read_fd: RawFd,
    pub write_fd: RawFd,
}

impl SignalPipe {
    pub fn create() -> Result<Self> {
        let (read_fd, write_fd) = unistd::pipe().context("creating signal pipe")?;
        Ok(Self { read_fd, write_fd })
    }

    /// Re-adopt the pipe fds inherited from a previous generation.
    pub fn from_raw(read_fd: RawFd, write_fd: RawFd) -> Self {
        Self { read_fd, write_fd }
    }

    /// Make the write end visible to the signal handler.
    pub fn publish_write_end(&self) {
        PIPE_WRITE_FD.store(self.write_fd, Ordering::Relaxed);
    }

    /// Read one pending signal byte. `None` for EOF or a byte that does not
    /// name a signal.
    pub fn read_signal(&self) -> Result<Option<Signal>> {
        let mut buf = [0u8; 1];
        let n = unistd::read(self.read_fd, &mut buf).context("reading signal pipe")?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Signal::try_from(buf[0] as libc::c_int).ok())
    }
}

/// Dispositions that were in place before the daemon installed its own
/// handlers, captured exactly once. Forked boosters restore these before
/// running any booster code; the table is empty from then on in the child.
pub struct SavedHandlers {
    saved: Vec<(Signal, SigAction)>,
}

impl SavedHandlers {
    /// Install the self-pipe handler for every handled signal and record
    /// the previous dispositions.
    pub fn install() -> Result<Self> {
        let action = SigAction::new(
            SigHandler::Handler(forward_to_pipe),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        let mut saved = Vec::with_capacity(HANDLED_SIGNALS.len());
        for sig in HANDLED_SIGNALS {
            // SAFETY: the handler only performs an async-signal-safe write.
            let old = unsafe { sigaction(sig, &action) }
                .with_context(|| format!("installing handler for {sig}"))?;

            // SIGHUP is set to SIG_IGN by the predecessor just before its
            // exec, so that a second SIGHUP cannot kill the successor early.
            // Children must still see the default disposition.
            let old = if sig == Signal::SIGHUP && matches!(old.handler(), SigHandler::SigIgn) {
                SigAction::new(SigHandler::SigDfl, old.flags(), old.mask())
            } else {
                old
            };
            saved.push((sig, old));
        }

        tracing::debug!(count = saved.len(), "signal handlers installed");
        Ok(Self { saved })
    }

    #[cfg(test)]
    pub fn empty() -> Self {
        Self { saved: Vec::new() }
    }

    /// Reinstate every saved disposition and empty the table. Called in the
    /// forked child before the booster takes over.
    pub fn restore_in_child(&mut self) {
        for (sig, action) in self.saved.drain(..) {
            // SAFETY: reinstalling a disposition previously returned by
            // sigaction for this signal.
            let _ = unsafe { sigaction(sig, &action) };
        }
    }

    pub fn len(&self) -> usize {
        self.saved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.saved.is_empty()
    }

    #[cfg(test)]
    fn disposition(&self, sig: Signal) -> Option<SigHandler> {
        self.saved
            .iter()
            .find(|(s, _)| *s == sig)
            .map(|(_, action)| action.handler())
    }
}
