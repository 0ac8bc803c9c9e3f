// ABOUTME: Booster side of the launcher: pre-initialized children that accept launch requests.
// ABOUTME: Defines the Booster capability set and the stock application booster.

use std::ffi::CString;
use std::os::unix::io::RawFd;

use anyhow::{bail, Context, Result};
use nix::sys::socket::accept;
use nix::unistd;
use tracing::{debug, warn};

use crate::report;
use crate::single_instance::SingleInstance;
use crate::socket_manager::SocketManager;

/// Request flag: the invoker wants at most one instance of the application.
pub const HELLO_FLAG_SINGLE_INSTANCE: u32 = 0x1;

/// The capability set a booster exposes to the supervisor. The supervisor
/// only ever forks it, initializes it, and runs it; everything else about
/// a booster is its own business.
pub trait Booster {
    /// Type tag keying the listening socket for this booster.
    fn booster_type(&self) -> &'static str;

    /// Runs in the freshly forked child: perform the expensive warm-up,
    /// wait for an invoker, and report the accepted request on the
    /// launcher socket.
    fn initialize(
        &mut self,
        initial_argv: &[String],
        launcher_fd: RawFd,
        listen_fd: RawFd,
        single_instance: &SingleInstance,
        boot_mode: bool,
    );

    /// Take over the accepted request. The return value becomes the child's
    /// exit status, which the supervisor relays to the invoker.
    fn run(&mut self, sockets: &SocketManager) -> i32;
}

/// Stock booster for ordinary applications. Warm-up here is the seam where
/// concrete booster types preload their libraries and caches; this one only
/// performs the launch protocol.
pub struct AppBooster {
    invoker_fd: RawFd,
}

impl AppBooster {
    pub const TYPE: &'static str = "app";

    pub fn new() -> Self {
        Self { invoker_fd: -1 }
    }

    /// Accept invoker connections until one results in a launch. A
    /// single-instance request for an already-running application is
    /// answered on the spot and does not consume this booster.
    fn accept_invocation(
        &mut self,
        launcher_fd: RawFd,
        listen_fd: RawFd,
        single_instance: &SingleInstance,
    ) -> Result<()> {
        loop {
            debug!("waiting for a message from an invoker");
            let conn_fd = accept(listen_fd).context("accepting invoker connection")?;

            let hello = match read_invoker_hello(conn_fd) {
                Ok(hello) => hello,
                Err(err) => {
                    warn!(error = %err, "dropping malformed invocation");
                    let _ = unistd::close(conn_fd);
                    continue;
                }
            };

            if hello.single_instance && !self.lock_single_instance(conn_fd, &hello, single_instance)
            {
                // Answered without launching; wait for the next invoker.
                continue;
            }

            debug!(
                invoker_pid = hello.invoker_pid,
                delay = hello.delay,
                app_name = %hello.app_name,
                "invocation accepted"
            );

            // From here the supervisor owns status propagation: it maps us
            // to this invoker and forks our replacement.
            report::send_launch_report(launcher_fd, hello.invoker_pid, hello.delay, conn_fd)?;
            self.invoker_fd = conn_fd;
            return Ok(());
        }
    }

    /// Take the single-instance lock for the requested application.
    /// Returns false when another instance already holds it, in which case
    /// the existing instance is raised and the invoker gets its answer now.
    fn lock_single_instance(
        &self,
        conn_fd: RawFd,
        hello: &InvokerHello,
        single_instance: &SingleInstance,
    ) -> bool {
        let Some(entry) = single_instance.entry() else {
            warn!("single-instance launch wanted, but plugin not loaded");
            return true;
        };
        let Ok(app_name) = CString::new(hello.app_name.as_str()) else {
            warn!("application name contains a NUL byte");
            return true;
        };

        // SAFETY: validated plugin entry points called with a
        // NUL-terminated name, per the plugin ABI.
        if unsafe { (entry.lock)(app_name.as_ptr()) } != 0 {
            return true;
        }

        let activated = unsafe { (entry.activate_existing)(app_name.as_ptr()) } != 0;
        if !activated {
            warn!(app_name = %hello.app_name, "cannot activate existing instance");
        }
        let _ = report::send_exit_status(conn_fd, if activated { 0 } else { 1 });
        let _ = unistd::close(conn_fd);
        false
    }
}

impl Booster for AppBooster {
    fn booster_type(&self) -> &'static str {
        Self::TYPE
    }

    fn initialize(
        &mut self,
        _initial_argv: &[String],
        launcher_fd: RawFd,
        listen_fd: RawFd,
        single_instance: &SingleInstance,
        boot_mode: bool,
    ) {
        if !boot_mode {
            // Cache warm-up happens before the invoker shows up, so the
            // cost is paid while nobody is waiting.
            debug!("warming booster caches");
        }

        if let Err(err) = self.accept_invocation(launcher_fd, listen_fd, single_instance) {
            warn!(error = %err, "failed to accept an invocation");
        }
    }

    fn run(&mut self, _sockets: &SocketManager) -> i32 {
        // Concrete boosters exec into the requested application image here;
        // the stock booster ends the exchange and reports success.
        if self.invoker_fd >= 0 {
            let _ = unistd::close(self.invoker_fd);
            self.invoker_fd = -1;
        }
        0
    }
}

/// First bytes on a fresh invoker connection: the invoker's pid, the
/// respawn delay it wants the supervisor to honor, request flags, and the
/// application name. Integers travel in native order.
#[derive(Debug)]
pub struct InvokerHello {
    pub invoker_pid: i32,
    pub delay: i32,
    pub single_instance: bool,
    pub app_name: String,
}

const MAX_APP_NAME_LEN: u32 = 4096;

pub fn read_invoker_hello(conn_fd: RawFd) -> Result<InvokerHello> {
    let mut header = [0u8; 16];
    read_exact(conn_fd, &mut header)?;

    let invoker_pid = i32::from_ne_bytes(header[0..4].try_into().unwrap());
    let delay = i32::from_ne_bytes(header[4..8].try_into().unwrap());
    let flags = u32::from_ne_bytes(header[8..12].try_into().unwrap());
    let name_len = u32::from_ne_bytes(header[12..16].try_into().unwrap());

    if name_len > MAX_APP_NAME_LEN {
        bail!("application name length {name_len} is out of range");
    }
    let mut name = vec![0u8; name_len as usize];
    read_exact(conn_fd, &mut name)?;

    Ok(InvokerHello {
        invoker_pid,
        delay,
        single_instance: flags & HELLO_FLAG_SINGLE_INSTANCE != 0,
        app_name: String::from_utf8(name).context("application name is not valid UTF-8")?,
    })
}

fn read_exact(fd: RawFd, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = unistd::read(fd, &mut buf[filled..]).context("reading invoker hello")?;
        if n == 0 {
            bail!("invoker closed the connection mid-hello");
        }
        filled += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

    // The hello encoder lives with the invoker client; this is the
    // test-side stand-in.
    fn write_invoker_hello(conn_fd: RawFd, hello: &InvokerHello) {
        let mut bytes = Vec::with_capacity(16 + hello.app_name.len());
        bytes.extend_from_slice(&hello.invoker_pid.to_ne_bytes());
        bytes.extend_from_slice(&hello.delay.to_ne_bytes());
        let flags = if hello.single_instance {
            HELLO_FLAG_SINGLE_INSTANCE
        } else {
            0
        };
        bytes.extend_from_slice(&flags.to_ne_bytes());
        bytes.extend_from_slice(&(hello.app_name.len() as u32).to_ne_bytes());
        bytes.extend_from_slice(hello.app_name.as_bytes());
        unistd::write(conn_fd, &bytes).unwrap();
    }

    fn stream_pair() -> (RawFd, RawFd) {
        socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .unwrap()
    }

    #[test]
    fn invoker_hello_round_trip() {
        let (ours, theirs) = stream_pair();

        let sent = InvokerHello {
            invoker_pid: 1000,
            delay: 2,
            single_instance: true,
            app_name: "calculator".to_string(),
        };
        write_invoker_hello(theirs, &sent);

        let hello = read_invoker_hello(ours).unwrap();
        assert_eq!(hello.invoker_pid, 1000);
        assert_eq!(hello.delay, 2);
        assert!(hello.single_instance);
        assert_eq!(hello.app_name, "calculator");

        let _ = unistd::close(ours);
        let _ = unistd::close(theirs);
    }

    #[test]
    fn plain_launch_has_no_flags() {
        let (ours, theirs) = stream_pair();

        write_invoker_hello(
            theirs,
            &InvokerHello {
                invoker_pid: 42,
                delay: 0,
                single_instance: false,
                app_name: String::new(),
            },
        );

        let hello = read_invoker_hello(ours).unwrap();
        assert_eq!(hello.invoker_pid, 42);
        assert!(!hello.single_instance);
        assert!(hello.app_name.is_empty());

        let _ = unistd::close(ours);
        let _ = unistd::close(theirs);
    }

    #[test]
    fn truncated_hello_is_an_error() {
        let (ours, theirs) = stream_pair();

        unistd::write(theirs, &[1u8, 2, 3]).unwrap();
        let _ = unistd::close(theirs);

        assert!(read_invoker_hello(ours).is_err());
        let _ = unistd::close(ours);
    }

    #[test]
    fn oversized_app_name_is_refused() {
        let (ours, theirs) = stream_pair();

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&7i32.to_ne_bytes());
        bytes.extend_from_slice(&0i32.to_ne_bytes());
        bytes.extend_from_slice(&0u32.to_ne_bytes());
        bytes.extend_from_slice(&(MAX_APP_NAME_LEN + 1).to_ne_bytes());
        unistd::write(theirs, &bytes).unwrap();

        assert!(read_invoker_hello(ours).is_err());
        let _ = unistd::close(ours);
        let _ = unistd::close(theirs);
    }
}
