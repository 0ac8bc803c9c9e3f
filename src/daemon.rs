// ABOUTME: Supervisor core of the launcher daemon.
// ABOUTME: Owns the booster lifecycle, the signal/socket event loop, mode changes, and re-exec.

use std::collections::HashMap;
use std::ffi::CString;
use std::os::unix::ffi::OsStringExt;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::io::RawFd;
use std::path::Path;

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::{kill, SigHandler, Signal};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};
use tracing::{debug, error, info, warn};

use crate::args::Args;
use crate::booster::Booster;
use crate::config::Config;
use crate::daemonize;
use crate::report;
use crate::signals::{SavedHandlers, SignalPipe};
use crate::single_instance::SingleInstance;
use crate::socket_manager::SocketManager;
use crate::state::{self, SavedState};

// Appended to the successor's argv on re-exec. Reserves address space for
// in-place process-title rewrites; treated as opaque by the parser.
const ARGV_PADDING: &str = "                                                  ";

/// The long-lived supervisor. Single-threaded: everything runs between
/// blocking waits on the signal pipe and the booster launcher socket, so
/// no state here ever needs locking.
pub struct Daemon {
    daemonize: bool,
    debug_mode: bool,
    boot_mode: bool,
    notify_service: bool,
    re_exec: bool,
    initial_argv: Vec<String>,
    /// Child pids still owed a wait. Dead boosters of earlier generations
    /// ride along here across a re-exec.
    children: Vec<i32>,
    /// Latest forked booster, 0 while a replacement fork is imminent.
    current_booster_pid: i32,
    invoker_pids: HashMap<i32, i32>,
    invoker_fds: HashMap<i32, RawFd>,
    /// Datagram pair shared with every booster; read end ours, write end
    /// theirs. The only channel for accept reports.
    launcher_socket: (RawFd, RawFd),
    signal_pipe: SignalPipe,
    saved_handlers: SavedHandlers,
    socket_manager: SocketManager,
    single_instance: SingleInstance,
    booster: Option<Box<dyn Booster>>,
    config: Config,
}

impl Daemon {
    pub fn new(args: &Args, config: Config) -> Result<Self> {
        // Handlers go in first so the saved dispositions are captured
        // before anything else can touch them. The pipe they write to is
        // published a few lines down.
        let saved_handlers =
            SavedHandlers::install().context("installing signal handlers")?;

        let mut daemon = Self {
            daemonize: args.daemon,
            debug_mode: args.debug,
            boot_mode: args.boot_mode,
            notify_service: args.systemd,
            re_exec: args.re_exec,
            initial_argv: std::env::args().collect(),
            children: Vec::new(),
            current_booster_pid: 0,
            invoker_pids: HashMap::new(),
            invoker_fds: HashMap::new(),
            launcher_socket: (-1, -1),
            signal_pipe: SignalPipe::from_raw(-1, -1),
            saved_handlers,
            socket_manager: SocketManager::new(config.socket_dir.clone()),
            single_instance: SingleInstance::new(),
            booster: None,
            config,
        };

        if daemon.re_exec {
            daemon.restore_state(&state::state_file())?;
        } else {
            let (read_end, write_end) = socketpair(
                AddressFamily::Unix,
                SockType::Datagram,
                None,
                SockFlag::empty(),
            )
            .context("creating booster launcher socket pair")?;
            daemon.launcher_socket = (read_end, write_end);
            daemon.signal_pipe = SignalPipe::create()?;
        }
        daemon.signal_pipe.publish_write_end();

        if daemon.daemonize {
            daemonize::daemonize().context("daemonizing")?;
        }

        Ok(daemon)
    }

    /// Run the supervisor with the given booster. Returns only on a fatal
    /// error; SIGTERM exits the process directly with success.
    pub fn run(&mut self, booster: Box<dyn Booster>) -> Result<()> {
        self.booster = Some(booster);

        // Keep LD_BIND_NOW from forcing eager binding on every dlopen the
        // boosters perform from here on.
        std::env::remove_var("LD_BIND_NOW");

        let plugin_path = self.config.single_instance_plugin.clone();
        self.single_instance.load(&plugin_path);
        if !self.single_instance.is_loaded() {
            debug!("continuing without single-instance support");
        }

        if self.re_exec {
            // The predecessor terminated its boosters right before exec;
            // reaping them forks our first booster of this generation.
            self.reap_zombies()?;
        } else {
            let booster_type = self.booster.as_ref().unwrap().booster_type();
            debug!(booster_type, "initializing booster socket");
            self.socket_manager.init_socket(booster_type)?;
            self.fork_booster(0)?;
        }

        if self.notify_service {
            debug!("initialization done, notifying service manager");
            if let Err(err) = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]) {
                warn!(error = %err, "service manager notification failed");
            }
        }

        loop {
            let mut fds = [
                PollFd::new(self.launcher_socket.0, PollFlags::POLLIN),
                PollFd::new(self.signal_pipe.read_fd, PollFlags::POLLIN),
            ];

            match poll(&mut fds, -1) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err).context("polling supervisor fds"),
            }

            let socket_ready = fds[0]
                .revents()
                .is_some_and(|r| r.contains(PollFlags::POLLIN));
            let signal_ready = fds[1]
                .revents()
                .is_some_and(|r| r.contains(PollFlags::POLLIN));

            // Booster reports before signal bytes; the order is arbitrary
            // but fixed so runs are reproducible.
            if socket_ready {
                self.read_booster_socket()?;
            }
            if signal_ready {
                self.dispatch_signal()?;
            }
        }
    }

    fn dispatch_signal(&mut self) -> Result<()> {
        match self.signal_pipe.read_signal()? {
            Some(Signal::SIGCHLD) => {
                debug!("SIGCHLD received");
                self.reap_zombies()?;
            }
            Some(Signal::SIGTERM) => {
                info!("SIGTERM received, exiting");
                std::process::exit(0);
            }
            Some(Signal::SIGUSR1) => {
                debug!("SIGUSR1 received");
                self.enter_normal_mode();
            }
            Some(Signal::SIGUSR2) => {
                debug!("SIGUSR2 received");
                self.enter_boot_mode();
            }
            Some(Signal::SIGPIPE) => {
                debug!("SIGPIPE received, invoker pipe broke");
            }
            Some(Signal::SIGHUP) => {
                // Diverges unless the re-exec fails early.
                self.re_exec();
            }
            _ => {}
        }
        Ok(())
    }

    /// Service one accept report from the launcher socket: record the
    /// invoker mapping against the reporting booster and fork its
    /// replacement so the next invoker never waits for warm-up.
    fn read_booster_socket(&mut self) -> Result<()> {
        let launch_report = match report::recv_launch_report(self.launcher_socket.0) {
            Ok(launch_report) => launch_report,
            Err(err) => {
                // The only channel for tracking accepted invocations is
                // gone; continuing would corrupt the child table.
                error!(error = %err, "booster socket failed, exiting");
                std::process::exit(1);
            }
        };

        debug!(
            invoker_pid = launch_report.invoker_pid,
            delay = launch_report.delay,
            "booster accepted an invocation"
        );

        if launch_report.invoker_pid != 0 && self.current_booster_pid != 0 {
            self.invoker_pids
                .insert(self.current_booster_pid, launch_report.invoker_pid);
            if let Some(fd) = launch_report.invoker_fd {
                self.invoker_fds.insert(self.current_booster_pid, fd);
            }
        } else if let Some(fd) = launch_report.invoker_fd {
            // Nothing to map the fd against; close it rather than leak.
            let _ = unistd::close(fd);
        }

        // The reported delay gives the just-launched application a head
        // start before the replacement burns CPU on re-initialization.
        self.fork_booster(launch_report.delay.max(0) as u32)
    }

    /// Fork the next booster of the managed type. In the child this never
    /// returns: control passes to the booster and ends in `_exit`.
    fn fork_booster(&mut self, delay_secs: u32) -> Result<()> {
        if self.booster.is_none() {
            error!("no booster registered, cannot fork");
            std::process::exit(1);
        }

        self.current_booster_pid = 0;

        // SAFETY: the supervisor is single-threaded and the child calls
        // only fork-safe operations before handing over to the booster.
        match unsafe { unistd::fork() }.context("forking booster")? {
            ForkResult::Child => {
                self.saved_handlers.restore_in_child();
                debug_assert!(self.saved_handlers.is_empty());

                // The booster must not outlive a dead supervisor.
                // SAFETY: plain prctl with immediate arguments.
                unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGHUP) };

                // Drop every supervisor-side fd: the launcher read end, the
                // whole signal pipe, and any invoker sockets in flight.
                let _ = unistd::close(self.launcher_socket.0);
                let _ = unistd::close(self.signal_pipe.read_fd);
                let _ = unistd::close(self.signal_pipe.write_fd);
                for fd in self.invoker_fds.values_mut() {
                    if *fd != -1 {
                        let _ = unistd::close(*fd);
                        *fd = -1;
                    }
                }

                // Best effort; terminal semantics are undefined if it
                // fails, but the booster itself still works.
                if let Err(err) = unistd::setsid() {
                    error!(error = %err, "could not set session id in booster");
                }

                if !self.boot_mode && delay_secs > 0 {
                    std::thread::sleep(std::time::Duration::from_secs(u64::from(delay_secs)));
                }

                let booster = self.booster.as_mut().unwrap();
                debug!(booster_type = booster.booster_type(), "running new booster");

                let Some(listen_fd) = self.socket_manager.find_socket(booster.booster_type())
                else {
                    error!(
                        booster_type = booster.booster_type(),
                        "no listening socket for booster type"
                    );
                    // SAFETY: terminating the child without finalizers.
                    unsafe { libc::_exit(1) };
                };

                booster.initialize(
                    &self.initial_argv,
                    self.launcher_socket.1,
                    listen_fd,
                    &self.single_instance,
                    self.boot_mode,
                );
                let exit_code = booster.run(&self.socket_manager);

                // No finalizers: buffers shared with the supervisor must
                // not be flushed twice.
                // SAFETY: immediate process exit.
                unsafe { libc::_exit(exit_code) };
            }
            ForkResult::Parent { child } => {
                self.children.push(child.as_raw());
                self.current_booster_pid = child.as_raw();
                debug!(pid = child.as_raw(), "booster forked");
            }
        }

        Ok(())
    }

    /// Wait on every tracked child without blocking, draining all ready
    /// zombies: several may have died before the SIGCHLD byte was read.
    fn reap_zombies(&mut self) -> Result<()> {
        let mut index = 0;
        while index < self.children.len() {
            let pid = self.children[index];
            match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => index += 1,
                Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                    self.children.remove(index);
                    self.handle_dead_child(pid, &status);

                    if pid == self.current_booster_pid {
                        self.fork_booster(self.config.respawn_delay_secs)?;
                    }
                }
                Ok(_) => index += 1,
                Err(err) => {
                    // Nothing more to learn about this pid; stop tracking.
                    debug!(pid, error = %err, "waitpid failed for tracked child");
                    self.children.remove(index);
                }
            }
        }
        Ok(())
    }

    /// Propagate a dead booster's fate to the invoker that was waiting on
    /// it, if it ever accepted a request.
    fn handle_dead_child(&mut self, pid: i32, status: &WaitStatus) {
        if !self.invoker_pids.contains_key(&pid) {
            return;
        }

        match *status {
            WaitStatus::Exited(_, exit_code) => {
                info!(pid, exit_code, "boosted process exited");
                if let Some(fd) = self.invoker_fds.remove(&pid) {
                    if let Err(err) = report::send_exit_status(fd, exit_code) {
                        warn!(pid, error = %err, "could not report exit to invoker");
                    }
                    let _ = unistd::close(fd);
                }
                self.invoker_pids.remove(&pid);
            }
            WaitStatus::Signaled(_, signal, _) => {
                info!(pid, signal = %signal, "boosted process was terminated by a signal");
                if let Some(fd) = self.invoker_fds.remove(&pid) {
                    let _ = unistd::close(fd);
                }
                // Mirror the death so the invoker can mirror it in turn.
                if let Some(invoker_pid) = self.invoker_pids.remove(&pid) {
                    self.kill_process(invoker_pid, signal);
                }
            }
            _ => {}
        }
    }

    fn kill_process(&self, pid: i32, signal: Signal) {
        if pid <= 0 {
            return;
        }
        debug!(pid, signal = %signal, "killing process");
        if let Err(err) = kill(Pid::from_raw(pid), signal) {
            error!(pid, signal = %signal, error = %err, "failed to kill process");
        }
    }

    pub fn enter_normal_mode(&mut self) {
        if self.boot_mode {
            self.boot_mode = false;
            self.kill_boosters();
            info!("exited boot mode");
        } else {
            info!("already in normal mode");
        }
    }

    pub fn enter_boot_mode(&mut self) {
        if !self.boot_mode {
            self.boot_mode = true;
            self.kill_boosters();
            info!("entered boot mode");
        } else {
            info!("already in boot mode");
        }
    }

    /// Terminate the current booster. Its pid is deliberately kept: the
    /// reap triggered by its death sees the match and forks the successor
    /// under whatever mode is active by then.
    fn kill_boosters(&mut self) {
        if self.current_booster_pid != 0 {
            self.kill_process(self.current_booster_pid, Signal::SIGTERM);
        }
    }

    fn snapshot_state(&self) -> SavedState {
        SavedState {
            my_pid: unistd::getpid().as_raw(),
            debug_mode: self.debug_mode,
            children: self.children.clone(),
            invoker_pids: self.invoker_pids.clone(),
            invoker_fds: self.invoker_fds.clone(),
            booster_pid: self.current_booster_pid,
            launcher_socket: self.launcher_socket,
            sigpipe_fd: (self.signal_pipe.read_fd, self.signal_pipe.write_fd),
            boot_mode: self.boot_mode,
            socket_map: self.socket_manager.state().clone(),
        }
    }

    /// Replace this image in place: persist the supervisor state, retire
    /// the running booster, and exec our own binary with `--re-exec`.
    /// Returns only if something failed before `execv`.
    fn re_exec(&mut self) {
        info!("re-exec requested");

        let state_dir = state::state_dir();
        let mut builder = std::fs::DirBuilder::new();
        builder.recursive(true).mode(0o700);
        if let Err(err) = builder.create(&state_dir) {
            error!(dir = %state_dir.display(), error = %err, "cannot create state directory");
            std::process::exit(1);
        }
        if !state_dir.is_dir() {
            error!(dir = %state_dir.display(), "state path exists but is not a directory");
            std::process::exit(1);
        }

        if let Err(err) = self.snapshot_state().save_to(&state::state_file()) {
            error!(error = %err, "failed to save state, re-exec aborted");
            std::process::exit(1);
        }

        // The booster's preloaded state goes stale across exec. Kill it
        // now; the successor reaps the corpse and forks a fresh one.
        self.kill_boosters();

        // Handler dispositions other than ignore/default are cleared by
        // exec, but SIG_IGN survives: a second SIGHUP arriving during the
        // exec window must not kill the successor before it reinstalls
        // its own handler.
        // SAFETY: installing SIG_IGN needs no handler-side guarantees.
        let _ = unsafe { nix::sys::signal::signal(Signal::SIGHUP, SigHandler::SigIgn) };

        debug!("state saved, calling execv");
        let err = exec_self().unwrap_err();
        error!(error = %err, "re-exec failed, exiting");
        std::process::exit(1);
    }

    /// Load the state a predecessor generation left for us. Any failure is
    /// fatal to the caller: invoker mappings transfer fully or not at all.
    /// The file is consumed either way, kept only in debug mode.
    fn restore_state(&mut self, path: &Path) -> Result<()> {
        match SavedState::load_from(path).and_then(Self::check_owner) {
            Ok(saved) => {
                self.debug_mode = self.debug_mode || saved.debug_mode;
                self.boot_mode = saved.boot_mode;
                self.children = saved.children;
                self.invoker_pids = saved.invoker_pids;
                self.invoker_fds = saved.invoker_fds;
                self.current_booster_pid = saved.booster_pid;
                self.launcher_socket = saved.launcher_socket;
                self.signal_pipe = SignalPipe::from_raw(saved.sigpipe_fd.0, saved.sigpipe_fd.1);
                for (booster_type, fd) in saved.socket_map {
                    debug!(booster_type = %booster_type, fd, "restored booster socket");
                    self.socket_manager.add_mapping(booster_type, fd);
                }
                self.remove_state_file(path);
                debug!("state restore completed");
                Ok(())
            }
            Err(err) => {
                self.remove_state_file(path);
                Err(err.context("restoring saved state"))
            }
        }
    }

    /// Exec preserves the pid, so a state file written by any other pid is
    /// a leftover from a crashed generation and describes children we
    /// never had.
    fn check_owner(saved: SavedState) -> Result<SavedState> {
        let my_pid = unistd::getpid().as_raw();
        if saved.my_pid != my_pid {
            bail!(
                "stale state file: written by pid {}, we are {my_pid}",
                saved.my_pid
            );
        }
        Ok(saved)
    }

    fn remove_state_file(&self, path: &Path) {
        // In debug mode the file is left behind for inspection.
        if self.debug_mode {
            return;
        }
        if let Err(err) = std::fs::remove_file(path) {
            error!(path = %path.display(), error = %err, "could not remove state file");
        }
    }
}

fn exec_self() -> Result<std::convert::Infallible> {
    let exe = std::env::current_exe().context("resolving own image path")?;
    let exe = CString::new(exe.into_os_string().into_vec())
        .context("own image path contains a NUL byte")?;
    let argv = [
        exe.clone(),
        CString::new("--re-exec").unwrap(),
        CString::new(ARGV_PADDING).unwrap(),
    ];
    unistd::execv(&exe, &argv).context("execv")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use std::time::{Duration, Instant};

    struct TestBooster {
        exit_code: i32,
    }

    impl Booster for TestBooster {
        fn booster_type(&self) -> &'static str {
            "app"
        }

        fn initialize(
            &mut self,
            _initial_argv: &[String],
            _launcher_fd: RawFd,
            _listen_fd: RawFd,
            _single_instance: &SingleInstance,
            _boot_mode: bool,
        ) {
        }

        fn run(&mut self, _sockets: &SocketManager) -> i32 {
            self.exit_code
        }
    }

    fn test_daemon() -> (Daemon, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let (read_end, write_end) = socketpair(
            AddressFamily::Unix,
            SockType::Datagram,
            None,
            SockFlag::empty(),
        )
        .unwrap();
        let (pipe_read, pipe_write) = unistd::pipe().unwrap();

        let daemon = Daemon {
            daemonize: false,
            debug_mode: false,
            boot_mode: false,
            notify_service: false,
            re_exec: false,
            initial_argv: vec!["launcherd".to_string()],
            children: Vec::new(),
            current_booster_pid: 0,
            invoker_pids: HashMap::new(),
            invoker_fds: HashMap::new(),
            launcher_socket: (read_end, write_end),
            signal_pipe: SignalPipe::from_raw(pipe_read, pipe_write),
            saved_handlers: SavedHandlers::empty(),
            socket_manager: SocketManager::new(dir.path().to_path_buf()),
            single_instance: SingleInstance::new(),
            booster: None,
            config: Config::default(),
        };
        (daemon, dir)
    }

    #[test]
    fn forked_booster_exits_with_its_run_code() {
        let (mut daemon, _dir) = test_daemon();
        daemon.socket_manager.init_socket("app").unwrap();
        daemon.booster = Some(Box::new(TestBooster { exit_code: 3 }));

        daemon.fork_booster(0).unwrap();

        let pid = daemon.current_booster_pid;
        assert!(pid > 0);
        assert_eq!(daemon.children, vec![pid]);

        let status = waitpid(Pid::from_raw(pid), None).unwrap();
        assert_eq!(status, WaitStatus::Exited(Pid::from_raw(pid), 3));
    }

    #[test]
    fn boot_mode_skips_the_respawn_delay() {
        let (mut daemon, _dir) = test_daemon();
        daemon.boot_mode = true;
        daemon.socket_manager.init_socket("app").unwrap();
        daemon.booster = Some(Box::new(TestBooster { exit_code: 0 }));

        let started = Instant::now();
        daemon.fork_booster(5).unwrap();
        waitpid(Pid::from_raw(daemon.current_booster_pid), None).unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn reap_removes_exited_children() {
        let (mut daemon, _dir) = test_daemon();
        let first = Command::new("true").spawn().unwrap();
        let second = Command::new("true").spawn().unwrap();
        daemon.children.push(first.id() as i32);
        daemon.children.push(second.id() as i32);

        std::thread::sleep(Duration::from_millis(200));
        daemon.reap_zombies().unwrap();

        assert!(daemon.children.is_empty());
    }

    #[test]
    fn dead_booster_is_reforked_with_the_configured_respawn_delay() {
        let (mut daemon, _dir) = test_daemon();
        daemon.socket_manager.init_socket("app").unwrap();
        daemon.booster = Some(Box::new(TestBooster { exit_code: 0 }));
        // Distinct from the stock 2 s delay: with zero the replacement
        // exits right away instead of sleeping first.
        daemon.config.respawn_delay_secs = 0;

        let booster = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = booster.id() as i32;
        daemon.children.push(pid);
        daemon.current_booster_pid = pid;

        daemon.kill_process(pid, Signal::SIGTERM);
        std::thread::sleep(Duration::from_millis(200));

        let started = Instant::now();
        daemon.reap_zombies().unwrap();

        let replacement = daemon.current_booster_pid;
        assert!(replacement > 0);
        assert_ne!(replacement, pid);
        assert_eq!(daemon.children, vec![replacement]);

        let status = waitpid(Pid::from_raw(replacement), None).unwrap();
        assert_eq!(status, WaitStatus::Exited(Pid::from_raw(replacement), 0));
        // A hardcoded 2 s respawn delay would still have the replacement
        // sleeping here.
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn normal_exit_reports_status_to_invoker() {
        let (mut daemon, _dir) = test_daemon();
        let (read_fd, write_fd) = unistd::pipe().unwrap();
        daemon.invoker_pids.insert(1234, 999_999);
        daemon.invoker_fds.insert(1234, write_fd);

        daemon.handle_dead_child(1234, &WaitStatus::Exited(Pid::from_raw(1234), 7));

        let mut buf = [0u8; 8];
        assert_eq!(unistd::read(read_fd, &mut buf).unwrap(), 8);
        assert_eq!(buf[0..4], report::INVOKER_MSG_EXIT.to_ne_bytes());
        assert_eq!(buf[4..8], 7i32.to_ne_bytes());

        // Closed exactly once, right after the status was written.
        assert_eq!(unistd::read(read_fd, &mut buf).unwrap(), 0);
        assert!(daemon.invoker_pids.is_empty());
        assert!(daemon.invoker_fds.is_empty());
        let _ = unistd::close(read_fd);
    }

    #[test]
    fn signal_death_is_mirrored_onto_the_invoker() {
        let (mut daemon, _dir) = test_daemon();
        let invoker = Command::new("sleep").arg("30").spawn().unwrap();
        let invoker_pid = invoker.id() as i32;
        let (read_fd, write_fd) = unistd::pipe().unwrap();
        daemon.invoker_pids.insert(88, invoker_pid);
        daemon.invoker_fds.insert(88, write_fd);

        daemon.handle_dead_child(
            88,
            &WaitStatus::Signaled(Pid::from_raw(88), Signal::SIGTERM, false),
        );

        // The fd is closed without any status bytes.
        let mut buf = [0u8; 1];
        assert_eq!(unistd::read(read_fd, &mut buf).unwrap(), 0);

        // The invoker received the same signal that killed the booster.
        let status = waitpid(Pid::from_raw(invoker_pid), None).unwrap();
        assert_eq!(
            status,
            WaitStatus::Signaled(Pid::from_raw(invoker_pid), Signal::SIGTERM, false)
        );
        assert!(daemon.invoker_pids.is_empty());
        assert!(daemon.invoker_fds.is_empty());
        let _ = unistd::close(read_fd);
    }

    #[test]
    fn accept_report_maps_the_invoker_and_forks_a_replacement() {
        let (mut daemon, _dir) = test_daemon();
        daemon.socket_manager.init_socket("app").unwrap();
        daemon.booster = Some(Box::new(TestBooster { exit_code: 0 }));
        daemon.current_booster_pid = 555;

        let (payload_read, payload_write) = unistd::pipe().unwrap();
        report::send_launch_report(daemon.launcher_socket.1, 1000, 0, payload_write).unwrap();

        daemon.read_booster_socket().unwrap();

        assert_eq!(daemon.invoker_pids.get(&555), Some(&1000));
        assert!(daemon.invoker_fds.contains_key(&555));

        // The replacement was forked before returning to the loop.
        let replacement = daemon.current_booster_pid;
        assert_ne!(replacement, 555);
        assert!(replacement > 0);
        waitpid(Pid::from_raw(replacement), None).unwrap();

        let _ = unistd::close(payload_read);
        let _ = unistd::close(payload_write);
    }

    #[test]
    fn entering_boot_mode_terminates_the_booster_and_keeps_its_pid() {
        let (mut daemon, _dir) = test_daemon();
        let booster = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = booster.id() as i32;
        daemon.children.push(pid);
        daemon.current_booster_pid = pid;

        daemon.enter_boot_mode();
        assert!(daemon.boot_mode);
        // Kept on purpose: the reap path matches on it to auto-fork the
        // successor under the new mode.
        assert_eq!(daemon.current_booster_pid, pid);

        let status = waitpid(Pid::from_raw(pid), None).unwrap();
        assert_eq!(
            status,
            WaitStatus::Signaled(Pid::from_raw(pid), Signal::SIGTERM, false)
        );

        // Entering the current mode again is a no-op.
        daemon.enter_boot_mode();
        assert!(daemon.boot_mode);

        daemon.enter_normal_mode();
        assert!(!daemon.boot_mode);
    }

    #[test]
    fn mode_change_with_no_booster_only_flips_the_flag() {
        let (mut daemon, _dir) = test_daemon();
        assert_eq!(daemon.current_booster_pid, 0);

        daemon.enter_boot_mode();
        assert!(daemon.boot_mode);
        daemon.enter_normal_mode();
        assert!(!daemon.boot_mode);
    }

    #[test]
    fn state_written_by_another_pid_is_stale() {
        let ours = SavedState {
            my_pid: unistd::getpid().as_raw(),
            ..SavedState::default()
        };
        assert!(Daemon::check_owner(ours).is_ok());

        let theirs = SavedState {
            my_pid: 1,
            ..SavedState::default()
        };
        assert!(Daemon::check_owner(theirs).is_err());
    }

    fn write_state_for_us(path: &Path, debug_mode: bool) {
        let saved = SavedState {
            my_pid: unistd::getpid().as_raw(),
            debug_mode,
            children: vec![10, 11],
            invoker_pids: HashMap::from([(11, 2000)]),
            invoker_fds: HashMap::from([(11, 7)]),
            booster_pid: 11,
            launcher_socket: (3, 4),
            sigpipe_fd: (5, 6),
            boot_mode: true,
            socket_map: HashMap::new(),
        };
        saved.save_to(path).unwrap();
    }

    #[test]
    fn successful_restore_applies_state_and_consumes_the_file() {
        let (mut daemon, dir) = test_daemon();
        let path = dir.path().join("saved-state");
        write_state_for_us(&path, false);

        daemon.restore_state(&path).unwrap();

        assert_eq!(daemon.children, vec![10, 11]);
        assert_eq!(daemon.current_booster_pid, 11);
        assert_eq!(daemon.invoker_pids.get(&11), Some(&2000));
        assert_eq!(daemon.invoker_fds.get(&11), Some(&7));
        assert!(daemon.boot_mode);
        assert_eq!(daemon.launcher_socket, (3, 4));
        assert!(!path.exists());
    }

    #[test]
    fn restored_debug_mode_keeps_the_state_file_for_inspection() {
        let (mut daemon, dir) = test_daemon();
        let path = dir.path().join("saved-state");
        write_state_for_us(&path, true);

        daemon.restore_state(&path).unwrap();

        assert!(daemon.debug_mode);
        assert!(path.exists());
    }

    #[test]
    fn failed_restore_still_consumes_the_file() {
        let (mut daemon, dir) = test_daemon();
        let path = dir.path().join("saved-state");
        let stale = SavedState {
            my_pid: 1,
            ..SavedState::default()
        };
        stale.save_to(&path).unwrap();

        assert!(daemon.restore_state(&path).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn failed_restore_in_debug_mode_keeps_the_file() {
        let (mut daemon, dir) = test_daemon();
        daemon.debug_mode = true;
        let path = dir.path().join("saved-state");
        std::fs::write(&path, "my-pid 1\nno trailer here").unwrap();

        assert!(daemon.restore_state(&path).is_err());
        assert!(path.exists());
    }

    #[test]
    fn snapshot_captures_the_supervisor_state() {
        let (mut daemon, _dir) = test_daemon();
        daemon.children = vec![10, 11];
        daemon.current_booster_pid = 11;
        daemon.invoker_pids.insert(11, 2000);
        daemon.invoker_fds.insert(11, 7);
        daemon.boot_mode = true;
        daemon.socket_manager.add_mapping("app".to_string(), 9);

        let snapshot = daemon.snapshot_state();
        assert_eq!(snapshot.my_pid, unistd::getpid().as_raw());
        assert_eq!(snapshot.children, vec![10, 11]);
        assert_eq!(snapshot.booster_pid, 11);
        assert_eq!(snapshot.invoker_pids.get(&11), Some(&2000));
        assert_eq!(snapshot.invoker_fds.get(&11), Some(&7));
        assert!(snapshot.boot_mode);
        assert_eq!(snapshot.launcher_socket, daemon.launcher_socket);
        assert_eq!(snapshot.socket_map.get("app"), Some(&9));

        // The snapshot survives the wire format unchanged.
        assert_eq!(SavedState::parse(&snapshot.serialize()).unwrap(), snapshot);
    }
}
