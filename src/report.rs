// ABOUTME: Wire formats between booster, supervisor, and invoker.
// ABOUTME: Launch-report datagram codec (pid, delay, SCM_RIGHTS fd) and the invoker exit message.

use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::RawFd;

use anyhow::{Context, Result};
use nix::cmsg_space;
use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags,
};
use nix::unistd;

/// Header written to the invoker fd before the exit code when a boosted
/// application exits normally. Fixed by this repository for both sides of
/// the socket.
pub const INVOKER_MSG_EXIT: u32 = 0xe4e5_0000;

/// One accepted invocation, as reported by a booster on the launcher
/// socket: the invoker's pid, the respawn delay it asked the supervisor to
/// apply, and the invoker's socket passed as ancillary data.
///
/// Integers travel in native order and width; booster and supervisor are
/// always the same build running on the same host.
#[derive(Debug)]
pub struct LaunchReport {
    pub invoker_pid: i32,
    pub delay: i32,
    pub invoker_fd: Option<RawFd>,
}

/// Booster side: tell the supervisor a launch request was accepted.
pub fn send_launch_report(
    launcher_fd: RawFd,
    invoker_pid: i32,
    delay: i32,
    invoker_fd: RawFd,
) -> Result<()> {
    let pid_bytes = invoker_pid.to_ne_bytes();
    let delay_bytes = delay.to_ne_bytes();
    let iov = [IoSlice::new(&pid_bytes), IoSlice::new(&delay_bytes)];
    let fds = [invoker_fd];
    let cmsgs = [ControlMessage::ScmRights(&fds)];

    sendmsg::<()>(launcher_fd, &iov, &cmsgs, MsgFlags::empty(), None)
        .context("sending launch report to supervisor")?;
    Ok(())
}

/// Supervisor side: receive one launch-report datagram.
pub fn recv_launch_report(launcher_fd: RawFd) -> Result<LaunchReport> {
    let mut pid_bytes = [0u8; 4];
    let mut delay_bytes = [0u8; 4];

    let invoker_fd = {
        let mut iov = [
            IoSliceMut::new(&mut pid_bytes),
            IoSliceMut::new(&mut delay_bytes),
        ];
        let mut cmsg_buf = cmsg_space!([RawFd; 1]);

        let msg = recvmsg::<()>(launcher_fd, &mut iov, Some(&mut cmsg_buf), MsgFlags::empty())
            .context("receiving launch report from booster")?;

        let mut fd = None;
        for cmsg in msg.cmsgs() {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                fd = fds.first().copied();
            }
        }
        fd
    };

    Ok(LaunchReport {
        invoker_pid: i32::from_ne_bytes(pid_bytes),
        delay: i32::from_ne_bytes(delay_bytes),
        invoker_fd,
    })
}

/// Report a boosted application's normal exit to its invoker: the exit
/// header followed by the exit code. The caller closes the fd afterwards.
pub fn send_exit_status(invoker_fd: RawFd, exit_code: i32) -> Result<()> {
    unistd::write(invoker_fd, &INVOKER_MSG_EXIT.to_ne_bytes())
        .context("writing exit header to invoker")?;
    unistd::write(invoker_fd, &exit_code.to_ne_bytes())
        .context("writing exit code to invoker")?;
    Ok(())
}
