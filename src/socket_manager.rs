// ABOUTME: Per-booster-type listening socket ownership.
// ABOUTME: Creates named Unix sockets that survive fork and re-exec, keyed by booster type.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use anyhow::{Context, Result};
use nix::sys::socket::{bind, listen, socket, AddressFamily, SockFlag, SockType, UnixAddr};
use tracing::{debug, warn};

const LISTEN_BACKLOG: usize = 16;

/// Owns the named listening sockets boosters accept invoker connections
/// on. Sockets are created without close-on-exec: forked boosters inherit
/// them, and across a re-exec the successor re-adopts them by fd number
/// from the state file instead of re-binding.
pub struct SocketManager {
    socket_dir: PathBuf,
    sockets: HashMap<String, RawFd>,
}

impl SocketManager {
    pub fn new(socket_dir: PathBuf) -> Self {
        Self {
            socket_dir,
            sockets: HashMap::new(),
        }
    }

    pub fn socket_path(&self, booster_type: &str) -> PathBuf {
        self.socket_dir.join(format!("boost-{booster_type}"))
    }

    /// Create and start listening on the socket for a booster type.
    /// Idempotent per type.
    pub fn init_socket(&mut self, booster_type: &str) -> Result<RawFd> {
        if let Some(&fd) = self.sockets.get(booster_type) {
            return Ok(fd);
        }

        let path = self.socket_path(booster_type);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating socket directory {}", parent.display()))?;
        }

        // A leftover socket file from a previous run would make bind fail.
        if path.exists() {
            if let Err(err) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %err, "could not remove stale socket");
            }
        }

        let fd = socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::empty(),
            None,
        )
        .context("creating booster socket")?;

        let addr = UnixAddr::new(&path)
            .with_context(|| format!("socket address {}", path.display()))?;
        bind(fd, &addr).with_context(|| format!("binding {}", path.display()))?;
        listen(fd, LISTEN_BACKLOG).with_context(|| format!("listening on {}", path.display()))?;

        debug!(booster_type, path = %path.display(), fd, "booster socket ready");
        self.sockets.insert(booster_type.to_string(), fd);
        Ok(fd)
    }

    pub fn find_socket(&self, booster_type: &str) -> Option<RawFd> {
        self.sockets.get(booster_type).copied()
    }

    /// The serializable name → fd mapping for the state file.
    pub fn state(&self) -> &HashMap<String, RawFd> {
        &self.sockets
    }

    /// Re-adopt a socket restored from the state file.
    pub fn add_mapping(&mut self, booster_type: String, fd: RawFd) {
        self.sockets.insert(booster_type, fd);
    }
}

impl Drop for SocketManager {
    fn drop(&mut self) {
        // Socket files are only advisory names; fds stay open for children.
        for booster_type in self.sockets.keys() {
            let path = self.socket_path(booster_type);
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileTypeExt;

    #[test]
    fn init_creates_a_listening_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = SocketManager::new(dir.path().to_path_buf());

        let fd = manager.init_socket("app").unwrap();
        assert!(fd >= 0);

        let meta = std::fs::metadata(dir.path().join("boost-app")).unwrap();
        assert!(meta.file_type().is_socket());
        assert_eq!(manager.find_socket("app"), Some(fd));
    }

    #[test]
    fn init_is_idempotent_per_type() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = SocketManager::new(dir.path().to_path_buf());

        let first = manager.init_socket("app").unwrap();
        let second = manager.init_socket("app").unwrap();
        assert_eq!(first, second);
        assert_eq!(manager.state().len(), 1);
    }

    #[test]
    fn unknown_type_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SocketManager::new(dir.path().to_path_buf());
        assert_eq!(manager.find_socket("nope"), None);
    }

    #[test]
    fn restored_mapping_is_found_without_init() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = SocketManager::new(dir.path().to_path_buf());

        manager.add_mapping("app".to_string(), 42);
        assert_eq!(manager.find_socket("app"), Some(42));
        assert_eq!(manager.state().get("app"), Some(&42));
    }

    #[test]
    fn stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = SocketManager::new(dir.path().to_path_buf());

        std::fs::write(dir.path().join("boost-app"), b"stale").unwrap();
        let fd = manager.init_socket("app").unwrap();
        assert!(fd >= 0);
    }
}
