// ABOUTME: Supervisor state serialization for re-exec.
// ABOUTME: Token-keyed text records saved before exec and restored by the successor image.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};

/// Everything the successor generation needs to take over without losing
/// invoker mappings or open invoker fds. Fd values are carried verbatim:
/// exec preserves open fds but resets handlers, so the successor re-adopts
/// the same numbers and reinstalls its handlers over them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SavedState {
    pub my_pid: i32,
    pub debug_mode: bool,
    pub children: Vec<i32>,
    pub invoker_pids: HashMap<i32, i32>,
    pub invoker_fds: HashMap<i32, i32>,
    pub booster_pid: i32,
    pub launcher_socket: (i32, i32),
    pub sigpipe_fd: (i32, i32),
    pub boot_mode: bool,
    pub socket_map: HashMap<String, i32>,
}

impl SavedState {
    pub fn serialize(&self) -> String {
        let mut out = String::new();

        // The pid header lets the reader reject a stale file left behind by
        // a crashed generation. Debug mode comes right after so a restored
        // daemon keeps its retention behavior from the start.
        let _ = writeln!(out, "my-pid {}", self.my_pid);
        let _ = writeln!(out, "debug-mode {}", self.debug_mode as i32);

        for pid in &self.children {
            let _ = writeln!(out, "child {pid}");
        }
        for (booster, invoker) in &self.invoker_pids {
            let _ = writeln!(out, "booster-invoker-pid {booster} {invoker}");
        }
        for (booster, fd) in &self.invoker_fds {
            let _ = writeln!(out, "booster-invoker-fd {booster} {fd}");
        }

        let _ = writeln!(out, "booster-pid {}", self.booster_pid);
        let _ = writeln!(
            out,
            "launcher-socket {} {}",
            self.launcher_socket.0, self.launcher_socket.1
        );
        let _ = writeln!(out, "sigpipe-fd {} {}", self.sigpipe_fd.0, self.sigpipe_fd.1);
        let _ = writeln!(out, "boot-mode {}", self.boot_mode as i32);

        for (booster_type, fd) in &self.socket_map {
            let _ = writeln!(out, "socket-hash {booster_type} {fd}");
        }

        // The trailer is how the reader knows the writer got this far.
        out.push_str("end\n");
        out
    }

    /// Parse a state file. The `my-pid` record must come first and `end`
    /// must be present; anything else is treated as corruption and refused,
    /// so a restore is all-or-nothing.
    pub fn parse(input: &str) -> Result<SavedState> {
        let mut tokens = input.split_whitespace();
        let mut state = SavedState::default();

        match tokens.next() {
            Some("my-pid") => state.my_pid = next_int(&mut tokens, "my-pid")?,
            Some(other) => bail!("state file starts with '{other}', expected 'my-pid'"),
            None => bail!("state file is empty"),
        }

        loop {
            let Some(token) = tokens.next() else {
                bail!("state file ended before 'end' record");
            };

            match token {
                "end" => return Ok(state),
                "debug-mode" => state.debug_mode = next_int(&mut tokens, token)? != 0,
                "boot-mode" => state.boot_mode = next_int(&mut tokens, token)? != 0,
                "child" => state.children.push(next_int(&mut tokens, token)?),
                "booster-invoker-pid" => {
                    let booster = next_int(&mut tokens, token)?;
                    let invoker = next_int(&mut tokens, token)?;
                    state.invoker_pids.insert(booster, invoker);
                }
                "booster-invoker-fd" => {
                    let booster = next_int(&mut tokens, token)?;
                    let fd = next_int(&mut tokens, token)?;
                    state.invoker_fds.insert(booster, fd);
                }
                "booster-pid" => state.booster_pid = next_int(&mut tokens, token)?,
                "launcher-socket" => {
                    state.launcher_socket = (
                        next_int(&mut tokens, token)?,
                        next_int(&mut tokens, token)?,
                    );
                }
                "sigpipe-fd" => {
                    state.sigpipe_fd = (
                        next_int(&mut tokens, token)?,
                        next_int(&mut tokens, token)?,
                    );
                }
                "socket-hash" => {
                    let Some(booster_type) = tokens.next() else {
                        bail!("socket-hash record is missing the booster type");
                    };
                    let fd = next_int(&mut tokens, token)?;
                    state.socket_map.insert(booster_type.to_string(), fd);
                }
                other => bail!("unknown token '{other}' in state file"),
            }
        }
    }

    /// Write the state file in one pass, flushed before returning.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let mut file = std::fs::File::create(path)
            .with_context(|| format!("creating state file {}", path.display()))?;
        file.write_all(self.serialize().as_bytes())
            .with_context(|| format!("writing state file {}", path.display()))?;
        file.flush()
            .with_context(|| format!("flushing state file {}", path.display()))?;
        Ok(())
    }

    pub fn load_from(path: &Path) -> Result<SavedState> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading state file {}", path.display()))?;
        Self::parse(&content)
    }
}

fn next_int<'a>(tokens: &mut impl Iterator<Item = &'a str>, record: &str) -> Result<i32> {
    let Some(token) = tokens.next() else {
        bail!("'{record}' record is missing an argument");
    };
    token
        .parse()
        .with_context(|| format!("'{record}' record has non-numeric argument '{token}'"))
}

pub fn state_dir() -> PathBuf {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(runtime_dir).join("launcherd")
}

pub fn state_file() -> PathBuf {
    state_dir().join("saved-state")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SavedState {
        SavedState {
            my_pid: 4321,
            debug_mode: true,
            children: vec![10, 11],
            invoker_pids: HashMap::from([(11, 2000)]),
            invoker_fds: HashMap::from([(11, 7)]),
            booster_pid: 11,
            launcher_socket: (3, 4),
            sigpipe_fd: (5, 6),
            boot_mode: false,
            socket_map: HashMap::from([("app".to_string(), 8)]),
        }
    }

    #[test]
    fn round_trip_is_structural_identity() {
        let state = sample();
        let parsed = SavedState::parse(&state.serialize()).unwrap();
        assert_eq!(parsed, state);
    }

    #[test]
    fn record_order_between_header_and_trailer_is_free() {
        let text = "my-pid 77\n\
                    boot-mode 1\n\
                    socket-hash app 9\n\
                    child 5\n\
                    booster-invoker-fd 5 12\n\
                    sigpipe-fd 3 4\n\
                    launcher-socket 1 2\n\
                    booster-invoker-pid 5 900\n\
                    booster-pid 5\n\
                    debug-mode 0\n\
                    end\n";

        let state = SavedState::parse(text).unwrap();
        assert_eq!(state.my_pid, 77);
        assert!(state.boot_mode);
        assert!(!state.debug_mode);
        assert_eq!(state.children, vec![5]);
        assert_eq!(state.invoker_pids.get(&5), Some(&900));
        assert_eq!(state.invoker_fds.get(&5), Some(&12));
        assert_eq!(state.booster_pid, 5);
        assert_eq!(state.launcher_socket, (1, 2));
        assert_eq!(state.sigpipe_fd, (3, 4));
        assert_eq!(state.socket_map.get("app"), Some(&9));
    }

    #[test]
    fn missing_end_is_corrupt() {
        let mut text = sample().serialize();
        text.truncate(text.len() - "end\n".len());
        assert!(SavedState::parse(&text).is_err());
    }

    #[test]
    fn missing_pid_header_is_corrupt() {
        assert!(SavedState::parse("boot-mode 1\nend\n").is_err());
        assert!(SavedState::parse("").is_err());
    }

    #[test]
    fn unknown_token_is_corrupt() {
        assert!(SavedState::parse("my-pid 1\nfuture-record 3\nend\n").is_err());
    }

    #[test]
    fn truncated_record_is_corrupt() {
        assert!(SavedState::parse("my-pid 1\nlauncher-socket 3\n").is_err());
        assert!(SavedState::parse("my-pid 1\nchild x\nend\n").is_err());
    }

    #[test]
    fn save_and_load_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saved-state");

        let state = sample();
        state.save_to(&path).unwrap();
        assert_eq!(SavedState::load_from(&path).unwrap(), state);
    }
}
