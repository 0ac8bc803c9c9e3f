// ABOUTME: Single-instance plugin loading for the launcher daemon.
// ABOUTME: dlopens the shared object and validates its exported entry points.

use std::ffi::{CStr, CString};

use tracing::{debug, warn};

type LockFn = unsafe extern "C" fn(*const libc::c_char) -> libc::c_int;
type ActivateFn = unsafe extern "C" fn(*const libc::c_char) -> libc::c_int;

const LOCK_SYMBOL: &[u8] = b"single_instance_lock\0";
const UNLOCK_SYMBOL: &[u8] = b"single_instance_unlock\0";
const ACTIVATE_SYMBOL: &[u8] = b"single_instance_activate\0";

/// Entry points exported by a valid single-instance plugin. Boosters use
/// these to refuse a second launch of an application and to raise the
/// window of the instance that is already running. The unlock entry point
/// belongs to the invoker process; the daemon only validates its presence.
pub struct PluginEntry {
    pub lock: LockFn,
    pub activate_existing: ActivateFn,
}

/// Holder for the dynamically loaded single-instance plugin. A missing or
/// invalid plugin is not fatal: single-instance semantics on the invoker
/// side simply degrade.
pub struct SingleInstance {
    entry: Option<PluginEntry>,
}

impl SingleInstance {
    pub fn new() -> Self {
        Self { entry: None }
    }

    /// Load and validate the plugin. Uses immediate symbol resolution so a
    /// broken plugin fails here rather than mid-launch.
    pub fn load(&mut self, path: &str) {
        let Ok(c_path) = CString::new(path) else {
            warn!(path, "single-instance plugin path contains a NUL byte");
            return;
        };

        // SAFETY: c_path is a valid NUL-terminated string.
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW) };
        if handle.is_null() {
            warn!(
                path,
                error = dl_error().as_deref().unwrap_or("unknown"),
                "dlopening single-instance plugin failed"
            );
            return;
        }

        // SAFETY: handle is a live dlopen handle.
        match unsafe { validate(handle) } {
            Some(entry) => {
                debug!(path, "single-instance plugin loaded");
                self.entry = Some(entry);
            }
            None => warn!(path, "invalid single-instance plugin"),
        }
    }

    pub fn entry(&self) -> Option<&PluginEntry> {
        self.entry.as_ref()
    }

    pub fn is_loaded(&self) -> bool {
        self.entry.is_some()
    }
}

/// Resolve the required entry points; any missing symbol invalidates the
/// plugin as a whole.
unsafe fn validate(handle: *mut libc::c_void) -> Option<PluginEntry> {
    let lock = lookup(handle, LOCK_SYMBOL)?;
    lookup(handle, UNLOCK_SYMBOL)?;
    let activate_existing = lookup(handle, ACTIVATE_SYMBOL)?;

    Some(PluginEntry {
        // SAFETY: the symbols are exported with these exact C signatures;
        // that contract is the plugin ABI.
        lock: std::mem::transmute::<*mut libc::c_void, LockFn>(lock),
        activate_existing: std::mem::transmute::<*mut libc::c_void, ActivateFn>(activate_existing),
    })
}

unsafe fn lookup(handle: *mut libc::c_void, symbol: &[u8]) -> Option<*mut libc::c_void> {
    let addr = libc::dlsym(handle, symbol.as_ptr().cast());
    if addr.is_null() {
        None
    } else {
        Some(addr)
    }
}

fn dl_error() -> Option<String> {
    // SAFETY: dlerror returns NULL or a NUL-terminated static string.
    let err = unsafe { libc::dlerror() };
    if err.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(err) }.to_string_lossy().into_owned())
}
