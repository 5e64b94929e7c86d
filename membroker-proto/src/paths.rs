//! Socket path derivation, mirroring `sockaddr_un`'s fixed-size `sun_path`
//! buffer: paths longer than [`SUN_PATH_MAX`] are silently truncated by the
//! kernel at bind time, so this module truncates explicitly and lets callers
//! detect the resulting collision rather than discovering it at bind time.

use std::path::PathBuf;

/// Size of `sockaddr_un.sun_path` on Linux, including the NUL terminator
/// `snprintf` always accounts for.
pub const SUN_PATH_MAX: usize = 108;

const SOCKET_NAME: &str = "membroker";
const DEBUG_SOCKET_NAME: &str = "membroker.debug";
const RUNTIME_DIR_VAR: &str = "LXK_RUNTIME_DIR";

fn runtime_dir() -> String {
    std::env::var(RUNTIME_DIR_VAR).unwrap_or_else(|_| ".".to_owned())
}

fn truncated(path: String) -> String {
    // Reserve one byte for the NUL terminator, matching `snprintf`'s length
    // accounting against `sizeof(sun_path)`.
    let max = SUN_PATH_MAX.saturating_sub(1);
    if path.len() <= max {
        path
    } else {
        // Truncate on a char boundary; socket paths are expected to be
        // plain ASCII, but never split a multibyte sequence.
        let mut end = max;
        while !path.is_char_boundary(end) {
            end -= 1;
        }
        path[..end].to_owned()
    }
}

/// The control socket path: `${LXK_RUNTIME_DIR}/membroker`.
pub fn control_socket_path() -> PathBuf {
    PathBuf::from(truncated(format!("{}/{}", runtime_dir(), SOCKET_NAME)))
}

/// The diagnostic dump socket path: `${LXK_RUNTIME_DIR}/membroker.debug`, or
/// `None` if path truncation would make it collide with the control socket.
pub fn debug_socket_path() -> Option<PathBuf> {
    let control = truncated(format!("{}/{}", runtime_dir(), SOCKET_NAME));
    let debug = truncated(format!("{}/{}", runtime_dir(), DEBUG_SOCKET_NAME));
    if debug == control {
        None
    } else {
        Some(PathBuf::from(debug))
    }
}
