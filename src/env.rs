// Environment-variable collaborators: centralizes the two overridable
// paths so callers never have to hardcode `/tmp/...` themselves, and
// tests can substitute a temp directory by setting the var before
// constructing a StateStore.
use std::path::PathBuf;

pub const STATE_FILE_VAR: &str = "NEKO_PORT_STATE_FILE";
pub const LOCK_FILE_VAR: &str = "NEKO_PORT_LOCK_FILE";

pub fn default_state_file() -> PathBuf {
    std::env::var_os(STATE_FILE_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp/neko_port_state.json"))
}

pub fn default_lock_file() -> PathBuf {
    std::env::var_os(LOCK_FILE_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp/neko_port_state.lock"))
}
