// Durable on-disk allocation state: a JSON document with three
// port-search cursors and a name -> Allocation map, persisted atomic
// from a reader's perspective via write-to-tmp-then-rename.
use crate::errors::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Width of the reserved WebRTC UDP range, in ports.
pub const WEBRTC_RANGE_SIZE: u16 = 101;

pub const DEFAULT_SERVER_PORT: u16 = 8081;
pub const DEFAULT_DEBUG_PORT: u16 = 9224;
pub const DEFAULT_WEBRTC_PORT: u16 = 52000;

/// A single container's port triple, keyed by `container_name` in
/// `State::allocations`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub server_port: u16,
    pub debug_port: u16,
    #[serde(rename = "webrtc_port_start")]
    pub webrtc_start: u16,
}

impl Allocation {
    /// The `[start, start+R)` interval this allocation reserves on UDP.
    pub fn webrtc_range(&self) -> (u16, u16) {
        (self.webrtc_start, self.webrtc_start + WEBRTC_RANGE_SIZE)
    }
}

/// The host-wide allocation document persisted at `NEKO_PORT_STATE_FILE`.
///
/// Unknown top-level keys are round-tripped through `extra` so a
/// forward-compatible reader never drops fields it doesn't understand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub next_server_port: u16,
    pub next_debug_port: u16,
    pub next_webrtc_port: u16,
    pub allocations: HashMap<String, Allocation>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for State {
    fn default() -> Self {
        // Deep copy / fresh construction only — never aliased, so
        // callers mutating a returned default can't pollute a shared
        // instance.
        Self {
            next_server_port: DEFAULT_SERVER_PORT,
            next_debug_port: DEFAULT_DEBUG_PORT,
            next_webrtc_port: DEFAULT_WEBRTC_PORT,
            allocations: HashMap::new(),
            extra: serde_json::Map::new(),
        }
    }
}

impl State {
    /// Reset the three cursors to their defaults. This holds exactly
    /// when `allocations` is empty.
    pub fn reset_cursors(&mut self) {
        self.next_server_port = DEFAULT_SERVER_PORT;
        self.next_debug_port = DEFAULT_DEBUG_PORT;
        self.next_webrtc_port = DEFAULT_WEBRTC_PORT;
    }

    pub fn reset_cursors_if_empty(&mut self) {
        if self.allocations.is_empty() {
            self.reset_cursors();
        }
    }
}

/// Persists and retrieves the `State` document.
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current state. A missing or malformed file yields a
    /// fresh default `State` rather than raising — callers never have
    /// to special-case "first run".
    pub fn read(&self) -> State {
        match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => State::default(),
        }
    }

    /// Persist `state`, atomic from a concurrent reader's perspective:
    /// write to `path.tmp`, `fsync`, then `rename` over `path`. A
    /// reader sees either the previous or the new content in full,
    /// never a truncated file.
    pub fn write(&self, state: &State) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp_path = tmp_path_for(&self.path);
        let bytes = serde_json::to_vec_pretty(state)?;
        {
            let mut f = fs::File::create(&tmp_path)?;
            use std::io::Write;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}
