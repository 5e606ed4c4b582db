// Port triple allocation under combined intra-/inter-process mutual
// exclusion.
use crate::docker::{DockerQuery, RunningNames};
use crate::errors::{NekoError, Result};
use crate::lock::Locks;
use crate::port_probe;
use crate::state::{Allocation, State, StateStore, WEBRTC_RANGE_SIZE};
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

fn name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*$").unwrap())
}

/// Fail fast on a container name that isn't a safe shell token, before
/// any side effect runs (defense against command injection into the
/// eventual `docker run --name <NAME>`).
pub fn validate_name(name: &str) -> Result<()> {
    if name_regex().is_match(name) {
        Ok(())
    } else {
        Err(NekoError::ValidationError(name.to_string()))
    }
}

/// Produces unique, free port triples for container names and
/// durably records them. Combines `StateStore`, `Locks` (the
/// intra-process mutex + cross-process `FileLock`), `DockerQuery`, and
/// `port_probe`.
pub struct Allocator {
    store: StateStore,
    locks: Locks,
    docker: DockerQuery,
}

impl Allocator {
    pub fn new(store: StateStore, locks: Locks, docker: DockerQuery) -> Self {
        Self {
            store,
            locks,
            docker,
        }
    }

    /// Allocate a fresh `(server_port, debug_port, webrtc_start)`
    /// triple for `name`, persisting it before returning.
    pub fn allocate(&self, name: &str) -> Result<(u16, u16, u16)> {
        validate_name(name)?;
        let _guard = self.locks.acquire()?;

        let mut state = self.store.read();

        reap_dead(&mut state, &self.docker);
        state.reset_cursors_if_empty();

        // The name itself may hold a stale allocation (its container
        // was running a moment ago and just vanished). Drop it inline
        // rather than recursing into `release` so we never re-enter
        // the already-held locks. Per the spec's step ordering, the
        // cursor reset is step 4, before this drop; it is not repeated
        // here even if this was the last surviving allocation.
        state.allocations.remove(name);

        let (server_excluded, debug_excluded, webrtc_excluded) = excluded_sets(&state);

        let server_port = port_probe::find_free_tcp(state.next_server_port, &server_excluded)
            .ok_or_else(|| NekoError::PortExhaustion {
                name: name.to_string(),
                kind: "tcp server",
            })?;
        let debug_port = port_probe::find_free_tcp(state.next_debug_port, &debug_excluded)
            .ok_or_else(|| NekoError::PortExhaustion {
                name: name.to_string(),
                kind: "tcp debug",
            })?;
        let webrtc_start =
            port_probe::find_free_webrtc_range(state.next_webrtc_port, &webrtc_excluded)
                .ok_or_else(|| NekoError::PortExhaustion {
                    name: name.to_string(),
                    kind: "udp webrtc",
                })?;

        state.allocations.insert(
            name.to_string(),
            Allocation {
                server_port,
                debug_port,
                webrtc_start,
            },
        );
        state.next_server_port = server_port + 1;
        state.next_debug_port = debug_port + 1;
        state.next_webrtc_port = webrtc_start + WEBRTC_RANGE_SIZE;

        self.store.write(&state)?;

        Ok((server_port, debug_port, webrtc_start))
    }

    /// Drop `name`'s allocation if present, reset cursors if the
    /// allocation set is now empty, and persist. Idempotent: releasing
    /// an unknown or already-released name is a no-op.
    pub fn release(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let _guard = self.locks.acquire()?;

        let mut state = self.store.read();
        if state.allocations.remove(name).is_some() {
            state.reset_cursors_if_empty();
            self.store.write(&state)?;
        }
        Ok(())
    }

    /// Current allocation for `name`, if any. Does not reap or mutate
    /// state.
    pub fn get(&self, name: &str) -> Result<Option<Allocation>> {
        validate_name(name)?;
        let _guard = self.locks.acquire()?;
        Ok(self.store.read().allocations.get(name).cloned())
    }
}

/// Remove every allocation whose container is no longer listed as
/// running. If the runtime is unreachable, skip reaping entirely —
/// preferring a stale allocation (ports held a little longer than
/// strictly necessary) over wrongly reclaiming ports out from under a
/// container that is, in fact, still alive.
fn reap_dead(state: &mut State, docker: &DockerQuery) {
    let running = match docker.running_names() {
        RunningNames::Known(names) => names,
        RunningNames::Unknown => return,
    };
    state
        .allocations
        .retain(|name, _| running.contains(name.as_str()));
}

/// Build the three excluded-port sets the port probe needs from every
/// surviving allocation. Exclusion is same-protocol only: TCP ports
/// are only excluded against other TCP ports, WebRTC ranges only
/// against other WebRTC ranges.
fn excluded_sets(state: &State) -> (HashSet<u16>, HashSet<u16>, HashSet<u16>) {
    let mut server = HashSet::new();
    let mut debug = HashSet::new();
    let mut webrtc = HashSet::new();
    for alloc in state.allocations.values() {
        server.insert(alloc.server_port);
        debug.insert(alloc.debug_port);
        webrtc.insert(alloc.webrtc_start);
    }
    (server, debug, webrtc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::Locks;
    use crate::state::StateStore;
    use tempfile::TempDir;

    fn new_allocator(dir: &TempDir) -> Allocator {
        let store = StateStore::new(dir.path().join("state.json"));
        let locks = Locks::new(dir.path().join("state.lock"));
        // Use a binary that will never be found, so `running_names`
        // always reports `Unknown` and reaping never fires unless a
        // test explicitly wants it to.
        let docker = DockerQuery::new("neko-launcher-test-no-such-binary");
        Allocator::new(store, locks, docker)
    }

    #[test]
    fn first_allocation_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let alloc = new_allocator(&dir);
        let triple = alloc.allocate("alpha").unwrap();
        assert_eq!(triple, (8081, 9224, 52000));
    }

    #[test]
    fn second_allocation_advances_cursors() {
        let dir = TempDir::new().unwrap();
        let alloc = new_allocator(&dir);
        alloc.allocate("alpha").unwrap();
        let triple = alloc.allocate("beta").unwrap();
        assert_eq!(triple, (8082, 9225, 52101));
    }

    #[test]
    fn release_of_one_of_two_does_not_reset_cursors() {
        let dir = TempDir::new().unwrap();
        let alloc = new_allocator(&dir);
        alloc.allocate("alpha").unwrap();
        alloc.allocate("beta").unwrap();
        alloc.release("alpha").unwrap();

        let store = StateStore::new(dir.path().join("state.json"));
        let state = store.read();
        assert!(!state.allocations.contains_key("alpha"));
        assert!(state.allocations.contains_key("beta"));
        assert_eq!(state.next_server_port, 8083);
        assert_eq!(state.next_debug_port, 9226);
        assert_eq!(state.next_webrtc_port, 52202);
    }

    #[test]
    fn release_of_last_allocation_resets_cursors() {
        let dir = TempDir::new().unwrap();
        let alloc = new_allocator(&dir);
        alloc.allocate("alpha").unwrap();
        alloc.allocate("beta").unwrap();
        alloc.release("alpha").unwrap();
        alloc.release("beta").unwrap();

        let store = StateStore::new(dir.path().join("state.json"));
        let state = store.read();
        assert!(state.allocations.is_empty());
        assert_eq!(state.next_server_port, 8081);
        assert_eq!(state.next_debug_port, 9224);
        assert_eq!(state.next_webrtc_port, 52000);
    }

    #[test]
    fn invalid_name_is_rejected_without_mutation() {
        let dir = TempDir::new().unwrap();
        let alloc = new_allocator(&dir);
        let err = alloc.allocate("bad;rm -rf /").unwrap_err();
        assert!(matches!(err, NekoError::ValidationError(_)));

        let store = StateStore::new(dir.path().join("state.json"));
        assert!(!dir.path().join("state.json").exists(), "no file should be created");
        let _ = store; // silence unused warning when path assertion above is sufficient
    }

    #[test]
    fn release_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let alloc = new_allocator(&dir);
        alloc.allocate("alpha").unwrap();
        alloc.release("alpha").unwrap();
        alloc.release("alpha").unwrap();
        alloc.release("never-allocated").unwrap();
    }

    #[test]
    fn reuse_of_a_name_reclaims_its_own_stale_allocation() {
        let dir = TempDir::new().unwrap();
        let alloc = new_allocator(&dir);
        let first = alloc.allocate("alpha").unwrap();
        assert_eq!(first, (8081, 9224, 52000));
        // Re-allocating the same name without releasing first should
        // still succeed (the stale entry for "alpha" itself is dropped
        // inline) and hand back a fresh triple. The cursors are not
        // reset just because dropping the stale entry emptied the map
        // (that reset only happens in step 4, before this drop), so the
        // second triple is the next one in sequence, not a repeat.
        let second = alloc.allocate("alpha").unwrap();
        assert_eq!(second, (8082, 9225, 52101));
        assert_ne!(first, second);
    }

    #[test]
    fn ports_and_ranges_stay_unique_over_many_allocations() {
        let dir = TempDir::new().unwrap();
        let alloc = new_allocator(&dir);
        let mut triples = Vec::new();
        for i in 0..20 {
            triples.push(alloc.allocate(&format!("c{i}")).unwrap());
        }
        let mut server_ports: Vec<u16> = triples.iter().map(|t| t.0).collect();
        let mut debug_ports: Vec<u16> = triples.iter().map(|t| t.1).collect();
        server_ports.sort_unstable();
        debug_ports.sort_unstable();
        server_ports.dedup();
        debug_ports.dedup();
        assert_eq!(server_ports.len(), 20);
        assert_eq!(debug_ports.len(), 20);

        let mut webrtc_starts: Vec<u16> = triples.iter().map(|t| t.2).collect();
        webrtc_starts.sort_unstable();
        for w in webrtc_starts.windows(2) {
            assert!(w[1] - w[0] >= WEBRTC_RANGE_SIZE, "webrtc ranges must not overlap");
        }
    }
}
