// TCP/UDP port-availability probing.
//
// Three primitives the allocator needs: a single-port TCP check, a
// whole-range UDP check, and two upward scans that skip ports already
// excluded. A TOCTOU window exists between a probe succeeding here and
// the container runtime actually binding the port later; the launcher
// compensates with retry, not this module.
use crate::state::WEBRTC_RANGE_SIZE;
use std::collections::HashSet;
use std::net::{TcpListener, UdpSocket};

const MAX_PORT: u32 = 65535;

/// `true` iff a TCP socket can bind `0.0.0.0:port` right now.
///
/// `std::net::TcpListener::bind` does not set `SO_REUSEADDR` on Unix
/// (unlike some other languages' default socket options), so a port
/// still in TIME-WAIT correctly reports as unavailable rather than
/// falsely free.
pub fn tcp_free(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}

/// `true` iff every port in `[start, start+size)` can bind a UDP socket
/// right now. The runtime publishes the whole range atomically, so
/// partial availability is treated as unavailable.
pub fn udp_range_free(start: u16, size: u16) -> bool {
    let end = match start.checked_add(size) {
        Some(e) => e,
        None => return false,
    };
    for port in start..end {
        match UdpSocket::bind(("0.0.0.0", port)) {
            Ok(_) => continue,
            Err(_) => return false,
        }
    }
    true
}

/// Scan upward from `start` for the first TCP port that is neither in
/// `excluded` nor reported busy by `tcp_free`. Returns `None` if the
/// scan passes 65535 (port exhaustion; the caller attaches the
/// container name to the resulting error).
pub fn find_free_tcp(start: u16, excluded: &HashSet<u16>) -> Option<u16> {
    let mut port = start as u32;
    while port <= MAX_PORT {
        let p = port as u16;
        if !excluded.contains(&p) && tcp_free(p) {
            return Some(p);
        }
        port += 1;
    }
    None
}

/// Scan upward in steps of `size` from `start` for the first UDP range
/// whose interval doesn't overlap any interval seeded from
/// `excluded_starts` and that binds cleanly end to end.
///
/// Two intervals `[a, a+size)` and `[b, b+size)` overlap iff
/// `a < b+size && b < a+size`.
pub fn find_free_udp_range(
    start: u16,
    excluded_starts: &HashSet<u16>,
    size: u16,
) -> Option<u16> {
    let mut candidate = start as u32;
    while candidate + size as u32 - 1 <= MAX_PORT {
        let a = candidate as u16;
        let overlaps = excluded_starts.iter().any(|&b| {
            let a32 = a as u32;
            let b32 = b as u32;
            let size32 = size as u32;
            a32 < b32 + size32 && b32 < a32 + size32
        });
        if !overlaps && udp_range_free(a, size) {
            return Some(a);
        }
        candidate += size as u32;
    }
    None
}

/// Convenience wrapper for the WebRTC-sized (§3, R=101) range scan.
pub fn find_free_webrtc_range(start: u16, excluded_starts: &HashSet<u16>) -> Option<u16> {
    find_free_udp_range(start, excluded_starts, WEBRTC_RANGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_free_reports_true_for_an_unused_high_port() {
        // Bind to port 0 to get a guaranteed-ephemeral free port first,
        // then release it and probe that exact number.
        let probe = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        assert!(tcp_free(port));
    }

    #[test]
    fn tcp_free_reports_false_while_a_listener_holds_the_port() {
        let listener = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!tcp_free(port));
    }

    #[test]
    fn find_free_tcp_skips_excluded_ports() {
        let mut excluded = HashSet::new();
        // Reserve a real port, then exclude the next one explicitly to
        // confirm find_free_tcp respects the exclusion set even when
        // that port is itself free.
        let reserved = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let base = reserved.local_addr().unwrap().port();
        drop(reserved);
        excluded.insert(base);
        let found = find_free_tcp(base, &excluded).unwrap();
        assert_ne!(found, base);
        assert!(found > base);
    }

    #[test]
    fn webrtc_ranges_detect_overlap_via_the_interval_formula() {
        let mut excluded = HashSet::new();
        excluded.insert(52000u16);
        // 52000..52101 is excluded; 52050 starts inside it and must be
        // skipped even though none of its individual ports are bound.
        let found = find_free_webrtc_range(52050, &excluded).unwrap();
        assert!(found >= 52101, "expected a start beyond the reserved range, got {found}");
    }

    #[test]
    fn udp_range_free_is_all_or_nothing() {
        // Binding the second port in the candidate range out from under
        // the probe should make the whole range report unavailable.
        let blocker = UdpSocket::bind(("0.0.0.0", 0)).unwrap();
        let blocked_port = blocker.local_addr().unwrap().port();
        let start = blocked_port.saturating_sub(1).max(1);
        assert!(!udp_range_free(start, 3));
    }
}
