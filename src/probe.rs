//! Local port probing
//!
//! Availability checks for local listener ports. A probe answer can go
//! stale between check and bind (TOCTOU), so callers treat a bind failure
//! on a "free" port as a signal to re-probe, never as fatal.

use tokio::net::TcpListener;

/// Upper bound on linear probing so a fully occupied range cannot loop
/// forever.
pub const MAX_PROBE_ATTEMPTS: u16 = 100;

/// Check whether a local TCP port is free: bind it on loopback, release
/// immediately.
pub async fn is_available(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).await.is_ok()
}

/// Find the next free port at or above `start`, probing linearly upward.
///
/// Bounded at [`MAX_PROBE_ATTEMPTS`] candidates and saturating at 65535;
/// `None` when every candidate is taken.
pub async fn find_available(start: u16) -> Option<u16> {
    let mut port = start;
    for _ in 0..MAX_PROBE_ATTEMPTS {
        if is_available(port).await {
            return Some(port);
        }
        if port == u16::MAX {
            return None;
        }
        port += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bound_port_is_not_available() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(!is_available(port).await);
        drop(listener);
    }

    #[tokio::test]
    async fn test_find_available_skips_bound_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let found = find_available(port).await.unwrap();
        assert!(found > port);
        assert!(is_available(found).await);
    }

    #[tokio::test]
    async fn test_find_available_returns_free_start() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert_eq!(find_available(port).await, Some(port));
    }
}
