//! Session lifecycle types

use serde::{Deserialize, Serialize};

/// Lifecycle of one SSH session.
///
/// `Connecting` covers the dial and authentication, `Ready` the steady
/// state, `Closing` the transient path out of it. `Closed` is terminal;
/// reconnection creates a new session rather than reviving this one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Ready,
    Closing,
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Explicit stop through the registry. Never triggers reconnection.
    Shutdown,
    /// The transport dropped out from under us.
    RemoteClosed,
    /// Keepalive probes went unanswered.
    KeepaliveFailed,
}

/// Emitted by session monitor tasks toward the registry event loop.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Closed {
        session_id: String,
        reason: CloseReason,
    },
}
