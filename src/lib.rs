//! OxideTunnel - SSH tunnel session and port forwarding engine
//!
//! Keeps named local port forwards running over password-authenticated
//! SSH sessions: persisted server profiles with vault-encrypted
//! credentials, conflict-aware local binds, live traffic counters, and
//! optional auto-reconnect. Interactive surfaces (CLI, wizard) live in
//! their own crate and drive this one through [`TunnelRegistry`].

pub mod error;
pub mod forward;
pub mod probe;
pub mod profile;
pub mod registry;
pub mod session;
pub mod ssh;
pub mod vault;

pub use error::TunnelError;
pub use profile::{ProfileStore, ServerProfile, TunnelSpec};
pub use registry::{ConnectResult, TunnelOutcome, TunnelRegistry, TunnelState, TunnelStatus};
pub use session::{CloseReason, ReconnectPolicy, SessionEvent, SessionState, TunnelSession};
pub use ssh::ConnectParams;
pub use vault::{CredentialVault, DecryptOutcome};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
