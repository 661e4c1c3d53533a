//! Session lifecycle: connect, monitor, close, reconnect policy.

mod reconnect;
#[allow(clippy::module_inception)]
mod session;
mod types;

pub use reconnect::ReconnectPolicy;
pub use session::TunnelSession;
pub use types::{CloseReason, SessionEvent, SessionState};
