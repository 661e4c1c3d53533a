//! Local port forwarding over an established session.

mod channel;
mod local;

pub use channel::{ChannelOpener, ForwardChannel, ProxyStream};
pub use local::{ForwardStats, PortForward};
