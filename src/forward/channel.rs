//! Forward channel seam
//!
//! [`ChannelOpener`] is the session surface a port forward depends on:
//! open one proxied byte stream, and hand out the disconnect broadcast
//! used for forcible teardown. Production sessions implement it with the
//! handle owner controller; tests substitute a plain TCP connector so the
//! proxy path runs without an SSH server.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::broadcast;

use crate::error::TunnelError;
use crate::ssh::HandleController;

/// Duplex byte stream suitable for boxing behind the seam.
pub trait ProxyStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ProxyStream for T {}

/// One proxied byte stream over an established session. Ephemeral: lives
/// exactly as long as its accepted local socket.
pub struct ForwardChannel {
    stream: Box<dyn ProxyStream>,
}

impl ForwardChannel {
    pub fn new(stream: impl ProxyStream + 'static) -> Self {
        Self {
            stream: Box::new(stream),
        }
    }

    /// Split into read/write halves for full-duplex piping.
    pub fn into_split(
        self,
    ) -> (
        ReadHalf<Box<dyn ProxyStream>>,
        WriteHalf<Box<dyn ProxyStream>>,
    ) {
        tokio::io::split(self.stream)
    }
}

/// What a port forward needs from its owning session.
#[async_trait]
pub trait ChannelOpener: Send + Sync {
    /// Open a proxied stream to `remote_addr:remote_port`, reporting
    /// `local_addr:local_port` as the originator endpoint.
    async fn open_forward_channel(
        &self,
        local_addr: &str,
        local_port: u16,
        remote_addr: &str,
        remote_port: u16,
    ) -> Result<ForwardChannel, TunnelError>;

    /// Fires once when the owning session goes away.
    fn subscribe_disconnect(&self) -> broadcast::Receiver<()>;
}

#[async_trait]
impl ChannelOpener for HandleController {
    async fn open_forward_channel(
        &self,
        local_addr: &str,
        local_port: u16,
        remote_addr: &str,
        remote_port: u16,
    ) -> Result<ForwardChannel, TunnelError> {
        let channel = self
            .open_direct_tcpip(
                remote_addr,
                remote_port as u32,
                local_addr,
                local_port as u32,
            )
            .await?;
        Ok(ForwardChannel::new(channel.into_stream()))
    }

    fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        HandleController::subscribe_disconnect(self)
    }
}
