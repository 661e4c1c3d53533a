//! Local port forwarding
//!
//! One [`PortForward`] binds a local listener and proxies every accepted
//! connection through a forward channel opened on its session. The accept
//! loop runs until asked to stop or until the session's disconnect
//! broadcast fires; a graceful stop only closes the listener and lets
//! connections already piped drain on their own.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::channel::ChannelOpener;
use crate::error::TunnelError;
use crate::probe;
use crate::profile::TunnelSpec;

/// Pipe buffer size per direction.
const PIPE_BUF_SIZE: usize = 32768;

/// Rounds of probe-then-bind before giving up on a busy port. A probed
/// port can be taken by someone else before we bind it, so one round is
/// not enough.
const REBIND_ROUNDS: usize = 4;

/// Traffic counters for one tunnel, updated live by the pipe tasks.
#[derive(Debug, Default)]
pub struct ForwardStats {
    /// Local client to remote service.
    bytes_sent: AtomicU64,
    /// Remote service back to local client.
    bytes_received: AtomicU64,
    connections: AtomicU64,
    active_connections: AtomicU64,
    /// Set on the first proxied byte and never cleared.
    saw_traffic: AtomicBool,
}

impl ForwardStats {
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Both directions summed.
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_sent() + self.bytes_received()
    }

    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// A tunnel is idle until the first byte moves through it, then
    /// counts as active for the rest of its life.
    pub fn is_active(&self) -> bool {
        self.saw_traffic.load(Ordering::Relaxed)
    }

    fn add_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
        self.saw_traffic.store(true, Ordering::Relaxed);
    }

    fn add_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
        self.saw_traffic.store(true, Ordering::Relaxed);
    }

    fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

enum PipeDirection {
    Send,
    Receive,
}

/// A running local forward. Dropping the handle does not stop the accept
/// loop; call [`PortForward::stop`] or let the session teardown broadcast
/// end it.
pub struct PortForward {
    spec: TunnelSpec,
    bound_addr: SocketAddr,
    running: Arc<AtomicBool>,
    stop_tx: mpsc::Sender<()>,
    stats: Arc<ForwardStats>,
}

impl PortForward {
    /// Bind a local listener for `spec` and start proxying through
    /// `opener`. If the requested port is taken, nearby higher ports are
    /// probed and the forward comes up on the first free one.
    pub async fn start(
        opener: Arc<dyn ChannelOpener>,
        spec: TunnelSpec,
        session_id: &str,
    ) -> Result<Self, TunnelError> {
        let listener = bind_with_reprobe(spec.requested_local_port).await?;
        let bound_addr = listener.local_addr()?;
        if spec.requested_local_port != 0 && bound_addr.port() != spec.requested_local_port {
            info!(
                session = %session_id,
                service = %spec.name,
                requested = spec.requested_local_port,
                bound = bound_addr.port(),
                "Requested local port busy, rebound to a nearby port"
            );
        }

        let running = Arc::new(AtomicBool::new(true));
        let (stop_tx, stop_rx) = mpsc::channel::<()>(1);
        let stats = Arc::new(ForwardStats::default());

        info!(
            session = %session_id,
            service = %spec.name,
            local = %bound_addr,
            remote_port = spec.remote_port,
            "Port forward listening"
        );

        tokio::spawn(accept_loop(
            listener,
            opener,
            spec.clone(),
            running.clone(),
            stop_rx,
            stats.clone(),
        ));

        Ok(Self {
            spec,
            bound_addr,
            running,
            stop_tx,
            stats,
        })
    }

    pub fn spec(&self) -> &TunnelSpec {
        &self.spec
    }

    /// The port actually bound, which may differ from the requested one.
    pub fn bound_port(&self) -> u16 {
        self.bound_addr.port()
    }

    pub fn bound_addr(&self) -> SocketAddr {
        self.bound_addr
    }

    pub fn stats(&self) -> Arc<ForwardStats> {
        self.stats.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop accepting new connections. Connections already piped keep
    /// draining until both ends close them.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(service = %self.spec.name, local = %self.bound_addr, "Stopping port forward");
        let _ = self.stop_tx.send(()).await;
    }
}

/// Bind the requested port, probing upward on conflict. Probing and
/// binding race against other processes, so the whole sequence retries a
/// few times before reporting the conflict.
async fn bind_with_reprobe(requested: u16) -> Result<TcpListener, TunnelError> {
    let mut port = requested;
    for _ in 0..REBIND_ROUNDS {
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                debug!(port, "Local port in use, probing for a free one");
                let next = port
                    .checked_add(1)
                    .ok_or(TunnelError::PortConflict(requested))?;
                port = probe::find_available(next)
                    .await
                    .ok_or(TunnelError::PortConflict(requested))?;
            }
            Err(e) => {
                if e.kind() == ErrorKind::PermissionDenied && port < 1024 {
                    warn!(port, "Binding ports below 1024 requires elevated privileges");
                }
                return Err(TunnelError::Io(e));
            }
        }
    }
    Err(TunnelError::PortConflict(requested))
}

async fn accept_loop(
    listener: TcpListener,
    opener: Arc<dyn ChannelOpener>,
    spec: TunnelSpec,
    running: Arc<AtomicBool>,
    mut stop_rx: mpsc::Receiver<()>,
    stats: Arc<ForwardStats>,
) {
    let bound_port = listener.local_addr().map(|a| a.port()).unwrap_or(0);
    let mut disconnect_rx = opener.subscribe_disconnect();

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                info!(service = %spec.name, port = bound_port, "Port forward stopped by request");
                break;
            }
            _ = disconnect_rx.recv() => {
                info!(service = %spec.name, port = bound_port, "Port forward stopped: session disconnected");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer)) => {
                        debug!(service = %spec.name, %peer, "Accepted forward connection");
                        if let Err(e) = socket.set_nodelay(true) {
                            warn!("Failed to set TCP_NODELAY: {}", e);
                        }
                        stats.connection_opened();
                        let opener = opener.clone();
                        let stats = stats.clone();
                        let spec = spec.clone();
                        tokio::spawn(async move {
                            if let Err(e) =
                                handle_connection(opener, socket, bound_port, &spec, &stats).await
                            {
                                warn!(
                                    service = %spec.name,
                                    remote_port = spec.remote_port,
                                    "Forward connection failed: {}",
                                    e
                                );
                            }
                            stats.connection_closed();
                        });
                    }
                    Err(e) => {
                        error!(service = %spec.name, "Accept failed: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    running.store(false, Ordering::SeqCst);
    debug!(service = %spec.name, port = bound_port, "Accept loop exited");
}

/// Proxy one accepted socket through a freshly opened forward channel.
/// Failure to open the channel closes only this socket; the listener
/// keeps accepting.
async fn handle_connection(
    opener: Arc<dyn ChannelOpener>,
    socket: TcpStream,
    bound_port: u16,
    spec: &TunnelSpec,
    stats: &ForwardStats,
) -> Result<(), TunnelError> {
    let channel = opener
        .open_forward_channel("127.0.0.1", bound_port, "127.0.0.1", spec.remote_port)
        .await?;
    debug!(service = %spec.name, remote_port = spec.remote_port, "Forward channel opened");

    let mut disconnect_rx = opener.subscribe_disconnect();
    let (mut socket_read, mut socket_write) = socket.into_split();
    let (mut channel_read, mut channel_write) = channel.into_split();

    let outbound = pump(
        &mut socket_read,
        &mut channel_write,
        stats,
        PipeDirection::Send,
    );
    let inbound = pump(
        &mut channel_read,
        &mut socket_write,
        stats,
        PipeDirection::Receive,
    );

    tokio::select! {
        _ = async { tokio::join!(outbound, inbound) } => {
            debug!(service = %spec.name, "Forward connection closed");
        }
        _ = disconnect_rx.recv() => {
            debug!(service = %spec.name, "Forward connection cut: session disconnected");
        }
    }

    Ok(())
}

/// Copy bytes one way until EOF or error, counting as we go. EOF is
/// propagated as a write-side shutdown so half-closed flows still drain.
async fn pump<R, W>(reader: &mut R, writer: &mut W, stats: &ForwardStats, direction: PipeDirection)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PIPE_BUF_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if writer.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                match direction {
                    PipeDirection::Send => stats.add_sent(n as u64),
                    PipeDirection::Receive => stats.add_received(n as u64),
                }
            }
            Err(_) => break,
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::channel::ForwardChannel;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::broadcast;

    /// Opens channels as plain TCP connections to the requested remote
    /// port on loopback.
    struct TcpOpener {
        disconnect_tx: broadcast::Sender<()>,
    }

    impl TcpOpener {
        fn new() -> Self {
            let (disconnect_tx, _) = broadcast::channel(4);
            Self { disconnect_tx }
        }
    }

    #[async_trait]
    impl ChannelOpener for TcpOpener {
        async fn open_forward_channel(
            &self,
            _local_addr: &str,
            _local_port: u16,
            remote_addr: &str,
            remote_port: u16,
        ) -> Result<ForwardChannel, TunnelError> {
            let stream = TcpStream::connect((remote_addr, remote_port))
                .await
                .map_err(|e| TunnelError::ChannelOpen(e.to_string()))?;
            Ok(ForwardChannel::new(stream))
        }

        fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
            self.disconnect_tx.subscribe()
        }
    }

    async fn spawn_echo_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let (mut r, mut w) = socket.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        port
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 1s");
    }

    fn spec_for(remote_port: u16, local_port: u16) -> TunnelSpec {
        TunnelSpec::new("echo", remote_port, local_port)
    }

    #[tokio::test]
    async fn proxies_bytes_and_tracks_stats() {
        let echo_port = spawn_echo_server().await;
        let opener = Arc::new(TcpOpener::new());
        let forward = PortForward::start(opener, spec_for(echo_port, 0), "s1")
            .await
            .unwrap();

        assert!(!forward.stats().is_active());

        let mut client = TcpStream::connect(("127.0.0.1", forward.bound_port()))
            .await
            .unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        let stats = forward.stats();
        wait_until(|| stats.bytes_transferred() >= 10).await;
        assert!(stats.bytes_sent() >= 5);
        assert!(stats.bytes_received() >= 5);
        assert_eq!(stats.connections(), 1);
        assert!(stats.is_active());
    }

    #[tokio::test]
    async fn busy_port_rebinds_to_higher_one() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken_port = taken.local_addr().unwrap().port();

        let echo_port = spawn_echo_server().await;
        let opener = Arc::new(TcpOpener::new());
        let forward = PortForward::start(opener, spec_for(echo_port, taken_port), "s1")
            .await
            .unwrap();

        assert_ne!(forward.bound_port(), taken_port);
        assert!(forward.bound_port() > taken_port);
        assert_eq!(forward.spec().requested_local_port, taken_port);
    }

    #[tokio::test]
    async fn channel_open_failure_keeps_listener_alive() {
        // Reserve a port and free it again so connects to it are refused.
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = dead.local_addr().unwrap().port();
        drop(dead);

        let opener = Arc::new(TcpOpener::new());
        let forward = PortForward::start(opener, spec_for(dead_port, 0), "s1")
            .await
            .unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", forward.bound_port()))
            .await
            .unwrap();
        let mut buf = [0u8; 8];
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0, "socket should be closed after channel open failure");

        assert!(forward.is_running());
        // The listener still accepts; the next connection gets the same
        // treatment instead of a refused connect.
        let mut second = TcpStream::connect(("127.0.0.1", forward.bound_port()))
            .await
            .unwrap();
        let n = second.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
        assert!(forward.is_running());
    }

    #[tokio::test]
    async fn graceful_stop_drains_existing_connections() {
        let echo_port = spawn_echo_server().await;
        let opener = Arc::new(TcpOpener::new());
        let forward = PortForward::start(opener, spec_for(echo_port, 0), "s1")
            .await
            .unwrap();
        let bound = forward.bound_port();

        let mut client = TcpStream::connect(("127.0.0.1", bound)).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();

        forward.stop().await;
        let running = forward.running.clone();
        wait_until(move || !running.load(Ordering::SeqCst)).await;

        // New connections are refused or immediately closed, but the
        // existing pipe keeps flowing.
        if let Ok(mut late) = TcpStream::connect(("127.0.0.1", bound)).await {
            let n = late.read(&mut buf).await.unwrap_or(0);
            assert_eq!(n, 0);
        }

        client.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn disconnect_broadcast_cuts_live_pipes() {
        let echo_port = spawn_echo_server().await;
        let opener = Arc::new(TcpOpener::new());
        let forward = PortForward::start(opener.clone(), spec_for(echo_port, 0), "s1")
            .await
            .unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", forward.bound_port()))
            .await
            .unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();

        opener.disconnect_tx.send(()).unwrap();

        let running = forward.running.clone();
        wait_until(move || !running.load(Ordering::SeqCst)).await;
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("pipe should be cut promptly")
            .unwrap_or(0);
        assert_eq!(n, 0, "live pipe should be cut by the disconnect broadcast");
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let echo_port = spawn_echo_server().await;
        let opener = Arc::new(TcpOpener::new());
        let forward = PortForward::start(opener, spec_for(echo_port, 0), "s1")
            .await
            .unwrap();
        forward.stop().await;
        forward.stop().await;
        assert!(!forward.is_running());
    }
}
