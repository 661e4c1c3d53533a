//! Handle owner task
//!
//! Exactly one spawned task owns the russh `Handle`; every other component
//! talks to it through a cloneable [`HandleController`] over an mpsc
//! command channel. This avoids `Arc<Mutex<Handle>>` contention, locks
//! held across `.await`, and concurrent Handle access.
//!
//! On shutdown the task broadcasts a disconnect notification (port
//! forwards select on it), drains pending commands with a disconnect
//! error, then closes the SSH transport.

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use crate::error::TunnelError;

/// Keepalive probe result, distinguishing soft from hard failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    Ok,
    /// Probe deadline passed. Possibly transient, worth retrying.
    Timeout,
    /// Transport error. The connection is gone.
    IoError,
}

/// Commands sent to the handle owner task
pub enum HandleCommand {
    /// Open a direct-tcpip channel (one per proxied local connection)
    OpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Probe the transport with an SSH keepalive
    Ping {
        reply_tx: oneshot::Sender<PingResult>,
    },

    /// Close the SSH connection
    Disconnect,
}

/// Cheap-to-clone command sender for the handle owner task. Anything
/// holding one can open channels or disconnect the session, so it stays
/// inside the crate's own plumbing.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    /// Fired once when the owner task shuts down. Port forwards select on
    /// a subscription to end their pipes.
    disconnect_tx: broadcast::Sender<()>,
}

impl HandleController {
    /// Build a controller around a bare command channel. Production code
    /// goes through [`spawn_handle_owner_task`]; this exists for tests.
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        let (disconnect_tx, _) = broadcast::channel(1);
        Self {
            cmd_tx,
            disconnect_tx,
        }
    }

    /// Subscribe to the shutdown notification.
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    /// Open a direct-tcpip channel to `host:port`, reporting the local
    /// originator endpoint to the server.
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, TunnelError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::OpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| TunnelError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| TunnelError::Disconnected)?
            .map_err(|e| TunnelError::ChannelOpen(e.to_string()))
    }

    /// Probe the connection; resolves to `IoError` when the owner task is
    /// already gone.
    pub async fn ping(&self) -> PingResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(HandleCommand::Ping { reply_tx })
            .await
            .is_err()
        {
            return PingResult::IoError;
        }
        reply_rx.await.unwrap_or(PingResult::IoError)
    }

    /// Ask the owner task to close the SSH connection.
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Whether the owner task is still running.
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }

    /// Fire the shutdown notification the way the owner task does during
    /// cleanup. Lets tests drive teardown without a real connection.
    #[cfg(test)]
    pub(crate) fn fire_disconnect(&self) {
        let _ = self.disconnect_tx.send(());
    }
}

/// Spawn the handle owner task, transferring ownership of the Handle.
pub fn spawn_handle_owner_task(
    handle: Handle<ClientHandler>,
    session_id: String,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);
    let disconnect_tx_clone = disconnect_tx.clone();

    tokio::spawn(async move {
        let mut handle = handle;

        info!("Handle owner task started for session {}", session_id);

        loop {
            match cmd_rx.recv().await {
                Some(HandleCommand::OpenDirectTcpip {
                    host,
                    port,
                    originator_host,
                    originator_port,
                    reply_tx,
                }) => {
                    let result = handle
                        .channel_open_direct_tcpip(&host, port, &originator_host, originator_port)
                        .await;
                    if reply_tx.send(result).is_err() {
                        // 调用方已放弃；Channel 随之 drop，服务端会关闭它
                        warn!("Caller dropped before receiving direct-tcpip result");
                    }
                }

                Some(HandleCommand::Ping { reply_tx }) => {
                    debug!("Keepalive probe for session {}", session_id);
                    let result = match tokio::time::timeout(
                        std::time::Duration::from_secs(5),
                        handle.send_keepalive(true),
                    )
                    .await
                    {
                        Ok(Ok(())) => PingResult::Ok,
                        Ok(Err(e)) => match e {
                            russh::Error::Disconnect | russh::Error::IO(_) => {
                                warn!("Keepalive transport failure for session {}: {}", session_id, e);
                                PingResult::IoError
                            }
                            other => {
                                warn!(
                                    "Keepalive soft failure for session {}: {}",
                                    session_id, other
                                );
                                PingResult::Timeout
                            }
                        },
                        Err(_) => {
                            warn!("Keepalive timeout for session {} (5s)", session_id);
                            PingResult::Timeout
                        }
                    };
                    let _ = reply_tx.send(result);
                }

                Some(HandleCommand::Disconnect) => {
                    info!("Disconnect requested for session {}", session_id);
                    break;
                }

                None => {
                    info!("All controllers dropped for session {}", session_id);
                    break;
                }
            }
        }

        // Cleanup: notify subscribers first so pipes end before the
        // transport goes away underneath them.
        let _ = disconnect_tx_clone.send(());

        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        info!("Handle owner task terminated for session {}", session_id);
    });

    HandleController {
        cmd_tx,
        disconnect_tx,
    }
}

/// Drain queued commands, answering each with a disconnect error.
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::OpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Ping { reply_tx } => {
                let _ = reply_tx.send(PingResult::IoError);
            }
            HandleCommand::Disconnect => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_controller_reports_closed_task() {
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let controller = HandleController::new(cmd_tx);

        assert!(controller.is_connected());
        drop(cmd_rx);
        assert!(!controller.is_connected());

        assert_eq!(controller.ping().await, PingResult::IoError);

        let err = controller
            .open_direct_tcpip("127.0.0.1", 80, "127.0.0.1", 5000)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Disconnected));
    }

    #[tokio::test]
    async fn test_controller_ping_roundtrip() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(4);
        let controller = HandleController::new(cmd_tx);

        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                if let HandleCommand::Ping { reply_tx } = cmd {
                    let _ = reply_tx.send(PingResult::Ok);
                }
            }
        });

        assert_eq!(controller.ping().await, PingResult::Ok);
    }

    #[tokio::test]
    async fn test_drain_answers_pending_opens() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(4);
        let (reply_tx, reply_rx) = oneshot::channel();

        cmd_tx
            .send(HandleCommand::OpenDirectTcpip {
                host: "127.0.0.1".into(),
                port: 80,
                originator_host: "127.0.0.1".into(),
                originator_port: 5000,
                reply_tx,
            })
            .await
            .unwrap();

        drain_pending_commands(&mut cmd_rx);

        let reply = reply_rx.await.unwrap();
        assert!(matches!(reply, Err(russh::Error::Disconnect)));
    }
}
