//! One authenticated session and its monitor task
//!
//! A [`TunnelSession`] wraps the handle owner controller for a single
//! connection. Connecting returns a ready session or a classified error;
//! once ready, port forwards start through it independently. A spawned
//! monitor watches the transport with keepalive probes and reports the
//! close over the registry's event channel, tagged with why it happened.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{CloseReason, SessionEvent, SessionState};
use crate::error::TunnelError;
use crate::forward::{ChannelOpener, PortForward};
use crate::profile::TunnelSpec;
use crate::ssh::{
    connect_and_auth, spawn_handle_owner_task, ConnectParams, HandleController, PingResult,
};

/// Consecutive keepalive timeouts before the session is declared dead.
const KEEPALIVE_FAIL_THRESHOLD: u32 = 3;

/// An authenticated connection to one host, shared by all port forwards
/// started under it.
pub struct TunnelSession {
    id: String,
    params: ConnectParams,
    controller: HandleController,
    state: Arc<RwLock<SessionState>>,
    /// Set by [`TunnelSession::close`] so the monitor reports `Shutdown`
    /// instead of a remote close.
    shutdown: Arc<AtomicBool>,
    forwards: Mutex<Vec<Arc<PortForward>>>,
}

impl TunnelSession {
    /// Dial and authenticate. Resolves to a ready session, or to the
    /// classified failure (authentication, network, timeout, config).
    pub async fn connect(
        params: ConnectParams,
        events_tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Arc<Self>, TunnelError> {
        let id = Uuid::new_v4().to_string();
        info!(
            session = %id,
            host = %params.host,
            port = params.port,
            user = %params.user,
            "Connecting session"
        );

        let handle = connect_and_auth(&params).await?;
        let controller = spawn_handle_owner_task(handle, id.clone());

        let session = Self::assemble(id, params, controller, events_tx);
        info!(session = %session.id, "Session ready");
        Ok(session)
    }

    fn assemble(
        id: String,
        params: ConnectParams,
        controller: HandleController,
        events_tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            id,
            params,
            controller,
            state: Arc::new(RwLock::new(SessionState::Ready)),
            shutdown: Arc::new(AtomicBool::new(false)),
            forwards: Mutex::new(Vec::new()),
        });
        session.spawn_monitor(events_tx);
        session
    }

    /// Build a session around an existing controller without dialing.
    #[cfg(test)]
    pub(crate) fn with_controller(
        id: &str,
        params: ConnectParams,
        controller: HandleController,
        events_tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Arc<Self> {
        Self::assemble(id.to_string(), params, controller, events_tx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn params(&self) -> &ConnectParams {
        &self.params
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// The channel-opening surface handed to port forwards.
    pub fn channel_opener(&self) -> Arc<dyn ChannelOpener> {
        Arc::new(self.controller.clone())
    }

    /// Start a port forward for every spec concurrently. Resolves only
    /// after every spec has been attempted; one failure never cancels the
    /// others. Successes are owned by the session for teardown.
    pub async fn start_forwards(
        &self,
        specs: Vec<TunnelSpec>,
    ) -> Vec<(TunnelSpec, Result<Arc<PortForward>, TunnelError>)> {
        let opener = self.channel_opener();
        let attempts = specs.into_iter().map(|spec| {
            let opener = opener.clone();
            async move {
                let result = PortForward::start(opener, spec.clone(), &self.id).await;
                (spec, result.map(Arc::new))
            }
        });
        let outcomes = join_all(attempts).await;

        let mut owned = self.forwards.lock();
        for (spec, result) in &outcomes {
            match result {
                Ok(forward) => owned.push(forward.clone()),
                Err(e) => warn!(
                    session = %self.id,
                    service = %spec.name,
                    "Failed to start port forward: {}",
                    e
                ),
            }
        }
        outcomes
    }

    /// Close the session: stop every owned listener, then drop the
    /// connection. The owner task's shutdown broadcast ends any pipes
    /// still flowing. Safe to call more than once.
    pub async fn close(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.state.write() = SessionState::Closing;
        info!(session = %self.id, "Closing session");

        let forwards: Vec<Arc<PortForward>> = {
            let mut owned = self.forwards.lock();
            owned.drain(..).collect()
        };
        for forward in forwards {
            forward.stop().await;
        }

        self.controller.disconnect().await;
        *self.state.write() = SessionState::Closed;
    }

    /// Watch the transport until it goes away, then report why.
    fn spawn_monitor(self: &Arc<Self>, events_tx: mpsc::UnboundedSender<SessionEvent>) {
        let session_id = self.id.clone();
        let controller = self.controller.clone();
        let shutdown = self.shutdown.clone();
        let state = self.state.clone();
        let interval = Duration::from_secs(self.params.keepalive_interval_secs.max(1));

        tokio::spawn(async move {
            let mut disconnect_rx = controller.subscribe_disconnect();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut timeouts = 0u32;

            let reason = loop {
                tokio::select! {
                    _ = disconnect_rx.recv() => {
                        break if shutdown.load(Ordering::SeqCst) {
                            CloseReason::Shutdown
                        } else {
                            info!(session = %session_id, "Session closed by remote");
                            CloseReason::RemoteClosed
                        };
                    }
                    _ = ticker.tick() => {
                        match controller.ping().await {
                            PingResult::Ok => {
                                timeouts = 0;
                                debug!(session = %session_id, "Keepalive OK");
                            }
                            PingResult::IoError => {
                                warn!(session = %session_id, "Keepalive hit an I/O error, link is down");
                                break CloseReason::RemoteClosed;
                            }
                            PingResult::Timeout => {
                                timeouts += 1;
                                warn!(
                                    session = %session_id,
                                    "Keepalive timeout ({}/{})",
                                    timeouts,
                                    KEEPALIVE_FAIL_THRESHOLD
                                );
                                if timeouts >= KEEPALIVE_FAIL_THRESHOLD {
                                    break CloseReason::KeepaliveFailed;
                                }
                            }
                        }
                    }
                }
            };

            // A ping-detected death leaves the owner task formally alive;
            // tear it down so forwards see the broadcast too.
            if !matches!(reason, CloseReason::Shutdown) && controller.is_connected() {
                controller.disconnect().await;
            }
            *state.write() = SessionState::Closed;
            let _ = events_tx.send(SessionEvent::Closed { session_id, reason });
        });
    }
}
