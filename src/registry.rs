//! Tunnel registry
//!
//! Owns every live session and every tunnel under them. `connect` brings
//! a session plus its forwards up as one call with per-tunnel outcomes,
//! `status` reports the live table, `stop_session` / `stop_all` tear
//! things down. An event loop task consumes session close events and
//! drives auto-reconnection when the session's policy asks for it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::TunnelError;
use crate::forward::PortForward;
use crate::profile::TunnelSpec;
use crate::session::{CloseReason, ReconnectPolicy, SessionEvent, TunnelSession};
use crate::ssh::ConnectParams;

/// How long a reconnect waits for dead listeners to release their ports
/// before re-binding them.
const LISTENER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Cancellation check cadence while a reconnect task waits.
const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Per-tunnel outcome of a connect call. Failures carry the message;
/// they never abort the sibling tunnels.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelOutcome {
    pub name: String,
    pub requested_local_port: u16,
    /// Present when the forward came up; can differ from the request
    /// when the port was busy.
    pub bound_local_port: Option<u16>,
    pub remote_port: u16,
    pub error: Option<String>,
}

impl TunnelOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// What a successful connect call hands back.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResult {
    pub session_id: String,
    pub tunnels: Vec<TunnelOutcome>,
}

impl ConnectResult {
    /// How many requested forwards actually came up.
    pub fn established(&self) -> usize {
        self.tunnels.iter().filter(|t| t.succeeded()).count()
    }
}

/// Whether any bytes have moved through a tunnel yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    Idle,
    Active,
}

/// One row of the status table.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStatus {
    pub name: String,
    pub bound_local_port: u16,
    pub remote_port: u16,
    pub status: TunnelState,
    pub bytes_transferred: u64,
    pub duration_ms: u64,
}

/// A live forward registered under a session.
struct ActiveTunnel {
    session_id: String,
    spec: TunnelSpec,
    forward: Arc<PortForward>,
    started_at: DateTime<Utc>,
}

impl ActiveTunnel {
    fn new(session_id: &str, spec: TunnelSpec, forward: Arc<PortForward>) -> Self {
        Self {
            session_id: session_id.to_string(),
            spec,
            forward,
            started_at: Utc::now(),
        }
    }

    /// Registry-wide key. Bound ports are unique per host, so the pair
    /// is unique across sessions too.
    fn key(&self) -> String {
        format!("{}_{}", self.session_id, self.forward.bound_port())
    }

    fn status(&self) -> TunnelStatus {
        let stats = self.forward.stats();
        TunnelStatus {
            name: self.spec.name.clone(),
            bound_local_port: self.forward.bound_port(),
            remote_port: self.spec.remote_port,
            status: if stats.is_active() {
                TunnelState::Active
            } else {
                TunnelState::Idle
            },
            bytes_transferred: stats.bytes_transferred(),
            duration_ms: (Utc::now() - self.started_at).num_milliseconds().max(0) as u64,
        }
    }
}

struct SessionEntry {
    session: Arc<TunnelSession>,
    /// Specs as originally requested, kept for re-dialing after a drop.
    specs: Vec<TunnelSpec>,
    policy: ReconnectPolicy,
}

/// The single owner of session and tunnel state.
pub struct TunnelRegistry {
    sessions: DashMap<String, SessionEntry>,
    tunnels: DashMap<String, ActiveTunnel>,
    /// Cancellation flags for pending reconnect tasks, keyed by the dead
    /// session's id.
    reconnects: DashMap<String, Arc<AtomicBool>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl TunnelRegistry {
    /// Create the registry and start its event loop. Must be called from
    /// within a runtime.
    pub fn new() -> Arc<Self> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            sessions: DashMap::new(),
            tunnels: DashMap::new(),
            reconnects: DashMap::new(),
            events_tx,
        });

        // The loop holds only a weak reference so dropping the registry
        // ends it.
        let weak = Arc::downgrade(&registry);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let Some(registry) = weak.upgrade() else { break };
                match event {
                    SessionEvent::Closed { session_id, reason } => {
                        registry.on_session_closed(&session_id, reason);
                    }
                }
            }
            debug!("Registry event loop exited");
        });

        registry
    }

    /// Connect a session and start a forward for every spec. The policy
    /// is derived from `params.auto_reconnect`.
    pub async fn connect(
        self: &Arc<Self>,
        specs: Vec<TunnelSpec>,
        params: ConnectParams,
    ) -> Result<ConnectResult, TunnelError> {
        let policy = if params.auto_reconnect {
            ReconnectPolicy::fixed_interval()
        } else {
            ReconnectPolicy::default()
        };
        self.connect_with_policy(specs, params, policy).await
    }

    /// Connect with an explicit reconnect policy.
    pub async fn connect_with_policy(
        self: &Arc<Self>,
        specs: Vec<TunnelSpec>,
        params: ConnectParams,
        policy: ReconnectPolicy,
    ) -> Result<ConnectResult, TunnelError> {
        self.establish(specs, params, policy).await
    }

    /// Dial, start forwards, register everything. Session-level failures
    /// reject the whole call; per-forward failures are reported in the
    /// result instead.
    async fn establish(
        self: &Arc<Self>,
        specs: Vec<TunnelSpec>,
        params: ConnectParams,
        policy: ReconnectPolicy,
    ) -> Result<ConnectResult, TunnelError> {
        let session = TunnelSession::connect(params, self.events_tx.clone()).await?;
        let session_id = session.id().to_string();

        let outcomes = session.start_forwards(specs.clone()).await;
        let mut tunnels = Vec::with_capacity(outcomes.len());
        for (spec, result) in outcomes {
            match result {
                Ok(forward) => {
                    tunnels.push(TunnelOutcome {
                        name: spec.name.clone(),
                        requested_local_port: spec.requested_local_port,
                        bound_local_port: Some(forward.bound_port()),
                        remote_port: spec.remote_port,
                        error: None,
                    });
                    let tunnel = ActiveTunnel::new(&session_id, spec, forward);
                    self.tunnels.insert(tunnel.key(), tunnel);
                }
                Err(e) => {
                    tunnels.push(TunnelOutcome {
                        name: spec.name.clone(),
                        requested_local_port: spec.requested_local_port,
                        bound_local_port: None,
                        remote_port: spec.remote_port,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        self.sessions.insert(
            session_id.clone(),
            SessionEntry {
                session,
                specs,
                policy,
            },
        );

        let result = ConnectResult {
            session_id,
            tunnels,
        };
        info!(
            session = %result.session_id,
            established = result.established(),
            requested = result.tunnels.len(),
            "Session connected"
        );
        Ok(result)
    }

    /// Live tunnel table, sorted by name then bound port for stable
    /// output.
    pub fn status(&self) -> Vec<TunnelStatus> {
        let mut rows: Vec<TunnelStatus> =
            self.tunnels.iter().map(|t| t.value().status()).collect();
        rows.sort_by(|a, b| {
            a.name
                .cmp(&b.name)
                .then(a.bound_local_port.cmp(&b.bound_local_port))
        });
        rows
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn tunnel_count(&self) -> usize {
        self.tunnels.len()
    }

    /// Tear down one session and its tunnels. Also cancels a pending
    /// reconnect for that id. Returns whether anything was found.
    pub async fn stop_session(&self, session_id: &str) -> bool {
        let had_reconnect = self.cancel_reconnect(session_id);
        let had_session = self.remove_and_close(session_id).await;
        had_session || had_reconnect
    }

    /// Tear down everything. Reconnect tasks are cancelled before any
    /// session is touched so none of them re-inserts a session while we
    /// iterate. Safe to call on an empty registry, and idempotent.
    pub async fn stop_all(&self) {
        let pending: Vec<String> = self.reconnects.iter().map(|e| e.key().clone()).collect();
        for key in pending {
            self.cancel_reconnect(&key);
        }

        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        if ids.is_empty() {
            debug!("stop_all: nothing to stop");
            return;
        }
        info!(sessions = ids.len(), "Stopping all sessions");
        for id in ids {
            self.remove_and_close(&id).await;
        }
    }

    /// Remove the entry and its tunnels first so the status table is
    /// immediately consistent, then close the session.
    async fn remove_and_close(&self, session_id: &str) -> bool {
        let entry = self.sessions.remove(session_id);
        self.tunnels.retain(|_, t| t.session_id != session_id);
        match entry {
            Some((_, entry)) => {
                entry.session.close().await;
                true
            }
            None => false,
        }
    }

    fn cancel_reconnect(&self, session_id: &str) -> bool {
        match self.reconnects.remove(session_id) {
            Some((_, flag)) => {
                info!(session = %session_id, "Cancelling pending reconnect");
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Handle a monitor-reported close. Explicit stops have already
    /// removed the entry, so this is a no-op for them.
    fn on_session_closed(self: &Arc<Self>, session_id: &str, reason: CloseReason) {
        let Some((_, entry)) = self.sessions.remove(session_id) else {
            return;
        };
        let old_forwards: Vec<Arc<PortForward>> = self
            .tunnels
            .iter()
            .filter(|t| t.value().session_id == session_id)
            .map(|t| t.value().forward.clone())
            .collect();
        self.tunnels.retain(|_, t| t.session_id != session_id);
        info!(
            session = %session_id,
            ?reason,
            dropped_tunnels = old_forwards.len(),
            "Session closed"
        );

        if reason == CloseReason::Shutdown || !entry.policy.enabled {
            return;
        }
        self.spawn_reconnect(session_id, entry, old_forwards);
    }

    /// Dial a replacement session with the original params and specs.
    /// Cancellation is cooperative: the flag is checked at every wait
    /// point, and a replacement that lands after cancellation is torn
    /// down again instead of kept.
    fn spawn_reconnect(
        self: &Arc<Self>,
        dead_session_id: &str,
        entry: SessionEntry,
        old_forwards: Vec<Arc<PortForward>>,
    ) {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.reconnects
            .insert(dead_session_id.to_string(), cancelled.clone());

        let weak = Arc::downgrade(self);
        let key = dead_session_id.to_string();
        let params = entry.session.params().clone();
        let specs = entry.specs;
        let policy = entry.policy;

        tokio::spawn(async move {
            info!(session = %key, host = %params.host, "Auto-reconnect task started");
            let mut attempt: u32 = 0;
            let mut auth_failures: u32 = 0;

            loop {
                attempt += 1;
                if !policy.allows_attempt(attempt) {
                    warn!(
                        session = %key,
                        attempts = attempt - 1,
                        "Auto-reconnect gave up: attempt limit reached"
                    );
                    break;
                }

                let delay = policy.delay_for(attempt);
                debug!(session = %key, attempt, ?delay, "Waiting before reconnect attempt");
                if sleep_cancellable(delay, &cancelled).await {
                    info!(session = %key, "Auto-reconnect cancelled");
                    break;
                }

                // The old listeners must release their ports before the
                // replacement binds the same ones.
                wait_for_listeners_closed(&old_forwards).await;
                if cancelled.load(Ordering::SeqCst) {
                    info!(session = %key, "Auto-reconnect cancelled");
                    break;
                }

                let Some(registry) = weak.upgrade() else { return };
                info!(session = %key, attempt, "Reconnect attempt");
                match registry
                    .establish(specs.clone(), params.clone(), policy.clone())
                    .await
                {
                    Ok(result) => {
                        if cancelled.load(Ordering::SeqCst) {
                            warn!(
                                session = %key,
                                "Reconnect landed after cancellation, discarding it"
                            );
                            registry.remove_and_close(&result.session_id).await;
                        } else {
                            info!(
                                session = %key,
                                new_session = %result.session_id,
                                tunnels = result.established(),
                                "Reconnected"
                            );
                        }
                        break;
                    }
                    Err(e) if e.is_authentication() => {
                        auth_failures += 1;
                        warn!(
                            session = %key,
                            attempt,
                            consecutive = auth_failures,
                            "Reconnect authentication failed: {}",
                            e
                        );
                        if auth_failures >= policy.max_auth_failures {
                            error!(
                                session = %key,
                                "Auto-reconnect gave up after {} consecutive authentication failures",
                                auth_failures
                            );
                            break;
                        }
                    }
                    Err(e) => {
                        auth_failures = 0;
                        warn!(session = %key, attempt, "Reconnect attempt failed: {}", e);
                    }
                }
            }

            if let Some(registry) = weak.upgrade() {
                registry.reconnects.remove(&key);
            }
        });
    }
}

/// Sleep in short steps so a cancellation flag is honored quickly.
/// Returns whether the sleep was cancelled.
async fn sleep_cancellable(total: Duration, cancelled: &AtomicBool) -> bool {
    let mut elapsed = Duration::ZERO;
    while elapsed < total {
        if cancelled.load(Ordering::SeqCst) {
            return true;
        }
        let step = CANCEL_CHECK_INTERVAL.min(total - elapsed);
        tokio::time::sleep(step).await;
        elapsed += step;
    }
    cancelled.load(Ordering::SeqCst)
}

/// Poll until every old listener has shut down, bounded by
/// [`LISTENER_DRAIN_TIMEOUT`]. Proceeding early is safe, the new forward
/// would just probe past the still-occupied port.
async fn wait_for_listeners_closed(old_forwards: &[Arc<PortForward>]) {
    let deadline = tokio::time::Instant::now() + LISTENER_DRAIN_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if old_forwards.iter().all(|f| !f.is_running()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    warn!("Old listeners still running before reconnect, proceeding anyway");
}
