//! Tunnel error types
//!
//! One classified error enum for the whole engine. `PortConflict` and
//! `ChannelOpen` are handled inside the forwarding layer and never reach
//! registry callers; the remaining variants propagate with the raw
//! underlying message attached.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunnelError {
    /// Server rejected the supplied credentials. Fatal per attempt.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Host unreachable, connection refused, DNS failure, reset.
    #[error("Network error: {0}")]
    Network(String),

    /// Connect or handshake exceeded its deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Local port already bound. Recovered by reprobe + rebind.
    #[error("Local port {0} is already in use")]
    PortConflict(u16),

    /// direct-tcpip open rejected. Drops one local connection only.
    #[error("Channel open failed: {0}")]
    ChannelOpen(String),

    /// Missing or invalid profile/parameters. Surfaced before any
    /// connection attempt.
    #[error("Configuration error: {0}")]
    Config(String),

    /// SSH protocol error not covered by a more specific class.
    #[error("SSH protocol error: {0}")]
    Ssh(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The session's handle owner task is gone.
    #[error("Disconnected")]
    Disconnected,
}

impl TunnelError {
    /// Actionable remediation text keyed by classification. `None` for
    /// classes that are recovered internally.
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            TunnelError::Authentication(_) => {
                Some("check that the user name and password are correct")
            }
            TunnelError::Network(_) | TunnelError::Disconnected => {
                Some("check that the host and port are correct and reachable")
            }
            TunnelError::Timeout(_) => {
                Some("check firewall rules between this machine and the host")
            }
            TunnelError::Config(_) => Some("check the profile configuration"),
            _ => None,
        }
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, TunnelError::Authentication(_))
    }

    /// Classify an IO error raised while dialing or handshaking.
    pub(crate) fn from_connect_io(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => TunnelError::Timeout(err.to_string()),
            _ => TunnelError::Network(err.to_string()),
        }
    }
}

impl From<russh::Error> for TunnelError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::IO(e) => TunnelError::from_connect_io(e),
            russh::Error::Disconnect => TunnelError::Disconnected,
            other => TunnelError::Ssh(other.to_string()),
        }
    }
}

// Profile and vault problems both mean "fix your configuration" by the
// time they reach a connect call.
impl From<crate::profile::StoreError> for TunnelError {
    fn from(err: crate::profile::StoreError) -> Self {
        TunnelError::Config(err.to_string())
    }
}

impl From<crate::vault::VaultError> for TunnelError {
    fn from(err: crate::vault::VaultError) -> Self {
        TunnelError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remediation_per_class() {
        let auth = TunnelError::Authentication("denied".into());
        assert!(auth.remediation().unwrap().contains("password"));

        let net = TunnelError::Network("refused".into());
        assert!(net.remediation().unwrap().contains("host"));

        let timeout = TunnelError::Timeout("15s".into());
        assert!(timeout.remediation().unwrap().contains("firewall"));

        // Locally-recovered classes carry no user-facing remediation.
        assert!(TunnelError::PortConflict(3306).remediation().is_none());
        assert!(TunnelError::ChannelOpen("rejected".into())
            .remediation()
            .is_none());
    }

    #[test]
    fn test_io_classification() {
        let refused =
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(
            TunnelError::from_connect_io(refused),
            TunnelError::Network(_)
        ));

        let timed_out = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert!(matches!(
            TunnelError::from_connect_io(timed_out),
            TunnelError::Timeout(_)
        ));
    }

    #[test]
    fn test_message_attached() {
        let err = TunnelError::Authentication("server said no".into());
        assert!(err.to_string().contains("server said no"));
    }

    #[test]
    fn test_ambient_errors_classify_as_config() {
        let store_err = crate::profile::StoreError::NoConfigDir;
        assert!(matches!(
            TunnelError::from(store_err),
            TunnelError::Config(_)
        ));

        let vault_err = crate::vault::VaultError::EncryptionFailed;
        assert!(matches!(
            TunnelError::from(vault_err),
            TunnelError::Config(_)
        ));
    }
}
