//! Connection parameters

use serde::{Deserialize, Serialize};

/// Parameters for one session dial. `password` is the already-decrypted
/// secret (callers run profile passwords through the vault first).
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub host: String,

    /// SSH port
    #[serde(default = "default_port")]
    pub port: u16,

    pub user: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Re-dial with the same spec set after an unexpected close
    #[serde(default)]
    pub auto_reconnect: bool,

    /// Connect + handshake deadline in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Transport keepalive interval in seconds
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
}

impl ConnectParams {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            user: user.into(),
            password: None,
            auto_reconnect: false,
            connect_timeout_secs: default_connect_timeout(),
            keepalive_interval_secs: default_keepalive_interval(),
        }
    }
}

// Keep the password out of debug output.
impl std::fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("auto_reconnect", &self.auto_reconnect)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("keepalive_interval_secs", &self.keepalive_interval_secs)
            .finish()
    }
}

fn default_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_keepalive_interval() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_defaults_from_json() {
        let json = r#"{"host": "db.internal", "user": "deploy"}"#;
        let params: ConnectParams = serde_json::from_str(json).unwrap();

        assert_eq!(params.port, 22);
        assert!(params.password.is_none());
        assert!(!params.auto_reconnect);
        assert_eq!(params.connect_timeout_secs, 15);
        assert_eq!(params.keepalive_interval_secs, 30);
    }

    #[test]
    fn test_debug_redacts_password() {
        let mut params = ConnectParams::new("db.internal", "deploy");
        params.password = Some("hunter2".into());

        let rendered = format!("{:?}", params);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("***"));
    }
}
