//! Profile, preset, and tunnel spec types

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::vault::{CredentialVault, DecryptOutcome};

/// One service port pair inside a profile: the port on the remote host and
/// the local port to expose it on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub remote: u16,
    pub local: u16,
}

/// A persisted server profile. Created by the wizard/add flow and treated
/// as read-only during connection attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerProfile {
    pub host: String,

    /// SSH port
    #[serde(default = "default_port")]
    pub port: u16,

    pub user: String,

    /// Vault-encrypted `ivHex:cipherHex`, or legacy plaintext
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Reserved. Accepted and persisted, but dialing through a jump host
    /// is not implemented.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jump_host: Option<String>,

    /// Service name -> port mapping. Entries here take precedence over
    /// presets with the same name.
    #[serde(default)]
    pub ports: BTreeMap<String, PortMapping>,
}

impl ServerProfile {
    /// Decrypt the stored password through the vault. `None` when the
    /// profile has no password at all.
    pub fn decrypted_password(&self, vault: &CredentialVault) -> Option<DecryptOutcome> {
        self.password.as_deref().map(|p| vault.decrypt(p))
    }
}

/// Catalog entry: default port pair for a well-known service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresetService {
    pub name: String,
    pub remote_port: u16,
    pub local_port: u16,
}

/// Resolved input to one tunnel request: which remote port to reach and
/// which local port the caller asked for. The actually bound local port
/// may differ (conflict resolution).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelSpec {
    pub name: String,
    pub remote_port: u16,
    pub requested_local_port: u16,
}

impl TunnelSpec {
    pub fn new(name: impl Into<String>, remote_port: u16, requested_local_port: u16) -> Self {
        Self {
            name: name.into(),
            remote_port,
            requested_local_port,
        }
    }
}

/// The persisted store record: named profiles plus the preset catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreData {
    #[serde(default)]
    pub servers: BTreeMap<String, ServerProfile>,

    #[serde(default)]
    pub presets: BTreeMap<String, PresetService>,
}

fn default_port() -> u16 {
    22
}
