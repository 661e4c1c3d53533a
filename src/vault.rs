//! Credential vault
//!
//! Encrypts profile passwords with a persisted master key. Secrets are
//! stored as `ivHex:cipherHex` (random nonce per call, ChaCha20-Poly1305).
//! Values that predate the vault are kept readable: anything that does not
//! parse and authenticate as vault output is handed back unchanged as a
//! legacy plaintext secret.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, KeyInit, Nonce};
use rand::RngCore;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Master key file name under the config directory
const KEY_FILENAME: &str = "vault.key";

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Vault errors
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encryption failed")]
    EncryptionFailed,
}

/// Result of decrypting a stored secret.
///
/// `LegacyPlaintext` carries input that was not produced by this vault
/// (pre-vault profiles, or ciphertext from a regenerated key). The value
/// is returned unchanged so old profiles keep working; callers may warn
/// the user and re-encrypt on the next save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptOutcome {
    Decrypted(String),
    LegacyPlaintext(String),
}

impl DecryptOutcome {
    pub fn into_plaintext(self) -> String {
        match self {
            DecryptOutcome::Decrypted(s) => s,
            DecryptOutcome::LegacyPlaintext(s) => s,
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, DecryptOutcome::LegacyPlaintext(_))
    }
}

/// Vault for profile secrets, keyed by a per-user master key file.
pub struct CredentialVault {
    key_path: PathBuf,
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl CredentialVault {
    /// Open the vault under `config_dir`, loading the master key or
    /// generating a fresh one if the file is missing or corrupt.
    ///
    /// Regeneration invalidates every previously encrypted secret; those
    /// decrypt as `LegacyPlaintext` from then on.
    pub fn open(config_dir: &Path) -> Result<Self, VaultError> {
        fs::create_dir_all(config_dir)?;
        let key_path = config_dir.join(KEY_FILENAME);
        let key = ensure_key(&key_path)?;

        debug!("Credential vault opened: key={:?}", key_path);

        Ok(Self { key_path, key })
    }

    /// Path of the master key file (for diagnostics).
    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// Encrypt a secret as `ivHex:cipherHex` with a per-call random nonce.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let cipher = ChaCha20Poly1305::new_from_slice(&*self.key)
            .map_err(|_| VaultError::EncryptionFailed)?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| VaultError::EncryptionFailed)?;

        Ok(format!("{}:{}", hex::encode(nonce), hex::encode(ciphertext)))
    }

    /// Decrypt a stored secret. Never fails: input that does not parse as
    /// `iv:cipher` (or does not authenticate under the current key) is
    /// returned unchanged as `LegacyPlaintext`.
    pub fn decrypt(&self, input: &str) -> DecryptOutcome {
        match self.try_decrypt(input) {
            Some(plaintext) => DecryptOutcome::Decrypted(plaintext),
            None => DecryptOutcome::LegacyPlaintext(input.to_string()),
        }
    }

    fn try_decrypt(&self, input: &str) -> Option<String> {
        let (iv_hex, cipher_hex) = input.split_once(':')?;
        let nonce = hex::decode(iv_hex).ok()?;
        if nonce.len() != NONCE_LEN {
            return None;
        }
        let ciphertext = hex::decode(cipher_hex).ok()?;

        let cipher = ChaCha20Poly1305::new_from_slice(&*self.key).ok()?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .ok()?;

        String::from_utf8(plaintext).ok()
    }
}

/// Load the master key, or generate and persist a new one when the file
/// is missing or not exactly 32 bytes.
fn ensure_key(key_path: &Path) -> Result<Zeroizing<[u8; KEY_LEN]>, VaultError> {
    match fs::read(key_path) {
        Ok(data) if data.len() == KEY_LEN => {
            let mut key = Zeroizing::new([0u8; KEY_LEN]);
            key.copy_from_slice(&data);
            return Ok(key);
        }
        Ok(data) => {
            warn!(
                "Vault key file has invalid length {} (expected {}); generating a new key. \
                 Previously encrypted secrets can no longer be decrypted",
                data.len(),
                KEY_LEN
            );
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("Vault key file not found, generating");
        }
        Err(e) => return Err(e.into()),
    }

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    rand::rngs::OsRng.fill_bytes(&mut *key);
    write_key(key_path, &key)?;
    Ok(key)
}

/// Write key material atomically: temp file then rename, owner-only perms.
fn write_key(key_path: &Path, key: &[u8; KEY_LEN]) -> Result<(), VaultError> {
    let temp_path = key_path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path)?;
    file.write_all(key)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp_path, key_path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o600);
        let _ = fs::set_permissions(key_path, perms);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let vault = CredentialVault::open(temp_dir.path()).unwrap();

        let encrypted = vault.encrypt("s3cret-password").unwrap();
        assert_ne!(encrypted, "s3cret-password");
        assert!(encrypted.contains(':'));

        let outcome = vault.decrypt(&encrypted);
        assert_eq!(outcome, DecryptOutcome::Decrypted("s3cret-password".into()));
        assert!(!outcome.is_legacy());
    }

    #[test]
    fn test_encrypt_uses_fresh_nonce() {
        let temp_dir = TempDir::new().unwrap();
        let vault = CredentialVault::open(temp_dir.path()).unwrap();

        let a = vault.encrypt("same input").unwrap();
        let b = vault.encrypt("same input").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_malformed_input_returned_unchanged() {
        let temp_dir = TempDir::new().unwrap();
        let vault = CredentialVault::open(temp_dir.path()).unwrap();

        for input in [
            "plain-old-password",
            "no-colon-here",
            "zz:zz",
            "deadbeef:not-hex!",
            "",
            ":",
        ] {
            let outcome = vault.decrypt(input);
            assert_eq!(
                outcome,
                DecryptOutcome::LegacyPlaintext(input.to_string()),
                "input {:?} must pass through unchanged",
                input
            );
        }
    }

    #[test]
    fn test_key_persists_across_open() {
        let temp_dir = TempDir::new().unwrap();

        let encrypted = {
            let vault = CredentialVault::open(temp_dir.path()).unwrap();
            vault.encrypt("persistent").unwrap()
        };

        let vault = CredentialVault::open(temp_dir.path()).unwrap();
        assert_eq!(
            vault.decrypt(&encrypted),
            DecryptOutcome::Decrypted("persistent".into())
        );
    }

    #[test]
    fn test_foreign_ciphertext_is_legacy() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let vault_a = CredentialVault::open(dir_a.path()).unwrap();
        let vault_b = CredentialVault::open(dir_b.path()).unwrap();

        let encrypted = vault_a.encrypt("secret").unwrap();

        // Well-formed iv:cipher, but wrong key: handed back unchanged.
        let outcome = vault_b.decrypt(&encrypted);
        assert_eq!(outcome, DecryptOutcome::LegacyPlaintext(encrypted));
    }

    #[test]
    fn test_corrupt_key_file_regenerated() {
        let temp_dir = TempDir::new().unwrap();

        let encrypted = {
            let vault = CredentialVault::open(temp_dir.path()).unwrap();
            vault.encrypt("secret").unwrap()
        };

        // Truncate the key file.
        fs::write(temp_dir.path().join(KEY_FILENAME), b"short").unwrap();

        let vault = CredentialVault::open(temp_dir.path()).unwrap();
        let key_data = fs::read(vault.key_path()).unwrap();
        assert_eq!(key_data.len(), KEY_LEN);

        // Old ciphertext is invalidated, not an error.
        assert!(vault.decrypt(&encrypted).is_legacy());
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let vault = CredentialVault::open(temp_dir.path()).unwrap();

        let mode = fs::metadata(vault.key_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
