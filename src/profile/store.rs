//! Profile store
//!
//! Reads/writes the profile file and resolves tunnel specs from profiles
//! and presets. Store location: ~/.oxidetunnel/profiles.json on
//! macOS/Linux, %APPDATA%\OxideTunnel on Windows.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::types::{PresetService, ServerProfile, StoreData, TunnelSpec};

/// Profile store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    #[error("Unknown service '{0}': not in the profile port map or the preset catalog")]
    UnknownService(String),
}

/// Get the OxideTunnel configuration directory
/// Returns %APPDATA%\OxideTunnel on Windows, ~/.oxidetunnel on macOS/Linux
pub fn config_dir() -> Result<PathBuf, StoreError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("OxideTunnel"));
        }
        dirs::home_dir()
            .map(|home| home.join(".oxidetunnel"))
            .ok_or(StoreError::NoConfigDir)
    }

    #[cfg(not(windows))]
    {
        dirs::home_dir()
            .map(|home| home.join(".oxidetunnel"))
            .ok_or(StoreError::NoConfigDir)
    }
}

/// Get the profiles file path
pub fn profiles_file() -> Result<PathBuf, StoreError> {
    Ok(config_dir()?.join("profiles.json"))
}

/// Built-in preset catalog. Persisted presets with the same name win.
pub fn builtin_presets() -> BTreeMap<String, PresetService> {
    let defaults = [
        ("mysql", 3306, 3306),
        ("postgres", 5432, 5432),
        ("redis", 6379, 6379),
        ("mongodb", 27017, 27017),
    ];

    defaults
        .into_iter()
        .map(|(name, remote, local)| {
            (
                name.to_string(),
                PresetService {
                    name: name.to_string(),
                    remote_port: remote,
                    local_port: local,
                },
            )
        })
        .collect()
}

/// Profile storage manager
pub struct ProfileStore {
    path: PathBuf,
}

impl ProfileStore {
    /// Create a store at the default path
    pub fn new() -> Result<Self, StoreError> {
        Ok(Self {
            path: profiles_file()?,
        })
    }

    /// Create a store with a custom path (for testing)
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    /// Get the store file path
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    async fn ensure_dir(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Load profiles and presets from disk.
    ///
    /// Missing file yields an empty store with the built-in presets. A
    /// corrupted file is backed up and replaced by defaults rather than
    /// failing the caller.
    pub async fn load(&self) -> Result<StoreData, StoreError> {
        let mut data = match fs::read_to_string(&self.path).await {
            Ok(contents) => match serde_json::from_str::<StoreData>(&contents) {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!("Profile file corrupted: {}", e);
                    match self.backup().await {
                        Ok(backup_path) => {
                            tracing::warn!(
                                "Corrupted profile file backed up to {:?}, using defaults",
                                backup_path
                            );
                        }
                        Err(backup_err) => {
                            tracing::error!(
                                "Failed to back up corrupted profile file: {}",
                                backup_err
                            );
                        }
                    }
                    StoreData::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreData::default(),
            Err(e) => return Err(StoreError::Io(e)),
        };

        // Built-ins sit under whatever the file carries.
        let mut presets = builtin_presets();
        presets.extend(std::mem::take(&mut data.presets));
        data.presets = presets;

        Ok(data)
    }

    /// Save the store to disk (atomic: temp file then rename)
    pub async fn save(&self, data: &StoreData) -> Result<(), StoreError> {
        self.ensure_dir().await?;

        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(data)?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.path).await?;

        Ok(())
    }

    /// Add or replace a profile under `name` and persist the store.
    pub async fn add_profile(
        &self,
        name: &str,
        profile: ServerProfile,
    ) -> Result<(), StoreError> {
        let mut data = self.load().await?;
        data.servers.insert(name.to_string(), profile);
        self.save(&data).await
    }

    /// Check if the store file exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    /// Create a timestamped backup of the current store file
    pub async fn backup(&self) -> Result<PathBuf, StoreError> {
        let backup_path = self.path.with_extension(format!(
            "json.backup.{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ));

        if self.exists().await {
            fs::copy(&self.path, &backup_path).await?;
        }

        Ok(backup_path)
    }
}

impl StoreData {
    /// Resolve tunnel specs for a named profile.
    ///
    /// `services = None` takes every entry of the profile's own port map.
    /// With an explicit service list, each name is looked up in the
    /// profile's port map first, then in the preset catalog; the profile
    /// entry wins when both exist.
    pub fn resolve_specs(
        &self,
        profile_name: &str,
        services: Option<&[String]>,
    ) -> Result<Vec<TunnelSpec>, StoreError> {
        let profile = self
            .servers
            .get(profile_name)
            .ok_or_else(|| StoreError::ProfileNotFound(profile_name.to_string()))?;

        match services {
            None => Ok(profile
                .ports
                .iter()
                .map(|(name, mapping)| TunnelSpec::new(name.clone(), mapping.remote, mapping.local))
                .collect()),
            Some(names) => names
                .iter()
                .map(|name| self.resolve_one(profile, name))
                .collect(),
        }
    }

    fn resolve_one(
        &self,
        profile: &ServerProfile,
        service: &str,
    ) -> Result<TunnelSpec, StoreError> {
        if let Some(mapping) = profile.ports.get(service) {
            return Ok(TunnelSpec::new(service, mapping.remote, mapping.local));
        }
        if let Some(preset) = self.presets.get(service) {
            return Ok(TunnelSpec::new(
                service,
                preset.remote_port,
                preset.local_port,
            ));
        }
        Err(StoreError::UnknownService(service.to_string()))
    }
}
