//! Server Profiles & Preset Catalog
//!
//! Persisted server profiles (host, credentials, port map) and the preset
//! catalog used to resolve tunnel specs.

mod store;
mod types;

pub use store::{builtin_presets, config_dir, profiles_file, ProfileStore, StoreError};
pub use types::{PortMapping, PresetService, ServerProfile, StoreData, TunnelSpec};
