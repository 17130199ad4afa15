//! Store configuration, loaded from a JSON file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use directories::ProjectDirs;
use lb_crypto::{KdfParams, XChaChaCrypto};
use serde::{Deserialize, Serialize};

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "lockbox";
pub const APP_NAME: &str = "lockbox";

/// Overrides the data directory when `data_dir` is not set in the file.
pub const DATA_DIR_ENV: &str = "LOCKBOX_DATA_DIR";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Memory,
    #[default]
    File,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: Option<PathBuf>,
    pub backend: BackendKind,
    pub fsync: bool,
    pub max_container_bytes: Option<u64>,
    pub kdf: KdfParams,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            backend: BackendKind::File,
            fsync: true,
            max_container_bytes: None,
            kdf: KdfParams::default(),
        }
    }
}

impl StoreConfig {
    /// Missing fields take their defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read store config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse store config {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("write store config {}", path.display()))
    }

    /// Value crypto keyed with this config's KDF cost. Still needs
    /// `init` before use.
    pub fn crypto(&self, salt: impl Into<Vec<u8>>) -> XChaChaCrypto {
        XChaChaCrypto::new(salt, self.kdf)
    }

    /// `data_dir`, else `$LOCKBOX_DATA_DIR`, else the platform data dir.
    pub fn resolved_data_dir(&self) -> anyhow::Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            if !dir.is_empty() {
                return Ok(PathBuf::from(dir));
            }
        }
        default_data_dir()
    }
}

pub fn default_data_dir() -> anyhow::Result<PathBuf> {
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine data directory"))?;
    Ok(dirs.data_dir().join("containers"))
}
