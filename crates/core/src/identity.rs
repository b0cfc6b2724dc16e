//! Stable device identity.
//!
//! The device id is generated exactly once per install and then reused for
//! every handshake; the gateway keys its issued device tokens to it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
}

impl DeviceIdentity {
    /// Loads the identity from `path`, creating and persisting a fresh one on
    /// first run. Once written, the id is never regenerated.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading device identity from {}", path.display()))?;
            return serde_json::from_str(&text)
                .with_context(|| format!("corrupt device identity file {}", path.display()));
        }

        let identity = Self {
            device_id: Uuid::new_v4().to_string(),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&identity)?)
            .with_context(|| format!("writing device identity to {}", path.display()))?;
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_created_once_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.json");

        let first = DeviceIdentity::load_or_create(&path).unwrap();
        assert!(!first.device_id.is_empty());

        let second = DeviceIdentity::load_or_create(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_identity_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("device.json");
        let identity = DeviceIdentity::load_or_create(&path).unwrap();
        assert!(path.exists());
        assert_eq!(
            identity,
            serde_json::from_str::<DeviceIdentity>(&std::fs::read_to_string(&path).unwrap())
                .unwrap()
        );
    }

    #[test]
    fn test_corrupt_identity_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(DeviceIdentity::load_or_create(&path).is_err());
    }
}
