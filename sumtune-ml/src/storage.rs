//! Persistence for trained model manifests.

use crate::error::TuneError;
use crate::training::trained::TrainedModel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const MANIFEST_FILE: &str = "trained_model.json";

/// Atomically write raw bytes: write a `.tmp` sibling, then rename over the target.
///
/// Creates parent directories if they don't exist.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Where a trained model was stored and the digest of what was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredModel {
    pub model_id: Uuid,
    pub manifest: PathBuf,
    pub digest: String,
    pub stored_at: DateTime<Utc>,
}

/// Stores trained models and loads them back.
pub trait ModelStore: Send + Sync {
    fn store(&self, model: &TrainedModel, dir: &Path) -> Result<StoredModel, TuneError>;

    fn load(&self, stored: &StoredModel) -> Result<TrainedModel, TuneError>;
}

/// Writes `<dir>/<model id>/trained_model.json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsModelStore;

impl FsModelStore {
    pub fn new() -> Self {
        Self
    }

    /// Handle for a manifest written earlier, e.g. by another process.
    pub fn open(manifest: &Path) -> Result<StoredModel, TuneError> {
        let bytes = std::fs::read(manifest)?;
        let model: TrainedModel = serde_json::from_slice(&bytes)?;
        let stored_at = std::fs::metadata(manifest)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(StoredModel {
            model_id: model.id,
            manifest: manifest.to_path_buf(),
            digest: sha256_hex(&bytes),
            stored_at,
        })
    }
}

impl ModelStore for FsModelStore {
    fn store(&self, model: &TrainedModel, dir: &Path) -> Result<StoredModel, TuneError> {
        let manifest = dir.join(model.id.to_string()).join(MANIFEST_FILE);
        let json = serde_json::to_vec_pretty(model)?;
        atomic_write(&manifest, &json).map_err(|e| {
            TuneError::storage(format!("failed to write {}: {e}", manifest.display()))
        })?;

        let stored = StoredModel {
            model_id: model.id,
            digest: sha256_hex(&json),
            manifest,
            stored_at: Utc::now(),
        };
        tracing::info!(
            model = %model.id,
            path = %stored.manifest.display(),
            digest = %stored.digest,
            "Stored trained model"
        );
        Ok(stored)
    }

    fn load(&self, stored: &StoredModel) -> Result<TrainedModel, TuneError> {
        let bytes = std::fs::read(&stored.manifest).map_err(|e| {
            TuneError::storage(format!("failed to read {}: {e}", stored.manifest.display()))
        })?;
        let digest = sha256_hex(&bytes);
        if digest != stored.digest {
            return Err(TuneError::storage(format!(
                "digest mismatch for {}: expected {}, found {digest}",
                stored.manifest.display(),
                stored.digest
            )));
        }
        let model: TrainedModel = serde_json::from_slice(&bytes)?;
        if model.id != stored.model_id {
            return Err(TuneError::storage(format!(
                "{} holds model {}, expected {}",
                stored.manifest.display(),
                model.id,
                stored.model_id
            )));
        }
        Ok(model)
    }
}
