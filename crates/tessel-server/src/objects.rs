//! Content objects pinned on the cafe, one file per cid.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info};

use tessel_shared::Cid;

use crate::error::ServerError;

/// Verify that a resolved path stays within the expected base directory.
fn ensure_within(base: &Path, target: &Path) -> Result<PathBuf, ServerError> {
    let canonical_base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
    let mut resolved = canonical_base.clone();
    for component in target
        .strip_prefix(base)
        .unwrap_or(target)
        .components()
    {
        match component {
            std::path::Component::Normal(c) => resolved.push(c),
            std::path::Component::ParentDir => {
                return Err(ServerError::BadRequest("Path traversal detected".to_string()));
            }
            _ => {}
        }
    }
    if !resolved.starts_with(&canonical_base) {
        return Err(ServerError::BadRequest("Path traversal detected".to_string()));
    }
    Ok(resolved)
}

#[derive(Debug, Clone)]
pub struct ObjectStore {
    base_path: PathBuf,
    max_size: usize,
}

impl ObjectStore {
    pub async fn new(base_path: PathBuf, max_size: usize) -> Result<Self, ServerError> {
        fs::create_dir_all(&base_path).await.map_err(|e| {
            ServerError::Internal(format!(
                "Failed to create object directory '{}': {}",
                base_path.display(),
                e
            ))
        })?;

        info!(path = %base_path.display(), "Object store initialized");

        Ok(Self {
            base_path,
            max_size,
        })
    }

    /// Store `data` under `cid`. The cid must be the content id of the
    /// bytes; storing an object that is already present is a no-op.
    pub async fn put(&self, cid: &Cid, data: &[u8]) -> Result<(), ServerError> {
        if data.is_empty() {
            return Err(ServerError::BadRequest("Empty object".to_string()));
        }
        if data.len() > self.max_size {
            return Err(ServerError::TooLarge {
                size: data.len(),
                max: self.max_size,
            });
        }
        if Cid::of(data) != *cid {
            return Err(ServerError::BadRequest(format!(
                "Object does not hash to {cid}"
            )));
        }

        let path = self.object_path(cid)?;
        if fs::try_exists(&path).await.unwrap_or(false) {
            debug!(cid = %cid, "Object already stored");
            return Ok(());
        }

        // write-then-rename so a reader never sees a partial object
        let partial = path.with_extension("partial");
        fs::write(&partial, data)
            .await
            .map_err(|e| ServerError::Internal(format!("Failed to write object {cid}: {e}")))?;
        fs::rename(&partial, &path)
            .await
            .map_err(|e| ServerError::Internal(format!("Failed to commit object {cid}: {e}")))?;

        debug!(cid = %cid, size = data.len(), "Stored object");
        Ok(())
    }

    pub async fn get(&self, cid: &Cid) -> Result<Vec<u8>, ServerError> {
        let path = self.object_path(cid)?;

        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ServerError::NotFound(format!("object {cid}")))
            }
            Err(e) => Err(ServerError::Internal(format!("Failed to read object {cid}: {e}"))),
        }
    }

    pub async fn has(&self, cid: &Cid) -> bool {
        match self.object_path(cid) {
            Ok(path) => fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// The subset of `cids` not stored yet, in request order. Malformed
    /// cids are reported as missing.
    pub async fn missing(&self, cids: &[String]) -> Vec<String> {
        let mut missing = Vec::new();
        for cid in cids {
            if !self.has(&Cid(cid.clone())).await && !missing.contains(cid) {
                missing.push(cid.clone());
            }
        }
        missing
    }

    fn object_path(&self, cid: &Cid) -> Result<PathBuf, ServerError> {
        if !cid.is_valid() {
            return Err(ServerError::BadRequest(format!("Invalid cid: {cid}")));
        }
        // two-level fan-out keeps directories small
        let raw = self.base_path.join(&cid.as_str()[..2]).join(cid.as_str());
        let path = ensure_within(&self.base_path, &raw)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ServerError::Internal(format!("Failed to create {}: {e}", parent.display())))?;
        }
        Ok(path)
    }
}
