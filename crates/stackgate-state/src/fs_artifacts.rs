//! Filesystem-backed artifact store with git-style 2-char sharding.
//!
//! Layout: `<root>/runs/<run_id>/<stage>/<first 2 hex chars>/<remaining hex chars>`

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;

use crate::error::StorageError;
use crate::storage_traits::{ArtifactRef, ArtifactStore, ContentDigest, RunId, StorageResult};

/// Filesystem-backed [`ArtifactStore`].
pub struct FsArtifactStore {
    runs_dir: PathBuf,
}

impl FsArtifactStore {
    /// Create a new `FsArtifactStore` rooted at `root`. Creates `root/runs/`
    /// if needed.
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let runs_dir = root.as_ref().join("runs");
        fs::create_dir_all(&runs_dir)?;
        Ok(Self { runs_dir })
    }

    fn blob_path(&self, run_id: &RunId, stage: &str, digest: &ContentDigest) -> PathBuf {
        let hex = digest.as_str();
        self.runs_dir
            .join(&run_id.0)
            .join(stage)
            .join(&hex[..2])
            .join(&hex[2..])
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, run_id: &RunId, stage: &str, data: &[u8]) -> StorageResult<ArtifactRef> {
        let digest = ContentDigest::from_bytes(data);
        let path = self.blob_path(run_id, stage, &digest);
        let artifact = ArtifactRef {
            run_id: run_id.clone(),
            stage: stage.to_string(),
            digest,
        };

        if path.exists() {
            return Ok(artifact);
        }

        let shard_dir = path.parent().expect("blob path always has parent");
        fs::create_dir_all(shard_dir)?;

        // Atomic write: write to temp file in the same directory, then rename.
        let mut tmp = NamedTempFile::new_in(shard_dir)?;
        tmp.write_all(data)?;
        tmp.persist(&path).map_err(|e| StorageError::Io(e.error))?;

        Ok(artifact)
    }

    async fn get(&self, artifact: &ArtifactRef) -> StorageResult<Vec<u8>> {
        let path = self.blob_path(&artifact.run_id, &artifact.stage, &artifact.digest);
        fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::ArtifactNotFound {
                    run_id: artifact.run_id.0.clone(),
                    stage: artifact.stage.clone(),
                    digest: artifact.digest.as_str().to_string(),
                }
            } else {
                StorageError::Io(e)
            }
        })
    }

    async fn contains(&self, artifact: &ArtifactRef) -> StorageResult<bool> {
        let path = self.blob_path(&artifact.run_id, &artifact.stage, &artifact.digest);
        Ok(path.exists())
    }
}
