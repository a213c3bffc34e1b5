//! Durable tier store checked before any tier is regenerated.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Error, anyhow};
use async_trait::async_trait;
use tempfile::NamedTempFile;

use crate::codec::{self, Raster};
use crate::types::{ContentHash, Tier};

use super::Result;

const SHARD_LEN: usize = 2;

/// Async key/value store of generated tier rasters, keyed by content hash.
///
/// A failure here is never fatal to generation; the scheduler logs it and
/// falls through to the next source.
#[async_trait]
pub trait TierStore: Send + Sync {
    /// Load one previously persisted tier, `None` when absent.
    async fn load_tier(&self, hash: &ContentHash, tier: Tier) -> Result<Option<Raster>>;

    /// Persist one tier raster.
    async fn store_tier(&self, hash: &ContentHash, tier: Tier, raster: &Raster) -> Result<()>;

    /// Drop every persisted tier of a hash.
    async fn remove(&self, hash: &ContentHash) -> Result<()>;
}

/// Disk-backed [`TierStore`] with a sharded directory layout.
///
/// Each hash gets its own directory (sharded on a blake3 digest of the hash
/// string so arbitrary hash formats stay path-safe) holding one PNG per tier.
#[derive(Debug, Clone)]
pub struct DiskTierStore {
    root: PathBuf,
}

impl DiskTierStore {
    /// Create or reuse a tier store rooted at the provided path.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("creating tier store root at {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding every persisted tier of a hash.
    pub fn dir_for(&self, hash: &ContentHash) -> PathBuf {
        let digest = blake3::hash(hash.as_str().as_bytes());
        let hex = digest.to_hex();
        let hex_str = hex.as_str();

        let (shard_one, remainder) = hex_str.split_at(SHARD_LEN);
        let (shard_two, remainder) = remainder.split_at(SHARD_LEN);

        self.root.join(shard_one).join(shard_two).join(remainder)
    }

    fn path_for(&self, hash: &ContentHash, tier: Tier) -> PathBuf {
        self.dir_for(hash).join(format!("t{tier}.png"))
    }

    fn read_sync(path: &Path) -> Result<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write_sync(path: &Path, bytes: &[u8]) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| anyhow!("tier path {} has no parent directory", path.display()))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("creating tier shard directory at {}", parent.display()))?;

        let mut tmp = NamedTempFile::new_in(parent)
            .with_context(|| format!("allocating temp file in {}", parent.display()))?;
        tmp.write_all(bytes).with_context(|| format!("writing {}", path.display()))?;
        tmp.flush().with_context(|| format!("flushing {}", path.display()))?;
        tmp.persist(path).map_err(|err| Error::from(err.error))?;
        Ok(())
    }
}

#[async_trait]
impl TierStore for DiskTierStore {
    async fn load_tier(&self, hash: &ContentHash, tier: Tier) -> Result<Option<Raster>> {
        let path = self.path_for(hash, tier);
        let bytes = tokio::task::spawn_blocking(move || Self::read_sync(&path))
            .await
            .context("tier read task aborted")??;

        match bytes {
            Some(bytes) => Ok(Some(codec::decode_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn store_tier(&self, hash: &ContentHash, tier: Tier, raster: &Raster) -> Result<()> {
        let path = self.path_for(hash, tier);
        let encoded = codec::encode_png(raster)?;
        tokio::task::spawn_blocking(move || Self::write_sync(&path, &encoded))
            .await
            .context("tier write task aborted")?
    }

    async fn remove(&self, hash: &ContentHash) -> Result<()> {
        let dir = self.dir_for(hash);
        tokio::task::spawn_blocking(move || match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        })
        .await
        .context("tier remove task aborted")?
    }
}
