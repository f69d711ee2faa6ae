//! Two-tier content-addressed build cache.
//!
//! A cache entry is addressed by the deps hash: the command's invocation
//! digest XOR-folded with the digest of every dependency that fed it. The
//! metadata record (keyed over configured deps) names the observed
//! dependency paths; the artifact entry (keyed over those observed deps)
//! holds one blob per target, named by a stable hash of the target's path.
//!
//! Reads check the local tier first, then the remote; stores go to every
//! enabled writable tier. Cache trouble is never fatal: local corruption
//! self-heals to a miss, remote trouble disables the remote tier for the
//! rest of the run.

pub mod local;
pub mod remote;

use crate::config::Config;
use crate::hash::ContentHash;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub use local::LocalStore;
pub use remote::RemoteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Local,
    Remote,
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheTier::Local => f.write_str("local"),
            CacheTier::Remote => f.write_str("remote"),
        }
    }
}

/// Which dependency paths fed a build, recorded beside the artifacts and
/// re-validated (by re-hashing those paths) before a cached entry is reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub deps: Vec<PathBuf>,
}

/// Uniform key-blob contract implemented by both cache tiers.
pub trait ObjectStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &str, data: &[u8]) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
}

pub fn metadata_key(hash: &ContentHash) -> String {
    format!("md-{}", hash.to_hex())
}

pub fn artifact_key(deps_hash: &ContentHash, target: &Path) -> String {
    format!(
        "{}/{}",
        deps_hash.to_hex(),
        ContentHash::of_str(&target.to_string_lossy()).to_hex()
    )
}

pub struct CacheManager {
    local: Option<LocalStore>,
    remote: Option<RemoteStore>,
}

impl CacheManager {
    pub fn from_config(config: &Config, local_enabled: bool, remote_enabled: bool) -> Result<Self> {
        let local = if local_enabled {
            Some(LocalStore::new(
                config.cache_dir.clone(),
                config.cache_ceiling_mb,
            )?)
        } else {
            None
        };
        let remote = match (&config.remote, remote_enabled) {
            (Some(remote_config), true) => Some(RemoteStore::new(remote_config.clone())?),
            _ => None,
        };
        Ok(Self { local, remote })
    }

    #[cfg(test)]
    pub fn with_stores(local: Option<LocalStore>, remote: Option<RemoteStore>) -> Self {
        Self { local, remote }
    }

    /// Look up the metadata record for a pre-check hash. A locally corrupt
    /// record is purged and treated as a miss.
    pub fn probe_metadata(&self, hash: &ContentHash) -> Option<MetadataRecord> {
        let key = metadata_key(hash);
        if let Some(local) = &self.local {
            match local.get(&key) {
                Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                    Ok(record) => return Some(record),
                    Err(err) => {
                        debug!("purging corrupt metadata record {key}: {err}");
                        let _ = local.delete(&key);
                    }
                },
                Ok(None) => {}
                Err(err) => debug!("local metadata probe failed: {err:#}"),
            }
        }
        if let Some(remote) = &self.remote {
            if let Ok(Some(bytes)) = remote.get(&key) {
                if let Ok(record) = serde_json::from_slice(&bytes) {
                    return Some(record);
                }
            }
        }
        None
    }

    pub fn store_metadata(&self, hash: &ContentHash, record: &MetadataRecord) {
        let key = metadata_key(hash);
        let bytes = match serde_json::to_vec(record) {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!("failed to serialize metadata record: {err}");
                return;
            }
        };
        if let Some(local) = &self.local {
            if let Err(err) = local.put(&key, &bytes) {
                debug!("local metadata store failed: {err:#}");
            }
        }
        if let Some(remote) = &self.remote {
            let _ = remote.put(&key, &bytes);
        }
    }

    /// Copy every target out of the first tier holding the complete artifact
    /// set, reporting which tier served the hit.
    pub fn restore_targets(
        &self,
        deps_hash: &ContentHash,
        targets: &BTreeSet<PathBuf>,
    ) -> Result<Option<CacheTier>> {
        if targets.is_empty() {
            return Ok(None);
        }

        if let Some(local) = &self.local {
            match local.restore_entry(deps_hash, targets) {
                Ok(true) => return Ok(Some(CacheTier::Local)),
                Ok(false) => {}
                Err(err) => debug!("local cache restore failed: {err:#}"),
            }
        }

        if let Some(remote) = &self.remote {
            let mut blobs = Vec::with_capacity(targets.len());
            let mut complete = true;
            for target in targets {
                match remote.get(&artifact_key(deps_hash, target)) {
                    Ok(Some(bytes)) => blobs.push((target.clone(), bytes)),
                    _ => {
                        complete = false;
                        break;
                    }
                }
            }
            if complete {
                for (target, bytes) in &blobs {
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(target, bytes)?;
                }
                // populate the local tier so the next probe is served locally
                if let Some(local) = &self.local {
                    for (target, bytes) in &blobs {
                        let _ = local.put(&artifact_key(deps_hash, target), bytes);
                    }
                }
                return Ok(Some(CacheTier::Remote));
            }
        }
        Ok(None)
    }

    /// Store the built targets into every enabled writable tier.
    pub fn store_targets(&self, deps_hash: &ContentHash, targets: &BTreeSet<PathBuf>) {
        if targets.is_empty() {
            return;
        }
        if let Some(local) = &self.local {
            if let Err(err) = local.store_entry(deps_hash, targets) {
                debug!("local cache store failed: {err:#}");
            }
        }
        if let Some(remote) = &self.remote {
            if remote.writable() {
                for target in targets {
                    if let Ok(bytes) = fs::read(target) {
                        let _ = remote.put(&artifact_key(deps_hash, target), &bytes);
                    }
                }
            }
        }
    }

    pub fn gc(&self) {
        if let Some(local) = &self.local {
            local.gc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_artifact_key_is_stable_per_target_path() {
        let hash = ContentHash::of_str("deps");
        let k1 = artifact_key(&hash, Path::new("/p/a.o"));
        let k2 = artifact_key(&hash, Path::new("/p/a.o"));
        let k3 = artifact_key(&hash, Path::new("/p/b.o"));
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
        assert!(k1.starts_with(&hash.to_hex()));
    }

    #[test]
    fn test_metadata_roundtrip_via_local_tier() {
        let temp = TempDir::new().unwrap();
        let manager = CacheManager::with_stores(
            Some(LocalStore::new(temp.path().join("cache"), 100).unwrap()),
            None,
        );

        let hash = ContentHash::of_str("pre-check");
        assert!(manager.probe_metadata(&hash).is_none());

        let record = MetadataRecord {
            deps: vec![PathBuf::from("/p/a.c"), PathBuf::from("/p/a.h")],
        };
        manager.store_metadata(&hash, &record);

        let loaded = manager.probe_metadata(&hash).unwrap();
        assert_eq!(loaded.deps, record.deps);
    }

    #[test]
    fn test_corrupt_metadata_purged_as_miss() {
        let temp = TempDir::new().unwrap();
        let local = LocalStore::new(temp.path().join("cache"), 100).unwrap();
        let hash = ContentHash::of_str("pre-check");
        local.put(&metadata_key(&hash), b"{ not json").unwrap();

        let manager = CacheManager::with_stores(
            Some(LocalStore::new(temp.path().join("cache"), 100).unwrap()),
            None,
        );
        assert!(manager.probe_metadata(&hash).is_none());
        // the broken record is gone
        assert!(manager.probe_metadata(&hash).is_none());
        let check = LocalStore::new(temp.path().join("cache"), 100).unwrap();
        assert!(check.get(&metadata_key(&hash)).unwrap().is_none());
    }

    #[test]
    fn test_restore_roundtrip() {
        let temp = TempDir::new().unwrap();
        let work = temp.path().join("work");
        fs::create_dir_all(&work).unwrap();
        let target = work.join("a.o");
        fs::write(&target, "object code").unwrap();

        let manager = CacheManager::with_stores(
            Some(LocalStore::new(temp.path().join("cache"), 100).unwrap()),
            None,
        );
        let deps_hash = ContentHash::of_str("post-check");
        let targets: BTreeSet<PathBuf> = [target.clone()].into_iter().collect();
        manager.store_targets(&deps_hash, &targets);

        fs::remove_file(&target).unwrap();
        let tier = manager.restore_targets(&deps_hash, &targets).unwrap();
        assert_eq!(tier, Some(CacheTier::Local));
        assert_eq!(fs::read_to_string(&target).unwrap(), "object code");
    }
}
