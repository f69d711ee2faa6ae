//! Local content-addressed artifact store.
//!
//! Layout under the cache directory:
//! - `md-<hex>` metadata records (JSON)
//! - `<hex>/<path-hash>` one blob per target inside an entry directory
//!
//! Blobs are written to a temporary name and renamed into place so readers
//! never observe torn writes. A create-exclusive `.lock` file serializes
//! writers to the same entry; a writer that loses the race skips the store.
//! Garbage collection evicts least-recently-used entries once usage comes
//! within a margin of the ceiling, down to a low watermark.

use super::ObjectStore;
use crate::hash::ContentHash;
use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// GC fires once the ceiling is within 10% of current usage...
const GC_TRIGGER_MARGIN: f64 = 1.1;
/// ...and evicts until usage drops below 60% of the ceiling.
const GC_LOW_WATERMARK: f64 = 0.6;

pub struct LocalStore {
    root: PathBuf,
    ceiling_bytes: u64,
}

/// Create-exclusive lock file; removed on drop.
struct EntryLock {
    path: PathBuf,
}

impl EntryLock {
    fn acquire(path: PathBuf) -> Option<EntryLock> {
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Some(EntryLock { path }),
            Err(_) => None,
        }
    }
}

impl Drop for EntryLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

impl LocalStore {
    pub fn new(root: PathBuf, ceiling_mb: u64) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create cache directory {}", root.display()))?;
        Ok(Self {
            root,
            ceiling_bytes: ceiling_mb.saturating_mul(1024 * 1024),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock_path(&self, entry_name: &str) -> PathBuf {
        self.root.join(format!("{entry_name}.lock"))
    }

    /// Store one blob per target under the entry directory for `deps_hash`.
    pub fn store_entry(&self, deps_hash: &ContentHash, targets: &BTreeSet<PathBuf>) -> Result<()> {
        let entry_name = deps_hash.to_hex();
        let Some(_lock) = EntryLock::acquire(self.lock_path(&entry_name)) else {
            // another writer owns this entry; its artifacts are equivalent
            return Ok(());
        };

        let entry_dir = self.root.join(&entry_name);
        let _ = fs::remove_dir_all(&entry_dir);
        fs::create_dir_all(&entry_dir)
            .with_context(|| format!("failed to create cache entry {}", entry_dir.display()))?;

        for target in targets {
            let blob = entry_dir.join(path_hash(target));
            let tmp = blob.with_extension(format!("tmp.{}", std::process::id()));
            fs::copy(target, &tmp)
                .with_context(|| format!("failed to copy {} into cache", target.display()))?;
            fs::rename(&tmp, &blob).context("failed to finalize cache blob")?;
        }
        Ok(())
    }

    /// Copy every blob of the entry back over its target path. A missing
    /// blob means a corrupt entry: it is cleared and reported as a miss.
    pub fn restore_entry(
        &self,
        deps_hash: &ContentHash,
        targets: &BTreeSet<PathBuf>,
    ) -> Result<bool> {
        let entry_dir = self.root.join(deps_hash.to_hex());
        if !entry_dir.is_dir() {
            return Ok(false);
        }
        for target in targets {
            let blob = entry_dir.join(path_hash(target));
            if !blob.is_file() {
                warn!(
                    "corrupted cache entry {}: no blob for {}; clearing",
                    deps_hash.to_hex(),
                    target.display()
                );
                let _ = fs::remove_dir_all(&entry_dir);
                return Ok(false);
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&blob, target)
                .with_context(|| format!("failed to restore {}", target.display()))?;
        }
        // refresh the entry's LRU position
        let _ = fs::write(entry_dir.join(".last-used"), now_secs().to_le_bytes());
        Ok(true)
    }

    /// Evict least-recently-used entries while usage sits above the low
    /// watermark. Writers hold per-entry locks, and GC holds the store lock,
    /// so an entry is never deleted mid-write.
    pub fn gc(&self) {
        let total = disk_usage(&self.root);
        if self.ceiling_bytes as f64 > total as f64 * GC_TRIGGER_MARGIN {
            return;
        }
        let low_watermark = (self.ceiling_bytes as f64 * GC_LOW_WATERMARK) as u64;

        let store_lock = self.root.with_extension("lock");
        let Some(_lock) = EntryLock::acquire(store_lock) else {
            warn!("cache is locked by another writer; skipping gc");
            return;
        };

        let mut entries: Vec<(SystemTime, PathBuf, u64)> = Vec::new();
        let dir = match fs::read_dir(&self.root) {
            Ok(dir) => dir,
            Err(err) => {
                debug!("cache gc failed to list entries: {err}");
                return;
            }
        };
        for entry in dir.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e == "lock").unwrap_or(false) {
                continue;
            }
            entries.push((entry_used_time(&path), path.clone(), disk_usage(&path)));
        }
        entries.sort_by_key(|(used, _, _)| *used);

        let mut current = total;
        let mut freed = 0u64;
        for (_, path, size) in entries {
            if current <= low_watermark {
                break;
            }
            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            if removed.is_ok() {
                current = current.saturating_sub(size);
                freed += size;
            }
        }
        if freed > 0 {
            info!("cache gc freed {} MB", freed / (1024 * 1024));
        }
    }
}

impl ObjectStore for LocalStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.root.join(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("failed to read cache key {key}")),
        }
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let top_level = key.split('/').next().unwrap_or(key);
        let Some(_lock) = EntryLock::acquire(self.lock_path(top_level)) else {
            return Ok(());
        };
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
        fs::write(&tmp, data).with_context(|| format!("failed to write cache key {key}"))?;
        fs::rename(&tmp, &path).context("failed to finalize cache blob")?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.root.join(key);
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }
}

fn path_hash(target: &Path) -> String {
    ContentHash::of_str(&target.to_string_lossy()).to_hex()
}

fn disk_usage(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.metadata().ok())
        .filter(|metadata| metadata.is_file())
        .map(|metadata| metadata.len())
        .sum()
}

fn entry_used_time(path: &Path) -> SystemTime {
    // prefer the explicit touch marker, then access time, then mtime
    let marker = path.join(".last-used");
    fs::metadata(&marker)
        .or_else(|_| fs::metadata(path))
        .map(|metadata| {
            metadata
                .accessed()
                .or_else(|_| metadata.modified())
                .unwrap_or(UNIX_EPOCH)
        })
        .unwrap_or(UNIX_EPOCH)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    #[test]
    fn test_store_and_restore_entry() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path().join("cache"), 100).unwrap();

        let target = temp.path().join("a.o");
        fs::write(&target, "object code").unwrap();
        let deps_hash = ContentHash::of_str("key");
        let targets: BTreeSet<PathBuf> = [target.clone()].into_iter().collect();

        store.store_entry(&deps_hash, &targets).unwrap();
        fs::write(&target, "stale").unwrap();

        assert!(store.restore_entry(&deps_hash, &targets).unwrap());
        assert_eq!(fs::read_to_string(&target).unwrap(), "object code");
    }

    #[test]
    fn test_missing_entry_is_a_miss() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path().join("cache"), 100).unwrap();
        let targets: BTreeSet<PathBuf> = [temp.path().join("a.o")].into_iter().collect();
        assert!(!store
            .restore_entry(&ContentHash::of_str("absent"), &targets)
            .unwrap());
    }

    #[test]
    fn test_corrupt_entry_self_heals() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path().join("cache"), 100).unwrap();

        let target = temp.path().join("a.o");
        fs::write(&target, "object code").unwrap();
        let deps_hash = ContentHash::of_str("key");
        let targets: BTreeSet<PathBuf> = [target.clone()].into_iter().collect();
        store.store_entry(&deps_hash, &targets).unwrap();

        // corrupt the entry: drop its blob
        let entry_dir = store.root().join(deps_hash.to_hex());
        let blob = entry_dir.join(path_hash(&target));
        fs::remove_file(&blob).unwrap();

        assert!(!store.restore_entry(&deps_hash, &targets).unwrap());
        // the whole entry was purged
        assert!(!entry_dir.exists());
    }

    #[test]
    fn test_losing_writer_skips_store() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path().join("cache"), 100).unwrap();

        let target = temp.path().join("a.o");
        fs::write(&target, "object code").unwrap();
        let deps_hash = ContentHash::of_str("key");
        let targets: BTreeSet<PathBuf> = [target.clone()].into_iter().collect();

        // hold the entry lock, as a concurrent winner would
        let _held = EntryLock::acquire(store.lock_path(&deps_hash.to_hex())).unwrap();
        store.store_entry(&deps_hash, &targets).unwrap();
        assert!(!store.root().join(deps_hash.to_hex()).exists());
    }

    #[test]
    fn test_object_store_get_put_delete() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path().join("cache"), 100).unwrap();

        assert!(store.get("md-abc").unwrap().is_none());
        store.put("md-abc", b"{\"deps\":[]}").unwrap();
        assert_eq!(store.get("md-abc").unwrap().unwrap(), b"{\"deps\":[]}");
        store.delete("md-abc").unwrap();
        assert!(store.get("md-abc").unwrap().is_none());
    }

    #[test]
    fn test_gc_evicts_oldest_to_low_watermark() {
        let temp = TempDir::new().unwrap();
        // 1 MB ceiling
        let store = LocalStore::new(temp.path().join("cache"), 1).unwrap();

        // three 512 KB entries, oldest first
        for (name, age) in [("aa", 3000), ("bb", 2000), ("cc", 1000)] {
            let target = temp.path().join(format!("{name}.bin"));
            fs::write(&target, vec![0u8; 512 * 1024]).unwrap();
            let deps_hash = ContentHash::of_str(name);
            let targets: BTreeSet<PathBuf> = [target].into_iter().collect();
            store.store_entry(&deps_hash, &targets).unwrap();
            // age the marker to order entries deterministically
            let entry_dir = store.root().join(deps_hash.to_hex());
            let marker = entry_dir.join(".last-used");
            fs::write(&marker, (now_secs() - age).to_le_bytes()).unwrap();
            let stamp = SystemTime::now() - std::time::Duration::from_secs(age);
            let file = fs::OpenOptions::new().write(true).open(&marker).unwrap();
            if file
                .set_times(fs::FileTimes::new().set_accessed(stamp).set_modified(stamp))
                .is_err()
            {
                // no timestamp control here, ordering would be arbitrary
                return;
            }
        }

        store.gc();

        // usage (1.5 MB) was above the trigger; eviction runs oldest-first
        // until below the 60% watermark (~614 KB), leaving only "cc"
        assert!(!store.root().join(ContentHash::of_str("aa").to_hex()).exists());
        assert!(!store.root().join(ContentHash::of_str("bb").to_hex()).exists());
        assert!(store.root().join(ContentHash::of_str("cc").to_hex()).exists());
    }

    #[test]
    fn test_gc_noop_below_trigger() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new(temp.path().join("cache"), 100).unwrap();

        let target = temp.path().join("a.o");
        fs::write(&target, "tiny").unwrap();
        let deps_hash = ContentHash::of_str("key");
        let targets: BTreeSet<PathBuf> = [target].into_iter().collect();
        store.store_entry(&deps_hash, &targets).unwrap();

        store.gc();
        assert!(store.root().join(deps_hash.to_hex()).exists());
    }
}
