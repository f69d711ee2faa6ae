//! Reporting sink for build progress.
//!
//! One `Reporter` is owned by the run and shared by reference with the
//! scheduler and the workers. Counters are atomics; actual output goes
//! through `tracing`, which serializes writes.

use crate::cache::CacheTier;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Default)]
pub struct Reporter {
    jobs_done: AtomicU64,
    local_hits: AtomicU64,
    remote_hits: AtomicU64,
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file_added(&self, path: &Path) {
        info!("   [A] {}", path.display());
    }

    pub fn file_updated(&self, path: &Path) {
        info!("   [U] {}", path.display());
    }

    pub fn file_deleted(&self, path: &Path) {
        info!("   [D] {}", path.display());
    }

    pub fn command_started(&self, invocation: &str) {
        info!("{invocation}");
    }

    pub fn command_finished(&self, label: &str, elapsed: f64, tier: Option<CacheTier>) {
        self.jobs_done.fetch_add(1, Ordering::Relaxed);
        match tier {
            Some(CacheTier::Local) => {
                self.local_hits.fetch_add(1, Ordering::Relaxed);
                info!("[{elapsed:.3}] [from-cache] {label}");
            }
            Some(CacheTier::Remote) => {
                self.remote_hits.fetch_add(1, Ordering::Relaxed);
                info!("[{elapsed:.3}] [from-cache remote] {label}");
            }
            None => info!("[{elapsed:.3}] {label}"),
        }
    }

    /// Surface a failing command's captured output.
    pub fn command_output(&self, stdout: &str, stderr: &str) {
        if !stdout.is_empty() {
            info!("{stdout}");
        }
        if !stderr.is_empty() {
            error!("{stderr}");
        }
    }

    pub fn jobs_done(&self) -> u64 {
        self.jobs_done.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.local_hits.load(Ordering::Relaxed) + self.remote_hits.load(Ordering::Relaxed)
    }

    pub fn summary(&self, elapsed: Duration) {
        let jobs = self.jobs_done();
        let local = self.local_hits.load(Ordering::Relaxed);
        let remote = self.remote_hits.load(Ordering::Relaxed);
        if jobs > 0 {
            let ratio = (local + remote) * 100 / jobs;
            info!(
                "done: {jobs} jobs, {ratio}% from cache (local {local}, remote {remote}) in {:.3}s",
                elapsed.as_secs_f64()
            );
        } else {
            info!("done: nothing to build ({:.3}s)", elapsed.as_secs_f64());
        }
    }
}
