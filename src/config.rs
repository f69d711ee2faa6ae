//! Run configuration.
//!
//! Settings merge in precedence order: environment variables over rule-file
//! directives over built-in defaults. The state root lives under the project
//! directory; everything lathe persists goes below it.

use crate::rules::Directive;
use anyhow::{bail, Context, Result};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

pub const RULE_FILE_NAME: &str = "Lathefile";
pub const STATE_DIR_NAME: &str = ".lathe";

const DEFAULT_CACHE_CEILING_MB: u64 = 1500;

#[derive(Debug, Clone)]
pub struct Config {
    /// Project root; rule paths and traced relative opens resolve against it.
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub db_path: PathBuf,
    pub cache_dir: PathBuf,
    /// Local cache size ceiling in megabytes.
    pub cache_ceiling_mb: u64,
    pub workers: usize,
    pub remote: Option<RemoteConfig>,
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub kind: String,
    pub host: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub mode: RemoteMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteMode {
    ReadOnly,
    ReadWrite,
}

impl FromStr for RemoteMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ro" => Ok(Self::ReadOnly),
            "rw" => Ok(Self::ReadWrite),
            _ => bail!("invalid remote cache mode '{}': must be ro or rw", s),
        }
    }
}

impl Config {
    pub fn new(root: PathBuf) -> Self {
        let state_dir = root.join(STATE_DIR_NAME);
        Self {
            tmp_dir: state_dir.join("tmp"),
            db_path: state_dir.join("db.json"),
            cache_dir: state_dir.join("build-cache"),
            state_dir,
            root,
            cache_ceiling_mb: DEFAULT_CACHE_CEILING_MB,
            workers: default_workers(),
            remote: None,
        }
    }

    pub fn apply_directives(&mut self, directives: &[Directive]) -> Result<()> {
        for directive in directives {
            match directive {
                Directive::LocalCacheSizeMb(mb) => self.cache_ceiling_mb = *mb,
                Directive::RemoteCache {
                    kind,
                    host,
                    access_key,
                    secret_key,
                    bucket,
                    mode,
                } => {
                    self.remote = Some(RemoteConfig {
                        kind: kind.clone(),
                        host: host.clone(),
                        access_key: access_key.clone(),
                        secret_key: secret_key.clone(),
                        bucket: bucket.clone(),
                        mode: mode.parse()?,
                    });
                }
            }
        }
        Ok(())
    }

    /// Environment overrides: `LATHE_CACHE_SIZE_MB` and the
    /// `LATHE_REMOTE_*` connection parameters.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(mb) = env::var("LATHE_CACHE_SIZE_MB") {
            self.cache_ceiling_mb = mb
                .parse()
                .context("LATHE_CACHE_SIZE_MB must be a number of megabytes")?;
        }

        let host = env::var("LATHE_REMOTE_HOST").ok();
        if self.remote.is_none() {
            if let Some(host) = host.clone() {
                let bucket = env::var("LATHE_REMOTE_BUCKET")
                    .context("LATHE_REMOTE_HOST is set but LATHE_REMOTE_BUCKET is not")?;
                self.remote = Some(RemoteConfig {
                    kind: "http".to_string(),
                    host,
                    access_key: String::new(),
                    secret_key: String::new(),
                    bucket,
                    mode: RemoteMode::ReadWrite,
                });
            }
        }

        if let Some(remote) = &mut self.remote {
            if let Ok(kind) = env::var("LATHE_REMOTE_KIND") {
                remote.kind = kind;
            }
            if let Some(host) = host {
                remote.host = host;
            }
            if let Ok(key) = env::var("LATHE_REMOTE_ACCESS_KEY") {
                remote.access_key = key;
            }
            if let Ok(secret) = env::var("LATHE_REMOTE_SECRET_KEY") {
                remote.secret_key = secret;
            }
            if let Ok(bucket) = env::var("LATHE_REMOTE_BUCKET") {
                remote.bucket = bucket;
            }
            if let Ok(mode) = env::var("LATHE_REMOTE_MODE") {
                remote.mode = mode.parse()?;
            }
        }
        Ok(())
    }

    /// Create the state directories; the per-run scratch dir starts empty.
    pub fn prepare_dirs(&self) -> Result<()> {
        let _ = fs::remove_dir_all(&self.tmp_dir);
        fs::create_dir_all(&self.tmp_dir).with_context(|| {
            format!("failed to create state directory {}", self.tmp_dir.display())
        })?;
        fs::create_dir_all(&self.cache_dir).with_context(|| {
            format!("failed to create cache directory {}", self.cache_dir.display())
        })?;
        Ok(())
    }
}

pub fn default_workers() -> usize {
    num_cpus::get().clamp(2, 8)
}
