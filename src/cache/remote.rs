//! Remote cache tier: a generic HTTP key-blob store.
//!
//! Objects live at `<host>/<bucket>/<key>`, with the configured credentials
//! sent as headers. The tier is strictly best-effort: after a few
//! consecutive transient failures (timeouts, connection errors, auth or
//! clock-skew rejections) it disables itself for the remainder of the run
//! and the build carries on with the local tier alone.

use super::ObjectStore;
use crate::config::{RemoteConfig, RemoteMode};
use anyhow::{bail, Context, Result};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

const MAX_CONSECUTIVE_FAILURES: u32 = 3;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

const ACCESS_KEY_HEADER: &str = "x-access-key";
const SECRET_KEY_HEADER: &str = "x-secret-key";

pub struct RemoteStore {
    client: Client,
    base_url: String,
    access_key: String,
    secret_key: String,
    read_write: bool,
    failures: AtomicU32,
    disabled: AtomicBool,
}

impl RemoteStore {
    pub fn new(config: RemoteConfig) -> Result<Self> {
        if config.kind != "http" {
            bail!(
                "unsupported remote cache kind '{}' (only 'http' is available)",
                config.kind
            );
        }
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build remote cache client")?;

        let host = config.host.trim_end_matches('/');
        let base_url = if host.starts_with("http://") || host.starts_with("https://") {
            format!("{}/{}", host, config.bucket)
        } else {
            format!("http://{}/{}", host, config.bucket)
        };

        Ok(Self {
            client,
            base_url,
            access_key: config.access_key,
            secret_key: config.secret_key,
            read_write: config.mode == RemoteMode::ReadWrite,
            failures: AtomicU32::new(0),
            disabled: AtomicBool::new(false),
        })
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    pub fn writable(&self) -> bool {
        self.read_write && !self.is_disabled()
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }

    fn record_success(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }

    fn record_failure(&self, operation: &str, detail: String) {
        let count = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("remote cache {operation} failed ({count}/{MAX_CONSECUTIVE_FAILURES}): {detail}");
        if count >= MAX_CONSECUTIVE_FAILURES && !self.disabled.swap(true, Ordering::Relaxed) {
            warn!(
                "remote cache disabled for the remainder of the run after {count} consecutive failures"
            );
        }
    }
}

impl ObjectStore for RemoteStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if self.is_disabled() {
            return Ok(None);
        }
        let response = self
            .client
            .get(self.url(key))
            .header(ACCESS_KEY_HEADER, &self.access_key)
            .header(SECRET_KEY_HEADER, &self.secret_key)
            .send();
        match response {
            Ok(response) if response.status() == StatusCode::NOT_FOUND => {
                self.record_success();
                Ok(None)
            }
            Ok(response) if response.status().is_success() => match response.bytes() {
                Ok(bytes) => {
                    self.record_success();
                    Ok(Some(bytes.to_vec()))
                }
                Err(err) => {
                    self.record_failure("read", err.to_string());
                    Ok(None)
                }
            },
            Ok(response) => {
                self.record_failure("get", format!("status {}", response.status()));
                Ok(None)
            }
            Err(err) => {
                self.record_failure("get", err.to_string());
                Ok(None)
            }
        }
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        if !self.writable() {
            return Ok(());
        }
        let response = self
            .client
            .put(self.url(key))
            .header(ACCESS_KEY_HEADER, &self.access_key)
            .header(SECRET_KEY_HEADER, &self.secret_key)
            .body(data.to_vec())
            .send();
        match response {
            Ok(response) if response.status().is_success() => self.record_success(),
            Ok(response) => self.record_failure("put", format!("status {}", response.status())),
            Err(err) => self.record_failure("put", err.to_string()),
        }
        Ok(())
    }

    fn delete(&self, _key: &str) -> Result<()> {
        // remote eviction is the server's concern
        Ok(())
    }
}
