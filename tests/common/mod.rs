// Common test utilities shared across acceptance tests
//
// Each acceptance test builds inside its own temporary project directory:
// rule file, sources, state dir and cache all live under one TempDir, so
// tests run in parallel without touching each other or any global state.
//
// Builds execute real commands under strace. On machines without strace the
// execution-heavy tests skip themselves (the unit tests still cover the
// pipeline pieces).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tempfile::TempDir;

pub struct BuildEnv {
    _temp: TempDir,
    root: PathBuf,
}

#[allow(dead_code)]
impl BuildEnv {
    pub fn new() -> Self {
        // NOT under /tmp: traced opens below /tmp are dropped as transient,
        // so a project there would never see its own files. Cargo's
        // per-target scratch directory lives under target/.
        let base = PathBuf::from(env!("CARGO_TARGET_TMPDIR"));
        fs::create_dir_all(&base).unwrap();
        let temp = TempDir::new_in(&base).expect("failed to create test dir");
        let root = temp.path().canonicalize().expect("canonical test dir");
        Self { _temp: temp, root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    pub fn write(&self, rel: &str, content: &str) {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    pub fn remove(&self, rel: &str) {
        fs::remove_file(self.path(rel)).unwrap();
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.path(rel).is_file()
    }

    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.path(rel)).unwrap()
    }

    pub fn mtime(&self, rel: &str) -> SystemTime {
        fs::metadata(self.path(rel)).unwrap().modified().unwrap()
    }

    /// An assert_cmd command for the lathe binary, rooted in this env.
    pub fn lathe(&self) -> assert_cmd::Command {
        let mut cmd = assert_cmd::Command::cargo_bin("lathe").expect("binary built");
        cmd.current_dir(&self.root);
        cmd.env("LATHE_LOG_FORMAT", "compact");
        cmd
    }

    /// Run a build expected to succeed.
    pub fn build(&self) {
        self.lathe().assert().success();
    }
}

/// Execution tests need a working strace (present on PATH, and allowed to
/// ptrace in this environment).
pub fn strace_available() -> bool {
    if which::which("strace").is_err() {
        eprintln!("strace not found; skipping execution acceptance test");
        return false;
    }
    let probe = std::process::Command::new("strace")
        .args(["-o", "/dev/null", "-f", "-e", "trace=open,openat", "/bin/sh", "-c", "true"])
        .output();
    match probe {
        Ok(output) if output.status.success() => true,
        _ => {
            eprintln!("strace cannot trace here; skipping execution acceptance test");
            false
        }
    }
}
