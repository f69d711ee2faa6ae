//! Per-command execution on a worker thread.
//!
//! A job first probes the cache with the hashes the scheduler prepared; on a
//! hit the artifacts are copied into place and no process runs. Otherwise
//! the command executes under strace, its successful opens become the
//! observed dependency set, declared targets are verified against it, and
//! the artifacts are stored back into the cache.

use crate::cache::{CacheManager, CacheTier};
use crate::graph::NodeId;
use crate::hash::ContentHash;
use crate::report::Reporter;
use crate::rules::RuleLocation;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// One dispatched command, with everything the worker needs precomputed;
/// workers never touch the graph.
#[derive(Debug)]
pub struct Job {
    pub node: NodeId,
    pub invocation: String,
    pub display: String,
    pub location: RuleLocation,
    pub targets: BTreeSet<PathBuf>,
    pub cmd_hash: ContentHash,
    /// Pre-check fold over the configured dependencies, when computable.
    pub metadata_hash: Option<ContentHash>,
    /// Post-check fold and recorded dependency set from a metadata hit.
    pub probe: Option<CacheProbe>,
}

#[derive(Debug)]
pub struct CacheProbe {
    pub deps_hash: ContentHash,
    pub deps: Vec<PathBuf>,
}

#[derive(Debug)]
pub enum JobFailure {
    Spawn(String),
    CommandFailed { stdout: String, stderr: String },
    TargetNotProduced { missing: Vec<PathBuf> },
}

#[derive(Debug)]
pub struct JobResult {
    pub node: NodeId,
    pub display: String,
    pub location: RuleLocation,
    pub invocation: String,
    pub targets: BTreeSet<PathBuf>,
    pub metadata_hash: Option<ContentHash>,
    pub elapsed: f64,
    pub from_cache: Option<CacheTier>,
    /// Observed dependencies; digests are present after a traced run and
    /// absent after a cache hit (the scheduler re-stats them instead).
    pub deps: Vec<(PathBuf, Option<ContentHash>)>,
    pub failure: Option<JobFailure>,
}

#[derive(Clone)]
pub struct WorkerContext {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub cache: Arc<CacheManager>,
    pub reporter: Arc<Reporter>,
}

pub fn run_job(ctx: &WorkerContext, job: Job) -> JobResult {
    let started = Instant::now();
    ctx.reporter.command_started(&job.invocation);

    // cache probe: skip execution entirely on a validated hit
    if !job.targets.is_empty() {
        if let Some(probe) = &job.probe {
            match ctx.cache.restore_targets(&probe.deps_hash, &job.targets) {
                Ok(Some(tier)) => {
                    return JobResult {
                        deps: probe.deps.iter().map(|p| (p.clone(), None)).collect(),
                        elapsed: started.elapsed().as_secs_f64(),
                        from_cache: Some(tier),
                        failure: None,
                        node: job.node,
                        display: job.display,
                        location: job.location,
                        invocation: job.invocation,
                        targets: job.targets,
                        metadata_hash: job.metadata_hash,
                    };
                }
                Ok(None) => {}
                Err(err) => debug!("cache restore failed, rebuilding: {err:#}"),
            }
        }
    }

    let fail = |failure: JobFailure, elapsed: f64| JobResult {
        deps: Vec::new(),
        elapsed,
        from_cache: None,
        failure: Some(failure),
        node: job.node,
        display: job.display.clone(),
        location: job.location.clone(),
        invocation: job.invocation.clone(),
        targets: job.targets.clone(),
        metadata_hash: job.metadata_hash,
    };

    // each job gets its own trace file so concurrent workers never collide
    let trace_file = match tempfile::Builder::new()
        .prefix("trace-")
        .tempfile_in(&ctx.tmp_dir)
    {
        Ok(file) => file,
        Err(err) => {
            return fail(
                JobFailure::Spawn(format!("failed to create trace file: {err}")),
                started.elapsed().as_secs_f64(),
            )
        }
    };

    let output = Command::new("strace")
        .arg("-f")
        .arg("-e")
        .arg("trace=open,openat")
        .arg("-o")
        .arg(trace_file.path())
        .arg("/bin/sh")
        .arg("-c")
        .arg(&job.invocation)
        .current_dir(&ctx.root)
        .env_clear()
        .env("PATH", "/usr/bin:/bin")
        .envs(std::env::var("HOME").ok().map(|home| ("HOME", home)))
        .output();

    let output = match output {
        Ok(output) => output,
        Err(err) => {
            return fail(
                JobFailure::Spawn(format!("failed to spawn strace: {err}")),
                started.elapsed().as_secs_f64(),
            )
        }
    };

    if !output.status.success() {
        return fail(
            JobFailure::CommandFailed {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            },
            started.elapsed().as_secs_f64(),
        );
    }

    let opened = match crate::exec::trace::parse_trace_file(trace_file.path(), &ctx.root) {
        Ok(opened) => opened,
        Err(err) => {
            return fail(
                JobFailure::Spawn(format!("{err:#}")),
                started.elapsed().as_secs_f64(),
            )
        }
    };

    // hash everything the command touched; directories and files that have
    // already vanished (compiler scratch) drop out here
    let mut observed: Vec<(PathBuf, ContentHash)> = Vec::new();
    for path in opened {
        if path.starts_with(&ctx.state_dir) {
            continue;
        }
        match std::fs::read(&path) {
            Ok(bytes) => observed.push((path, ContentHash::of_bytes(&bytes))),
            Err(_) => continue,
        }
    }

    // every declared target must have been opened by the command
    let missing: Vec<PathBuf> = job
        .targets
        .iter()
        .filter(|target| !observed.iter().any(|(path, _)| path == *target))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return fail(
            JobFailure::TargetNotProduced { missing },
            started.elapsed().as_secs_f64(),
        );
    }

    // targets out; the remainder is the automatic dependency set
    observed.retain(|(path, _)| !job.targets.contains(path));

    if !job.targets.is_empty() {
        let deps_hash = observed
            .iter()
            .fold(job.cmd_hash, |acc, (_, digest)| acc.combine(digest));
        ctx.cache.store_targets(&deps_hash, &job.targets);
    }

    JobResult {
        deps: observed
            .into_iter()
            .map(|(path, digest)| (path, Some(digest)))
            .collect(),
        elapsed: started.elapsed().as_secs_f64(),
        from_cache: None,
        failure: None,
        node: job.node,
        display: job.display,
        location: job.location,
        invocation: job.invocation,
        targets: job.targets,
        metadata_hash: job.metadata_hash,
    }
}
