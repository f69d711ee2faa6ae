//! Dependency-gated parallel scheduler.
//!
//! One scheduler thread walks the graph in topological order and owns every
//! graph mutation. A fixed pool of worker threads consumes command jobs from
//! a bounded queue and pushes results into a completion queue; results are
//! applied in completion order, readiness is tracked purely by per-target
//! pending-producer counts. The first failure stops dispatch, lets in-flight
//! jobs drain, and aborts the run.

use crate::cache::{CacheManager, MetadataRecord};
use crate::config::Config;
use crate::error::BuildError;
use crate::exec::executor::{self, CacheProbe, Job, JobFailure, JobResult, WorkerContext};
use crate::graph::{scan, Graph, NodeId, NodeKind};
use crate::hash::ContentHash;
use crate::report::Reporter;
use anyhow::{bail, Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::debug;

const JOB_QUEUE_DEPTH: usize = 1024;

pub struct Scheduler {
    jobs_tx: Option<Sender<Job>>,
    done_rx: Receiver<JobResult>,
    workers: Vec<JoinHandle<()>>,
    cache: Arc<CacheManager>,
    reporter: Arc<Reporter>,
    inflight: usize,
}

impl Scheduler {
    pub fn new(config: &Config, cache: Arc<CacheManager>, reporter: Arc<Reporter>) -> Result<Self> {
        let (jobs_tx, jobs_rx) = bounded::<Job>(JOB_QUEUE_DEPTH);
        let (done_tx, done_rx) = unbounded::<JobResult>();

        let context = WorkerContext {
            root: config.root.clone(),
            state_dir: config.state_dir.clone(),
            tmp_dir: config.tmp_dir.clone(),
            cache: Arc::clone(&cache),
            reporter: Arc::clone(&reporter),
        };

        let mut workers = Vec::with_capacity(config.workers);
        for i in 0..config.workers {
            let jobs_rx = jobs_rx.clone();
            let done_tx = done_tx.clone();
            let context = context.clone();
            let handle = thread::Builder::new()
                .name(format!("lathe-worker-{i}"))
                .spawn(move || {
                    while let Ok(job) = jobs_rx.recv() {
                        let result = executor::run_job(&context, job);
                        if done_tx.send(result).is_err() {
                            break;
                        }
                    }
                })
                .context("failed to spawn worker thread")?;
            workers.push(handle);
        }

        Ok(Self {
            jobs_tx: Some(jobs_tx),
            done_rx,
            workers,
            cache,
            reporter,
            inflight: 0,
        })
    }

    /// Run every dirty command reachable in this build. With explicit
    /// targets, only their backward closure is considered.
    pub fn execute(&mut self, graph: &mut Graph, requested: &[PathBuf]) -> Result<()> {
        let result = self.walk(graph, requested);
        if result.is_err() {
            // stop dispatching; jobs already handed out run to completion
            while self.inflight > 0 {
                match self.done_rx.recv() {
                    Ok(_) => self.inflight -= 1,
                    Err(_) => break,
                }
            }
        }
        result
    }

    fn walk(&mut self, graph: &mut Graph, requested: &[PathBuf]) -> Result<()> {
        let order = graph.topological_sort()?;
        let restrict = self.restriction(graph, requested)?;

        for id in order {
            if !graph.is_live(id) {
                continue;
            }
            if let Some(allowed) = &restrict {
                if !allowed.contains(&id) {
                    continue;
                }
            }
            if !graph.node(id).state.dirty {
                continue;
            }

            // a generated file is ready only once every outstanding
            // producer job has completed
            while graph.node(id).state.pending > 0 {
                self.apply_one(graph)?;
            }

            let is_command = graph.node(id).is_command();
            for succ in graph.succs(id).to_vec() {
                let node = graph.node_mut(succ);
                node.state.dirty = true;
                if is_command {
                    node.state.pending += 1;
                }
            }

            if is_command {
                let job = self.prepare_job(graph, id);
                self.dispatch(job)?;
            }
        }

        while self.inflight > 0 {
            self.apply_one(graph)?;
        }
        Ok(())
    }

    /// Resolve explicit target paths into the backward closure that seeds
    /// the restricted walk.
    fn restriction(
        &self,
        graph: &Graph,
        requested: &[PathBuf],
    ) -> Result<Option<HashSet<NodeId>>> {
        if requested.is_empty() {
            return Ok(None);
        }
        let mut seeds = Vec::with_capacity(requested.len());
        for path in requested {
            match graph.id(&path.to_string_lossy()) {
                Some(id) => seeds.push(id),
                None => bail!("unknown target {}", path.display()),
            }
        }
        Ok(Some(graph.backward_closure(&seeds)))
    }

    fn dispatch(&mut self, job: Job) -> Result<()> {
        let jobs_tx = self.jobs_tx.as_ref().expect("scheduler already shut down");
        jobs_tx
            .send(job)
            .map_err(|_| anyhow::anyhow!("worker pool is gone"))?;
        self.inflight += 1;
        Ok(())
    }

    /// Block for one completed job and merge its outcome into the graph.
    fn apply_one(&mut self, graph: &mut Graph) -> Result<()> {
        let result = self
            .done_rx
            .recv()
            .context("worker pool stopped unexpectedly")?;
        self.inflight -= 1;
        self.apply_result(graph, result)
    }

    fn prepare_job(&mut self, graph: &mut Graph, id: NodeId) -> Job {
        let data = graph
            .node(id)
            .command()
            .expect("dispatched node is not a command")
            .clone();

        let metadata_hash = self.fold_deps(graph, data.hash, data.conf_deps.iter());
        let probe = match &metadata_hash {
            Some(metadata_hash) if !data.targets.is_empty() => {
                self.cache.probe_metadata(metadata_hash).and_then(|record| {
                    let deps_hash = self.fold_deps(graph, data.hash, record.deps.iter());
                    deps_hash.map(|deps_hash| CacheProbe {
                        deps_hash,
                        deps: record.deps,
                    })
                })
            }
            _ => None,
        };

        Job {
            node: id,
            invocation: data.invocation.clone(),
            display: data.display(),
            location: data.location.clone(),
            targets: data.targets.clone(),
            cmd_hash: data.hash,
            metadata_hash,
            probe,
        }
    }

    /// XOR-fold dependency content digests into the invocation digest.
    /// Dependencies the graph has never seen are registered on the fly; a
    /// path with no obtainable digest makes the fold (and so the cache
    /// probe) unavailable.
    fn fold_deps<'a>(
        &self,
        graph: &mut Graph,
        base: ContentHash,
        paths: impl IntoIterator<Item = &'a PathBuf>,
    ) -> Option<ContentHash> {
        let mut acc = base;
        for path in paths {
            let digest = match graph.id(&path.to_string_lossy()) {
                Some(id) => graph.node(id).file_meta().and_then(|meta| meta.digest),
                None => match scan::stat_meta(path) {
                    Some(meta) => {
                        let digest = meta.digest;
                        graph.insert(path.to_string_lossy().into_owned(), NodeKind::Source { meta });
                        self.reporter.file_added(path);
                        digest
                    }
                    None => None,
                },
            };
            match digest {
                Some(digest) => acc = acc.combine(&digest),
                None => return None,
            }
        }
        Some(acc)
    }

    fn apply_result(&self, graph: &mut Graph, result: JobResult) -> Result<()> {
        if let Some(failure) = result.failure {
            return Err(match failure {
                JobFailure::Spawn(message) => BuildError::CommandFailed {
                    location: result.location,
                    invocation: result.invocation,
                    stderr: message,
                }
                .into(),
                JobFailure::CommandFailed { stdout, stderr } => {
                    self.reporter.command_output(&stdout, &stderr);
                    BuildError::CommandFailed {
                        location: result.location,
                        invocation: result.invocation,
                        stderr,
                    }
                    .into()
                }
                JobFailure::TargetNotProduced { missing } => BuildError::TargetNotProduced {
                    location: result.location,
                    missing,
                }
                .into(),
            });
        }

        let cmd_id = result.node;
        graph.node_mut(cmd_id).state.dirty = false;

        for (dep, digest) in &result.deps {
            let dep_id = match graph.id(&dep.to_string_lossy()) {
                Some(dep_id) => {
                    // an automatically discovered dependency that some other
                    // rule generates must be declared manually, or ordering
                    // cannot be guaranteed
                    if graph.node(dep_id).is_generated() && !graph.has_edge(dep_id, cmd_id) {
                        let producer = graph
                            .node(dep_id)
                            .producer()
                            .filter(|&p| graph.is_live(p))
                            .and_then(|p| graph.node(p).command())
                            .map(|data| data.location.clone())
                            .unwrap_or_else(|| result.location.clone());
                        return Err(BuildError::UndeclaredGeneratedDep {
                            dep: dep.clone(),
                            producer,
                            consumer: result.location.clone(),
                        }
                        .into());
                    }
                    match digest {
                        Some(digest) => update_meta(graph, dep_id, dep, *digest),
                        None => refresh_meta(graph, dep_id, dep),
                    }
                    dep_id
                }
                None => match scan::stat_meta(dep) {
                    Some(meta) => {
                        let dep_id = graph
                            .insert(dep.to_string_lossy().into_owned(), NodeKind::Source { meta });
                        self.reporter.file_added(dep);
                        dep_id
                    }
                    // the file was opened during the build but is already
                    // gone again; nothing to track
                    None => continue,
                },
            };
            graph.add_edge(dep_id, cmd_id);
        }

        for target in &result.targets {
            if let Some(target_id) = graph.id(&target.to_string_lossy()) {
                {
                    let node = graph.node_mut(target_id);
                    node.state.pending = node.state.pending.saturating_sub(1);
                }
                refresh_meta(graph, target_id, target);
            }
        }

        if !result.targets.is_empty() {
            if let Some(metadata_hash) = &result.metadata_hash {
                let record = MetadataRecord {
                    deps: result.deps.iter().map(|(path, _)| path.clone()).collect(),
                };
                self.cache.store_metadata(metadata_hash, &record);
            }
        }

        self.reporter
            .command_finished(&result.display, result.elapsed, result.from_cache);
        Ok(())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // closing the job queue lets the workers run dry and exit
        drop(self.jobs_tx.take());
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                debug!("worker thread panicked during shutdown");
            }
        }
    }
}

/// Record a freshly observed digest together with the file's current mtime.
fn update_meta(graph: &mut Graph, id: NodeId, path: &Path, digest: ContentHash) {
    let mtime = fs::metadata(path)
        .map(|metadata| scan::mtime_nanos(&metadata))
        .unwrap_or(0);
    if let Some(meta) = graph.node_mut(id).file_meta_mut() {
        meta.mtime = mtime;
        meta.digest = Some(digest);
    }
}

/// Re-stat and re-digest a file node from disk.
fn refresh_meta(graph: &mut Graph, id: NodeId, path: &Path) {
    if let Some(fresh) = scan::stat_meta(path) {
        if let Some(meta) = graph.node_mut(id).file_meta_mut() {
            *meta = fresh;
        }
    }
}
