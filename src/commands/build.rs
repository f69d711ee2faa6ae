//! The full build pipeline: load state, scan, expand, reconcile, execute,
//! persist, collect garbage.

use crate::cache::CacheManager;
use crate::cli::Cli;
use crate::config::{self, Config};
use crate::exec::Scheduler;
use crate::graph::{reconcile, scan, Graph};
use crate::paths::absolutize;
use crate::report::Reporter;
use crate::rules;
use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

pub fn run(cli: &Cli) -> Result<()> {
    let started = Instant::now();
    let root = env::current_dir().context("failed to resolve working directory")?;

    let rule_path = root.join(config::RULE_FILE_NAME);
    let parsed = rules::parse_rule_file(&rule_path, &cli.variants)?;

    let mut config = Config::new(root);
    config.apply_directives(&parsed.directives)?;
    config.apply_env()?;
    if let Some(workers) = cli.workers {
        config.workers = workers.max(1);
    }
    config.prepare_dirs()?;

    let reporter = Arc::new(Reporter::new());

    let phase = Instant::now();
    let mut graph = Graph::load(&config.db_path);
    debug!(
        "loaded graph ({} nodes) in {:.3}s",
        graph.len(),
        phase.elapsed().as_secs_f64()
    );

    let phase = Instant::now();
    scan::scan_filesystem(&mut graph, &reporter)?;
    debug!("filesystem scan in {:.3}s", phase.elapsed().as_secs_f64());

    let phase = Instant::now();
    let mut all_targets = BTreeSet::new();
    let mut commands = Vec::new();
    let mut source_files = BTreeSet::new();
    for template in &parsed.templates {
        let expansion = template.expand(&graph, &mut all_targets)?;
        commands.extend(expansion.commands);
        source_files.extend(expansion.source_files);
    }
    reconcile::reconcile(&mut graph, &commands, &source_files, &reporter)?;
    debug!(
        "expanded {} commands and reconciled in {:.3}s",
        commands.len(),
        phase.elapsed().as_secs_f64()
    );

    let cache = Arc::new(CacheManager::from_config(
        &config,
        !cli.no_cache,
        !cli.no_remote_cache,
    )?);

    let requested: Vec<PathBuf> = cli
        .targets
        .iter()
        .map(|target| absolutize(Path::new(target), &config.root))
        .collect();

    let mut scheduler = Scheduler::new(&config, Arc::clone(&cache), Arc::clone(&reporter))?;
    scheduler.execute(&mut graph, &requested)?;
    drop(scheduler);

    graph.save(&config.db_path)?;
    cache.gc();
    reporter.summary(started.elapsed());
    Ok(())
}
