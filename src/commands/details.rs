//! Dependency details for built targets: configured and manual dependencies
//! from the rule, plus the automatically discovered set split into
//! project-local and global files.

use crate::cli::Cli;
use crate::config::Config;
use crate::graph::{Graph, NodeId};
use anyhow::{bail, Context, Result};
use glob::Pattern;
use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::PathBuf;

pub fn run(cli: &Cli) -> Result<()> {
    if cli.targets.is_empty() {
        bail!("--details needs at least one target pattern");
    }

    let root = env::current_dir().context("failed to resolve working directory")?;
    let config = Config::new(root.clone());
    let graph = Graph::load(&config.db_path);
    if graph.is_empty() {
        bail!("no saved build graph; run a build first");
    }

    let mut matched = false;
    for target in &cli.targets {
        // a trailing wildcard so a path prefix selects everything below it
        // (Pattern::matches does not require literal separators)
        let full = crate::paths::absolutize(std::path::Path::new(target), &root);
        let pattern = Pattern::new(&format!("{}*", full.display()))
            .with_context(|| format!("invalid target pattern '{target}'"))?;
        for id in graph.node_ids() {
            let node = graph.node(id);
            if node.is_generated() && pattern.matches(&node.name) {
                matched = true;
                report_target(&graph, id, &root, cli)?;
            }
        }
    }
    if !matched {
        bail!("no generated target matches the requested pattern");
    }
    Ok(())
}

fn report_target(graph: &Graph, target_id: NodeId, root: &PathBuf, cli: &Cli) -> Result<()> {
    let node = graph.node(target_id);
    let producer = node
        .producer()
        .filter(|&id| graph.is_live(id))
        .context("generated file has no producing command")?;
    let data = graph
        .node(producer)
        .command()
        .context("producer is not a command")?;

    let all_deps: BTreeSet<String> = graph
        .preds(producer)
        .iter()
        .map(|&dep| graph.node(dep).name.clone())
        .collect();
    let declared: BTreeSet<String> = data
        .conf_deps
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    let manual: BTreeSet<String> = data
        .manual_deps
        .iter()
        .map(|p| p.display().to_string())
        .collect();

    let configured: Vec<&String> = declared.iter().filter(|d| !manual.contains(*d)).collect();
    let root_prefix = format!("{}/", root.display());
    let (auto_in, auto_global): (Vec<&String>, Vec<&String>) = all_deps
        .iter()
        .filter(|d| !declared.contains(*d))
        .partition(|d| d.starts_with(&root_prefix));

    if let Some(json_path) = &cli.json {
        let document = serde_json::json!({
            "target": node.name,
            "cmd": data.invocation,
            "deps": {
                "configured": configured,
                "manual": manual,
                "auto_in": auto_in,
                "auto_global": auto_global,
            },
        });
        fs::write(json_path, serde_json::to_string(&document)?)
            .with_context(|| format!("failed to write {}", json_path.display()))?;
        return Ok(());
    }

    println!("{}:", node.name);
    println!("\tdeps:");
    for dep in &configured {
        println!("\t\t{dep}");
    }
    for dep in &manual {
        println!("\t\t{dep} (manual)");
    }
    for dep in &auto_in {
        println!("\t\t{dep} (auto)");
    }
    for dep in &auto_global {
        println!("\t\t{dep} (auto, global)");
    }
    println!();
    println!("\tsuccessor targets:");
    for &consumer in graph.succs(target_id) {
        let targets: Vec<String> = graph
            .succs(consumer)
            .iter()
            .map(|&t| graph.node(t).name.clone())
            .collect();
        println!("\t\t{}", targets.join(" "));
    }
    println!();
    println!("\tcmd:");
    println!("\t\t{}", data.invocation);
    println!();
    Ok(())
}
