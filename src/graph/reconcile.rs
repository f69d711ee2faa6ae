//! Graph reconciliation: merge the run's intended command set into the
//! persisted graph.
//!
//! Commands absent from this run are removed together with their outputs
//! (on disk and in the graph). Commands whose dependency or target set
//! changed are replaced wholesale, which forces a rebuild downstream.
//! Unchanged commands keep their identity and accumulated metadata.

use super::scan::{remove_generated, stat_meta};
use super::{CommandData, FileMeta, Graph, NodeId, NodeKind};
use crate::report::Reporter;
use crate::rules::CommandSpec;
use anyhow::Result;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

pub fn reconcile(
    graph: &mut Graph,
    commands: &[CommandSpec],
    source_files: &BTreeSet<PathBuf>,
    reporter: &Reporter,
) -> Result<()> {
    // register files discovered while globbing
    for path in source_files {
        register_source(graph, path, reporter);
    }

    let previous: BTreeSet<String> = graph
        .node_ids()
        .into_iter()
        .filter(|&id| graph.node(id).is_command())
        .map(|id| graph.node(id).name.clone())
        .collect();
    let current: BTreeSet<String> = commands
        .iter()
        .map(|spec| spec.invocation.clone())
        .collect();

    for name in previous.difference(&current) {
        if let Some(id) = graph.id(name) {
            remove_command(graph, id, reporter);
        }
    }

    for spec in commands {
        match graph.id(&spec.invocation) {
            Some(id) => update_command(graph, id, spec, reporter),
            None => add_command(graph, spec, reporter),
        }
    }
    Ok(())
}

fn register_source(graph: &mut Graph, path: &Path, reporter: &Reporter) -> Option<NodeId> {
    let name = path.to_string_lossy().into_owned();
    if let Some(id) = graph.id(&name) {
        return Some(id);
    }
    let meta = stat_meta(path)?;
    let id = graph.insert(name, NodeKind::Source { meta });
    reporter.file_added(path);
    Some(id)
}

/// Remove a command that no longer exists: delete its generated outputs from
/// disk and graph, and strip those paths from downstream consumers'
/// configured dependency sets so a removed manual dependency surfaces as a
/// configuration problem instead of a silent rebuild.
fn remove_command(graph: &mut Graph, cmd_id: NodeId, reporter: &Reporter) {
    for target in graph.succs(cmd_id).to_vec() {
        if !graph.is_live(target) || !graph.node(target).is_generated() {
            continue;
        }
        drop_generated_output(graph, target, reporter);
    }
    graph.remove_node(cmd_id);
}

/// Delete one generated output, notifying downstream consumers.
fn drop_generated_output(graph: &mut Graph, target: NodeId, reporter: &Reporter) {
    let path = PathBuf::from(&graph.node(target).name);
    for consumer in graph.succs(target).to_vec() {
        if !graph.is_live(consumer) {
            continue;
        }
        if let Some(data) = graph.node_mut(consumer).command_mut() {
            data.conf_deps.remove(&path);
            data.manual_deps.remove(&path);
        }
    }
    remove_generated(graph, target, reporter, true);
}

fn add_command(graph: &mut Graph, spec: &CommandSpec, reporter: &Reporter) {
    let data = CommandData::new(
        spec.invocation.clone(),
        spec.conf_deps.clone(),
        spec.manual_deps.clone(),
        spec.targets.clone(),
        spec.location.clone(),
    );
    let cmd_id = graph.insert(spec.invocation.clone(), NodeKind::Command { data });
    link_command(graph, cmd_id, spec, reporter);
}

fn update_command(graph: &mut Graph, cmd_id: NodeId, spec: &CommandSpec, reporter: &Reporter) {
    let data = graph
        .node(cmd_id)
        .command()
        .expect("command node without data")
        .clone();

    if data.conf_deps != spec.conf_deps || data.targets != spec.targets {
        // replaced: outputs that are no longer declared go away, then the
        // node is rebuilt from scratch (fresh nodes are born dirty)
        for gone in data.targets.difference(&spec.targets) {
            if let Some(target) = graph.id(&gone.to_string_lossy()) {
                if graph.node(target).is_generated() {
                    drop_generated_output(graph, target, reporter);
                }
            }
        }
        graph.remove_node(cmd_id);
        add_command(graph, spec, reporter);
    } else {
        // unchanged: refresh diagnostics and re-create whatever the scan
        // pass dropped (a deleted target node, a pruned edge)
        if let Some(data) = graph.node_mut(cmd_id).command_mut() {
            data.location = spec.location.clone();
        }
        link_command(graph, cmd_id, spec, reporter);
    }
}

/// Ensure target and dependency nodes exist and are wired to the command.
fn link_command(graph: &mut Graph, cmd_id: NodeId, spec: &CommandSpec, reporter: &Reporter) {
    for target in &spec.targets {
        let name = target.to_string_lossy().into_owned();
        let target_id = match graph.id(&name) {
            Some(id) if graph.node(id).is_generated() => {
                if let NodeKind::Generated { producer, .. } = &mut graph.node_mut(id).kind {
                    *producer = cmd_id;
                }
                id
            }
            Some(_) => {
                // the path used to be an ordinary source; it is owned by
                // this command now
                graph.insert(
                    name,
                    NodeKind::Generated {
                        meta: FileMeta::default(),
                        producer: cmd_id,
                    },
                )
            }
            None => graph.insert(
                name,
                NodeKind::Generated {
                    meta: stat_meta(target).unwrap_or_default(),
                    producer: cmd_id,
                },
            ),
        };
        graph.add_edge(cmd_id, target_id);
    }

    for dep in &spec.conf_deps {
        if let Some(dep_id) = graph
            .id(&dep.to_string_lossy())
            .or_else(|| register_source(graph, dep, reporter))
        {
            graph.add_edge(dep_id, cmd_id);
        }
    }
}
