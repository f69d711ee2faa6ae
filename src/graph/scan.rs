//! Filesystem scan: reflect external modifications and deletions in the
//! graph before reconciliation decides what must rebuild.

use super::{FileMeta, Graph, NodeId};
use crate::hash::ContentHash;
use crate::report::Reporter;
use anyhow::Result;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Re-stat every file node. An mtime change triggers a re-digest; a digest
/// change dirties the node and its producing command. A vanished generated
/// file is removed with its producer dirtied; a vanished source file takes
/// every consuming command's outputs with it.
pub fn scan_filesystem(graph: &mut Graph, reporter: &Reporter) -> Result<()> {
    let file_ids: Vec<NodeId> = graph
        .node_ids()
        .into_iter()
        .filter(|&id| !graph.node(id).is_command())
        .collect();

    for id in file_ids {
        if !graph.is_live(id) {
            // removed by an earlier cascade in this scan
            continue;
        }
        let path = PathBuf::from(&graph.node(id).name);
        match refresh_file(graph, id, &path) {
            Ok(true) => {
                reporter.file_updated(&path);
                for pred in graph.preds(id).to_vec() {
                    graph.node_mut(pred).state.dirty = true;
                }
            }
            Ok(false) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                if graph.node(id).is_generated() {
                    remove_generated(graph, id, reporter, false);
                } else {
                    remove_source(graph, id, reporter);
                }
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Stat and, when the mtime moved, re-digest one file node. Returns whether
/// the content actually changed.
fn refresh_file(graph: &mut Graph, id: NodeId, path: &Path) -> io::Result<bool> {
    let metadata = fs::metadata(path)?;
    if metadata.is_dir() {
        // the path no longer names a file; treat it as gone
        return Err(io::Error::from(io::ErrorKind::NotFound));
    }
    let mtime = mtime_nanos(&metadata);

    let node = graph.node_mut(id);
    let meta = node.file_meta_mut().expect("file node without metadata");
    if mtime == meta.mtime {
        return Ok(false);
    }

    let digest = ContentHash::of_bytes(&fs::read(path)?);
    let changed = meta.digest != Some(digest);
    meta.mtime = mtime;
    meta.digest = Some(digest);
    if changed {
        node.state.dirty = true;
    }
    Ok(changed)
}

/// Drop a generated file from the graph, dirtying its producing command so
/// the chain above it is rebuilt rather than silently skipped.
pub(crate) fn remove_generated(
    graph: &mut Graph,
    id: NodeId,
    reporter: &Reporter,
    delete_from_disk: bool,
) {
    let path = PathBuf::from(&graph.node(id).name);
    reporter.file_deleted(&path);
    for pred in graph.preds(id).to_vec() {
        graph.node_mut(pred).state.dirty = true;
    }
    if delete_from_disk {
        let _ = fs::remove_file(&path);
    }
    graph.remove_node(id);
}

/// A source file vanished: every command consuming it loses its outputs,
/// on disk and in the graph. The consuming commands themselves disappear
/// during reconciliation, once expansion no longer recreates them.
fn remove_source(graph: &mut Graph, id: NodeId, reporter: &Reporter) {
    for consumer in graph.succs(id).to_vec() {
        if !graph.is_live(consumer) || !graph.node(consumer).is_command() {
            continue;
        }
        for target in graph.succs(consumer).to_vec() {
            if graph.is_live(target) && graph.node(target).is_generated() {
                remove_generated(graph, target, reporter, true);
            }
        }
    }
    let path = PathBuf::from(&graph.node(id).name);
    reporter.file_deleted(&path);
    graph.remove_node(id);
}

/// Fresh metadata for a file, or None when it cannot be read as a file.
pub(crate) fn stat_meta(path: &Path) -> Option<FileMeta> {
    let metadata = fs::metadata(path).ok()?;
    if !metadata.is_file() {
        return None;
    }
    let digest = ContentHash::of_bytes(&fs::read(path).ok()?);
    Some(FileMeta {
        mtime: mtime_nanos(&metadata),
        digest: Some(digest),
    })
}

pub(crate) fn mtime_nanos(metadata: &fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{CommandData, NodeKind};
    use crate::rules::RuleLocation;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn loc() -> RuleLocation {
        RuleLocation {
            file: PathBuf::from("Lathefile"),
            line: 1,
        }
    }

    fn command_kind(invocation: &str) -> NodeKind {
        NodeKind::Command {
            data: CommandData::new(
                invocation.to_string(),
                BTreeSet::new(),
                BTreeSet::new(),
                BTreeSet::new(),
                loc(),
            ),
        }
    }

    /// a.c -> [cc] -> a.o, with metadata freshly taken from disk.
    fn build_chain(temp: &TempDir, graph: &mut Graph) -> (NodeId, NodeId, NodeId) {
        let a_c = temp.path().join("a.c");
        let a_o = temp.path().join("a.o");
        fs::write(&a_c, "int a;").unwrap();
        fs::write(&a_o, "obj").unwrap();

        let src = graph.insert(
            a_c.to_string_lossy().into_owned(),
            NodeKind::Source {
                meta: stat_meta(&a_c).unwrap(),
            },
        );
        let cmd = graph.insert("cc a.c".into(), command_kind("cc a.c"));
        let out = graph.insert(
            a_o.to_string_lossy().into_owned(),
            NodeKind::Generated {
                meta: stat_meta(&a_o).unwrap(),
                producer: cmd,
            },
        );
        graph.add_edge(src, cmd);
        graph.add_edge(cmd, out);
        for id in [src, cmd, out] {
            graph.node_mut(id).state.dirty = false;
        }
        (src, cmd, out)
    }

    #[test]
    fn test_unchanged_files_stay_clean() {
        let temp = TempDir::new().unwrap();
        let mut graph = Graph::default();
        let (src, cmd, out) = build_chain(&temp, &mut graph);

        scan_filesystem(&mut graph, &Reporter::new()).unwrap();
        assert!(!graph.node(src).state.dirty);
        assert!(!graph.node(cmd).state.dirty);
        assert!(!graph.node(out).state.dirty);
    }

    #[test]
    fn test_modified_source_marked_dirty() {
        let temp = TempDir::new().unwrap();
        let mut graph = Graph::default();
        let (src, cmd, _) = build_chain(&temp, &mut graph);

        // force an mtime difference regardless of filesystem resolution
        {
            let node = graph.node_mut(src);
            node.file_meta_mut().unwrap().mtime -= 1;
        }
        fs::write(temp.path().join("a.c"), "int a_changed;").unwrap();

        scan_filesystem(&mut graph, &Reporter::new()).unwrap();
        assert!(graph.node(src).state.dirty);
        // the consuming command goes dirty later, during the scheduler walk
        assert!(!graph.node(cmd).state.dirty);
    }

    #[test]
    fn test_touched_but_unchanged_content_stays_clean() {
        let temp = TempDir::new().unwrap();
        let mut graph = Graph::default();
        let (src, _, _) = build_chain(&temp, &mut graph);

        {
            let node = graph.node_mut(src);
            node.file_meta_mut().unwrap().mtime -= 1;
        }

        scan_filesystem(&mut graph, &Reporter::new()).unwrap();
        assert!(!graph.node(src).state.dirty);
    }

    #[test]
    fn test_modified_generated_dirties_producer() {
        let temp = TempDir::new().unwrap();
        let mut graph = Graph::default();
        let (_, cmd, out) = build_chain(&temp, &mut graph);

        {
            let node = graph.node_mut(out);
            node.file_meta_mut().unwrap().mtime -= 1;
        }
        fs::write(temp.path().join("a.o"), "tampered").unwrap();

        scan_filesystem(&mut graph, &Reporter::new()).unwrap();
        assert!(graph.node(out).state.dirty);
        assert!(graph.node(cmd).state.dirty);
    }

    #[test]
    fn test_deleted_generated_removed_and_producer_dirtied() {
        let temp = TempDir::new().unwrap();
        let mut graph = Graph::default();
        let (_, cmd, out) = build_chain(&temp, &mut graph);

        fs::remove_file(temp.path().join("a.o")).unwrap();

        scan_filesystem(&mut graph, &Reporter::new()).unwrap();
        assert!(!graph.is_live(out));
        assert!(graph.node(cmd).state.dirty);
    }

    #[test]
    fn test_deleted_source_cascades_to_outputs() {
        let temp = TempDir::new().unwrap();
        let mut graph = Graph::default();
        let (src, _, out) = build_chain(&temp, &mut graph);

        fs::remove_file(temp.path().join("a.c")).unwrap();

        scan_filesystem(&mut graph, &Reporter::new()).unwrap();
        assert!(!graph.is_live(src));
        assert!(!graph.is_live(out));
        // the generated output is gone from disk too
        assert!(!temp.path().join("a.o").exists());
    }
}
