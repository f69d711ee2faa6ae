//! Persistent dependency graph.
//!
//! Nodes live in an arena addressed by small integer ids, with a name→id
//! lookup table and adjacency lists of ids. Edges run dependency→command and
//! command→generated-file. The arena is the one artifact persisted across
//! runs; transient build state is skipped during serialization, so loading
//! resets it for free. A removed node tombstones its slot; the arena is
//! compacted when saved.

pub mod reconcile;
pub mod scan;

use crate::error::BuildError;
use crate::hash::ContentHash;
use crate::rules::RuleLocation;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub type NodeId = u32;

/// Metadata tracked for every real file node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FileMeta {
    /// Last seen modification time, nanoseconds since the epoch.
    pub mtime: i64,
    pub digest: Option<ContentHash>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandData {
    pub invocation: String,
    /// Configured dependencies: matched sources plus manual dependencies.
    pub conf_deps: BTreeSet<PathBuf>,
    pub manual_deps: BTreeSet<PathBuf>,
    pub targets: BTreeSet<PathBuf>,
    /// Digest of the invocation text, one half of the cache key.
    pub hash: ContentHash,
    pub location: RuleLocation,
}

impl CommandData {
    pub fn new(
        invocation: String,
        conf_deps: BTreeSet<PathBuf>,
        manual_deps: BTreeSet<PathBuf>,
        targets: BTreeSet<PathBuf>,
        location: RuleLocation,
    ) -> Self {
        let hash = ContentHash::of_str(&invocation);
        Self {
            invocation,
            conf_deps,
            manual_deps,
            targets,
            hash,
            location,
        }
    }

    /// Sorted targets joined for display, the way progress lines name a job.
    pub fn display(&self) -> String {
        if self.targets.is_empty() {
            self.invocation.clone()
        } else {
            self.targets
                .iter()
                .map(|t| t.display().to_string())
                .collect::<Vec<_>>()
                .join(" ")
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeKind {
    Source { meta: FileMeta },
    Generated { meta: FileMeta, producer: NodeId },
    Command { data: CommandData },
}

/// Per-run build state; reset whenever the graph is loaded.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildState {
    pub dirty: bool,
    /// Producing commands not yet completed (generated files only).
    pub pending: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Absolute path, or the invocation text for command nodes.
    pub name: String,
    pub kind: NodeKind,
    #[serde(skip)]
    pub state: BuildState,
}

impl Node {
    pub fn is_command(&self) -> bool {
        matches!(self.kind, NodeKind::Command { .. })
    }

    pub fn is_generated(&self) -> bool {
        matches!(self.kind, NodeKind::Generated { .. })
    }

    pub fn is_source(&self) -> bool {
        matches!(self.kind, NodeKind::Source { .. })
    }

    pub fn file_meta(&self) -> Option<&FileMeta> {
        match &self.kind {
            NodeKind::Source { meta } | NodeKind::Generated { meta, .. } => Some(meta),
            NodeKind::Command { .. } => None,
        }
    }

    pub fn file_meta_mut(&mut self) -> Option<&mut FileMeta> {
        match &mut self.kind {
            NodeKind::Source { meta } | NodeKind::Generated { meta, .. } => Some(meta),
            NodeKind::Command { .. } => None,
        }
    }

    pub fn producer(&self) -> Option<NodeId> {
        match &self.kind {
            NodeKind::Generated { producer, .. } => Some(*producer),
            _ => None,
        }
    }

    pub fn command(&self) -> Option<&CommandData> {
        match &self.kind {
            NodeKind::Command { data } => Some(data),
            _ => None,
        }
    }

    pub fn command_mut(&mut self) -> Option<&mut CommandData> {
        match &mut self.kind {
            NodeKind::Command { data } => Some(data),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct Graph {
    nodes: Vec<Option<Node>>,
    index: HashMap<String, NodeId>,
    preds: Vec<Vec<NodeId>>,
    succs: Vec<Vec<NodeId>>,
}

/// On-disk form: compacted nodes plus a flat edge list.
#[derive(Serialize, Deserialize)]
struct PersistedGraph {
    nodes: Vec<Node>,
    edges: Vec<(NodeId, NodeId)>,
}

impl Graph {
    pub fn id(&self, name: &str) -> Option<NodeId> {
        self.index.get(name).copied()
    }

    pub fn is_live(&self, id: NodeId) -> bool {
        self.nodes
            .get(id as usize)
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    pub fn node(&self, id: NodeId) -> &Node {
        self.nodes[id as usize].as_ref().expect("stale node id")
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes[id as usize].as_mut().expect("stale node id")
    }

    /// Live node ids in arena order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|_| i as NodeId))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Insert a node, replacing the payload (but keeping the edges) of an
    /// existing node with the same name. Fresh or replaced payloads start
    /// dirty, like any node the previous run never confirmed clean.
    pub fn insert(&mut self, name: String, kind: NodeKind) -> NodeId {
        if let Some(&id) = self.index.get(&name) {
            let node = self.nodes[id as usize].as_mut().expect("stale index entry");
            node.kind = kind;
            node.state.dirty = true;
            return id;
        }
        let id = self.nodes.len() as NodeId;
        self.nodes.push(Some(Node {
            name: name.clone(),
            kind,
            state: BuildState {
                dirty: true,
                pending: 0,
            },
        }));
        self.preds.push(Vec::new());
        self.succs.push(Vec::new());
        self.index.insert(name, id);
        id
    }

    pub fn add_edge(&mut self, from: NodeId, to: NodeId) {
        if !self.succs[from as usize].contains(&to) {
            self.succs[from as usize].push(to);
            self.preds[to as usize].push(from);
        }
    }

    pub fn has_edge(&self, from: NodeId, to: NodeId) -> bool {
        self.succs[from as usize].contains(&to)
    }

    pub fn preds(&self, id: NodeId) -> &[NodeId] {
        &self.preds[id as usize]
    }

    pub fn succs(&self, id: NodeId) -> &[NodeId] {
        &self.succs[id as usize]
    }

    pub fn remove_node(&mut self, id: NodeId) {
        let Some(node) = self.nodes[id as usize].take() else {
            return;
        };
        self.index.remove(&node.name);
        for pred in std::mem::take(&mut self.preds[id as usize]) {
            self.succs[pred as usize].retain(|&s| s != id);
        }
        for succ in std::mem::take(&mut self.succs[id as usize]) {
            self.preds[succ as usize].retain(|&p| p != id);
        }
    }

    /// Kahn's algorithm over the live nodes; deterministic (id order) so
    /// runs are reproducible. A leftover node means a cycle, which is a
    /// configuration error.
    pub fn topological_sort(&self) -> Result<Vec<NodeId>> {
        let mut indegree: HashMap<NodeId, usize> = HashMap::new();
        let mut queue = VecDeque::new();
        for id in self.node_ids() {
            let degree = self.preds[id as usize].len();
            indegree.insert(id, degree);
            if degree == 0 {
                queue.push_back(id);
            }
        }

        let mut order = Vec::with_capacity(indegree.len());
        while let Some(id) = queue.pop_front() {
            order.push(id);
            for &succ in &self.succs[id as usize] {
                let degree = indegree.get_mut(&succ).expect("edge to unknown node");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(succ);
                }
            }
        }

        if order.len() != indegree.len() {
            let ordered: HashSet<NodeId> = order.iter().copied().collect();
            let stuck = self
                .node_ids()
                .into_iter()
                .find(|id| !ordered.contains(id))
                .expect("cycle without a stuck node");
            return Err(BuildError::Cycle(self.node(stuck).name.clone()).into());
        }
        Ok(order)
    }

    /// Every node reachable backwards from the seeds, seeds included.
    pub fn backward_closure(&self, seeds: &[NodeId]) -> HashSet<NodeId> {
        let mut seen: HashSet<NodeId> = seeds.iter().copied().collect();
        let mut queue: VecDeque<NodeId> = seeds.iter().copied().collect();
        while let Some(id) = queue.pop_front() {
            for &pred in self.preds(id) {
                if seen.insert(pred) {
                    queue.push_back(pred);
                }
            }
        }
        seen
    }

    /// Load the persisted graph; unreadable or corrupt state means first run.
    pub fn load(path: &Path) -> Graph {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(_) => {
                debug!("no prior build graph at {}", path.display());
                return Graph::default();
            }
        };
        let persisted: PersistedGraph = match serde_json::from_slice(&bytes) {
            Ok(persisted) => persisted,
            Err(err) => {
                debug!("discarding unreadable build graph: {err}");
                return Graph::default();
            }
        };

        let mut graph = Graph {
            preds: vec![Vec::new(); persisted.nodes.len()],
            succs: vec![Vec::new(); persisted.nodes.len()],
            ..Graph::default()
        };
        for (i, node) in persisted.nodes.into_iter().enumerate() {
            graph.index.insert(node.name.clone(), i as NodeId);
            graph.nodes.push(Some(node));
        }
        for (from, to) in persisted.edges {
            if graph.is_live(from) && graph.is_live(to) {
                graph.add_edge(from, to);
            }
        }
        graph
    }

    /// Compact the arena and write it atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut remap: HashMap<NodeId, NodeId> = HashMap::new();
        for id in self.node_ids() {
            remap.insert(id, remap.len() as NodeId);
        }

        let mut nodes = Vec::with_capacity(remap.len());
        for id in self.node_ids() {
            let mut node = self.node(id).clone();
            if let NodeKind::Generated { producer, .. } = &mut node.kind {
                *producer = *remap.get(producer).expect("generated file lost its producer");
            }
            nodes.push(node);
        }

        let mut edges = Vec::new();
        for id in self.node_ids() {
            for &succ in self.succs(id) {
                edges.push((remap[&id], remap[&succ]));
            }
        }

        let persisted = PersistedGraph { nodes, edges };
        let bytes = serde_json::to_vec(&persisted).context("failed to serialize build graph")?;

        let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
        fs::write(&tmp, &bytes)
            .with_context(|| format!("failed to write build graph to {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("failed to move build graph into {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn loc() -> RuleLocation {
        RuleLocation {
            file: PathBuf::from("Lathefile"),
            line: 1,
        }
    }

    fn command(name: &str) -> NodeKind {
        NodeKind::Command {
            data: CommandData::new(
                name.to_string(),
                BTreeSet::new(),
                BTreeSet::new(),
                BTreeSet::new(),
                loc(),
            ),
        }
    }

    fn source() -> NodeKind {
        NodeKind::Source {
            meta: FileMeta::default(),
        }
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut graph = Graph::default();
        let a = graph.insert("/p/a.c".into(), source());
        assert_eq!(graph.id("/p/a.c"), Some(a));
        assert!(graph.node(a).state.dirty);
        assert_eq!(graph.len(), 1);

        // inserting the same name replaces the payload, keeps the id
        let a2 = graph.insert("/p/a.c".into(), source());
        assert_eq!(a, a2);
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_edges_deduplicated() {
        let mut graph = Graph::default();
        let a = graph.insert("/p/a.c".into(), source());
        let c = graph.insert("cc a.c".into(), command("cc a.c"));
        graph.add_edge(a, c);
        graph.add_edge(a, c);
        assert_eq!(graph.succs(a), &[c]);
        assert_eq!(graph.preds(c), &[a]);
    }

    #[test]
    fn test_remove_node_clears_edges() {
        let mut graph = Graph::default();
        let a = graph.insert("/p/a.c".into(), source());
        let c = graph.insert("cc a.c".into(), command("cc a.c"));
        let o = graph.insert(
            "/p/a.o".into(),
            NodeKind::Generated {
                meta: FileMeta::default(),
                producer: c,
            },
        );
        graph.add_edge(a, c);
        graph.add_edge(c, o);

        graph.remove_node(c);
        assert!(!graph.is_live(c));
        assert!(graph.succs(a).is_empty());
        assert!(graph.preds(o).is_empty());
        assert_eq!(graph.id("cc a.c"), None);
    }

    #[test]
    fn test_topological_sort_orders_dependencies_first() {
        let mut graph = Graph::default();
        let a = graph.insert("/p/a.c".into(), source());
        let c = graph.insert("cc a.c".into(), command("cc a.c"));
        let o = graph.insert(
            "/p/a.o".into(),
            NodeKind::Generated {
                meta: FileMeta::default(),
                producer: c,
            },
        );
        let link = graph.insert("link".into(), command("link"));
        let so = graph.insert(
            "/p/t.so".into(),
            NodeKind::Generated {
                meta: FileMeta::default(),
                producer: link,
            },
        );
        graph.add_edge(a, c);
        graph.add_edge(c, o);
        graph.add_edge(o, link);
        graph.add_edge(link, so);

        let order = graph.topological_sort().unwrap();
        let pos = |id: NodeId| order.iter().position(|&x| x == id).unwrap();
        assert!(pos(a) < pos(c));
        assert!(pos(c) < pos(o));
        assert!(pos(o) < pos(link));
        assert!(pos(link) < pos(so));
    }

    #[test]
    fn test_cycle_detected() {
        let mut graph = Graph::default();
        let a = graph.insert("a".into(), command("a"));
        let b = graph.insert("b".into(), command("b"));
        graph.add_edge(a, b);
        graph.add_edge(b, a);
        let err = graph.topological_sort().unwrap_err().to_string();
        assert!(err.contains("cycle"), "got: {err}");
    }

    #[test]
    fn test_backward_closure() {
        let mut graph = Graph::default();
        let a = graph.insert("/p/a.c".into(), source());
        let b = graph.insert("/p/b.c".into(), source());
        let ca = graph.insert("cc a".into(), command("cc a"));
        let cb = graph.insert("cc b".into(), command("cc b"));
        let oa = graph.insert(
            "/p/a.o".into(),
            NodeKind::Generated {
                meta: FileMeta::default(),
                producer: ca,
            },
        );
        let ob = graph.insert(
            "/p/b.o".into(),
            NodeKind::Generated {
                meta: FileMeta::default(),
                producer: cb,
            },
        );
        graph.add_edge(a, ca);
        graph.add_edge(ca, oa);
        graph.add_edge(b, cb);
        graph.add_edge(cb, ob);

        let closure = graph.backward_closure(&[oa]);
        assert!(closure.contains(&oa));
        assert!(closure.contains(&ca));
        assert!(closure.contains(&a));
        assert!(!closure.contains(&b));
        assert!(!closure.contains(&ob));
    }

    #[test]
    fn test_save_load_roundtrip_resets_state() {
        let temp = TempDir::new().unwrap();
        let db = temp.path().join("db.json");

        let mut graph = Graph::default();
        let a = graph.insert("/p/a.c".into(), source());
        let c = graph.insert("cc a.c".into(), command("cc a.c"));
        let o = graph.insert(
            "/p/a.o".into(),
            NodeKind::Generated {
                meta: FileMeta {
                    mtime: 42,
                    digest: Some(ContentHash::of_str("a.o")),
                },
                producer: c,
            },
        );
        graph.add_edge(a, c);
        graph.add_edge(c, o);
        graph.node_mut(a).state.dirty = true;
        graph.save(&db).unwrap();

        let loaded = Graph::load(&db);
        assert_eq!(loaded.len(), 3);
        let a2 = loaded.id("/p/a.c").unwrap();
        let c2 = loaded.id("cc a.c").unwrap();
        let o2 = loaded.id("/p/a.o").unwrap();
        // transient state is reset on load
        assert!(!loaded.node(a2).state.dirty);
        // structure and metadata survive
        assert!(loaded.has_edge(a2, c2));
        assert!(loaded.has_edge(c2, o2));
        assert_eq!(loaded.node(o2).file_meta().unwrap().mtime, 42);
        assert_eq!(loaded.node(o2).producer(), Some(c2));
    }

    #[test]
    fn test_save_compacts_tombstones() {
        let temp = TempDir::new().unwrap();
        let db = temp.path().join("db.json");

        let mut graph = Graph::default();
        let a = graph.insert("/p/a.c".into(), source());
        let gone = graph.insert("/p/gone.c".into(), source());
        let c = graph.insert("cc".into(), command("cc"));
        graph.add_edge(a, c);
        graph.remove_node(gone);
        graph.save(&db).unwrap();

        let loaded = Graph::load(&db);
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.id("/p/gone.c"), None);
        let a2 = loaded.id("/p/a.c").unwrap();
        let c2 = loaded.id("cc").unwrap();
        assert!(loaded.has_edge(a2, c2));
    }

    #[test]
    fn test_load_corrupt_state_is_first_run() {
        let temp = TempDir::new().unwrap();
        let db = temp.path().join("db.json");
        fs::write(&db, b"{ not json").unwrap();
        let graph = Graph::load(&db);
        assert!(graph.is_empty());

        let graph = Graph::load(&temp.path().join("absent.json"));
        assert!(graph.is_empty());
    }
}
