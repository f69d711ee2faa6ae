//! Rule template expansion.
//!
//! Binds one rule template against the current filesystem state and the set
//! of targets declared by earlier rules, producing concrete command specs.
//! Glob hits that the persisted graph knows as generated files are skipped:
//! reconciliation has not yet confirmed their producing rule this run, so
//! they may be about to disappear. Generated inputs instead enter through
//! the accumulated target set.

use crate::error::BuildError;
use crate::graph::Graph;
use crate::paths::{absolutize, is_hidden_under};
use anyhow::{Context, Result};
use glob::Pattern;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use super::parser::RuleLocation;

#[derive(Debug, Clone)]
pub struct RuleTemplate {
    pub sources_fmt: Vec<String>,
    pub manual_fmt: Vec<String>,
    pub cmd_fmt: String,
    pub targets_fmt: Vec<String>,
    pub foreach: bool,
    pub root: PathBuf,
    pub location: RuleLocation,
}

/// One concrete, fully-bound command.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub invocation: String,
    /// Configured dependency set: matched sources plus manual dependencies.
    pub conf_deps: BTreeSet<PathBuf>,
    pub manual_deps: BTreeSet<PathBuf>,
    pub targets: BTreeSet<PathBuf>,
    pub location: RuleLocation,
}

#[derive(Debug, Default)]
pub struct Expansion {
    pub commands: Vec<CommandSpec>,
    /// Filesystem files seen while globbing, to register as source nodes.
    pub source_files: BTreeSet<PathBuf>,
}

impl RuleTemplate {
    pub fn expand(&self, graph: &Graph, all_targets: &mut BTreeSet<PathBuf>) -> Result<Expansion> {
        let mut expansion = Expansion::default();

        let mut manual_deps = BTreeSet::new();
        for fmt in &self.manual_fmt {
            let pattern = self.pattern_for(fmt)?;
            let matched: Vec<PathBuf> = all_targets
                .iter()
                .filter(|t| pattern.matches_path(t))
                .cloned()
                .collect();
            if matched.is_empty() {
                return Err(BuildError::UnresolvedManualDep {
                    location: self.location.clone(),
                    pattern: fmt.clone(),
                }
                .into());
            }
            manual_deps.extend(matched);
        }

        if self.foreach {
            self.expand_foreach(graph, all_targets, manual_deps, &mut expansion)?;
        } else {
            self.expand_batch(graph, all_targets, manual_deps, &mut expansion)?;
        }
        Ok(expansion)
    }

    /// One command per matched source; targets of earlier rules that match a
    /// source pattern join both the source set and the manual dependencies.
    fn expand_foreach(
        &self,
        graph: &Graph,
        all_targets: &mut BTreeSet<PathBuf>,
        mut manual_deps: BTreeSet<PathBuf>,
        expansion: &mut Expansion,
    ) -> Result<()> {
        for source_fmt in &self.sources_fmt {
            let pattern = self.pattern_for(source_fmt)?;
            let from_targets: BTreeSet<PathBuf> = all_targets
                .iter()
                .filter(|t| pattern.matches_path(t))
                .cloned()
                .collect();
            manual_deps.extend(from_targets.iter().cloned());

            let mut files = self.glob_files(graph, source_fmt, expansion)?;
            files.extend(from_targets);

            for source in files {
                let mut conf_deps = manual_deps.clone();
                conf_deps.insert(source.clone());

                let mut targets = BTreeSet::new();
                let mut last_target = None;
                for target_fmt in &self.targets_fmt {
                    let formatted = format_placeholders(target_fmt, Some(&source), None);
                    let target = absolutize(Path::new(&formatted), &self.root);
                    if all_targets.contains(&target) {
                        return Err(BuildError::DuplicateTarget {
                            location: self.location.clone(),
                            target,
                        }
                        .into());
                    }
                    all_targets.insert(target.clone());
                    last_target = Some(target.display().to_string());
                    targets.insert(target);
                }

                let invocation =
                    format_placeholders(&self.cmd_fmt, Some(&source), last_target.as_deref());
                expansion.commands.push(CommandSpec {
                    invocation,
                    conf_deps,
                    manual_deps: manual_deps.clone(),
                    targets,
                    location: self.location.clone(),
                });
            }
        }
        Ok(())
    }

    /// One command over the sorted union of every matched source. Targets of
    /// earlier rules are folded in only when they live in the pattern's own
    /// directory.
    fn expand_batch(
        &self,
        graph: &Graph,
        all_targets: &mut BTreeSet<PathBuf>,
        manual_deps: BTreeSet<PathBuf>,
        expansion: &mut Expansion,
    ) -> Result<()> {
        let mut sources = BTreeSet::new();
        for source_fmt in &self.sources_fmt {
            sources.extend(self.glob_files(graph, source_fmt, expansion)?);

            let fmt_full = absolutize(Path::new(source_fmt), &self.root);
            let fmt_dir = fmt_full.parent().map(Path::to_path_buf);
            let pattern = self.pattern_for(source_fmt)?;
            for target in all_targets.iter() {
                if target.parent().map(Path::to_path_buf) == fmt_dir
                    && pattern.matches_path(target)
                {
                    sources.insert(target.clone());
                }
            }
        }

        let last_source = sources.iter().next_back().cloned();
        let mut targets = BTreeSet::new();
        for target_fmt in &self.targets_fmt {
            let formatted = format_placeholders(target_fmt, last_source.as_deref(), None);
            let target = absolutize(Path::new(&formatted), &self.root);
            if all_targets.contains(&target) {
                return Err(BuildError::DuplicateTarget {
                    location: self.location.clone(),
                    target,
                }
                .into());
            }
            targets.insert(target);
        }
        all_targets.extend(targets.iter().cloned());

        // the command sees the space-joined, sorted source and target lists
        let joined_sources = join_paths(&sources);
        let joined_targets = join_paths(&targets);
        let invocation = self
            .cmd_fmt
            .replace("{filename}", &joined_sources)
            .replace("{target}", &joined_targets);

        let mut conf_deps = manual_deps.clone();
        conf_deps.extend(sources);
        expansion.commands.push(CommandSpec {
            invocation,
            conf_deps,
            manual_deps,
            targets,
            location: self.location.clone(),
        });
        Ok(())
    }

    fn glob_files(
        &self,
        graph: &Graph,
        fmt: &str,
        expansion: &mut Expansion,
    ) -> Result<BTreeSet<PathBuf>> {
        let full = absolutize(Path::new(fmt), &self.root);
        let mut files = BTreeSet::new();
        let entries = glob::glob(&full.to_string_lossy())
            .with_context(|| format!("{}: invalid glob pattern '{}'", self.location, fmt))?;
        for entry in entries {
            let path = match entry {
                Ok(path) => path,
                Err(_) => continue,
            };
            if !path.is_file() {
                continue;
            }
            let path = absolutize(&path, &self.root);
            if is_hidden_under(&path, &self.root) {
                continue;
            }
            if let Some(id) = graph.id(&path.to_string_lossy()) {
                if graph.node(id).is_generated() {
                    continue;
                }
            }
            expansion.source_files.insert(path.clone());
            files.insert(path);
        }
        Ok(files)
    }

    fn pattern_for(&self, fmt: &str) -> Result<Pattern> {
        let full = absolutize(Path::new(fmt), &self.root);
        Pattern::new(&full.to_string_lossy())
            .with_context(|| format!("{}: invalid pattern '{}'", self.location, fmt))
    }
}

fn join_paths(paths: &BTreeSet<PathBuf>) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Substitute the per-source placeholders. `{target}` is only available in
/// foreach command templates, where it names the last formatted target.
fn format_placeholders(fmt: &str, source: Option<&Path>, target: Option<&str>) -> String {
    let mut out = fmt.to_string();
    if let Some(source) = source {
        let dir = source
            .parent()
            .map(|d| d.display().to_string())
            .unwrap_or_default();
        let basename = source
            .file_name()
            .map(|b| b.to_string_lossy().to_string())
            .unwrap_or_default();
        let noext = source
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        out = out
            .replace("{filename}", &source.display().to_string())
            .replace("{dir}", &dir)
            .replace("{basename}", &basename)
            .replace("{noext}", &noext);
    }
    if let Some(target) = target {
        out = out.replace("{target}", target);
    }
    out
}
