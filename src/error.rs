//! Fatal build error taxonomy.
//!
//! Configuration errors abort before any command executes; execution errors
//! abort the run after in-flight jobs drain. Cache trouble is never fatal and
//! therefore has no variant here.

use crate::rules::RuleLocation;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("{location}: {reason}")]
    Config { location: RuleLocation, reason: String },

    #[error("{location}: manual dependency '{pattern}' does not match any target declared by another rule")]
    UnresolvedManualDep { location: RuleLocation, pattern: String },

    #[error("{location}: target {} is already declared by another rule; two rules can't generate the same target", .target.display())]
    DuplicateTarget { location: RuleLocation, target: PathBuf },

    #[error("requested variant '{0}' is not declared in the rule file")]
    UnknownVariant(String),

    #[error("dependency cycle detected at '{0}'")]
    Cycle(String),

    #[error("command failed at {location}:\n\t{invocation}\n{stderr}")]
    CommandFailed {
        location: RuleLocation,
        invocation: String,
        stderr: String,
    },

    #[error("{location}: command exited successfully but never opened its declared {}: {}", if .missing.len() == 1 { "target" } else { "targets" }, join_paths(.missing))]
    TargetNotProduced {
        location: RuleLocation,
        missing: Vec<PathBuf>,
    },

    #[error("{} is generated by {producer} but consumed at {consumer} without being declared; add it as a manual dependency (after '|') in the consuming rule", .dep.display())]
    UndeclaredGeneratedDep {
        dep: PathBuf,
        producer: RuleLocation,
        consumer: RuleLocation,
    },
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn loc(line: u32) -> RuleLocation {
        RuleLocation {
            file: PathBuf::from("Lathefile"),
            line,
        }
    }

    #[test]
    fn test_messages_carry_rule_location() {
        let err = BuildError::UnresolvedManualDep {
            location: loc(7),
            pattern: "proto/*.h".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("Lathefile:7"));
        assert!(msg.contains("proto/*.h"));
    }

    #[test]
    fn test_undeclared_generated_dep_names_both_rules() {
        let err = BuildError::UndeclaredGeneratedDep {
            dep: Path::new("/p/gen.h").to_path_buf(),
            producer: loc(1),
            consumer: loc(4),
        };
        let msg = err.to_string();
        assert!(msg.contains("Lathefile:1"));
        assert!(msg.contains("Lathefile:4"));
        assert!(msg.contains("manual dependency"));
    }
}
