use clap::Parser;
use std::path::PathBuf;

/// Lathe - incremental build orchestrator
///
/// Lathe expands the rules in a `Lathefile` into concrete commands, keeps a
/// dependency graph across runs, discovers real file dependencies by tracing
/// each command's file opens, and reuses artifacts from a two-tier
/// content-addressed build cache.
#[derive(Parser, Debug)]
#[command(name = "lathe")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Incremental build orchestrator", long_about = None)]
pub struct Cli {
    /// Target paths to build (default: everything declared in the Lathefile)
    #[arg(value_name = "TARGET")]
    pub targets: Vec<String>,

    /// Show dependency details for the matching targets instead of building
    #[arg(long)]
    pub details: bool,

    /// Write the detail report as a JSON document to this file
    #[arg(long, value_name = "FILE", requires = "details")]
    pub json: Option<PathBuf>,

    /// Build the named variant (repeatable)
    #[arg(long = "variant", value_name = "NAME")]
    pub variants: Vec<String>,

    /// Disable the local artifact cache
    #[arg(long, env = "LATHE_NO_CACHE")]
    pub no_cache: bool,

    /// Disable the remote cache tier
    #[arg(long, env = "LATHE_NO_REMOTE_CACHE")]
    pub no_remote_cache: bool,

    /// Number of worker threads
    #[arg(long, env = "LATHE_WORKERS", value_name = "N")]
    pub workers: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_default_invocation() {
        let cli = Cli::parse_from(["lathe"]);
        assert!(cli.targets.is_empty());
        assert!(!cli.details);
        assert!(cli.variants.is_empty());
    }

    #[test]
    fn test_parse_targets_and_flags() {
        let cli = Cli::parse_from(["lathe", "out/a.o", "out/b.o", "--no-cache", "--variant", "test"]);
        assert_eq!(cli.targets, vec!["out/a.o", "out/b.o"]);
        assert!(cli.no_cache);
        assert_eq!(cli.variants, vec!["test"]);
    }

    #[test]
    fn test_json_requires_details() {
        assert!(Cli::try_parse_from(["lathe", "a.o", "--json", "out.json"]).is_err());
        assert!(Cli::try_parse_from(["lathe", "a.o", "--details", "--json", "out.json"]).is_ok());
    }
}
