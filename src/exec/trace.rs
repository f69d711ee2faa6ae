//! strace output parsing.
//!
//! Commands run under `strace -f -e trace=open,openat -o <file>`; afterwards
//! every successful open names a file the command actually touched. Only the
//! two open syscalls are observed. Relative paths resolve against the
//! project root; transient system locations are dropped.

use crate::paths::absolutize;
use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

const SKIP_PREFIXES: &[&str] = &["/tmp/", "/dev/", "/proc/", "/sys/"];

pub fn parse_trace_file(path: &Path, root: &Path) -> Result<BTreeSet<PathBuf>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read trace output {}", path.display()))?;
    Ok(parse_trace(&text, root))
}

/// Deduplicated set of successfully opened paths.
pub fn parse_trace(text: &str, root: &Path) -> BTreeSet<PathBuf> {
    text.lines()
        .filter_map(|line| parse_line(line, root))
        .collect()
}

// Lines look like:
//   1234 open("/lib/libc.so.6", O_RDONLY|O_CLOEXEC) = 3
//   1234 openat(AT_FDCWD, "a.c", O_RDONLY) = -1 ENOENT (No such file or directory)
//   1234 openat(AT_FDCWD, "/usr/lib/x.so", O_RDONLY|O_CLOEXEC <unfinished ...>
fn parse_line(line: &str, root: &Path) -> Option<PathBuf> {
    let mut tokens = line.split_whitespace();
    let _pid = tokens.next()?;
    let call = tokens.next()?;
    if !call.starts_with("open(") && !call.starts_with("openat(") {
        return None;
    }
    if line.contains("<unfinished") {
        return None;
    }

    let eq = line.rfind(" = ")?;
    let rc: i64 = line[eq + 3..].split_whitespace().next()?.parse().ok()?;
    if rc < 0 {
        return None;
    }

    let raw = extract_quoted(line)?;
    if SKIP_PREFIXES.iter().any(|prefix| raw.starts_with(prefix)) {
        return None;
    }
    Some(absolutize(Path::new(raw), root))
}

fn extract_quoted(line: &str) -> Option<&str> {
    let start = line.find('"')? + 1;
    let end = line[start..].find('"')? + start;
    Some(&line[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: &str = "/proj";

    fn parse(text: &str) -> BTreeSet<PathBuf> {
        parse_trace(text, Path::new(ROOT))
    }

    #[test]
    fn test_successful_opens_collected() {
        let trace = "\
1234 openat(AT_FDCWD, \"/proj/a.c\", O_RDONLY|O_CLOEXEC) = 3
1234 open(\"/proj/a.h\", O_RDONLY) = 4
";
        let opened = parse(trace);
        assert_eq!(opened.len(), 2);
        assert!(opened.contains(Path::new("/proj/a.c")));
        assert!(opened.contains(Path::new("/proj/a.h")));
    }

    #[test]
    fn test_failed_opens_skipped() {
        let trace = "\
1234 openat(AT_FDCWD, \"/proj/missing.h\", O_RDONLY) = -1 ENOENT (No such file or directory)
";
        assert!(parse(trace).is_empty());
    }

    #[test]
    fn test_unfinished_lines_skipped() {
        let trace = "\
1234 openat(AT_FDCWD, \"/usr/lib/x.so\", O_RDONLY|O_CLOEXEC <unfinished ...>
1234 <... openat resumed>) = 3
";
        assert!(parse(trace).is_empty());
    }

    #[test]
    fn test_relative_paths_resolve_against_root() {
        let trace = "1234 openat(AT_FDCWD, \"sub/b.c\", O_RDONLY) = 3\n";
        let opened = parse(trace);
        assert!(opened.contains(Path::new("/proj/sub/b.c")));
    }

    #[test]
    fn test_transient_locations_dropped() {
        let trace = "\
1234 openat(AT_FDCWD, \"/tmp/cc1234.s\", O_RDWR|O_CREAT) = 3
1234 open(\"/dev/null\", O_WRONLY) = 4
1234 openat(AT_FDCWD, \"/proc/self/maps\", O_RDONLY) = 5
1234 openat(AT_FDCWD, \"/sys/devices/x\", O_RDONLY) = 6
1234 openat(AT_FDCWD, \"/proj/real.c\", O_RDONLY) = 7
";
        let opened = parse(trace);
        assert_eq!(opened.len(), 1);
        assert!(opened.contains(Path::new("/proj/real.c")));
    }

    #[test]
    fn test_other_syscalls_ignored() {
        let trace = "\
1234 close(3) = 0
1234 read(3, \"data\", 4096) = 4
";
        assert!(parse(trace).is_empty());
    }

    #[test]
    fn test_duplicates_collapse() {
        let trace = "\
1234 openat(AT_FDCWD, \"/proj/a.h\", O_RDONLY) = 3
1235 openat(AT_FDCWD, \"/proj/a.h\", O_RDONLY) = 4
";
        assert_eq!(parse(trace).len(), 1);
    }
}
