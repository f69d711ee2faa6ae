//! Path helpers shared by rule expansion and trace parsing.

use std::path::{Component, Path, PathBuf};

/// Resolve `path` against `base` and normalize `.`/`..` components lexically,
/// without touching the filesystem (symlinks are not resolved).
pub fn absolutize(path: &Path, base: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };

    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Hidden-path check relative to the project root: any `.`-prefixed
/// component below the root keeps a file out of glob registration.
pub fn is_hidden_under(path: &Path, root: &Path) -> bool {
    let rel = match path.strip_prefix(root) {
        Ok(rel) => rel,
        Err(_) => return false,
    };
    rel.components().any(|c| {
        c.as_os_str()
            .to_str()
            .map(|s| s.starts_with('.'))
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolutize_relative() {
        assert_eq!(
            absolutize(Path::new("a/b.c"), Path::new("/root")),
            PathBuf::from("/root/a/b.c")
        );
    }

    #[test]
    fn test_absolutize_normalizes() {
        assert_eq!(
            absolutize(Path::new("./a/../b.c"), Path::new("/root/sub")),
            PathBuf::from("/root/sub/b.c")
        );
        assert_eq!(
            absolutize(Path::new("/x/./y/../z"), Path::new("/ignored")),
            PathBuf::from("/x/z")
        );
    }

    #[test]
    fn test_is_hidden_under() {
        let root = Path::new("/proj");
        assert!(is_hidden_under(Path::new("/proj/.lathe/db.json"), root));
        assert!(is_hidden_under(Path::new("/proj/sub/.git/config"), root));
        assert!(!is_hidden_under(Path::new("/proj/src/a.c"), root));
        // a hidden segment in the root itself does not count
        assert!(!is_hidden_under(
            Path::new("/home/.config/proj/a.c"),
            Path::new("/home/.config/proj")
        ));
    }
}
