//! Lexical path normalization shared by the safety gate and the working set.

use std::path::{Component, Path, PathBuf};

/// Resolve `requested` against `base` and collapse `.`/`..` components
/// without touching the filesystem, so paths that do not exist yet (write
/// targets) normalize the same way as existing ones.
///
/// `..` never climbs above the root.
pub fn normalize_path(base: &Path, requested: &str) -> PathBuf {
    let expanded = expand_home(requested);
    let joined = if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    };

    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

/// Normalized path rendered as a string key.
pub fn normalize_key(base: &Path, requested: &str) -> String {
    normalize_path(base, requested).to_string_lossy().into_owned()
}

fn expand_home(requested: &str) -> PathBuf {
    if let Some(rest) = requested.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(requested)
}

/// Lowercased file extension, if any.
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_joined_with_base() {
        let p = normalize_path(Path::new("/work"), "src/main.rs");
        assert_eq!(p, PathBuf::from("/work/src/main.rs"));
    }

    #[test]
    fn test_dot_segments_collapse() {
        let p = normalize_path(Path::new("/work"), "./src/../lib/./a.rs");
        assert_eq!(p, PathBuf::from("/work/lib/a.rs"));
    }

    #[test]
    fn test_parent_cannot_escape_root() {
        let p = normalize_path(Path::new("/"), "../../etc/passwd");
        assert_eq!(p, PathBuf::from("/etc/passwd"));
    }

    #[test]
    fn test_traversal_out_of_base_is_visible() {
        let p = normalize_path(Path::new("/work/project"), "../../etc/shadow");
        assert_eq!(p, PathBuf::from("/etc/shadow"));
    }

    #[test]
    fn test_same_file_different_spellings() {
        let base = Path::new("/work");
        assert_eq!(
            normalize_key(base, "a/b.txt"),
            normalize_key(base, "/work/a/./c/../b.txt")
        );
    }

    #[test]
    fn test_extension_lowercased() {
        assert_eq!(extension_of(Path::new("/k/id_rsa.PEM")), Some("pem".to_string()));
        assert_eq!(extension_of(Path::new("/k/Makefile")), None);
    }
}
