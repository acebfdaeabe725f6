use std::fs;
use std::path::{Component, Path, PathBuf};

/// Resolves `.` and `..` without touching the filesystem.
pub(super) fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !matches!(
                    out.components().next_back(),
                    None | Some(Component::RootDir) | Some(Component::Prefix(_))
                ) {
                    out.pop();
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// A set of protected or permitted roots, matched by whole path components.
#[derive(Debug, Clone, Default)]
pub(super) struct RootSet {
    roots: Vec<PathBuf>,
}

impl RootSet {
    /// Each configured root contributes its lexical form and, when it exists,
    /// its canonical form, so `/tmp` still covers `/private/tmp/...`.
    pub(super) fn new(paths: &[PathBuf]) -> Self {
        let mut roots = Vec::with_capacity(paths.len());
        for path in paths.iter().filter(|p| !p.as_os_str().is_empty()) {
            let lexical = lexical_normalize(path);
            if let Ok(real) = fs::canonicalize(&lexical) {
                if real != lexical {
                    roots.push(real);
                }
            }
            roots.push(lexical);
        }
        roots.sort();
        roots.dedup();
        RootSet { roots }
    }

    pub(super) fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// First root containing `path`, if any.
    pub(super) fn containing(&self, path: &Path) -> Option<&Path> {
        let path = lexical_normalize(path);
        self.roots
            .iter()
            .find(|root| path.starts_with(root))
            .map(PathBuf::as_path)
    }
}
