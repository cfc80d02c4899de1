//! Logical to physical path resolution
//!
//! The export root backs the whole logical tree except where a mountpoint
//! override splices another host path in for a subtree.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

/// Export root plus per-subtree overrides
#[derive(Debug, Clone)]
pub struct MountTable {
    /// Host directory backing `/`
    root: PathBuf,
    /// Logical prefix -> physical root, longest prefix wins
    overrides: BTreeMap<PathBuf, PathBuf>,
}

impl MountTable {
    pub fn new(root: PathBuf, overrides: BTreeMap<PathBuf, PathBuf>) -> Self {
        Self { root, overrides }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve an absolute logical path to the host path backing it
    pub fn resolve(&self, logical: &Path) -> PathBuf {
        let best = self
            .overrides
            .iter()
            .filter(|(prefix, _)| logical.starts_with(prefix))
            .max_by_key(|(prefix, _)| prefix.components().count());

        match best {
            Some((prefix, physical)) => {
                let rest = logical.strip_prefix(prefix).unwrap_or(Path::new(""));
                join_relative(physical, rest)
            }
            None => join_relative(&self.root, logical),
        }
    }
}

/// Join `path` onto `base`, dropping root and `..` components
fn join_relative(base: &Path, path: &Path) -> PathBuf {
    let mut out = base.to_path_buf();
    for component in path.components() {
        if let Component::Normal(part) = component {
            out.push(part);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> MountTable {
        let mut overrides = BTreeMap::new();
        overrides.insert(PathBuf::from("/host"), PathBuf::from("/"));
        overrides.insert(PathBuf::from("/host/data"), PathBuf::from("/srv/data"));
        MountTable::new(PathBuf::from("/export"), overrides)
    }

    #[test]
    fn test_plain_paths_use_export_root() {
        let mounts = table();
        assert_eq!(mounts.resolve(Path::new("/")), PathBuf::from("/export"));
        assert_eq!(mounts.resolve(Path::new("/etc/passwd")), PathBuf::from("/export/etc/passwd"));
        assert_eq!(mounts.resolve(Path::new("/hostname")), PathBuf::from("/export/hostname"));
    }

    #[test]
    fn test_override_prefix() {
        let mounts = table();
        assert_eq!(mounts.resolve(Path::new("/host")), PathBuf::from("/"));
        assert_eq!(mounts.resolve(Path::new("/host/etc")), PathBuf::from("/etc"));
    }

    #[test]
    fn test_longest_prefix_wins() {
        let mounts = table();
        assert_eq!(mounts.resolve(Path::new("/host/data/x")), PathBuf::from("/srv/data/x"));
    }

    #[test]
    fn test_parent_components_cannot_escape() {
        let mounts = table();
        assert_eq!(mounts.resolve(Path::new("/../../etc")), PathBuf::from("/export/etc"));
    }
}
