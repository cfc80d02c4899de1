//! Capability interface consumed by the protocol engine

use std::ffi::OsStr;
use std::path::{Component, Path};

use crate::error::Result;
use crate::fs::overlay::{EntryHandle, LogicalId, SetAttributes};

/// Filesystem-wide counters reported to clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsStats {
    pub read_only: bool,
    /// Recorded, not enforced
    pub size_quota: Option<u64>,
    /// Recorded, not enforced
    pub entries_quota: Option<u64>,
    /// Entries currently tracked
    pub entries: usize,
}

/// Operations a network filesystem server performs on an export.
///
/// Every method taking an [`EntryHandle`] expects one previously returned by
/// the same filesystem instance.
pub trait FileSystem: Send + Sync {
    /// Instance id embedded in file handles
    fn fsid(&self) -> u64;

    fn root(&self) -> EntryHandle;

    /// Resolve a decoded file handle id
    fn entry_by_id(&self, id: LogicalId) -> Result<EntryHandle>;

    /// Re-stat an entry and return fresh attributes
    fn getattr(&self, entry: &EntryHandle) -> Result<EntryHandle>;

    fn statfs(&self) -> FsStats;

    fn lookup(&self, dir: &EntryHandle, name: &OsStr) -> Result<EntryHandle>;

    /// Every member of `dir`, `.` and `..` first
    fn list(&self, dir: &EntryHandle) -> Result<Vec<EntryHandle>>;

    fn create_directory(
        &self,
        dir: &EntryHandle,
        name: &OsStr,
        attrs: &SetAttributes,
    ) -> Result<EntryHandle>;

    fn remove_directory(&self, entry: &EntryHandle) -> Result<()>;

    /// Move `entry` to `new_name` inside `new_parent`, returning it re-resolved
    fn rename(
        &self,
        entry: &EntryHandle,
        new_parent: &EntryHandle,
        new_name: &OsStr,
    ) -> Result<EntryHandle>;

    fn create_file(
        &self,
        dir: &EntryHandle,
        name: &OsStr,
        attrs: &SetAttributes,
    ) -> Result<EntryHandle>;

    fn remove(&self, entry: &EntryHandle) -> Result<()>;

    fn read(&self, entry: &EntryHandle, offset: u64, count: usize) -> Result<Vec<u8>>;

    fn write(&self, entry: &EntryHandle, offset: u64, data: &[u8]) -> Result<usize>;

    fn read_link(&self, entry: &EntryHandle) -> Result<Vec<u8>>;

    fn create_symlink(
        &self,
        dir: &EntryHandle,
        name: &OsStr,
        attrs: &SetAttributes,
        target: &OsStr,
    ) -> Result<EntryHandle>;

    fn set_attributes(&self, entry: &EntryHandle, attrs: &SetAttributes) -> Result<EntryHandle>;

    /// Resolve an absolute logical path by walking lookups from the root
    fn resolve_path(&self, path: &Path) -> Result<EntryHandle> {
        let mut current = self.root();
        for component in path.components() {
            if let Component::Normal(name) = component {
                current = self.lookup(&current, name)?;
            }
        }
        Ok(current)
    }
}
