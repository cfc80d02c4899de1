//! Overlay filesystem over a host directory tree
//!
//! Tracks every host object a client has seen, hands out logical ids for
//! them and performs all host I/O relative to open directory descriptors.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::ExportConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::fs::capability::{FileSystem, FsStats};

use super::{
    entry::{Entry, EntryHandle, FileKind, SetAttributes},
    host::{self, set_fd_attrs, HostDir},
    inode::{InodeAllocator, InodeKey, LogicalId},
    mounts::MountTable,
};

/// Largest read served in one call
pub const MAX_READ: usize = 4 * 1024 * 1024;

/// Default mode of directories created without an explicit mode
const DEFAULT_DIR_MODE: u32 = 0o700;

/// Default mode of files created without an explicit mode
const DEFAULT_FILE_MODE: u32 = 0o644;

const DOT: &str = ".";
const DOTDOT: &str = "..";

fn is_link_name(name: &OsStr) -> bool {
    name == DOT || name == DOTDOT
}

/// Reject names that cannot denote a single new member of a directory
fn check_new_name(name: &OsStr) -> Result<()> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.contains(&b'/') || bytes.contains(&0) {
        return Err(Error::fs(
            ErrorKind::PermissionDenied,
            format!("invalid name {:?}", name),
        ));
    }
    if is_link_name(name) {
        return Err(Error::fs(ErrorKind::AlreadyExists, format!("{:?}", name)));
    }
    Ok(())
}

fn untracked(id: LogicalId) -> Error {
    Error::fs(ErrorKind::StaleHandle, format!("inode {} is not tracked", id))
}

/// Open a regular file for I/O, refusing anything else found under its name
fn open_regular(path: &Path, write: bool) -> Result<File> {
    let (dir, name) = HostDir::open_parent(path).map_err(|e| Error::host("open", path, e))?;
    let file = dir
        .open_file(name, write)
        .map_err(|e| Error::host("open", path, e))?;
    let meta = file.metadata().map_err(|e| Error::host("fstat", path, e))?;
    if !meta.is_file() {
        return Err(Error::fs(
            ErrorKind::GenericIo,
            format!("{:?} is no longer a regular file", path),
        ));
    }
    Ok(file)
}

/// Mutable bookkeeping, guarded by one lock per filesystem
struct FsState {
    entries: HashMap<LogicalId, Entry>,
    inodes: InodeAllocator,
    root: LogicalId,
}

impl FsState {
    fn get(&self, id: LogicalId) -> Result<&Entry> {
        self.entries.get(&id).ok_or_else(|| untracked(id))
    }

    fn get_mut(&mut self, id: LogicalId) -> Result<&mut Entry> {
        self.entries.get_mut(&id).ok_or_else(|| untracked(id))
    }

    fn require_dir(&self, id: LogicalId) -> Result<&Entry> {
        let entry = self.get(id)?;
        if entry.kind != FileKind::Directory {
            return Err(Error::fs(
                ErrorKind::NotADirectory,
                format!("{:?}", entry.logical_path),
            ));
        }
        Ok(entry)
    }

    /// Stat the object at `logical` and take a reference on its entry,
    /// creating the entry on first sight.
    fn observe(
        &mut self,
        mounts: &MountTable,
        logical: PathBuf,
        parent: Option<LogicalId>,
    ) -> Result<LogicalId> {
        let physical = mounts.resolve(&logical);
        let meta = host::lstat(&physical).map_err(|e| Error::host("lstat", &physical, e))?;

        let key = InodeKey::new(meta.dev(), meta.ino());
        let id = self.inodes.acquire(key);

        let entry = self.entries.entry(id).or_insert_with(|| {
            debug!("add entry: inode={}: {:?}", id, physical);
            Entry::new(id, key, logical, physical, parent, &meta)
        });
        if entry.key != key {
            return Err(Error::fault(
                "observe",
                format!("inode {} maps to {:?}, not {:?}", id, entry.key, key),
            ));
        }
        entry.refresh(&meta);
        entry.refs += 1;
        debug!("get entry: inode={} refs={}: {:?}", id, entry.refs, entry.physical_path);

        Ok(id)
    }

    /// Drop one reference; entries reaching zero are forgotten along with
    /// their cached children.
    fn release(&mut self, id: LogicalId) {
        let mut pending = vec![id];

        while let Some(id) = pending.pop() {
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            entry.refs = entry.refs.saturating_sub(1);
            debug!("dec entry: inode={} refs={}: {:?}", id, entry.refs, entry.physical_path);
            if entry.refs > 0 || id == self.root {
                continue;
            }

            if let Some(entry) = self.entries.remove(&id) {
                debug!("put entry: inode={}: {:?}", id, entry.physical_path);
                self.inodes.release(entry.key);
                pending.extend(
                    entry
                        .children
                        .iter()
                        .filter(|(name, _)| !is_link_name(name))
                        .map(|(_, child)| *child),
                );
            }
        }
    }

    /// Forget a directory's cached members
    fn drop_children(&mut self, id: LogicalId) {
        let children = match self.entries.get_mut(&id) {
            Some(entry) => std::mem::take(&mut entry.children),
            None => return,
        };
        for (name, child) in children {
            if !is_link_name(&name) {
                self.release(child);
            }
        }
    }

    /// Rebuild the children cache of directory `id` from a fresh listing
    fn fill_children(&mut self, mounts: &MountTable, id: LogicalId) -> Result<()> {
        let dir = self.get(id)?;
        if dir.kind != FileKind::Directory {
            return Ok(());
        }

        let parent = dir
            .parent
            .filter(|p| self.entries.contains_key(p))
            .unwrap_or(self.root);
        let logical = dir.logical_path.clone();
        let names = HostDir::open(&dir.physical_path)
            .and_then(|dir| dir.list())
            .map_err(|e| Error::host("readdir", &dir.physical_path, e))?;

        let mut old = std::mem::take(&mut self.get_mut(id)?.children);
        let mut fresh = std::collections::BTreeMap::new();
        fresh.insert(OsString::from(DOT), id);
        fresh.insert(OsString::from(DOTDOT), parent);

        for name in names {
            if let Some(child) = old.remove(&name) {
                if self.entries.contains_key(&child) {
                    fresh.insert(name, child);
                    continue;
                }
            }
            match self.observe(mounts, logical.join(&name), Some(id)) {
                Ok(child) => {
                    fresh.insert(name, child);
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("skipping {:?} in {:?}: {}", name, logical, e),
            }
        }

        for (name, child) in old {
            if !is_link_name(&name) {
                self.release(child);
            }
        }

        self.get_mut(id)?.children = fresh;
        Ok(())
    }

    /// Member `name` of directory `id`, listing the directory on first use
    fn child(
        &mut self,
        mounts: &MountTable,
        id: LogicalId,
        name: &OsStr,
    ) -> Result<Option<LogicalId>> {
        if self.require_dir(id)?.children.is_empty() {
            self.fill_children(mounts, id)?;
        }
        Ok(self.get(id)?.children.get(name).copied())
    }

    /// Record `child` as member `name` of `dir`, replacing any previous member
    fn attach(&mut self, dir: LogicalId, name: &OsStr, child: LogicalId) -> Result<()> {
        let previous = self.get_mut(dir)?.children.insert(name.to_os_string(), child);
        if let Some(previous) = previous.filter(|p| *p != child) {
            self.release(previous);
        }
        Ok(())
    }

    /// Remove `id` from its parent's members and drop the parent's reference
    fn detach(&mut self, id: LogicalId) -> Result<()> {
        let entry = self.get(id)?;
        let (parent, name) = (entry.parent, entry.name.clone());

        if let Some(parent) = parent.and_then(|p| self.entries.get_mut(&p)) {
            if parent.children.get(&name) == Some(&id) {
                parent.children.remove(&name);
            }
        }
        self.release(id);
        Ok(())
    }

    /// Snapshot of `id`, optionally exposed under a synthetic name
    fn snapshot(&self, fsid: u64, id: LogicalId, name: Option<&OsStr>) -> Result<EntryHandle> {
        let entry = self.get(id)?;
        Ok(match name {
            Some(name) => EntryHandle::capture(fsid, &entry.link(name)),
            None => EntryHandle::capture(fsid, entry),
        })
    }
}

/// Host directory tree exported as a filesystem
pub struct OverlayFs {
    fsid: u64,
    read_only: bool,
    size_quota: Option<u64>,
    entries_quota: Option<u64>,
    mounts: MountTable,
    state: Mutex<FsState>,
}

impl OverlayFs {
    /// Create a new overlay filesystem with instance id `fsid`
    pub fn new(config: &ExportConfig, fsid: u64) -> Result<Self> {
        let mounts = MountTable::new(config.root.clone(), config.mountpoints.clone());

        let mut state = FsState {
            entries: HashMap::new(),
            inodes: InodeAllocator::new(),
            root: LogicalId(0),
        };
        let root = state.observe(&mounts, PathBuf::from("/"), None)?;
        if state.get(root)?.kind != FileKind::Directory {
            return Err(Error::InvalidConfig(format!(
                "Export root is not a directory: {:?}",
                config.root
            )));
        }
        state.root = root;

        debug!("export {:?} as fsid {} (read_only={})", config.root, fsid, config.read_only);

        Ok(Self {
            fsid,
            read_only: config.read_only,
            size_quota: config.size_quota,
            entries_quota: config.entries_quota,
            mounts,
            state: Mutex::new(state),
        })
    }

    /// Host path backing a tracked entry
    #[cfg(test)]
    fn physical_path(&self, entry: &EntryHandle) -> Result<PathBuf> {
        self.verify_owned(entry)?;
        Ok(self.state.lock().get(entry.fileid)?.physical_path.clone())
    }

    /// Reject handles minted by another filesystem instance
    fn verify_owned(&self, entry: &EntryHandle) -> Result<()> {
        if entry.fsid != self.fsid {
            return Err(Error::fs(
                ErrorKind::GenericIo,
                format!("handle for fsid {} used on fsid {}", entry.fsid, self.fsid),
            ));
        }
        Ok(())
    }

    fn verify_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::fs(ErrorKind::ReadOnlyFilesystem, "filesystem is read-only"));
        }
        Ok(())
    }

    /// Shared tail of the create operations: track the new member and
    /// return it
    fn track_new(
        &self,
        state: &mut FsState,
        dir: LogicalId,
        name: &OsStr,
    ) -> Result<EntryHandle> {
        let logical = state.get(dir)?.logical_path.join(name);
        let id = state.observe(&self.mounts, logical, Some(dir))?;
        state.attach(dir, name, id)?;
        state.snapshot(self.fsid, id, None)
    }

    /// Fail with AlreadyExists if `dir` already has a member `name`
    fn ensure_absent(&self, state: &mut FsState, dir: LogicalId, name: &OsStr) -> Result<()> {
        if state.child(&self.mounts, dir, name)?.is_some() {
            return Err(Error::fs(ErrorKind::AlreadyExists, format!("{:?}", name)));
        }
        Ok(())
    }
}

impl FileSystem for OverlayFs {
    fn fsid(&self) -> u64 {
        self.fsid
    }

    fn root(&self) -> EntryHandle {
        let state = self.state.lock();
        let root = &state.entries[&state.root];
        EntryHandle::capture(self.fsid, root)
    }

    fn entry_by_id(&self, id: LogicalId) -> Result<EntryHandle> {
        self.state.lock().snapshot(self.fsid, id, None)
    }

    fn getattr(&self, entry: &EntryHandle) -> Result<EntryHandle> {
        debug!("getattr(ino={})", entry.fileid);
        self.verify_owned(entry)?;

        let mut state = self.state.lock();
        let tracked = state.get_mut(entry.fileid)?;
        let meta = host::lstat(&tracked.physical_path)
            .map_err(|e| Error::host("getattr", &tracked.physical_path, e))?;
        tracked.refresh(&meta);
        state.snapshot(self.fsid, entry.fileid, None)
    }

    fn statfs(&self) -> FsStats {
        FsStats {
            read_only: self.read_only,
            size_quota: self.size_quota,
            entries_quota: self.entries_quota,
            entries: self.state.lock().entries.len(),
        }
    }

    fn lookup(&self, dir: &EntryHandle, name: &OsStr) -> Result<EntryHandle> {
        debug!("lookup(dir={}, name={:?})", dir.fileid, name);
        self.verify_owned(dir)?;

        let mut state = self.state.lock();
        let found = match state.child(&self.mounts, dir.fileid, name)? {
            Some(id) => Some(id),
            None => {
                // The host may have gained the name since the last listing
                state.fill_children(&self.mounts, dir.fileid)?;
                state.get(dir.fileid)?.children.get(name).copied()
            }
        };

        match found {
            Some(id) => state.snapshot(self.fsid, id, Some(name)),
            None => Err(Error::fs(ErrorKind::NotFound, format!("{:?}", name))),
        }
    }

    fn list(&self, dir: &EntryHandle) -> Result<Vec<EntryHandle>> {
        debug!("readdir(dir={})", dir.fileid);
        self.verify_owned(dir)?;

        let mut state = self.state.lock();
        state.require_dir(dir.fileid)?;
        state.fill_children(&self.mounts, dir.fileid)?;

        let children = &state.get(dir.fileid)?.children;
        let mut out = Vec::with_capacity(children.len());
        for link in [DOT, DOTDOT] {
            let name = OsStr::new(link);
            if let Some(id) = children.get(name) {
                out.push(state.snapshot(self.fsid, *id, Some(name))?);
            }
        }
        for (name, id) in children.iter().filter(|(name, _)| !is_link_name(name)) {
            out.push(state.snapshot(self.fsid, *id, Some(name.as_os_str()))?);
        }
        Ok(out)
    }

    fn create_directory(
        &self,
        dir: &EntryHandle,
        name: &OsStr,
        attrs: &SetAttributes,
    ) -> Result<EntryHandle> {
        debug!("mkdir(dir={}, name={:?})", dir.fileid, name);
        self.verify_owned(dir)?;
        self.verify_writable()?;
        check_new_name(name)?;

        let mut state = self.state.lock();
        self.ensure_absent(&mut state, dir.fileid, name)?;

        let parent_path = state.get(dir.fileid)?.physical_path.clone();
        let path = parent_path.join(name);
        let parent =
            HostDir::open(&parent_path).map_err(|e| Error::host("open", &parent_path, e))?;
        parent
            .mkdir(name, attrs.mode.unwrap_or(DEFAULT_DIR_MODE))
            .map_err(|e| Error::host("mkdir", &path, e))?;
        // By reference, so a mode without read permission can still be applied
        let created = parent.open_node(name).map_err(|e| Error::host("open", &path, e))?;
        created
            .set_attrs(attrs)
            .map_err(|e| Error::host("setattr", &path, e))?;

        self.track_new(&mut state, dir.fileid, name)
    }

    fn remove_directory(&self, entry: &EntryHandle) -> Result<()> {
        debug!("rmdir(ino={})", entry.fileid);
        self.verify_owned(entry)?;
        self.verify_writable()?;

        let mut state = self.state.lock();
        let target = state.require_dir(entry.fileid)?;
        if entry.fileid == state.root {
            return Err(Error::fs(
                ErrorKind::DirectoryNotEmpty,
                "trying to remove the root directory",
            ));
        }

        let path = target.physical_path.clone();
        let (parent, name) =
            HostDir::open_parent(&path).map_err(|e| Error::host("open", &path, e))?;
        parent.rmdir(name).map_err(|e| Error::host("rmdir", &path, e))?;

        state.detach(entry.fileid)
    }

    fn rename(
        &self,
        entry: &EntryHandle,
        new_parent: &EntryHandle,
        new_name: &OsStr,
    ) -> Result<EntryHandle> {
        debug!(
            "rename(ino={}, to_dir={}, name={:?})",
            entry.fileid, new_parent.fileid, new_name
        );
        self.verify_owned(entry)?;
        self.verify_owned(new_parent)?;
        self.verify_writable()?;
        check_new_name(new_name)?;

        let mut state = self.state.lock();
        state.require_dir(new_parent.fileid)?;
        let source_id = entry.fileid;
        if source_id == state.root {
            return Err(Error::fs(
                ErrorKind::OperationNotPermitted,
                "trying to rename the root directory",
            ));
        }

        // Populate the destination so the new member has somewhere to live
        let replaced = state.child(&self.mounts, new_parent.fileid, new_name)?;

        let source = state.get(source_id)?;
        let (old_parent, old_name) = (source.parent, source.name.clone());
        let source_path = source.physical_path.clone();
        let dest_path = state.get(new_parent.fileid)?.physical_path.clone();

        let (from, name) =
            HostDir::open_parent(&source_path).map_err(|e| Error::host("open", &source_path, e))?;
        let to = HostDir::open(&dest_path).map_err(|e| Error::host("open", &dest_path, e))?;
        from.rename(name, &to, new_name)
            .map_err(|e| Error::host("rename", &source_path, e))?;

        if old_parent == Some(new_parent.fileid) && old_name.as_os_str() == new_name {
            drop(state);
            return self.getattr(entry);
        }

        if let Some(replaced) = replaced.filter(|r| *r != source_id) {
            state.get_mut(new_parent.fileid)?.children.remove(new_name);
            state.release(replaced);
        }

        let logical = state.get(new_parent.fileid)?.logical_path.join(new_name);
        let id = state.observe(&self.mounts, logical.clone(), Some(new_parent.fileid))?;
        if id == source_id {
            let physical = self.mounts.resolve(&logical);
            let moved = state.get_mut(id)?;
            moved.name = new_name.to_os_string();
            moved.logical_path = logical;
            moved.physical_path = physical;
            moved.parent = Some(new_parent.fileid);
            if moved.kind == FileKind::Directory {
                // Cached members still point at the old location
                state.drop_children(id);
            }
        }
        state.attach(new_parent.fileid, new_name, id)?;

        if let Some(parent) = old_parent.and_then(|p| state.entries.get_mut(&p)) {
            if parent.children.get(&old_name) == Some(&source_id) {
                parent.children.remove(&old_name);
            }
        }
        state.release(source_id);

        state.snapshot(self.fsid, id, None)
    }

    fn create_file(
        &self,
        dir: &EntryHandle,
        name: &OsStr,
        attrs: &SetAttributes,
    ) -> Result<EntryHandle> {
        debug!("create_file(dir={}, name={:?})", dir.fileid, name);
        self.verify_owned(dir)?;
        self.verify_writable()?;
        check_new_name(name)?;

        let mut state = self.state.lock();
        self.ensure_absent(&mut state, dir.fileid, name)?;

        let parent_path = state.get(dir.fileid)?.physical_path.clone();
        let path = parent_path.join(name);
        let parent =
            HostDir::open(&parent_path).map_err(|e| Error::host("open", &parent_path, e))?;
        let file = parent
            .create_file(name, attrs.mode.unwrap_or(DEFAULT_FILE_MODE))
            .map_err(|e| Error::host("create", &path, e))?;
        set_fd_attrs(&file, attrs).map_err(|e| Error::host("setattr", &path, e))?;
        drop(file);

        self.track_new(&mut state, dir.fileid, name)
    }

    fn remove(&self, entry: &EntryHandle) -> Result<()> {
        debug!("remove(ino={})", entry.fileid);
        self.verify_owned(entry)?;
        self.verify_writable()?;

        let mut state = self.state.lock();
        let target = state.get(entry.fileid)?;
        if target.kind == FileKind::Directory {
            return Err(Error::fs(
                ErrorKind::IsADirectory,
                format!("{:?}", target.logical_path),
            ));
        }

        let path = target.physical_path.clone();
        let (parent, name) =
            HostDir::open_parent(&path).map_err(|e| Error::host("open", &path, e))?;
        parent.unlink(name).map_err(|e| Error::host("remove", &path, e))?;

        state.detach(entry.fileid)
    }

    fn read(&self, entry: &EntryHandle, offset: u64, count: usize) -> Result<Vec<u8>> {
        debug!("read(ino={}, offset={}, count={})", entry.fileid, offset, count);
        self.verify_owned(entry)?;

        let mut state = self.state.lock();
        let target = state.get_mut(entry.fileid)?;
        if target.kind != FileKind::Regular {
            return Err(Error::fs(ErrorKind::GenericIo, "not a regular file"));
        }

        let path = target.physical_path.clone();
        let host_err = |op: &str, e| Error::host(op, &path, e);
        let file = open_regular(&path, false)?;

        let mut buf = vec![0u8; count.min(MAX_READ)];
        let mut filled = 0;
        while filled < buf.len() {
            let n = file
                .read_at(&mut buf[filled..], offset + filled as u64)
                .map_err(|e| host_err("read", e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);

        let meta = file.metadata().map_err(|e| host_err("fstat", e))?;
        target.refresh(&meta);
        Ok(buf)
    }

    fn write(&self, entry: &EntryHandle, offset: u64, data: &[u8]) -> Result<usize> {
        debug!("write(ino={}, offset={}, len={})", entry.fileid, offset, data.len());
        self.verify_owned(entry)?;
        self.verify_writable()?;

        let mut state = self.state.lock();
        let target = state.get_mut(entry.fileid)?;
        if target.kind != FileKind::Regular {
            return Err(Error::fs(ErrorKind::GenericIo, "not a regular file"));
        }

        let path = target.physical_path.clone();
        let host_err = |op: &str, e| Error::host(op, &path, e);
        let file = open_regular(&path, true)?;
        file.write_all_at(data, offset).map_err(|e| host_err("write", e))?;

        let meta = file.metadata().map_err(|e| host_err("fstat", e))?;
        target.refresh(&meta);
        Ok(data.len())
    }

    fn read_link(&self, entry: &EntryHandle) -> Result<Vec<u8>> {
        debug!("readlink(ino={})", entry.fileid);
        self.verify_owned(entry)?;

        let state = self.state.lock();
        let target = state.get(entry.fileid)?;
        if target.kind != FileKind::Symlink {
            return Err(Error::fs(ErrorKind::GenericIo, "not a symlink"));
        }

        let path = &target.physical_path;
        let (parent, name) =
            HostDir::open_parent(path).map_err(|e| Error::host("open", path, e))?;
        let link = parent
            .readlink(name)
            .map_err(|e| Error::host("readlink", path, e))?;
        Ok(link)
    }

    fn create_symlink(
        &self,
        dir: &EntryHandle,
        name: &OsStr,
        attrs: &SetAttributes,
        target: &OsStr,
    ) -> Result<EntryHandle> {
        debug!("symlink(dir={}, name={:?}, target={:?})", dir.fileid, name, target);
        self.verify_owned(dir)?;
        self.verify_writable()?;
        check_new_name(name)?;

        let mut state = self.state.lock();
        self.ensure_absent(&mut state, dir.fileid, name)?;

        let parent_path = state.get(dir.fileid)?.physical_path.clone();
        let path = parent_path.join(name);
        let parent =
            HostDir::open(&parent_path).map_err(|e| Error::host("open", &parent_path, e))?;
        parent
            .symlink(target, name)
            .map_err(|e| Error::host("symlink", &path, e))?;
        if !attrs.is_empty() {
            parent
                .set_link_attrs_at(name, attrs)
                .map_err(|e| Error::host("setattr", &path, e))?;
        }

        self.track_new(&mut state, dir.fileid, name)
    }

    fn set_attributes(&self, entry: &EntryHandle, attrs: &SetAttributes) -> Result<EntryHandle> {
        debug!("setattr(ino={}, attrs={:?})", entry.fileid, attrs);
        self.verify_owned(entry)?;
        self.verify_writable()?;

        let mut state = self.state.lock();
        let target = state.get_mut(entry.fileid)?;
        let path = target.physical_path.clone();
        let meta =
            host::set_path_attrs(&path, attrs).map_err(|e| Error::host("setattr", &path, e))?;

        target.refresh(&meta);
        state.snapshot(self.fsid, entry.fileid, None)
    }
}

impl std::fmt::Debug for OverlayFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayFs")
            .field("fsid", &self.fsid)
            .field("root", &self.mounts.root())
            .field("read_only", &self.read_only)
            .finish()
    }
}
