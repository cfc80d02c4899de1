//! In-memory entry model
//!
//! An [`Entry`] is a snapshot of one host object plus its place in the
//! exported tree. [`EntryLink`] is a borrowed view over an entry exposing a
//! different name, used for the `.` and `..` members of a directory.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use super::inode::{InodeKey, LogicalId};

/// Kind of host object backing an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    Directory,
    Regular,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
}

impl FileKind {
    /// Derive the kind from host mode bits; unknown types read as regular
    pub fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT as u32 {
            m if m == libc::S_IFDIR as u32 => FileKind::Directory,
            m if m == libc::S_IFLNK as u32 => FileKind::Symlink,
            m if m == libc::S_IFCHR as u32 => FileKind::CharDevice,
            m if m == libc::S_IFBLK as u32 => FileKind::BlockDevice,
            m if m == libc::S_IFIFO as u32 => FileKind::Fifo,
            m if m == libc::S_IFSOCK as u32 => FileKind::Socket,
            _ => FileKind::Regular,
        }
    }

    /// NFSv3 `ftype3` value
    pub fn nfs_type(&self) -> u32 {
        match self {
            FileKind::Regular => 1,
            FileKind::Directory => 2,
            FileKind::BlockDevice => 3,
            FileKind::CharDevice => 4,
            FileKind::Symlink => 5,
            FileKind::Socket => 6,
            FileKind::Fifo => 7,
        }
    }
}

/// Cached host metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryAttributes {
    pub mode: u32,
    pub size: u64,
    pub blocks: u64,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    /// Major and minor numbers for device nodes, zero otherwise
    pub rdev: (u32, u32),
    pub blksize: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl EntryAttributes {
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            mode: meta.mode(),
            size: meta.size(),
            blocks: meta.blocks(),
            nlink: meta.nlink(),
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: split_dev(meta.rdev()),
            blksize: meta.blksize(),
            atime: unix_time(meta.atime(), meta.atime_nsec()),
            mtime: unix_time(meta.mtime(), meta.mtime_nsec()),
            ctime: unix_time(meta.ctime(), meta.ctime_nsec()),
        }
    }

    /// Permission bits without the file type
    pub fn perm(&self) -> u32 {
        self.mode & 0o7777
    }
}

/// Split a glibc-encoded device number into (major, minor)
fn split_dev(dev: u64) -> (u32, u32) {
    if dev == 0 {
        return (0, 0);
    }
    let major = ((dev >> 32) & 0xffff_f000) | ((dev >> 8) & 0x0000_0fff);
    let minor = ((dev >> 12) & 0xffff_ff00) | (dev & 0x0000_00ff);
    (major as u32, minor as u32)
}

fn unix_time(secs: i64, nsecs: i64) -> SystemTime {
    let nanos = Duration::from_nanos(nsecs.clamp(0, 999_999_999) as u64);
    if secs >= 0 {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs as u64) + nanos
    } else {
        SystemTime::UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()) + nanos
    }
}

/// Timestamp requested by a set-attributes call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetTime {
    /// Use the host clock at the time of the call
    ServerCurrent,
    /// Use a client-supplied time
    Client(SystemTime),
}

/// Attributes to apply on create or set-attributes.
///
/// `None` leaves the corresponding host attribute untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetAttributes {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mode: Option<u32>,
    pub atime: Option<SetTime>,
    pub mtime: Option<SetTime>,
}

impl SetAttributes {
    pub fn is_empty(&self) -> bool {
        self == &SetAttributes::default()
    }
}

/// Read access shared by concrete entries and links
pub trait FsEntry {
    fn logical_id(&self) -> LogicalId;
    fn name(&self) -> &OsStr;
    fn kind(&self) -> FileKind;
    fn attrs(&self) -> &EntryAttributes;
    fn parent(&self) -> Option<LogicalId>;
}

/// A tracked host object
#[derive(Debug)]
pub struct Entry {
    pub(crate) id: LogicalId,
    pub(crate) key: InodeKey,
    pub(crate) name: OsString,
    /// Path inside the export, always absolute (`/` is the root)
    pub(crate) logical_path: PathBuf,
    /// Host path backing the entry, resolved once at creation
    pub(crate) physical_path: PathBuf,
    pub(crate) kind: FileKind,
    pub(crate) attrs: EntryAttributes,
    pub(crate) parent: Option<LogicalId>,
    /// Name -> child id, including `.` and `..` once populated
    pub(crate) children: BTreeMap<OsString, LogicalId>,
    pub(crate) refs: u32,
}

impl Entry {
    pub(crate) fn new(
        id: LogicalId,
        key: InodeKey,
        logical_path: PathBuf,
        physical_path: PathBuf,
        parent: Option<LogicalId>,
        meta: &std::fs::Metadata,
    ) -> Self {
        let name = logical_path
            .file_name()
            .map(OsStr::to_os_string)
            .unwrap_or_default();
        let attrs = EntryAttributes::from_metadata(meta);
        Self {
            id,
            key,
            name,
            logical_path,
            physical_path,
            kind: FileKind::from_mode(attrs.mode),
            attrs,
            parent,
            children: BTreeMap::new(),
            refs: 0,
        }
    }

    /// Refresh cached metadata from a fresh host stat
    pub(crate) fn refresh(&mut self, meta: &std::fs::Metadata) {
        self.attrs = EntryAttributes::from_metadata(meta);
        self.kind = FileKind::from_mode(self.attrs.mode);
    }

    /// View of this entry under another name
    pub fn link<'a>(&'a self, name: &'a OsStr) -> EntryLink<'a> {
        EntryLink { base: self, name }
    }
}

impl FsEntry for Entry {
    fn logical_id(&self) -> LogicalId {
        self.id
    }

    fn name(&self) -> &OsStr {
        &self.name
    }

    fn kind(&self) -> FileKind {
        self.kind
    }

    fn attrs(&self) -> &EntryAttributes {
        &self.attrs
    }

    fn parent(&self) -> Option<LogicalId> {
        self.parent
    }
}

/// Synthetic `.`/`..` entry: the base entry with its name replaced
#[derive(Debug, Clone, Copy)]
pub struct EntryLink<'a> {
    base: &'a Entry,
    name: &'a OsStr,
}

impl FsEntry for EntryLink<'_> {
    fn logical_id(&self) -> LogicalId {
        self.base.id
    }

    fn name(&self) -> &OsStr {
        self.name
    }

    fn kind(&self) -> FileKind {
        self.base.kind
    }

    fn attrs(&self) -> &EntryAttributes {
        &self.base.attrs
    }

    fn parent(&self) -> Option<LogicalId> {
        self.base.parent
    }
}

/// Detached snapshot of an entry handed to callers.
///
/// Operations accept it back to identify their target; the snapshot itself
/// never grants access, the owning filesystem re-resolves `fileid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHandle {
    /// Filesystem instance that produced the snapshot
    pub fsid: u64,
    pub fileid: LogicalId,
    pub name: OsString,
    pub kind: FileKind,
    pub attrs: EntryAttributes,
    pub parent: Option<LogicalId>,
}

impl EntryHandle {
    pub fn capture(fsid: u64, entry: &dyn FsEntry) -> Self {
        Self {
            fsid,
            fileid: entry.logical_id(),
            name: entry.name().to_os_string(),
            kind: entry.kind(),
            attrs: entry.attrs().clone(),
            parent: entry.parent(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry_for(path: &std::path::Path) -> Entry {
        let meta = std::fs::symlink_metadata(path).unwrap();
        Entry::new(
            LogicalId(7),
            InodeKey::new(1, 2),
            PathBuf::from("/dir"),
            path.to_path_buf(),
            Some(LogicalId(1)),
            &meta,
        )
    }

    #[test]
    fn test_kind_from_mode() {
        assert_eq!(FileKind::from_mode(libc::S_IFDIR as u32 | 0o755), FileKind::Directory);
        assert_eq!(FileKind::from_mode(libc::S_IFLNK as u32 | 0o777), FileKind::Symlink);
        assert_eq!(FileKind::from_mode(libc::S_IFIFO as u32), FileKind::Fifo);
        assert_eq!(FileKind::from_mode(0o644), FileKind::Regular);
    }

    #[test]
    fn test_split_dev() {
        assert_eq!(split_dev(0), (0, 0));
        // makedev(8, 1)
        assert_eq!(split_dev((8 << 8) | 1), (8, 1));
    }

    #[test]
    fn test_link_overrides_only_name() {
        let dir = tempdir().unwrap();
        let entry = entry_for(dir.path());
        let link = entry.link(OsStr::new(".."));

        assert_eq!(link.name(), OsStr::new(".."));
        assert_eq!(entry.name(), OsStr::new("dir"));
        assert_eq!(link.logical_id(), entry.logical_id());
        assert_eq!(link.kind(), FileKind::Directory);
        assert_eq!(link.attrs(), entry.attrs());
        assert_eq!(link.parent(), Some(LogicalId(1)));
    }

    #[test]
    fn test_handle_capture() {
        let dir = tempdir().unwrap();
        let entry = entry_for(dir.path());
        let handle = EntryHandle::capture(3, &entry.link(OsStr::new(".")));

        assert_eq!(handle.fsid, 3);
        assert_eq!(handle.fileid, LogicalId(7));
        assert_eq!(handle.name, OsString::from("."));
        assert!(handle.is_dir());
    }
}
