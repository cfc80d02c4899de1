//! Registry of exported filesystems and their file handles

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::ExportConfig;
use crate::crypto::FileHandleCodec;
use crate::error::{Error, ErrorKind, Result};
use crate::fs::capability::FileSystem;
use crate::fs::overlay::{EntryHandle, OverlayFs};

/// Owns the handle codec and every filesystem instance keyed by fsid.
///
/// Callers only ever see filesystems through the [`FileSystem`] trait.
pub struct FileSystemManager {
    codec: FileHandleCodec,
    filesystems: RwLock<BTreeMap<u64, Arc<dyn FileSystem>>>,
}

impl FileSystemManager {
    /// Create a manager with a fresh per-process handle secret
    pub fn new() -> Self {
        Self::with_codec(FileHandleCodec::new())
    }

    pub fn with_codec(codec: FileHandleCodec) -> Self {
        Self {
            codec,
            filesystems: RwLock::new(BTreeMap::new()),
        }
    }

    /// Export a host tree under the next free fsid
    pub fn register(&self, config: &ExportConfig) -> Result<Arc<dyn FileSystem>> {
        let mut filesystems = self.filesystems.write();
        let fsid = filesystems.keys().next_back().map_or(1, |last| last + 1);
        let fs: Arc<dyn FileSystem> = Arc::new(OverlayFs::new(config, fsid)?);
        filesystems.insert(fsid, Arc::clone(&fs));
        info!("Registered {:?} as fsid {}", config.root, fsid);
        Ok(fs)
    }

    pub fn get(&self, fsid: u64) -> Option<Arc<dyn FileSystem>> {
        self.filesystems.read().get(&fsid).cloned()
    }

    /// Number of registered filesystems
    pub fn len(&self) -> usize {
        self.filesystems.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.filesystems.read().is_empty()
    }

    /// File handle for `entry`
    pub fn encode(&self, entry: &EntryHandle, compact: bool) -> Vec<u8> {
        self.codec.encode(entry, compact)
    }

    /// Verify a file handle and resolve it to its filesystem and entry
    pub fn resolve(
        &self,
        bytes: &[u8],
        compact: bool,
    ) -> Result<(Arc<dyn FileSystem>, EntryHandle)> {
        let decoded = self.codec.decode(bytes, compact)?;
        debug!("resolve(fsid={}, ino={})", decoded.fsid, decoded.fileid);

        let fs = self.get(decoded.fsid).ok_or_else(|| {
            Error::fs(
                ErrorKind::StaleHandle,
                format!("unknown fsid {}", decoded.fsid),
            )
        })?;
        let entry = fs.entry_by_id(decoded.fileid)?;
        Ok((fs, entry))
    }
}

impl fmt::Debug for FileSystemManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSystemManager")
            .field("codec", &self.codec)
            .field("fsids", &self.filesystems.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for FileSystemManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::overlay::LogicalId;
    use std::ffi::OsStr;
    use tempfile::tempdir;

    #[test]
    fn test_fsids_are_sequential() {
        let a = tempdir().unwrap();
        let b = tempdir().unwrap();
        let manager = FileSystemManager::new();

        let first = manager.register(&ExportConfig::new(a.path())).unwrap();
        let second = manager.register(&ExportConfig::new(b.path())).unwrap();
        assert_eq!(first.fsid(), 1);
        assert_eq!(second.fsid(), 2);
        assert_eq!(manager.len(), 2);
        assert!(manager.get(3).is_none());
    }

    #[test]
    fn test_resolve_roundtrip() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"data").unwrap();
        let manager = FileSystemManager::new();
        let fs = manager.register(&ExportConfig::new(dir.path())).unwrap();

        let entry = fs.lookup(&fs.root(), OsStr::new("f")).unwrap();
        for compact in [true, false] {
            let handle = manager.encode(&entry, compact);
            let (resolved_fs, resolved) = manager.resolve(&handle, compact).unwrap();
            assert_eq!(resolved_fs.fsid(), fs.fsid());
            assert_eq!(resolved.fileid, entry.fileid);
            assert_eq!(resolved_fs.read(&resolved, 0, 4).unwrap(), b"data");
        }
    }

    #[test]
    fn test_resolve_unknown_fsid() {
        let codec = FileHandleCodec::with_secret(b"secret");
        let handle = codec.encode_ids(LogicalId(1), 9, false);
        let manager = FileSystemManager::with_codec(codec);

        let err = manager.resolve(&handle, false).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::StaleHandle);
    }

    #[test]
    fn test_resolve_removed_entry() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"").unwrap();
        let manager = FileSystemManager::new();
        let fs = manager.register(&ExportConfig::new(dir.path())).unwrap();

        let entry = fs.lookup(&fs.root(), OsStr::new("f")).unwrap();
        let handle = manager.encode(&entry, false);
        fs.remove(&entry).unwrap();

        let err = manager.resolve(&handle, false).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::StaleHandle);
    }

    #[test]
    fn test_resolve_tampered_handle() {
        let dir = tempdir().unwrap();
        let manager = FileSystemManager::new();
        let fs = manager.register(&ExportConfig::new(dir.path())).unwrap();

        let mut handle = manager.encode(&fs.root(), true);
        let last = handle.len() - 1;
        handle[last] ^= 1;
        let err = manager.resolve(&handle, true).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::GenericIo);
    }
}
