//! Host directory overlay
//!
//! Exposes a host directory tree (plus optional mountpoint overrides) as a
//! filesystem with adapter-assigned inode ids:
//! - Entries: in-memory snapshots of host objects, keyed by logical id
//! - Host: directory-relative system calls on open descriptors
//! - Mounts: logical to physical path resolution

mod entry;
mod filesystem;
mod host;
mod inode;
mod mounts;

pub use entry::{
    Entry, EntryAttributes, EntryHandle, EntryLink, FileKind, FsEntry, SetAttributes, SetTime,
};
pub use filesystem::{OverlayFs, MAX_READ};
pub use host::HostDir;
pub use inode::{InodeAllocator, InodeKey, LogicalId};
pub use mounts::MountTable;
