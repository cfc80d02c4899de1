//! Filesystem adapter
//!
//! Exposes host directory trees through the [`FileSystem`] capability
//! interface a network filesystem server calls into.

mod capability;
mod manager;
pub mod overlay;

pub use capability::{FileSystem, FsStats};
pub use manager::FileSystemManager;
pub use overlay::{EntryHandle, FileKind, LogicalId, OverlayFs, SetAttributes, SetTime};
