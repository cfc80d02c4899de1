//! hostfs - Host directory trees exported as network filesystems
//!
//! This library adapts a host directory (plus optional mountpoint
//! overrides) to the operation set of a network filesystem server, with
//! race-safe host I/O and tamper-evident file handles.

pub mod config;
pub mod crypto;
pub mod error;
pub mod fs;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, ExportConfig};
    pub use crate::crypto::FileHandleCodec;
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::fs::{EntryHandle, FileSystem, FileSystemManager, OverlayFs};
}
