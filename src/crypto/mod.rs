//! Cryptographic primitives for hostfs
//!
//! File handles carry an HMAC-SHA256 digest keyed with a per-process secret,
//! so a remote client can hold them but not forge or alter them.

mod fhandle;

pub use fhandle::{DecodedHandle, FileHandleCodec, COMPACT_DIGEST_SIZE, FULL_DIGEST_SIZE};

/// Size of the file handle secret in bytes
pub const SECRET_SIZE: usize = 32;

/// Size of the handle payload: logical id and fsid, 8 bytes each
pub const PAYLOAD_SIZE: usize = 16;
