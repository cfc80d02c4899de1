//! Integrity-protected file handles
//!
//! Layout: `digest || logical_id (u64 BE) || fsid (u64 BE)`, where the
//! digest is HMAC-SHA256 over the payload truncated to 16 or 32 bytes.

use rand::RngCore;
use ring::hmac;
use zeroize::Zeroizing;

use crate::crypto::{PAYLOAD_SIZE, SECRET_SIZE};
use crate::error::{Error, ErrorKind, Result};
use crate::fs::overlay::{EntryHandle, LogicalId};

/// Digest length of handles sized for a 32-byte handle budget
pub const COMPACT_DIGEST_SIZE: usize = 16;

/// Digest length of full-size handles
pub const FULL_DIGEST_SIZE: usize = 32;

/// Identity carried by a verified handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedHandle {
    pub fileid: LogicalId,
    pub fsid: u64,
}

/// Encodes and verifies file handles with a secret that never leaves the process
pub struct FileHandleCodec {
    key: hmac::Key,
}

impl FileHandleCodec {
    /// Create a codec with a fresh random secret
    pub fn new() -> Self {
        let mut secret = Zeroizing::new([0u8; SECRET_SIZE]);
        rand::thread_rng().fill_bytes(secret.as_mut());
        Self::with_secret(secret.as_ref())
    }

    /// Create a codec from an explicit secret
    pub fn with_secret(secret: &[u8]) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
        }
    }

    fn digest_size(compact: bool) -> usize {
        if compact {
            COMPACT_DIGEST_SIZE
        } else {
            FULL_DIGEST_SIZE
        }
    }

    /// Total handle length for the given variant
    pub fn handle_size(compact: bool) -> usize {
        Self::digest_size(compact) + PAYLOAD_SIZE
    }

    /// Encode the identity of `entry`
    pub fn encode(&self, entry: &EntryHandle, compact: bool) -> Vec<u8> {
        self.encode_ids(entry.fileid, entry.fsid, compact)
    }

    /// Encode a `(logical id, fsid)` pair
    pub fn encode_ids(&self, fileid: LogicalId, fsid: u64, compact: bool) -> Vec<u8> {
        let mut payload = [0u8; PAYLOAD_SIZE];
        payload[..8].copy_from_slice(&fileid.0.to_be_bytes());
        payload[8..].copy_from_slice(&fsid.to_be_bytes());

        let tag = hmac::sign(&self.key, &payload);
        let mut out = Vec::with_capacity(Self::handle_size(compact));
        out.extend_from_slice(&tag.as_ref()[..Self::digest_size(compact)]);
        out.extend_from_slice(&payload);
        out
    }

    /// Verify and decode a handle produced by [`encode`](Self::encode)
    pub fn decode(&self, bytes: &[u8], compact: bool) -> Result<DecodedHandle> {
        let digest_size = Self::digest_size(compact);
        if bytes.len() != digest_size + PAYLOAD_SIZE {
            return Err(Error::fs(
                ErrorKind::GenericIo,
                format!(
                    "file handle length {} (expected {})",
                    bytes.len(),
                    digest_size + PAYLOAD_SIZE
                ),
            ));
        }

        let (digest, payload) = bytes.split_at(digest_size);
        let expected = hmac::sign(&self.key, payload);
        ring::constant_time::verify_slices_are_equal(&expected.as_ref()[..digest_size], digest)
            .map_err(|_| Error::fs(ErrorKind::GenericIo, "file handle digest mismatch"))?;

        let mut fileid = [0u8; 8];
        let mut fsid = [0u8; 8];
        fileid.copy_from_slice(&payload[..8]);
        fsid.copy_from_slice(&payload[8..]);

        Ok(DecodedHandle {
            fileid: LogicalId(u64::from_be_bytes(fileid)),
            fsid: u64::from_be_bytes(fsid),
        })
    }
}

impl Default for FileHandleCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FileHandleCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandleCodec").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> FileHandleCodec {
        FileHandleCodec::with_secret(&[7u8; SECRET_SIZE])
    }

    #[test]
    fn test_layout() {
        let handle = codec().encode_ids(LogicalId(0x0102), 3, false);
        assert_eq!(handle.len(), 48);
        assert_eq!(&handle[32..40], &[0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(&handle[40..], &[0, 0, 0, 0, 0, 0, 0, 3]);

        let compact = codec().encode_ids(LogicalId(0x0102), 3, true);
        assert_eq!(compact.len(), 32);
        assert_eq!(&compact[..16], &handle[..16]);
        assert_eq!(&compact[16..], &handle[32..]);
    }

    #[test]
    fn test_roundtrip() {
        let codec = codec();
        for compact in [true, false] {
            for (fileid, fsid) in [(1, 1), (u64::MAX, 0), (0, u64::MAX)] {
                let handle = codec.encode_ids(LogicalId(fileid), fsid, compact);
                let decoded = codec.decode(&handle, compact).unwrap();
                assert_eq!(decoded.fileid, LogicalId(fileid));
                assert_eq!(decoded.fsid, fsid);
            }
        }
    }

    #[test]
    fn test_single_bit_flips_rejected() {
        let codec = codec();
        for compact in [true, false] {
            let handle = codec.encode_ids(LogicalId(42), 1, compact);
            for bit in 0..handle.len() * 8 {
                let mut tampered = handle.clone();
                tampered[bit / 8] ^= 1 << (bit % 8);
                let err = codec.decode(&tampered, compact).unwrap_err();
                assert_eq!(err.kind(), ErrorKind::GenericIo);
            }
        }
    }

    #[test]
    fn test_wrong_length_rejected() {
        let codec = codec();
        let full = codec.encode_ids(LogicalId(5), 2, false);
        let compact = codec.encode_ids(LogicalId(5), 2, true);

        assert!(codec.decode(&full, true).is_err());
        assert!(codec.decode(&compact, false).is_err());
        assert!(codec.decode(&full[..full.len() - 1], false).is_err());
        assert!(codec.decode(&[], true).is_err());
    }

    #[test]
    fn test_secrets_are_per_codec() {
        let handle = FileHandleCodec::new().encode_ids(LogicalId(1), 1, false);
        assert!(FileHandleCodec::new().decode(&handle, false).is_err());
    }
}
