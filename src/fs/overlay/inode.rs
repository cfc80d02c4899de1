//! Logical inode allocation
//!
//! Maps host `(device, inode)` pairs to small identifiers that are stable
//! for the lifetime of one filesystem instance.

use std::collections::HashMap;
use std::fmt;

/// Host identity of a filesystem object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeKey {
    pub dev: u64,
    pub ino: u64,
}

impl InodeKey {
    pub fn new(dev: u64, ino: u64) -> Self {
        Self { dev, ino }
    }
}

/// Adapter-assigned identifier of a tracked object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogicalId(pub u64);

impl fmt::Display for LogicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Hands out logical ids for host inodes.
///
/// Ids come from a counter that only moves forward, so a released id is
/// never handed to another object.
#[derive(Debug, Default)]
pub struct InodeAllocator {
    inodes: HashMap<InodeKey, LogicalId>,
    last: u64,
}

impl InodeAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the id for `key`, allocating the next one on first sight
    pub fn acquire(&mut self, key: InodeKey) -> LogicalId {
        if let Some(id) = self.inodes.get(&key) {
            return *id;
        }
        self.last += 1;
        let id = LogicalId(self.last);
        self.inodes.insert(key, id);
        id
    }

    /// Forget the mapping for `key`
    pub fn release(&mut self, key: InodeKey) {
        self.inodes.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_is_idempotent() {
        let mut alloc = InodeAllocator::new();
        let a = alloc.acquire(InodeKey::new(1, 100));
        let b = alloc.acquire(InodeKey::new(1, 200));

        assert_eq!(a, LogicalId(1));
        assert_eq!(b, LogicalId(2));
        assert_eq!(alloc.acquire(InodeKey::new(1, 100)), a);
        assert_eq!(alloc.acquire(InodeKey::new(1, 200)), b);
    }

    #[test]
    fn test_device_distinguishes_keys() {
        let mut alloc = InodeAllocator::new();
        let a = alloc.acquire(InodeKey::new(1, 7));
        let b = alloc.acquire(InodeKey::new(2, 7));
        assert_ne!(a, b);
    }

    #[test]
    fn test_released_ids_are_not_reused() {
        let mut alloc = InodeAllocator::new();
        let key = InodeKey::new(3, 42);
        let first = alloc.acquire(key);

        alloc.release(key);

        let second = alloc.acquire(key);
        assert_ne!(first, second);
        assert_eq!(second, LogicalId(2));
    }
}
