// A bijective int<->string table with admission control, used to substitute
// small integers for frequently-repeated dictionary keys. Readers consult a
// snapshot under a read lock; writers (new key admission) take the
// exclusive write lock, per the design notes' "copy-on-write snapshot for
// readers, exclusive lock for inserts" guidance. We use `RwLock` rather
// than a hand-rolled lock-free structure since nothing in the surrounding
// corpus pulls in an atomic-swap crate for this.

use std::collections::HashMap;
use std::sync::RwLock;

pub const DEFAULT_CAPACITY: usize = 2048;

#[derive(Default)]
struct Inner {
    by_code: Vec<Box<str>>,
    by_string: HashMap<Box<str>, u32>,
}

pub struct SharedKeys {
    capacity: usize,
    inner: RwLock<Inner>,
}

impl std::fmt::Debug for SharedKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.count();
        f.debug_struct("SharedKeys")
            .field("capacity", &self.capacity)
            .field("count", &count)
            .finish()
    }
}

/// A string is eligible for shared-key substitution when it's 1..=16 bytes,
/// every byte is in `[A-Za-z0-9_$-]`, and it doesn't start with a digit.
pub fn is_eligible(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.is_empty() || bytes.len() > 16 {
        return false;
    }
    if bytes[0].is_ascii_digit() {
        return false;
    }
    bytes
        .iter()
        .all(|&b| b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b == b'-')
}

impl SharedKeys {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        SharedKeys {
            capacity,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Looks up `key`, inserting it if eligible, under capacity, and not
    /// already interned. Returns `None` if the key is ineligible or the
    /// table is full.
    pub fn encode(&self, key: &str) -> Option<u32> {
        {
            let inner = self.inner.read().expect("SharedKeys lock poisoned");
            if let Some(&code) = inner.by_string.get(key) {
                return Some(code);
            }
        }
        if !is_eligible(key) {
            return None;
        }
        let mut inner = self.inner.write().expect("SharedKeys lock poisoned");
        // Re-check: another writer may have admitted this key while we
        // waited for the write lock.
        if let Some(&code) = inner.by_string.get(key) {
            return Some(code);
        }
        if inner.by_code.len() >= self.capacity {
            return None;
        }
        let code = inner.by_code.len() as u32;
        let boxed: Box<str> = key.into();
        inner.by_code.push(boxed.clone());
        inner.by_string.insert(boxed, code);
        tracing::debug!(target: "fleece::shared_keys", key, code, "admitted new shared key");
        Some(code)
    }

    /// Looks up `key`'s code without admitting it if absent (used by
    /// decode-side lookups, which must never mutate the table).
    pub fn encode_lookup_only(&self, key: &str) -> Option<u32> {
        let inner = self.inner.read().expect("SharedKeys lock poisoned");
        inner.by_string.get(key).copied()
    }

    /// Resolves an already-assigned code back to its string, if any.
    pub fn decode(&self, code: u32) -> Option<String> {
        let inner = self.inner.read().expect("SharedKeys lock poisoned");
        inner.by_code.get(code as usize).map(|s| s.to_string())
    }

    pub fn count(&self) -> usize {
        self.inner.read().expect("SharedKeys lock poisoned").by_code.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Rolls the table back to exactly `count` entries (used to undo a
    /// failed or aborted encode transaction). Codes are otherwise
    /// append-only and never reused once assigned.
    pub fn revert_to(&self, count: usize) {
        let mut inner = self.inner.write().expect("SharedKeys lock poisoned");
        if count >= inner.by_code.len() {
            return;
        }
        for removed in inner.by_code.split_off(count) {
            inner.by_string.remove(&removed);
        }
    }

    /// Caller-assigned codes must be monotonically increasing and dense
    /// starting at 0; this is how a persisted table is reloaded.
    pub fn assign(&self, key: &str, code: u32) -> bool {
        let mut inner = self.inner.write().expect("SharedKeys lock poisoned");
        if code as usize != inner.by_code.len() {
            return false;
        }
        if inner.by_code.len() >= self.capacity {
            return false;
        }
        let boxed: Box<str> = key.into();
        inner.by_code.push(boxed.clone());
        inner.by_string.insert(boxed, code);
        true
    }
}

impl Default for SharedKeys {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    #[test]
    fn test_eligibility() {
        assert!(is_eligible("name"));
        assert!(is_eligible("_foo-bar$1"));
        assert!(!is_eligible("1name"));
        assert!(!is_eligible(""));
        assert!(!is_eligible("this-key-is-way-too-long-for-sk"));
        assert!(!is_eligible("has space"));
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let sk = SharedKeys::new();
        let a = sk.encode("name").unwrap();
        let b = sk.encode("age").unwrap();
        assert_ne!(a, b);
        // Repeated encode of the same key returns the same code.
        assert_eq!(sk.encode("name"), Some(a));
        assert_eq!(sk.decode(a).as_deref(), Some("name"));
        assert_eq!(sk.decode(b).as_deref(), Some("age"));
        assert_eq!(sk.count(), 2);
    }

    #[test]
    fn test_ineligible_never_admitted() {
        let sk = SharedKeys::new();
        assert_eq!(sk.encode("has space"), None);
        assert_eq!(sk.count(), 0);
    }

    #[test]
    fn test_capacity_cap() {
        let sk = SharedKeys::with_capacity(2);
        assert!(sk.encode("a").is_some());
        assert!(sk.encode("b").is_some());
        assert_eq!(sk.encode("c"), None);
        assert_eq!(sk.count(), 2);
    }

    #[test]
    fn test_revert_to() {
        let sk = SharedKeys::new();
        sk.encode("a").unwrap();
        sk.encode("b").unwrap();
        sk.encode("c").unwrap();
        assert_eq!(sk.count(), 3);
        sk.revert_to(1);
        assert_eq!(sk.count(), 1);
        assert_eq!(sk.decode(1), None);
        // Codes are append-only: the next admitted key gets code 1 again.
        let code = sk.encode("d").unwrap();
        assert_eq!(code, 1);
    }

    #[test]
    fn test_assign_dense_monotonic() {
        let sk = SharedKeys::new();
        assert!(sk.assign("name", 0));
        assert!(sk.assign("age", 1));
        assert!(!sk.assign("bogus", 5));
        assert_eq!(sk.decode(0).as_deref(), Some("name"));
    }
}
