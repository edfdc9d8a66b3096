// citron-parser - Interned strings
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Interned strings with precomputed 64-bit hashes.
//!
//! # Interning
//!
//! Every `FlyweightStr` is registered in a process-wide interner, so two
//! flyweights built from the same text share the same underlying storage:
//!
//! - **O(1) equality**: comparing flyweights compares their 64-bit hashes
//! - **O(1) hashing**: the hash is computed once, at interning time
//! - **Stable identity**: the hash is the value used in compiled modules,
//!   so it must not change between runs (FNV-1a, not a randomized hasher)
//!
//! # Memory behaviour
//!
//! Interned strings are never deallocated. The interner keeps strong
//! references (`Arc`) to every string created during the program's lifetime.
//! Identifiers in scripts form a bounded set, so this is not a concern in
//! practice; it is what makes hash-based lookups safe across module reloads.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, OnceLock};

use ahash::AHashMap;

/// 64-bit FNV-1a hash, the stable hash used for all identifier lookups.
///
/// An empty input hashes to 0 so that "no string" and "empty string" are
/// indistinguishable, matching the behaviour of invalid flyweights.
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    if bytes.is_empty() {
        return 0;
    }
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

struct StrInner {
    hash: u64,
    text: Box<str>,
}

/// An interned string handle with a precomputed 64-bit hash.
///
/// Cheap to clone and compare; used for every identifier, function name,
/// label and string literal in the toolchain.
#[derive(Clone)]
pub struct FlyweightStr {
    inner: Arc<StrInner>,
}

struct Interner {
    by_hash: AHashMap<u64, Arc<StrInner>>,
}

static INTERNER: OnceLock<Mutex<Interner>> = OnceLock::new();

fn interner() -> &'static Mutex<Interner> {
    INTERNER.get_or_init(|| {
        Mutex::new(Interner {
            by_hash: AHashMap::new(),
        })
    })
}

impl FlyweightStr {
    /// Intern the given text and return its flyweight handle.
    pub fn new(text: &str) -> Self {
        let hash = fnv1a_64(text.as_bytes());
        let mut guard = interner()
            .lock()
            .expect("string interner mutex poisoned: a thread panicked while interning");
        let inner = guard
            .by_hash
            .entry(hash)
            .or_insert_with(|| {
                Arc::new(StrInner {
                    hash,
                    text: Box::from(text),
                })
            })
            .clone();
        FlyweightStr { inner }
    }

    /// The empty flyweight, used where the reference keeps "invalid" strings.
    pub fn empty() -> Self {
        FlyweightStr::new("")
    }

    /// Look up an already-interned string by its hash.
    ///
    /// Returns `None` if no string with that hash was interned in this
    /// process. Deserialized modules re-intern their string tables before
    /// any hash-based lookups happen.
    pub fn resolve(hash: u64) -> Option<Self> {
        let guard = interner()
            .lock()
            .expect("string interner mutex poisoned: a thread panicked while interning");
        guard
            .by_hash
            .get(&hash)
            .map(|inner| FlyweightStr { inner: inner.clone() })
    }

    /// The precomputed 64-bit FNV-1a hash.
    #[inline]
    #[must_use]
    pub fn hash(&self) -> u64 {
        self.inner.hash
    }

    /// The interned text.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.inner.text
    }

    /// Whether this is the empty flyweight.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.text.is_empty()
    }
}

impl PartialEq for FlyweightStr {
    fn eq(&self, other: &Self) -> bool {
        // Interned per hash, so hash equality is string equality
        self.inner.hash == other.inner.hash
    }
}

impl Eq for FlyweightStr {}

impl Hash for FlyweightStr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.hash.hash(state);
    }
}

impl PartialOrd for FlyweightStr {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FlyweightStr {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.inner.text.cmp(&other.inner.text)
    }
}

impl fmt::Display for FlyweightStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.text)
    }
}

impl fmt::Debug for FlyweightStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FlyweightStr({:?})", &*self.inner.text)
    }
}

impl From<&str> for FlyweightStr {
    fn from(text: &str) -> Self {
        FlyweightStr::new(text)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_shares_storage() {
        let a = FlyweightStr::new("update");
        let b = FlyweightStr::new("update");
        assert_eq!(a, b);
        assert_eq!(a.hash(), b.hash());
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
    }

    #[test]
    fn test_distinct_strings_differ() {
        let a = FlyweightStr::new("foo");
        let b = FlyweightStr::new("bar");
        assert_ne!(a, b);
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_resolve_by_hash() {
        let a = FlyweightStr::new("resolve.me");
        let b = FlyweightStr::resolve(a.hash()).expect("string was interned");
        assert_eq!(a, b);
        assert_eq!(b.as_str(), "resolve.me");
    }

    #[test]
    fn test_empty_hashes_to_zero() {
        assert_eq!(fnv1a_64(b""), 0);
        assert!(FlyweightStr::empty().is_empty());
        assert_eq!(FlyweightStr::empty().hash(), 0);
    }

    #[test]
    fn test_known_fnv1a_vector() {
        // FNV-1a 64-bit of "a"
        assert_eq!(fnv1a_64(b"a"), 0xaf63dc4c8601ec8c);
    }
}
