//! String interning for cached string, text and log payloads
//!
//! History of string-typed items is highly repetitive (status strings, repeated
//! log sources), so each distinct payload is stored once and shared by every
//! cached record that holds it. Unlike a plain interner the pool reference-counts
//! its entries: a payload is dropped, and its budget returned, as soon as the last
//! record referencing it leaves the cache.
//!
//! # Memory accounting
//!
//! The pool itself does not charge the memory budget. The registry charges
//! [`StringPool::entry_size`] bytes before calling [`StringPool::insert`] and
//! frees whatever [`StringPool::release`] reports.

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::Arc;

/// Size of the per-entry reference counter, charged with every pooled string
pub const REFCOUNT_SIZE: usize = mem::size_of::<u32>();

/// Handle to an interned string
///
/// Handles are only created by the pool and are deliberately not `Clone`: every
/// handle must be given back through [`StringPool::release`] exactly once.
pub struct StrHandle(Arc<str>);

impl StrHandle {
    /// The interned content
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether two handles refer to the same pool entry
    pub fn same_entry(&self, other: &StrHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for StrHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StrHandle").field(&&*self.0).finish()
    }
}

/// Reference-counted string pool
#[derive(Debug, Default)]
pub struct StringPool {
    /// content -> number of live handles
    strings: HashMap<Arc<str>, u32>,
}

impl StringPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes a new entry for `s` costs: content, terminator and refcount
    pub fn entry_size(s: &str) -> usize {
        s.len() + 1 + REFCOUNT_SIZE
    }

    /// Take another reference to an already pooled string
    ///
    /// Returns `None` if `s` is not pooled; the caller must then charge
    /// [`entry_size`](Self::entry_size) bytes and [`insert`](Self::insert) it.
    pub fn lookup(&mut self, s: &str) -> Option<StrHandle> {
        let key = self.strings.get_key_value(s).map(|(k, _)| Arc::clone(k))?;
        if let Some(refcount) = self.strings.get_mut(s) {
            *refcount += 1;
        }
        Some(StrHandle(key))
    }

    /// Add a new entry with a single reference
    pub fn insert(&mut self, s: &str) -> StrHandle {
        debug_assert!(!self.strings.contains_key(s), "string already pooled");
        let key: Arc<str> = Arc::from(s);
        self.strings.insert(Arc::clone(&key), 1);
        StrHandle(key)
    }

    /// Drop one reference
    ///
    /// Returns the entry size once the last reference is gone, otherwise 0.
    pub fn release(&mut self, handle: StrHandle) -> usize {
        let s: &str = &handle.0;
        match self.strings.get_mut(s) {
            Some(refcount) if *refcount > 1 => {
                *refcount -= 1;
                0
            }
            Some(_) => {
                self.strings.remove(s);
                Self::entry_size(s)
            }
            None => {
                debug_assert!(false, "released a string that is not pooled");
                0
            }
        }
    }

    /// Current reference count of `s` (0 if not pooled)
    pub fn refcount(&self, s: &str) -> u32 {
        self.strings.get(s).copied().unwrap_or(0)
    }

    /// Number of distinct pooled strings
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intern(pool: &mut StringPool, s: &str) -> StrHandle {
        match pool.lookup(s) {
            Some(handle) => handle,
            None => pool.insert(s),
        }
    }

    #[test]
    fn test_intern_dedup() {
        let mut pool = StringPool::new();
        let first = intern(&mut pool, "up");
        let second = intern(&mut pool, "up");

        assert!(first.same_entry(&second));
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.refcount("up"), 2);
    }

    #[test]
    fn test_release_frees_after_last_reference() {
        let mut pool = StringPool::new();
        let first = intern(&mut pool, "down");
        let second = intern(&mut pool, "down");

        assert_eq!(pool.release(first), 0);
        assert_eq!(pool.refcount("down"), 1);

        assert_eq!(pool.release(second), StringPool::entry_size("down"));
        assert!(pool.is_empty());
        assert!(pool.lookup("down").is_none());
    }

    #[test]
    fn test_entry_size() {
        assert_eq!(StringPool::entry_size(""), 1 + REFCOUNT_SIZE);
        assert_eq!(StringPool::entry_size("abc"), 4 + REFCOUNT_SIZE);
    }

    #[test]
    fn test_distinct_strings() {
        let mut pool = StringPool::new();
        let a = intern(&mut pool, "a");
        let b = intern(&mut pool, "b");
        assert!(!a.same_entry(&b));
        assert_eq!(b.as_str(), "b");
        assert_eq!(pool.len(), 2);
    }
}
