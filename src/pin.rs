//! The pinning table (`spec.md` §4.D).
//!
//! A second namespace, keyed by a byte-verbatim UTF-8 name rather than a
//! handle, so an object can be shared across callers that never exchanged
//! a handle directly. Shaped the same way as the handle table: one
//! process-owned map, one strong reference held per live entry.

use rustc_hash::FxHashMap;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::object::Object;
use crate::platform::utf8_eq;

/// `spec.md` §6.3: names are bounded by 2^32-1 bytes.
pub const MAX_NAME_LEN: usize = u32::MAX as usize;

pub struct PinningTable {
    // A `Vec<(Vec<u8>, Object)>` would make `utf8_eq`'s byte-verbatim
    // comparison explicit, but a hash map keyed on the raw bytes is
    // equivalent (and is what `spec.md` §4.D calls for: "hash table keyed
    // by UTF-8 byte string") as long as the hash and `Eq` impls used are
    // themselves byte-verbatim, which `Vec<u8>`'s are.
    entries: Mutex<FxHashMap<Vec<u8>, Object>>,
}

impl Default for PinningTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PinningTable {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        PinningTable {
            entries: Mutex::new(FxHashMap::with_capacity_and_hasher(capacity, Default::default())),
        }
    }

    /// Takes a reference to `obj` under `name`. Fails [`Error::AlreadyExists`]
    /// if `name` is already pinned, or [`Error::InvalidParameter`] if `name`
    /// exceeds [`MAX_NAME_LEN`].
    pub fn insert(&self, name: &[u8], obj: Object) -> Result<()> {
        if name.len() > MAX_NAME_LEN {
            return Err(Error::InvalidParameter);
        }
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.keys().any(|k| utf8_eq(k, name)) {
            return Err(Error::AlreadyExists);
        }
        entries.insert(name.to_vec(), obj);
        Ok(())
    }

    /// Returns a reference-bumped clone of the object pinned at `name`, or
    /// [`Error::NotFound`].
    pub fn find(&self, name: &[u8]) -> Result<Object> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .find(|(k, _)| utf8_eq(k, name))
            .map(|(_, v)| v.clone())
            .ok_or(Error::NotFound)
    }

    /// Releases the reference held for `name`. Fails [`Error::NotFound`] if
    /// `name` is not currently pinned.
    pub fn delete(&self, name: &[u8]) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let key = entries
            .keys()
            .find(|k| utf8_eq(k, name))
            .cloned()
            .ok_or(Error::NotFound)?;
        entries.remove(&key);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every currently-pinned name, for the read-only inspection surface
    /// (`crate::runtime::Runtime::pins`). Order is unspecified.
    pub fn names(&self) -> Vec<Vec<u8>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).keys().cloned().collect()
    }
}

// `PinningTable`'s `Drop` is the derived one: dropping `entries` drops
// every remaining `Object`, releasing each reference exactly once
// (`spec.md` §4.D: "Table destruction releases every remaining reference").
