//! The map engine (`spec.md` §4.E).
//!
//! Two storage kinds share one external contract: `create`, `lookup`,
//! `update`, `delete`, `next_key`, all checked against a fixed
//! `{key_size, value_size, max_entries}` definition. Writers take a
//! per-map mutex; readers — in particular a sandboxed program mid-`invoke`
//! — never block, relying instead on the epoch domain (`epoch.rs`) to keep
//! a value's backing bytes alive until every reader that might still be
//! looking at them has called `exit`.
//!
//! `spec.md` §9's "Epoch critical sections... a compile-time error where
//! the target language can express it" is realized directly: [`lookup`]
//! ties its returned slice's lifetime to the caller's borrow of their
//! [`EpochGuard`], so using the slice after the guard drops fails to
//! compile rather than failing at runtime.

use std::collections::HashMap as StdHashMap;
use std::sync::{Arc, Mutex};

use crate::epoch::{EpochDomain, EpochGuard};
use crate::error::{Error, Result};
use crate::object::{ObjectBody, ObjectKind};

/// Which concrete storage backs a map. `spec.md` §4.E: "Minimum required
/// kinds: fixed-size array... and hash map."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    Array,
    Hash,
}

/// The immutable definition of a map, fixed for its lifetime (`spec.md`
/// §3: "key_size and value_size are fixed for life").
#[derive(Debug, Clone, Copy)]
pub struct MapDef {
    pub kind: MapKind,
    pub key_size: usize,
    pub value_size: usize,
    pub max_entries: usize,
}

fn array_index(def: &MapDef, key: &[u8]) -> Result<usize> {
    if key.len() != def.key_size {
        return Err(Error::InvalidParameter);
    }
    if def.key_size == 0 || def.key_size > 8 {
        // Array maps interpret the key as a little-endian index; spec.md
        // leaves the exact key encoding to the implementation.
        return Err(Error::InvalidParameter);
    }
    let mut buf = [0u8; 8];
    buf[..def.key_size].copy_from_slice(key);
    let idx = u64::from_le_bytes(buf) as usize;
    if idx >= def.max_entries {
        return Err(Error::InvalidParameter);
    }
    Ok(idx)
}

struct ArrayStorage {
    slots: Vec<Mutex<Box<[u8]>>>,
}

impl ArrayStorage {
    fn new(def: &MapDef) -> Self {
        let slots = (0..def.max_entries)
            .map(|_| Mutex::new(vec![0u8; def.value_size].into_boxed_slice()))
            .collect();
        ArrayStorage { slots }
    }

    /// Raw pointer into a preallocated slot. Array slots never move or get
    /// freed (`delete` zeroes in place), so the pointer is valid for as
    /// long as the map itself is alive; tying it to the epoch guard's
    /// lifetime still gives callers one uniform contract across both map
    /// kinds.
    fn raw_ptr(&self, idx: usize) -> *const u8 {
        self.slots[idx].lock().unwrap_or_else(|e| e.into_inner()).as_ptr()
    }

    fn write(&self, idx: usize, value: &[u8]) {
        let mut slot = self.slots[idx].lock().unwrap_or_else(|e| e.into_inner());
        slot.copy_from_slice(value);
    }

    fn zero(&self, idx: usize) {
        let mut slot = self.slots[idx].lock().unwrap_or_else(|e| e.into_inner());
        slot.iter_mut().for_each(|b| *b = 0);
    }
}

struct HashStorage {
    entries: Mutex<StdHashMap<Vec<u8>, Box<[u8]>>>,
}

impl HashStorage {
    fn new() -> Self {
        HashStorage {
            entries: Mutex::new(StdHashMap::new()),
        }
    }
}

enum Storage {
    Array(ArrayStorage),
    Hash(HashStorage),
}

/// A map object: the typed, fixed-shape container programs read and write
/// (`spec.md` §3 "Map").
pub struct MapObject {
    def: MapDef,
    storage: Storage,
    domain: Arc<EpochDomain>,
}

impl ObjectBody for MapObject {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Map
    }
}

impl MapObject {
    /// `spec.md` §4.E `create(def)`.
    pub fn create(def: MapDef, domain: Arc<EpochDomain>) -> Result<Self> {
        if def.key_size == 0 || def.value_size == 0 || def.max_entries == 0 {
            return Err(Error::InvalidParameter);
        }
        let storage = match def.kind {
            MapKind::Array => {
                // Validate the index encoding up front so `create` never
                // succeeds with a definition every later lookup would reject.
                if def.key_size == 0 || def.key_size > 8 {
                    return Err(Error::InvalidParameter);
                }
                Storage::Array(ArrayStorage::new(&def))
            }
            MapKind::Hash => Storage::Hash(HashStorage::new()),
        };
        Ok(MapObject { def, storage, domain })
    }

    pub fn def(&self) -> MapDef {
        self.def
    }

    fn check_key_len(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.def.key_size {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }

    fn check_value_len(&self, value: &[u8]) -> Result<()> {
        if value.len() != self.def.value_size {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }

    /// Lock-free lookup for use from inside a program's `invoke`, or by any
    /// other caller already holding an [`EpochGuard`] on this map's domain.
    /// The returned slice cannot outlive the guard (`spec.md` §4.E:
    /// "valid until the reader's `epoch_exit`").
    pub fn lookup<'g>(&'g self, _guard: &'g EpochGuard<'_>, key: &[u8]) -> Result<&'g [u8]> {
        self.check_key_len(key)?;
        match &self.storage {
            Storage::Array(a) => {
                let idx = array_index(&self.def, key)?;
                let ptr = a.raw_ptr(idx);
                // SAFETY: array slots are never freed; `_guard` merely
                // documents that the caller is inside a read-side critical
                // section, matching the hash-map case below.
                Ok(unsafe { std::slice::from_raw_parts(ptr, self.def.value_size) })
            }
            Storage::Hash(h) => {
                let entries = h.entries.lock().unwrap_or_else(|e| e.into_inner());
                let ptr = entries.get(key).map(|b| b.as_ptr()).ok_or(Error::NotFound)?;
                // SAFETY: `update`/`delete` never drop a superseded value
                // synchronously; they hand it to `self.domain` for
                // deferred reclamation, so the bytes at `ptr` remain valid
                // for as long as `_guard`'s entered epoch could still be
                // the minimum across all participating threads.
                Ok(unsafe { std::slice::from_raw_parts(ptr, self.def.value_size) })
            }
        }
    }

    /// Convenience for callers outside program context: enters its own
    /// critical section and returns a copy (`spec.md` §4.E: "callers
    /// outside program context receive a copy").
    pub fn lookup_copy(&self, key: &[u8]) -> Result<Vec<u8>> {
        let guard = self.domain.enter();
        let slice = self.lookup(&guard, key)?;
        Ok(slice.to_vec())
    }

    /// `spec.md` §4.E `update(key, value)`: replaces or inserts.
    pub fn update(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_key_len(key)?;
        self.check_value_len(value)?;
        match &self.storage {
            Storage::Array(a) => {
                let idx = array_index(&self.def, key)?;
                a.write(idx, value);
                Ok(())
            }
            Storage::Hash(h) => {
                let mut entries = h.entries.lock().unwrap_or_else(|e| e.into_inner());
                if !entries.contains_key(key) && entries.len() >= self.def.max_entries {
                    return Err(Error::OutOfResources);
                }
                let new_box: Box<[u8]> = value.to_vec().into_boxed_slice();
                if let Some(old) = entries.insert(key.to_vec(), new_box) {
                    self.domain.retire(Box::new(move || drop(old)));
                }
                Ok(())
            }
        }
    }

    /// `spec.md` §4.E `delete(key)`: array maps zero the slot; hash maps
    /// remove it, retiring the old storage under epoch protection.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.check_key_len(key)?;
        match &self.storage {
            Storage::Array(a) => {
                let idx = array_index(&self.def, key)?;
                a.zero(idx);
                Ok(())
            }
            Storage::Hash(h) => {
                let mut entries = h.entries.lock().unwrap_or_else(|e| e.into_inner());
                let removed = entries.remove(key).ok_or(Error::NotFound)?;
                self.domain.retire(Box::new(move || drop(removed)));
                Ok(())
            }
        }
    }

    /// `spec.md` §4.E `next_key(prev_key_or_null)`: an arbitrary but
    /// stable-per-snapshot order; need not observe concurrent mutation.
    pub fn next_key(&self, prev: Option<&[u8]>) -> Result<Vec<u8>> {
        match &self.storage {
            Storage::Array(a) => {
                let next_idx = match prev {
                    None => 0,
                    Some(p) => array_index(&self.def, p)? + 1,
                };
                if next_idx >= a.slots.len() {
                    return Err(Error::NoMoreKeys);
                }
                Ok((next_idx as u64).to_le_bytes()[..self.def.key_size].to_vec())
            }
            Storage::Hash(h) => {
                let entries = h.entries.lock().unwrap_or_else(|e| e.into_inner());
                let mut keys: Vec<&Vec<u8>> = entries.keys().collect();
                keys.sort();
                let next = match prev {
                    None => keys.first(),
                    Some(p) => keys.iter().find(|k| k.as_slice() > p).copied(),
                };
                next.cloned().ok_or(Error::NoMoreKeys)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn array_def() -> MapDef {
        MapDef { kind: MapKind::Array, key_size: 4, value_size: 4, max_entries: 4 }
    }

    fn hash_def(max_entries: usize) -> MapDef {
        MapDef { kind: MapKind::Hash, key_size: 4, value_size: 4, max_entries }
    }

    #[test]
    fn array_update_lookup_delete_round_trip() {
        let domain = Arc::new(EpochDomain::new());
        let map = MapObject::create(array_def(), domain).unwrap();
        let key = 2u32.to_le_bytes();
        map.update(&key, &[1, 2, 3, 4]).unwrap();
        assert_eq!(map.lookup_copy(&key).unwrap(), vec![1, 2, 3, 4]);
        map.delete(&key).unwrap();
        assert_eq!(map.lookup_copy(&key).unwrap(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn array_rejects_index_past_max_entries() {
        let domain = Arc::new(EpochDomain::new());
        let map = MapObject::create(array_def(), domain).unwrap();
        let key = 10u32.to_le_bytes();
        assert_eq!(map.update(&key, &[0; 4]).unwrap_err(), Error::InvalidParameter);
    }

    #[test]
    fn hash_update_lookup_delete_round_trip() {
        let domain = Arc::new(EpochDomain::new());
        let map = MapObject::create(hash_def(4), domain).unwrap();
        let key = 7u32.to_le_bytes();
        map.update(&key, &[9, 9, 9, 9]).unwrap();
        assert_eq!(map.lookup_copy(&key).unwrap(), vec![9, 9, 9, 9]);
        map.delete(&key).unwrap();
        assert_eq!(map.lookup_copy(&key).unwrap_err(), Error::NotFound);
    }

    #[test]
    fn hash_full_table_rejects_new_key_insert_no_eviction() {
        let domain = Arc::new(EpochDomain::new());
        let map = MapObject::create(hash_def(1), domain).unwrap();
        map.update(&1u32.to_le_bytes(), &[0; 4]).unwrap();
        assert_eq!(
            map.update(&2u32.to_le_bytes(), &[0; 4]).unwrap_err(),
            Error::OutOfResources
        );
        // Updating the existing key still succeeds.
        map.update(&1u32.to_le_bytes(), &[1; 4]).unwrap();
    }

    #[test]
    fn wrong_length_key_or_value_is_invalid_parameter() {
        let domain = Arc::new(EpochDomain::new());
        let map = MapObject::create(hash_def(4), domain).unwrap();
        assert_eq!(map.update(&[0; 3], &[0; 4]).unwrap_err(), Error::InvalidParameter);
        assert_eq!(map.update(&[0; 4], &[0; 3]).unwrap_err(), Error::InvalidParameter);
    }

    #[test]
    fn lookup_pointer_survives_concurrent_delete_until_flush() {
        let domain = Arc::new(EpochDomain::new());
        let map = MapObject::create(hash_def(4), domain.clone());
        let map = map.unwrap();
        let key = 1u32.to_le_bytes();
        map.update(&key, &[5, 5, 5, 5]).unwrap();

        let guard = domain.enter();
        let value = map.lookup(&guard, &key).unwrap();
        // A concurrent delete retires the old storage instead of freeing
        // it synchronously, so `value` is still readable here.
        map.delete(&key).unwrap();
        assert_eq!(value, &[5, 5, 5, 5]);
        drop(guard);
        domain.flush();
    }

    #[test]
    fn next_key_visits_every_hash_entry_exactly_once() {
        let domain = Arc::new(EpochDomain::new());
        let map = MapObject::create(hash_def(4), domain).unwrap();
        for i in 0..3u32 {
            map.update(&i.to_le_bytes(), &[0; 4]).unwrap();
        }
        let mut seen = Vec::new();
        let mut prev: Option<Vec<u8>> = None;
        loop {
            match map.next_key(prev.as_deref()) {
                Ok(k) => {
                    seen.push(k.clone());
                    prev = Some(k);
                }
                Err(Error::NoMoreKeys) => break,
                Err(e) => panic!("unexpected error {e:?}"),
            }
        }
        assert_eq!(seen.len(), 3);
    }
}
