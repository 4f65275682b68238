//! The handle table (`spec.md` §4.C).
//!
//! A dense, append-with-free-list vector mapping a small integer handle to
//! a strong [`Object`] reference, the same shape `eventp`'s `Eventp` uses
//! for its `registered: FxHashMap<RawFd, ThinBoxSubscriber<Eventp>>` table
//! (a single owned map from a small integer key to the owned entity) —
//! generalized here from "one table keyed by fd" to "one table per caller
//! context keyed by handle, holding any object kind".

use std::sync::Mutex;

use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::object::{Object, ObjectKind};

/// The all-ones sentinel: never a live handle, doubles as "invalid" and as
/// the seed value passed to [`HandleTable::next`] to begin iteration
/// (`spec.md` §4.C).
pub const INVALID_HANDLE_VALUE: u64 = u64::MAX;

struct Inner {
    slots: FxHashMap<u64, Object>,
    next_fresh: u64,
    free_list: Vec<u64>,
}

/// Per-caller-context table of live handles. `spec.md` §4.C: "Handle table:
/// allocated per dispatcher instance."
pub struct HandleTable {
    inner: Mutex<Inner>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// `spec.md` §4.C allocates this table "per dispatcher instance";
    /// `crate::runtime::RuntimeConfig` sizes the initial reservation so a
    /// dispatcher expecting many handles avoids early rehashing.
    pub fn with_capacity(capacity: usize) -> Self {
        HandleTable {
            inner: Mutex::new(Inner {
                slots: FxHashMap::with_capacity_and_hasher(capacity, Default::default()),
                // Handle 0 is reserved (spec.md §3); dense allocation starts at 1.
                next_fresh: 1,
                free_list: Vec::new(),
            }),
        }
    }

    /// Bumps `object`'s refcount (by holding a clone of the `Arc`) and
    /// returns a fresh handle for it.
    pub fn allocate_handle(&self, object: Object) -> u64 {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let handle = match inner.free_list.pop() {
            Some(h) => h,
            None => {
                let h = inner.next_fresh;
                inner.next_fresh += 1;
                h
            }
        };
        inner.slots.insert(handle, object);
        handle
    }

    /// Returns a strong clone of the object bound to `handle`, valid for
    /// the duration of the caller's in-flight call (`spec.md` §4.C: "a
    /// borrowed pointer valid for the call's duration"). Fails
    /// `INVALID_HANDLE` if no live handle matches, or `INVALID_OBJECT_TYPE`
    /// if `expected_kind` is given and does not match.
    pub fn resolve_handle(&self, handle: u64, expected_kind: Option<ObjectKind>) -> Result<Object> {
        if handle == 0 || handle == INVALID_HANDLE_VALUE {
            return Err(Error::InvalidHandle);
        }
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let obj = inner.slots.get(&handle).ok_or(Error::InvalidHandle)?;
        if let Some(kind) = expected_kind {
            if obj.kind() != kind {
                return Err(Error::InvalidObjectType);
            }
        }
        Ok(obj.clone())
    }

    /// Invalidates `handle`'s slot and releases the table's reference.
    pub fn close_handle(&self, handle: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.slots.remove(&handle).is_none() {
            return Err(Error::InvalidHandle);
        }
        inner.free_list.push(handle);
        Ok(())
    }

    /// Returns the next live handle greater than `prev` whose kind matches
    /// `kind_filter` (or any kind, if `None`), in ascending handle order, or
    /// [`INVALID_HANDLE_VALUE`] once exhausted. Seed with
    /// `INVALID_HANDLE_VALUE` to start from the beginning (`spec.md`
    /// §4.C).
    pub fn next(&self, prev: u64, kind_filter: Option<ObjectKind>) -> u64 {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let lower_bound = if prev == INVALID_HANDLE_VALUE { 0 } else { prev };
        let mut candidates: Vec<u64> = inner
            .slots
            .iter()
            .filter(|(h, obj)| {
                **h > lower_bound && kind_filter.map_or(true, |k| obj.kind() == k)
            })
            .map(|(h, _)| *h)
            .collect();
        candidates.sort_unstable();
        candidates.into_iter().next().unwrap_or(INVALID_HANDLE_VALUE)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectBody;
    use std::sync::Arc;

    struct Dummy(ObjectKind);
    impl ObjectBody for Dummy {
        fn kind(&self) -> ObjectKind {
            self.0
        }
    }

    #[test]
    fn allocate_resolve_close_round_trip() {
        let table = HandleTable::new();
        let h = table.allocate_handle(Arc::new(Dummy(ObjectKind::Map)));
        assert!(h != 0 && h != INVALID_HANDLE_VALUE);
        table.resolve_handle(h, Some(ObjectKind::Map)).unwrap();
        table.close_handle(h).unwrap();
        assert_eq!(table.resolve_handle(h, None).unwrap_err(), Error::InvalidHandle);
    }

    #[test]
    fn resolve_wrong_kind_is_invalid_object_type() {
        let table = HandleTable::new();
        let h = table.allocate_handle(Arc::new(Dummy(ObjectKind::Map)));
        assert_eq!(
            table.resolve_handle(h, Some(ObjectKind::Program)).unwrap_err(),
            Error::InvalidObjectType
        );
    }

    #[test]
    fn close_handle_releases_refcount() {
        let table = HandleTable::new();
        let obj: crate::object::Object = Arc::new(Dummy(ObjectKind::Map));
        let h = table.allocate_handle(Arc::clone(&obj));
        assert_eq!(Arc::strong_count(&obj), 2);
        table.close_handle(h).unwrap();
        assert_eq!(Arc::strong_count(&obj), 1);
    }

    #[test]
    fn next_handle_visits_each_live_handle_exactly_once() {
        let table = HandleTable::new();
        let h1 = table.allocate_handle(Arc::new(Dummy(ObjectKind::Program)));
        let h2 = table.allocate_handle(Arc::new(Dummy(ObjectKind::Map)));
        let h3 = table.allocate_handle(Arc::new(Dummy(ObjectKind::Program)));

        let mut seen = Vec::new();
        let mut cur = INVALID_HANDLE_VALUE;
        loop {
            cur = table.next(cur, None);
            if cur == INVALID_HANDLE_VALUE {
                break;
            }
            seen.push(cur);
        }
        assert_eq!(seen, vec![h1, h2, h3]);
    }

    #[test]
    fn next_handle_kind_filter_skips_other_kinds() {
        let table = HandleTable::new();
        let h1 = table.allocate_handle(Arc::new(Dummy(ObjectKind::Program)));
        let _h2 = table.allocate_handle(Arc::new(Dummy(ObjectKind::Map)));
        let h3 = table.allocate_handle(Arc::new(Dummy(ObjectKind::Program)));

        let first = table.next(INVALID_HANDLE_VALUE, Some(ObjectKind::Program));
        assert_eq!(first, h1);
        let second = table.next(first, Some(ObjectKind::Program));
        assert_eq!(second, h3);
        let third = table.next(second, Some(ObjectKind::Program));
        assert_eq!(third, INVALID_HANDLE_VALUE);
    }

    #[test]
    fn freed_handle_slot_is_reused() {
        let table = HandleTable::new();
        let h1 = table.allocate_handle(Arc::new(Dummy(ObjectKind::Map)));
        table.close_handle(h1).unwrap();
        let h2 = table.allocate_handle(Arc::new(Dummy(ObjectKind::Map)));
        assert_eq!(h1, h2);
    }
}
