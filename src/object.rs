//! The object model (`spec.md` §3 "Object").
//!
//! `spec.md` §9 calls for re-expressing "manual ref-counting on intrusive
//! Objects" as first-class ownership: every long-lived entity here is an
//! `Arc<dyn ObjectBody>`. A handle, a pinning entry, and a link each hold
//! one strong `Arc` clone; the handle table's weak upward references (used
//! where the original had a cyclic intrusive pointer) are `Weak`, which
//! upgrades to `None` once the strong count reaches zero instead of ever
//! dereferencing a dangling pointer.

use std::sync::Arc;

use downcast_rs::{impl_downcast, DowncastSync};

/// The kind tag every [`Object`] carries, fixed for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Map,
    Program,
    Link,
    PinningEntry,
}

impl ObjectKind {
    pub const fn name(self) -> &'static str {
        match self {
            ObjectKind::Map => "MAP",
            ObjectKind::Program => "PROGRAM",
            ObjectKind::Link => "LINK",
            ObjectKind::PinningEntry => "PINNING_ENTRY",
        }
    }
}

/// The behavior every object kind must provide: a stable kind tag and,
/// via [`DowncastSync`], a way to reach its concrete type for the handle
/// table's typed resolution (`spec.md` §4.C: `resolve_handle` "fails
/// `INVALID_OBJECT_TYPE`"). `downcast-rs`'s blanket impl covers every
/// `T: Any + Send + Sync`, so no concrete `ObjectBody` impl has anything
/// to add here beyond `kind()`.
pub trait ObjectBody: DowncastSync {
    fn kind(&self) -> ObjectKind;
}
impl_downcast!(sync ObjectBody);

/// A reference-counted handle to any kind of object. `Object::strong_count`
/// backs the refcount invariant of `spec.md` §8 property 1: the count
/// equals the number of handles, pinning entries, links and in-flight
/// calls that reference it, since every one of those holds exactly one
/// clone of this `Arc`.
pub type Object = Arc<dyn ObjectBody>;

/// Downcasts an [`Object`] to a concrete body, failing the caller's
/// `resolve_handle`/`pin::find` call with `INVALID_OBJECT_TYPE` rather than
/// ever performing a raw pointer cast (`spec.md` §9 redesign note: binding
/// contexts and, by extension, object bodies are checked by tag/type, not
/// cast by pointer).
pub fn downcast<T: ObjectBody>(obj: &Object) -> Option<&T> {
    obj.downcast_ref::<T>()
}

/// Like [`downcast`], but recovers an owned `Arc<T>` instead of a
/// borrowed reference, for callers (`crate::program::attach`) that need
/// to keep the concrete type beyond the current call's borrow.
pub fn downcast_arc<T: ObjectBody>(obj: &Object) -> Option<Arc<T>> {
    Arc::clone(obj).downcast_arc::<T>().ok()
}
