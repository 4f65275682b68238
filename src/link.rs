//! The link object (`spec.md` §3 "Link").
//!
//! A link binds exactly one program to one hook attachment; its lifetime
//! controls the attachment (dropping the last reference does not detach
//! automatically — `spec.md` §4.G requires an explicit `detach`, matching
//! the way a [`crate::handle::HandleTable`] entry is released by
//! `close_handle` rather than by `Drop` alone, since detaching also has
//! to run the provider's `detach_cb`).
//!
//! Holds its program by strong [`Arc`] (`spec.md` §9 redesign note 4:
//! "links own only strong references downward"); the upward edge to the
//! hook's provider is owned entirely by the [`crate::extension::Client`]
//! it wraps, which itself holds only a [`std::sync::Weak`] back to the
//! provider.

use std::sync::{Arc, Mutex};

use crate::extension::Client;
use crate::object::{ObjectBody, ObjectKind};
use crate::platform::Guid;
use crate::program::ProgramObject;

pub struct LinkObject {
    program: Arc<ProgramObject>,
    // `Mutex<Option<_>>` rather than a bare `Client` so `detach` can take
    // the client out through a shared `&LinkObject` — the handle table
    // only ever hands out `Arc<dyn ObjectBody>` clones, never a uniquely
    // owned `LinkObject`, so consuming `self` by value is not available to
    // [`crate::program::detach`].
    client: Mutex<Option<Client>>,
    hook_attach_type: Guid,
}

impl LinkObject {
    pub fn new(program: Arc<ProgramObject>, client: Client, hook_attach_type: Guid) -> Self {
        LinkObject { program, client: Mutex::new(Some(client)), hook_attach_type }
    }

    pub fn program(&self) -> &Arc<ProgramObject> {
        &self.program
    }

    pub fn hook_attach_type(&self) -> Guid {
        self.hook_attach_type
    }

    /// Takes the client out for [`crate::program::detach`]. Returns `None`
    /// if already detached.
    pub(crate) fn take_client(&self) -> Option<Client> {
        self.client.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

impl ObjectBody for LinkObject {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Link
    }
}
