//! The runtime (`spec.md` §9 redesign note: "Global mutable state...
//! re-express as a single process-wide `Runtime` value created at init,
//! passed explicitly").
//!
//! Owns every table component A–I name: the epoch domain, the handle
//! table, the pinning table, the extension registry, and the
//! well-known hooks. `RuntimeConfig`/`RuntimeBuilder` mirror `eventp`'s
//! `Eventp::new(capacity, flags)` constructor and its `builder.rs`
//! method-chaining style, generalized to this crate's three constructor-
//! time knobs.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::collaborators::Collaborators;
use crate::epoch::EpochDomain;
use crate::extension::ExtensionRegistry;
use crate::handle::HandleTable;
use crate::hook::{Hook, HookKind};
use crate::object::ObjectKind;
use crate::pin::PinningTable;
use crate::platform::Guid;

/// Constructor-time configuration. `spec.md` §6.5: "Persisted state:
/// none" — there is no on-disk config, only these in-memory knobs.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    pub handle_table_capacity: usize,
    pub pinning_table_capacity: usize,
    /// Forwarded to `crate::platform` allocations; surfaced here rather
    /// than as a global so two `Runtime`s in one process (e.g. two
    /// independent tests) can run with different leak-diagnostics
    /// verbosity.
    pub leak_diagnostics: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            handle_table_capacity: 0,
            pinning_table_capacity: 0,
            leak_diagnostics: false,
        }
    }
}

/// Method-chaining builder, the same shape as `eventp::builder`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_table_capacity(mut self, capacity: usize) -> Self {
        self.config.handle_table_capacity = capacity;
        self
    }

    pub fn pinning_table_capacity(mut self, capacity: usize) -> Self {
        self.config.pinning_table_capacity = capacity;
        self
    }

    pub fn leak_diagnostics(mut self, enabled: bool) -> Self {
        self.config.leak_diagnostics = enabled;
        self
    }

    pub fn build(self, collaborators: Arc<dyn Collaborators>) -> Runtime {
        Runtime::new(self.config, collaborators)
    }
}

/// The process-wide value every core operation is a method of, or takes
/// a reference to, instead of reaching for global state.
pub struct Runtime {
    config: RuntimeConfig,
    pub domain: Arc<EpochDomain>,
    pub handles: HandleTable,
    pub pins: PinningTable,
    pub registry: ExtensionRegistry,
    pub collaborators: Arc<dyn Collaborators>,
    hooks: FxHashMap<u32, Hook>,
}

/// `spec.md` §8 scenario S1: the XDP-like hook well-known callers attach
/// drop/pass programs to.
pub const HOOK_XDP: u32 = 1;
/// `spec.md` §8 scenario S2: the bind-like hook.
pub const HOOK_BIND: u32 = 2;

impl Runtime {
    pub fn new(config: RuntimeConfig, collaborators: Arc<dyn Collaborators>) -> Self {
        let domain = Arc::new(EpochDomain::new());
        let handles = HandleTable::with_capacity(config.handle_table_capacity);
        let pins = PinningTable::with_capacity(config.pinning_table_capacity);
        let registry = ExtensionRegistry::new();

        let mut hooks = FxHashMap::default();
        hooks.insert(HOOK_XDP, Hook::new(&registry, Guid::new_v4(), HookKind::Xdp).expect("well-known hook registration cannot collide on a fresh registry"));
        hooks.insert(HOOK_BIND, Hook::new(&registry, Guid::new_v4(), HookKind::Bind).expect("well-known hook registration cannot collide on a fresh registry"));

        Runtime { config, domain, handles, pins, registry, collaborators, hooks }
    }

    pub fn config(&self) -> RuntimeConfig {
        self.config
    }

    /// Looks up a well-known hook by its wire-level id (`spec.md` §4.H
    /// `ATTACH_CODE`/`DETACH_CODE`: "u64 handle, u32 hook").
    pub fn hook(&self, hook_id: u32) -> Option<&Hook> {
        self.hooks.get(&hook_id)
    }

    /// Read-only enumeration surface over the handle table, by kind.
    /// Mirrors `spec.md` §4.C `next_handle`, exposed at the runtime level
    /// for callers that want "every live program" rather than "the next
    /// handle after N".
    pub fn programs(&self) -> Vec<u64> {
        self.handles_of_kind(ObjectKind::Program)
    }

    pub fn maps(&self) -> Vec<u64> {
        self.handles_of_kind(ObjectKind::Map)
    }

    /// Every currently-pinned name, the pinning-table counterpart of
    /// [`Self::programs`]/[`Self::maps`].
    pub fn pins(&self) -> Vec<Vec<u8>> {
        self.pins.names()
    }

    fn handles_of_kind(&self, kind: ObjectKind) -> Vec<u64> {
        let mut out = Vec::new();
        let mut cur = crate::handle::INVALID_HANDLE_VALUE;
        loop {
            cur = self.handles.next(cur, Some(kind));
            if cur == crate::handle::INVALID_HANDLE_VALUE {
                break;
            }
            out.push(cur);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{AlwaysAcceptVerifier, DefaultCollaborators, StaticHelperTable};

    fn test_collaborators() -> Arc<dyn Collaborators> {
        struct NoopBackend;
        impl crate::collaborators::CodeBackend for NoopBackend {
            fn jit_compile(&self, b: &[u8]) -> crate::error::Result<Vec<u8>> {
                Ok(b.to_vec())
            }
            fn interpret(&self, _b: &[u8], _ctx: u64) -> u32 {
                0
            }
        }
        Arc::new(DefaultCollaborators {
            verifier: Arc::new(AlwaysAcceptVerifier),
            backend: Arc::new(NoopBackend),
            helpers: Arc::new(StaticHelperTable::new()),
        })
    }

    #[test]
    fn well_known_hooks_are_registered_at_construction() {
        let runtime = RuntimeBuilder::new().build(test_collaborators());
        assert!(runtime.hook(HOOK_XDP).is_some());
        assert!(runtime.hook(HOOK_BIND).is_some());
        assert!(runtime.hook(999).is_none());
    }

    #[test]
    fn programs_and_maps_start_empty() {
        let runtime = RuntimeBuilder::new().build(test_collaborators());
        assert!(runtime.programs().is_empty());
        assert!(runtime.maps().is_empty());
        assert!(runtime.pins().is_empty());
    }
}
