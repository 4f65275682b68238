//! The extension registry (`spec.md` §4.F).
//!
//! A rendezvous between one "provider" (a hook implementation) and the
//! "clients" attached to it, paired by `interface_id`. Per `spec.md` §9's
//! redesign note 2, the opaque `void*` binding context the original
//! exchanges between provider and client is re-expressed here as
//! [`BindingContext`], a tagged enum the receiving end matches on rather
//! than downcasts by pointer cast.
//!
//! A provider's client list is snapshotted as an `Arc<Vec<_>>` behind a
//! short-lived lock: a reader clones the `Arc` and releases the lock
//! immediately, then iterates the snapshot lock-free. `spec.md` §5 asks
//! for this list to be "traversed under epoch protection so invoke never
//! blocks on detach" — `Arc`'s own refcounting gives the same guarantee
//! (the snapshot a reader holds stays alive for as long as it holds the
//! `Arc`, independent of any writer racing ahead) without routing an
//! unrelated subsystem through the map engine's [`crate::epoch::EpochDomain`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::platform::Guid;

pub type ClientId = u64;

/// `spec.md` §4.F: "Dispatch tables are plain vectors of function
/// pointers with a version and size prefix; callers must check both."
/// Entries are stored as raw addresses; this crate never calls through
/// one itself (that is `crate::program`'s job once a dispatch table has
/// been resolved against the caller's expected version).
#[derive(Debug)]
pub struct DispatchTable {
    pub version: u32,
    pub entries: Vec<u64>,
}

impl DispatchTable {
    /// `spec.md` §4.F: "Contract failure is `INVALID_OBJECT`." This
    /// crate's taxonomy (§6.2) has no separate `INVALID_OBJECT` code, so a
    /// version or bounds mismatch here is reported as
    /// [`Error::InvalidObjectType`], the closest existing variant.
    pub fn get(&self, index: usize, expected_version: u32) -> Result<u64> {
        if self.version != expected_version {
            return Err(Error::InvalidObjectType);
        }
        self.entries.get(index).copied().ok_or(Error::InvalidObjectType)
    }
}

/// `spec.md` §9 redesign note 2: a tagged variant replacing the opaque
/// `void*` binding context a client hands to a provider on attach. Each
/// variant carries the capability a provider needs to fire that client:
/// a callback taking the hook's opaque caller context and returning the
/// program's `u32` policy result (`spec.md` §4.G `invoke`).
#[derive(Clone)]
pub enum BindingContext {
    Xdp(Arc<dyn Fn(&[u8]) -> u32 + Send + Sync>),
    Bind(Arc<dyn Fn(&[u8]) -> u32 + Send + Sync>),
}

impl BindingContext {
    pub fn invoker(&self) -> Arc<dyn Fn(&[u8]) -> u32 + Send + Sync> {
        match self {
            BindingContext::Xdp(f) | BindingContext::Bind(f) => Arc::clone(f),
        }
    }
}

type AttachFn = Box<dyn Fn(ClientId, BindingContext, Arc<[u8]>, Arc<DispatchTable>) -> Result<()> + Send + Sync>;
type DetachFn = Box<dyn Fn(ClientId) + Send + Sync>;

struct ProviderState {
    interface_id: Guid,
    provider_data: Arc<[u8]>,
    provider_dispatch: Arc<DispatchTable>,
    attach_cb: AttachFn,
    detach_cb: DetachFn,
    clients: Mutex<Arc<Vec<ClientId>>>,
    next_client_id: AtomicU64,
    unloading: AtomicBool,
}

/// A registered provider. Returned by [`ExtensionRegistry::provider_load`];
/// consumed by [`ExtensionRegistry::provider_unload`].
pub struct Provider(Arc<ProviderState>);

impl Provider {
    pub fn interface_id(&self) -> Guid {
        self.0.interface_id
    }

    /// A lock-free snapshot of currently-attached client ids, in
    /// registration order (`spec.md` §4.I: "Ordering: registration
    /// order"). Used by [`crate::hook`] fan-out.
    pub fn clients_snapshot(&self) -> Arc<Vec<ClientId>> {
        Arc::clone(&self.0.clients.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

/// A client's attachment to a provider. Returned by
/// [`ExtensionRegistry::extension_load`]; consumed by
/// [`ExtensionRegistry::extension_unload`].
///
/// Holds its provider only by [`Weak`] reference (`spec.md` §9 redesign
/// note 4: "links... holding an upward reference through the registry's
/// lookup table, never a direct pointer" — here a client's reference to
/// its provider is the analogous upward edge, and a `Weak` makes it
/// impossible to keep a provider alive past its own `provider_unload`).
pub struct Client {
    pub id: ClientId,
    pub interface_id: Guid,
    provider_data: Arc<[u8]>,
    provider_dispatch: Arc<DispatchTable>,
    provider: Weak<ProviderState>,
}

impl Client {
    pub fn provider_data(&self) -> &Arc<[u8]> {
        &self.provider_data
    }

    pub fn provider_dispatch(&self) -> &Arc<DispatchTable> {
        &self.provider_dispatch
    }
}

/// `spec.md` §4.F: the registry itself. One per [`crate::runtime::Runtime`].
pub struct ExtensionRegistry {
    providers: Mutex<FxHashMap<Guid, Arc<ProviderState>>>,
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        ExtensionRegistry {
            providers: Mutex::new(FxHashMap::default()),
        }
    }

    /// `spec.md` §4.F `provider_load`. Fails [`Error::AlreadyExists`] if a
    /// provider is already registered at `interface_id` (the invariant
    /// "clients and providers are paired by interface-id" presumes one
    /// provider per interface).
    #[allow(clippy::too_many_arguments)]
    pub fn provider_load(
        &self,
        interface_id: Guid,
        provider_data: Arc<[u8]>,
        provider_dispatch: Arc<DispatchTable>,
        attach_cb: AttachFn,
        detach_cb: DetachFn,
    ) -> Result<Provider> {
        let mut providers = self.providers.lock().unwrap_or_else(|e| e.into_inner());
        if providers.contains_key(&interface_id) {
            return Err(Error::AlreadyExists);
        }
        let state = Arc::new(ProviderState {
            interface_id,
            provider_data,
            provider_dispatch,
            attach_cb,
            detach_cb,
            clients: Mutex::new(Arc::new(Vec::new())),
            next_client_id: AtomicU64::new(1),
            unloading: AtomicBool::new(false),
        });
        providers.insert(interface_id, Arc::clone(&state));
        Ok(Provider(state))
    }

    /// `spec.md` §4.F `provider_unload`: "calls detach for each still-
    /// attached client." Detaches in reverse registration order, the
    /// mirror image of the order clients were fired in.
    pub fn provider_unload(&self, provider: Provider) -> Result<()> {
        let state = provider.0;
        state.unloading.store(true, Ordering::SeqCst);
        let snapshot = Arc::clone(&state.clients.lock().unwrap_or_else(|e| e.into_inner()));
        for &client_id in snapshot.iter().rev() {
            (state.detach_cb)(client_id);
        }
        let mut providers = self.providers.lock().unwrap_or_else(|e| e.into_inner());
        providers.remove(&state.interface_id);
        Ok(())
    }

    /// `spec.md` §4.F `extension_load`: "attaches a client to the sole
    /// provider with matching interface-id." Fails [`Error::NotFound`] if
    /// no provider is registered there, or [`Error::ExtensionFailedToLoad`]
    /// if the provider's `attach_cb` refuses.
    pub fn extension_load(
        &self,
        interface_id: Guid,
        client_data: Arc<[u8]>,
        client_dispatch: Arc<DispatchTable>,
        binding_ctx: BindingContext,
    ) -> Result<Client> {
        let state = {
            let providers = self.providers.lock().unwrap_or_else(|e| e.into_inner());
            providers.get(&interface_id).map(Arc::clone).ok_or(Error::NotFound)?
        };
        let client_id = state.next_client_id.fetch_add(1, Ordering::SeqCst);
        (state.attach_cb)(client_id, binding_ctx, Arc::clone(&client_data), Arc::clone(&client_dispatch))
            .map_err(|_| Error::ExtensionFailedToLoad)?;
        {
            let mut clients = state.clients.lock().unwrap_or_else(|e| e.into_inner());
            let mut next = (**clients).clone();
            next.push(client_id);
            *clients = Arc::new(next);
        }
        Ok(Client {
            id: client_id,
            interface_id,
            provider_data: Arc::clone(&state.provider_data),
            provider_dispatch: Arc::clone(&state.provider_dispatch),
            provider: Arc::downgrade(&state),
        })
    }

    /// `spec.md` §4.F `extension_unload`: "calls the provider's
    /// `detach_cb`... before tearing down." A no-op if the provider has
    /// already been fully unloaded (it already detached every client in
    /// [`Self::provider_unload`]). "Reentrant unload is forbidden": a
    /// `detach_cb` that calls back into `extension_unload` for the same
    /// provider while it is mid-`provider_unload` fails
    /// [`Error::InvalidState`] rather than deadlocking or double-detaching.
    pub fn extension_unload(&self, client: Client) -> Result<()> {
        let Some(state) = client.provider.upgrade() else {
            return Ok(());
        };
        if state.unloading.load(Ordering::SeqCst) {
            return Err(Error::InvalidState);
        }
        (state.detach_cb)(client.id);
        let mut clients = state.clients.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = (**clients).clone();
        next.retain(|&id| id != client.id);
        *clients = Arc::new(next);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn dispatch(version: u32) -> Arc<DispatchTable> {
        Arc::new(DispatchTable { version, entries: vec![0x1000] })
    }

    #[test]
    fn provider_load_rejects_duplicate_interface_id() {
        let registry = ExtensionRegistry::new();
        let id = Guid::new_v4();
        let p1 = registry
            .provider_load(id, Arc::from(vec![]), dispatch(1), Box::new(|_, _, _, _| Ok(())), Box::new(|_| {}))
            .unwrap();
        assert_eq!(
            registry
                .provider_load(id, Arc::from(vec![]), dispatch(1), Box::new(|_, _, _, _| Ok(())), Box::new(|_| {}))
                .unwrap_err(),
            Error::AlreadyExists
        );
        registry.provider_unload(p1).unwrap();
    }

    #[test]
    fn extension_load_against_unknown_interface_id_is_not_found() {
        let registry = ExtensionRegistry::new();
        let err = registry
            .extension_load(
                Guid::new_v4(),
                Arc::from(vec![]),
                dispatch(1),
                BindingContext::Xdp(Arc::new(|_| 0)),
            )
            .unwrap_err();
        assert_eq!(err, Error::NotFound);
    }

    #[test]
    fn attach_refusal_surfaces_as_extension_failed_to_load() {
        let registry = ExtensionRegistry::new();
        let id = Guid::new_v4();
        let provider = registry
            .provider_load(
                id,
                Arc::from(vec![]),
                dispatch(1),
                Box::new(|_, _, _, _| Err(Error::ExtensionFailedToLoad)),
                Box::new(|_| {}),
            )
            .unwrap();
        let err = registry
            .extension_load(id, Arc::from(vec![]), dispatch(1), BindingContext::Xdp(Arc::new(|_| 0)))
            .unwrap_err();
        assert_eq!(err, Error::ExtensionFailedToLoad);
        registry.provider_unload(provider).unwrap();
    }

    #[test]
    fn provider_unload_detaches_every_remaining_client() {
        let registry = ExtensionRegistry::new();
        let id = Guid::new_v4();
        let detach_count = Arc::new(AtomicUsize::new(0));
        let dc = Arc::clone(&detach_count);
        let provider = registry
            .provider_load(
                id,
                Arc::from(vec![]),
                dispatch(1),
                Box::new(|_, _, _, _| Ok(())),
                Box::new(move |_| {
                    dc.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        let _c1 = registry
            .extension_load(id, Arc::from(vec![]), dispatch(1), BindingContext::Xdp(Arc::new(|_| 0)))
            .unwrap();
        let _c2 = registry
            .extension_load(id, Arc::from(vec![]), dispatch(1), BindingContext::Xdp(Arc::new(|_| 0)))
            .unwrap();
        registry.provider_unload(provider).unwrap();
        assert_eq!(detach_count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn extension_unload_removes_client_from_snapshot() {
        let registry = ExtensionRegistry::new();
        let id = Guid::new_v4();
        let provider = registry
            .provider_load(id, Arc::from(vec![]), dispatch(1), Box::new(|_, _, _, _| Ok(())), Box::new(|_| {}))
            .unwrap();
        let client = registry
            .extension_load(id, Arc::from(vec![]), dispatch(1), BindingContext::Xdp(Arc::new(|_| 0)))
            .unwrap();
        assert_eq!(provider.clients_snapshot().len(), 1);
        registry.extension_unload(client).unwrap();
        assert_eq!(provider.clients_snapshot().len(), 0);
        registry.provider_unload(provider).unwrap();
    }
}
