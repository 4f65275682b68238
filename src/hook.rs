//! The hook invoker (`spec.md` §4.I).
//!
//! A [`Hook`] is a concrete provider built on [`crate::extension`]: it
//! registers its own `attach_cb`/`detach_cb` pair that, on a successful
//! attach, extracts the client's invoke capability from its
//! [`BindingContext`] (tagged `Xdp` or `Bind`, matched against the hook's
//! own [`HookKind`] — a mismatch refuses the attach rather than ever
//! downcasting by pointer) and appends it to an `Arc`-snapshotted list in
//! registration order.
//!
//! Two concrete hook kinds are wired up here, matching the scenarios in
//! `spec.md` §8 (S1 drop-packet is an XDP-like hook, S2 bind-monitor is a
//! BIND-like hook), with the combining rule `spec.md` §4.I leaves
//! implementation-specified per hook.

use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::extension::{BindingContext, ClientId, DispatchTable, ExtensionRegistry, Provider};
use crate::platform::Guid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    /// Last-registered program's result wins (`spec.md` §4.I).
    Xdp,
    /// Most restrictive result wins. This crate treats a larger `u32`
    /// policy result as more restrictive (the convention `0` = allow,
    /// nonzero = a deny/restrict code of increasing severity), so the
    /// combining rule is `max` over all attached clients' results.
    Bind,
}

type Invoker = Arc<dyn Fn(&[u8]) -> u32 + Send + Sync>;
type InvokerList = Arc<Mutex<Arc<Vec<(ClientId, Invoker)>>>>;

/// A hook attach point: a provider (`spec.md` §3 "Provider... the
/// component owning a hook and fanning it out to attached clients").
pub struct Hook {
    kind: HookKind,
    provider: Provider,
    invokers: InvokerList,
}

impl Hook {
    /// Registers a new hook as a provider at `interface_id` (`spec.md`
    /// §4.F `provider_load`).
    pub fn new(registry: &ExtensionRegistry, interface_id: Guid, kind: HookKind) -> Result<Hook> {
        let invokers: InvokerList = Arc::new(Mutex::new(Arc::new(Vec::new())));

        let attach_invokers = Arc::clone(&invokers);
        let expected_kind = kind;
        let attach_cb = Box::new(move |client_id: ClientId, binding_ctx: BindingContext, _client_data: Arc<[u8]>, _client_dispatch: Arc<DispatchTable>| {
            let kind_matches = matches!(
                (&binding_ctx, expected_kind),
                (BindingContext::Xdp(_), HookKind::Xdp) | (BindingContext::Bind(_), HookKind::Bind)
            );
            if !kind_matches {
                return Err(Error::ExtensionFailedToLoad);
            }
            let invoke = binding_ctx.invoker();
            let mut guard = attach_invokers.lock().unwrap_or_else(|e| e.into_inner());
            let mut next = (**guard).clone();
            next.push((client_id, invoke));
            *guard = Arc::new(next);
            Ok(())
        });

        let detach_invokers = Arc::clone(&invokers);
        let detach_cb = Box::new(move |client_id: ClientId| {
            let mut guard = detach_invokers.lock().unwrap_or_else(|e| e.into_inner());
            let mut next = (**guard).clone();
            next.retain(|(id, _)| *id != client_id);
            *guard = Arc::new(next);
        });

        let provider_dispatch = Arc::new(DispatchTable { version: 1, entries: Vec::new() });
        let provider = registry.provider_load(interface_id, Arc::from(Vec::new()), provider_dispatch, attach_cb, detach_cb)?;

        Ok(Hook { kind, provider, invokers })
    }

    pub fn interface_id(&self) -> Guid {
        self.provider.interface_id()
    }

    pub fn kind(&self) -> HookKind {
        self.kind
    }

    /// `spec.md` §4.I: "iterates its client list; for each client, calls
    /// `program_invoke`... Ordering: registration order. A program
    /// returning a non-success result does NOT short-circuit." Every
    /// attached client is always invoked; only the combining rule differs
    /// by [`HookKind`].
    pub fn fire(&self, caller_context: &[u8]) -> u32 {
        let snapshot = Arc::clone(&self.invokers.lock().unwrap_or_else(|e| e.into_inner()));
        match self.kind {
            HookKind::Xdp => {
                let mut result = 0;
                for (_, invoke) in snapshot.iter() {
                    result = invoke(caller_context);
                }
                result
            }
            HookKind::Bind => snapshot.iter().map(|(_, invoke)| invoke(caller_context)).max().unwrap_or(0),
        }
    }

    pub fn attached_count(&self) -> usize {
        self.invokers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Consumes the hook, handing its [`Provider`] back to
    /// [`ExtensionRegistry::provider_unload`].
    pub fn into_provider(self) -> Provider {
        self.provider
    }
}
