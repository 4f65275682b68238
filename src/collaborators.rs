//! Collaborator interfaces consumed by the core (`spec.md` §6.4).
//!
//! The ELF parser, the static verifier, and the JIT code generator's
//! instruction selection are explicitly out of scope (`spec.md` §1): this
//! module only names the seams the core calls through, the same way
//! `eventp::EventpOps` names the seam between the reactor and the raw
//! `epoll` syscalls so both can be swapped for a mock in tests. The `mock`
//! feature gates a generated `MockCollaborators`, mirroring `eventp`'s own
//! `mock` feature built on the same `mockall` version.

use std::sync::Arc;

use crate::error::Result;

/// One section an ELF enumerator found in a loaded file. Consumed by the
/// external, caller-side loader (`spec.md` §1's "command-line tooling...
/// caller-side thin library"), which extracts one section's bytes and then
/// calls [`crate::program::ProgramEngine::load`] per section — the core
/// dispatcher never calls `elf_enumerate_sections` itself, so this type
/// only documents the seam.
#[derive(Debug, Clone)]
pub struct SectionInfo {
    pub section_name: String,
    pub section_type: String,
    pub map_count: u32,
    pub program_bytes: Vec<u8>,
}

/// `spec.md` §6.4: helper-id resolution table, "static map `u32 helper_id
/// → fn ptr`".
pub trait HelperTable: Send + Sync {
    fn resolve(&self, helper_id: u32) -> Option<u64>;
}

/// A fixed, in-memory helper table built once at startup. In a full system
/// this would be populated by the host embedding the runtime; tests build
/// one directly.
#[derive(Default)]
pub struct StaticHelperTable {
    entries: std::collections::HashMap<u32, u64>,
}

impl StaticHelperTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_helper(mut self, helper_id: u32, address: u64) -> Self {
        self.entries.insert(helper_id, address);
        self
    }
}

impl HelperTable for StaticHelperTable {
    fn resolve(&self, helper_id: u32) -> Option<u64> {
        self.entries.get(&helper_id).copied()
    }
}

/// `spec.md` §6.4: `verifier_verify_section(file_bytes, section_name) →
/// (ok, report_text)`. The verifier itself is out of scope and trusted
/// (`spec.md` §1 Non-goals: "sandboxing against a malicious compiler (the
/// verifier is trusted)"); the core only needs to call through this seam
/// and act on its verdict.
pub trait Verifier: Send + Sync {
    fn verify_section(&self, code: &[u8], section_name: &str) -> (bool, String);
}

/// A verifier that accepts everything. Stands in for the real,
/// out-of-scope static verifier in tests and examples.
pub struct AlwaysAcceptVerifier;

impl Verifier for AlwaysAcceptVerifier {
    fn verify_section(&self, _code: &[u8], _section_name: &str) -> (bool, String) {
        (true, String::new())
    }
}

/// `spec.md` §6.4: `jit_compile(bytecode) → machine_code_bytes` OR
/// `interpreter_run(bytecode, ctx) → u32`. A single trait carries both,
/// since a given deployment of the core may offer either or both
/// execution modes.
pub trait CodeBackend: Send + Sync {
    /// Compiles `bytecode` to directly-callable machine code taking a
    /// single `u64` context pointer and returning the `u32` policy result.
    fn jit_compile(&self, bytecode: &[u8]) -> Result<Vec<u8>>;

    /// Runs `bytecode` against `ctx_ptr` through an in-process bytecode
    /// interpreter.
    fn interpret(&self, bytecode: &[u8], ctx_ptr: u64) -> u32;
}

/// Bundles the three collaborator seams the program engine calls through.
/// `#[cfg_attr(feature = "mock", automock)]` generates `MockCollaborators`
/// for program-engine unit tests, the same pattern `eventp` uses for
/// `EventpOps`.
#[cfg_attr(feature = "mock", mockall::automock)]
pub trait Collaborators: Send + Sync {
    fn verify_section(&self, code: &[u8], section_name: &str) -> (bool, String);
    fn jit_compile(&self, bytecode: &[u8]) -> Result<Vec<u8>>;
    fn interpret(&self, bytecode: &[u8], ctx_ptr: u64) -> u32;
    fn resolve_helper(&self, helper_id: u32) -> Option<u64>;
}

/// The default, real wiring of [`Collaborators`] on top of a [`Verifier`],
/// a [`CodeBackend`] and a [`HelperTable`].
pub struct DefaultCollaborators {
    pub verifier: Arc<dyn Verifier>,
    pub backend: Arc<dyn CodeBackend>,
    pub helpers: Arc<dyn HelperTable>,
}

impl Collaborators for DefaultCollaborators {
    fn verify_section(&self, code: &[u8], section_name: &str) -> (bool, String) {
        self.verifier.verify_section(code, section_name)
    }
    fn jit_compile(&self, bytecode: &[u8]) -> Result<Vec<u8>> {
        self.backend.jit_compile(bytecode)
    }
    fn interpret(&self, bytecode: &[u8], ctx_ptr: u64) -> u32 {
        self.backend.interpret(bytecode, ctx_ptr)
    }
    fn resolve_helper(&self, helper_id: u32) -> Option<u64> {
        self.helpers.resolve(helper_id)
    }
}
