//! An in-process runtime for loading, verifying-at-the-boundary, and
//! executing small sandboxed programs attached to named hooks, and the
//! maps they share.
//!
//! Programs arrive as machine code (JIT) or bytecode (interpreted),
//! along with the map handles and helper functions their code
//! references. Once loaded, a program attaches to a hook; when the hook
//! fires, every attached program runs against a caller-supplied context
//! and returns a small integer the caller treats as a policy decision
//! (permit, deny, redirect).
//!
//! # Key Features
//!
//! - **Typed handle table**: callers see only opaque `u64` handles;
//!   [`object::ObjectBody`] implementors are reference-counted
//!   internally and destroyed exactly once their last handle, pin, or
//!   in-flight call releases them.
//! - **Epoch-based reclamation**: map storage and JIT code regions are
//!   freed only once no reader holds an older epoch, so a firing hook
//!   never races a concurrent unload (see [`epoch::EpochDomain`]).
//! - **Pluggable verification/codegen**: the static verifier, the JIT
//!   backend, and the helper-function table are collaborators behind
//!   the [`collaborators::Collaborators`] trait, not hard-wired into
//!   the core (mockable behind the `mock` feature).
//!
//! # Core Concepts
//!
//! - [`runtime::Runtime`]: the process-wide value every operation is a
//!   method of, or takes a reference to, in place of global state.
//! - [`protocol::dispatch`]: the single seam an untrusted caller's
//!   length-prefixed, tagged request bytes cross before reaching a
//!   typed handler.
//! - [`program::ProgramObject`] / [`map::MapObject`] / [`link::LinkObject`]:
//!   the three object kinds the handle table and pinning table hold.
//! - [`hook::Hook`] / [`extension::ExtensionRegistry`]: the provider/client
//!   rendezvous a program's attach/detach runs through, and the fan-out
//!   a hook fire dispatches over.
//!
//! # Examples
//!
//! ```rust
//! use sandrt::collaborators::{AlwaysAcceptVerifier, DefaultCollaborators, StaticHelperTable};
//! use sandrt::runtime::{RuntimeBuilder, HOOK_XDP};
//! use std::sync::Arc;
//!
//! struct NoopBackend;
//! impl sandrt::collaborators::CodeBackend for NoopBackend {
//!     fn jit_compile(&self, bytecode: &[u8]) -> sandrt::error::Result<Vec<u8>> {
//!         Ok(bytecode.to_vec())
//!     }
//!     fn interpret(&self, _bytecode: &[u8], _ctx_ptr: u64) -> u32 {
//!         0
//!     }
//! }
//!
//! let collaborators = Arc::new(DefaultCollaborators {
//!     verifier: Arc::new(AlwaysAcceptVerifier),
//!     backend: Arc::new(NoopBackend),
//!     helpers: Arc::new(StaticHelperTable::new()),
//! });
//! let runtime = RuntimeBuilder::new().build(collaborators);
//! assert!(runtime.hook(HOOK_XDP).is_some());
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]

pub mod collaborators;
pub mod epoch;
pub mod error;
pub mod extension;
pub mod handle;
pub mod hook;
pub mod link;
pub mod map;
pub mod object;
pub mod pin;
pub mod platform;
pub mod program;
pub mod protocol;
pub mod runtime;

pub use crate::error::{Error, ErrorCode, Result};
pub use crate::object::{Object, ObjectBody, ObjectKind};
pub use crate::runtime::{Runtime, RuntimeBuilder, RuntimeConfig};
