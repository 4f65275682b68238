//! Stable caller-visible error taxonomy.
//!
//! [`spec.md` §6.2 / §7]: every handler in this crate returns `Result<T,
//! Error>`; the protocol dispatcher (`protocol.rs`) is the only place an
//! `Error` is ever turned into the numeric wire code a caller sees. Variant
//! order matches the spec's numbering exactly, `SUCCESS = 0` being the
//! absence of an `Error` rather than a variant of it.

use thiserror::Error;

/// The taxonomy of recoverable failures the core can report.
///
/// Fatal conditions (refcount underflow, epoch re-entry, dispatch-table
/// version mismatch) are *not* represented here: they are programming
/// errors and abort the process (see [`crate::fatal`]).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("out of resources")]
    OutOfResources,
    #[error("not found")]
    NotFound,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("no more keys")]
    NoMoreKeys,
    #[error("invalid handle")]
    InvalidHandle,
    #[error("invalid object type")]
    InvalidObjectType,
    #[error("already exists")]
    AlreadyExists,
    #[error("invalid state")]
    InvalidState,
    #[error("busy")]
    Busy,
    #[error("extension failed to load")]
    ExtensionFailedToLoad,
}

pub type Result<T> = std::result::Result<T, Error>;

/// The numeric codes `spec.md` §6.2 promises are stable across versions.
///
/// `SUCCESS` has no `Error` counterpart; callers observe it as `Ok(())`
/// turning into a wire-level `0`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Success = 0,
    OutOfResources = 1,
    NotFound = 2,
    InvalidParameter = 3,
    NoMoreKeys = 4,
    InvalidHandle = 5,
    InvalidObjectType = 6,
    AlreadyExists = 7,
    InvalidState = 8,
    Busy = 9,
    ExtensionFailedToLoad = 10,
}

impl From<Error> for ErrorCode {
    fn from(e: Error) -> Self {
        match e {
            Error::OutOfResources => ErrorCode::OutOfResources,
            Error::NotFound => ErrorCode::NotFound,
            Error::InvalidParameter => ErrorCode::InvalidParameter,
            Error::NoMoreKeys => ErrorCode::NoMoreKeys,
            Error::InvalidHandle => ErrorCode::InvalidHandle,
            Error::InvalidObjectType => ErrorCode::InvalidObjectType,
            Error::AlreadyExists => ErrorCode::AlreadyExists,
            Error::InvalidState => ErrorCode::InvalidState,
            Error::Busy => ErrorCode::Busy,
            Error::ExtensionFailedToLoad => ErrorCode::ExtensionFailedToLoad,
        }
    }
}

impl ErrorCode {
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_result<T>(r: &Result<T>) -> Self {
        match r {
            Ok(_) => ErrorCode::Success,
            Err(e) => ErrorCode::from(*e),
        }
    }
}

/// Aborts the process with a distinguishable fatal code.
///
/// `spec.md` §7: "detected ref-count underflow, epoch re-entry, and
/// dispatch-table version mismatch are programming errors; the core aborts
/// the process... rather than continuing with corrupt invariants." This is
/// not a panic: panics can be caught with `catch_unwind` and would let a
/// caller observe corrupted tables.
#[cold]
#[inline(never)]
pub fn fatal(reason: &str) -> ! {
    log::error!("fatal runtime invariant violation: {reason}");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_round_trip_is_stable() {
        assert_eq!(ErrorCode::Success.as_u32(), 0);
        assert_eq!(ErrorCode::from(Error::OutOfResources).as_u32(), 1);
        assert_eq!(
            ErrorCode::from(Error::ExtensionFailedToLoad).as_u32(),
            10
        );
    }

    #[test]
    fn from_result_maps_ok_to_success() {
        let ok: Result<()> = Ok(());
        assert_eq!(ErrorCode::from_result(&ok), ErrorCode::Success);
        let err: Result<()> = Err(Error::Busy);
        assert_eq!(ErrorCode::from_result(&err), ErrorCode::Busy);
    }
}
