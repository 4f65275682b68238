//! Platform primitives (`spec.md` §4.A).
//!
//! Allocation of executable/non-executable memory, GUID generation,
//! monotonic timestamps and byte-verbatim UTF-8 comparison. Everything
//! here is a thin, directly-FFI wrapper in the same spirit as `eventp`'s
//! `utils::epoll_ctl`, which called `libc::epoll_ctl` straight through
//! rather than going via `nix`'s higher-level wrapper when it needed a
//! raw fd it didn't otherwise have. Here the raw syscall is `mmap`/
//! `mprotect` instead of `epoll_ctl`.

use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;
use std::time::Instant;

use rand::RngCore;

use crate::error::{Error, Result};

/// Tag attached to every allocation for leak diagnostics, as `spec.md`
/// §4.A requires ("All allocations are tagged with a purpose").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocPurpose {
    ProgramCode,
    MapStorage,
    HandleTable,
}

impl fmt::Display for AllocPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AllocPurpose::ProgramCode => "program-code",
            AllocPurpose::MapStorage => "map-storage",
            AllocPurpose::HandleTable => "handle-table",
        };
        f.write_str(s)
    }
}

/// A 128-bit version-4 GUID, used as an attach-type and interface-id
/// identifier throughout the crate.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Guid(pub [u8; 16]);

impl Guid {
    /// Generates a random version-4 GUID (`spec.md` §4.A: "GUID generation
    /// (random, version 4)").
    pub fn new_v4() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        // Version 4: top nibble of byte 6 is 0b0100.
        bytes[6] = (bytes[6] & 0x0f) | 0x40;
        // Variant 1 (RFC 4122): top two bits of byte 8 are 0b10.
        bytes[8] = (bytes[8] & 0x3f) | 0x80;
        Guid(bytes)
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15]
        )
    }
}

/// Byte-verbatim UTF-8 comparison: case-sensitive, not normalised.
///
/// Used for pinning names (`spec.md` §4.D, Open Question 2: "byte-verbatim
/// is the safe default").
pub fn utf8_eq(a: &[u8], b: &[u8]) -> bool {
    a == b
}

/// A monotonic timestamp in nanoseconds since an arbitrary, process-local
/// epoch. Only differences between two calls are meaningful.
pub fn monotonic_timestamp_nanos() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = *START.get_or_init(Instant::now);
    Instant::now().saturating_duration_since(start).as_nanos() as u64
}

/// A region of process memory owned by the allocator below.
///
/// Dropping it unmaps the region. `executable` regions are mapped
/// read+exec only (never writable at the same time: the loader fills the
/// bytes via a writable staging buffer first, see `program.rs`).
pub struct MemRegion {
    ptr: NonNull<u8>,
    len: usize,
    executable: bool,
    purpose: AllocPurpose,
}

// SAFETY: the region is exclusively owned by this handle; no interior
// mutability is exposed except through `&mut` accessors below.
unsafe impl Send for MemRegion {}
unsafe impl Sync for MemRegion {}

impl MemRegion {
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Copies `code` into the region and, for executable regions, flips
    /// the mapping from read+write to read+exec. `spec.md` §4.G step 4:
    /// "For JIT: mark the region executable-only."
    pub fn finalize(&mut self, code: &[u8]) -> Result<()> {
        if code.len() > self.len {
            return Err(Error::InvalidParameter);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), self.ptr.as_ptr(), code.len());
        }
        if self.executable {
            let prot = libc::PROT_READ | libc::PROT_EXEC;
            let ret = unsafe {
                libc::mprotect(self.ptr.as_ptr() as *mut c_void, self.len, prot)
            };
            if ret != 0 {
                return Err(Error::OutOfResources);
            }
        }
        Ok(())
    }
}

impl Drop for MemRegion {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.ptr.as_ptr() as *mut c_void, self.len) };
        if ret != 0 {
            log::warn!("munmap of {} region ({} bytes) failed", self.purpose, self.len);
        }
    }
}

/// Allocates `size` bytes, initially read+write, optionally destined to
/// become executable (`spec.md` §4.A: "allocate/free of executable and
/// non-executable memory"). Fails with [`Error::OutOfResources`]; never
/// returns partially-initialised memory (the mapping is zero-filled by the
/// kernel).
pub fn allocate(size: usize, executable: bool, purpose: AllocPurpose) -> Result<MemRegion> {
    if size == 0 {
        return Err(Error::InvalidParameter);
    }
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
    let ptr = unsafe {
        libc::mmap(std::ptr::null_mut(), size, prot, flags, -1, 0)
    };
    if ptr == libc::MAP_FAILED {
        log::debug!("mmap failed for {purpose} allocation of {size} bytes");
        return Err(Error::OutOfResources);
    }
    log::trace!("allocated {size} bytes for {purpose} (executable={executable})");
    Ok(MemRegion {
        // SAFETY: mmap did not return MAP_FAILED, and the requested size is
        // non-zero, so the pointer is non-null.
        ptr: unsafe { NonNull::new_unchecked(ptr as *mut u8) },
        len: size,
        executable,
        purpose,
    })
}
