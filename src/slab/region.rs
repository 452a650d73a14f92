//! Backing-region mapping helper.
//!
//! The pool itself never maps memory — it manages whatever extent the
//! caller hands it, typically a segment created by an external shared-memory
//! manager. This module is the minimal stand-in for that collaborator:
//! an anonymous `MAP_SHARED` mapping, which forked workers inherit and
//! share, released on drop. Callers with their own segment manager can
//! ignore it entirely and pass the pool a raw extent.

use std::fmt;
use std::io;
use std::ptr::NonNull;

#[derive(Debug)]
pub enum RegionError {
    MapFailed(io::Error),
    UnmapFailed(io::Error),
    InvalidLength { len: usize },
}

impl fmt::Display for RegionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionError::MapFailed(e) => write!(f, "region mapping failed: {e}"),
            RegionError::UnmapFailed(e) => write!(f, "region unmapping failed: {e}"),
            RegionError::InvalidLength { len } => {
                write!(f, "invalid region length: {len}")
            }
        }
    }
}

impl std::error::Error for RegionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RegionError::MapFailed(e) | RegionError::UnmapFailed(e) => Some(e),
            RegionError::InvalidLength { .. } => None,
        }
    }
}

/// An owned, page-aligned, zero-initialized mapping.
///
/// On Unix the mapping is `MAP_SHARED | MAP_ANON`, so processes forked
/// after creation address the same physical memory — the arrangement the
/// pool's shared-state layout is built for. On Windows the mapping is
/// process-private committed memory; sharing there requires a real segment
/// manager.
pub struct MappedRegion {
    base: NonNull<u8>,
    len: usize,
}

// Safety: MappedRegion owns the mapping; the raw pointer is only a base
// address, not a borrow of thread-local state.
unsafe impl Send for MappedRegion {}

impl MappedRegion {
    /// Map a fresh region of `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns `RegionError` if `len` is zero or the OS refuses the
    /// mapping.
    pub fn new(len: usize) -> Result<Self, RegionError> {
        if len == 0 {
            return Err(RegionError::InvalidLength { len });
        }
        // Safety: FFI call; len validated non-zero.
        let base = unsafe { platform::map_shared(len)? };
        Ok(Self { base, len })
    }

    #[must_use]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // Safety: base/len describe exactly the mapping we created.
        unsafe {
            drop(platform::unmap(self.base, self.len));
        }
    }
}

/// The OS page size, a sensible default for the pool's page granule.
#[must_use]
pub fn os_page_size() -> usize {
    platform::page_size()
}

#[cfg(unix)]
mod platform {
    use super::RegionError;
    use std::io;
    use std::ptr::NonNull;

    pub(super) unsafe fn map_shared(len: usize) -> Result<NonNull<u8>, RegionError> {
        // Safety: FFI call to mmap; anonymous mapping, no fd.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANON,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(RegionError::MapFailed(io::Error::last_os_error()));
        }

        // Safety: a successful mmap returns a non-null page-aligned address.
        Ok(unsafe { NonNull::new_unchecked(ptr.cast::<u8>()) })
    }

    pub(super) unsafe fn unmap(base: NonNull<u8>, len: usize) -> Result<(), RegionError> {
        // Safety: FFI call to munmap on a mapping we own.
        if unsafe { libc::munmap(base.as_ptr().cast::<libc::c_void>(), len) } != 0 {
            return Err(RegionError::UnmapFailed(io::Error::last_os_error()));
        }
        Ok(())
    }

    pub(super) fn page_size() -> usize {
        // Safety: sysconf is always safe to call.
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz > 0 { sz as usize } else { 4096 }
    }
}

#[cfg(windows)]
mod platform {
    use super::RegionError;
    use std::io;
    use std::ptr::NonNull;

    pub(super) unsafe fn map_shared(len: usize) -> Result<NonNull<u8>, RegionError> {
        // Safety: FFI call to VirtualAlloc.
        let ptr = unsafe {
            libc::VirtualAlloc(
                std::ptr::null_mut(),
                len,
                libc::MEM_RESERVE | libc::MEM_COMMIT,
                libc::PAGE_READWRITE,
            )
        };

        NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| RegionError::MapFailed(io::Error::last_os_error()))
    }

    pub(super) unsafe fn unmap(base: NonNull<u8>, _len: usize) -> Result<(), RegionError> {
        // Safety: FFI call to VirtualFree; MEM_RELEASE frees the whole
        // allocation, size must be zero.
        if unsafe { libc::VirtualFree(base.as_ptr().cast(), 0, libc::MEM_RELEASE) } == 0 {
            return Err(RegionError::UnmapFailed(io::Error::last_os_error()));
        }
        Ok(())
    }

    pub(super) fn page_size() -> usize {
        4096
    }
}
