//! The byte region shared with the kernel.
//!
//! All access goes through offset-indexed, bounds-checked accessors. Status
//! words are touched only through atomics since the kernel writes them
//! concurrently; everything else is read after an acquire load of the status
//! that handed the slot to us.

use std::os::fd::RawFd;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicUsize};

use crate::error::{Error, Result};

enum Backing {
    Mmap,
    #[cfg(test)]
    Heap(std::alloc::Layout),
}

pub struct MappedRing {
    ptr: NonNull<u8>,
    len: usize,
    backing: Backing,
}

// SAFETY: the region is plain memory; shared mutation happens only through
// the atomic status accessors, and frame contents are read only while the
// slot's status says user space owns it.
unsafe impl Send for MappedRing {}
unsafe impl Sync for MappedRing {}

impl MappedRing {
    /// Map `len` bytes of the ring configured on `fd`, shared with the kernel.
    pub(crate) fn map(fd: RawFd, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::Setup {
                op: "mmap",
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty ring"),
            });
        }
        // SAFETY: a fresh mapping with no address hint; the result is checked
        // against MAP_FAILED before use.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Error::Setup {
                op: "mmap",
                source: std::io::Error::last_os_error(),
            });
        }
        let ptr = NonNull::new(addr as *mut u8).ok_or_else(|| Error::Setup {
            op: "mmap",
            source: std::io::Error::new(std::io::ErrorKind::Other, "no ring"),
        })?;
        Ok(Self {
            ptr,
            len,
            backing: Backing::Mmap,
        })
    }

    /// Zeroed, page-aligned heap region standing in for the kernel mapping.
    #[cfg(test)]
    pub(crate) fn heap(len: usize) -> Self {
        let layout = std::alloc::Layout::from_size_align(len, 4096).unwrap();
        // SAFETY: layout has non-zero size in every test that builds a ring.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        Self {
            ptr: NonNull::new(raw).unwrap(),
            len,
            backing: Backing::Heap(layout),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    fn fits(&self, offset: usize, size: usize) -> bool {
        offset.checked_add(size).is_some_and(|end| end <= self.len)
    }

    pub(crate) fn u16_at(&self, offset: usize) -> Option<u16> {
        if !self.fits(offset, 2) {
            return None;
        }
        // SAFETY: bounds checked above.
        Some(unsafe { self.ptr.as_ptr().add(offset).cast::<u16>().read_unaligned() })
    }

    pub(crate) fn u32_at(&self, offset: usize) -> Option<u32> {
        if !self.fits(offset, 4) {
            return None;
        }
        // SAFETY: bounds checked above.
        Some(unsafe { self.ptr.as_ptr().add(offset).cast::<u32>().read_unaligned() })
    }

    /// A 32-bit status word. `None` when out of range or misaligned.
    pub(crate) fn status_u32(&self, offset: usize) -> Option<&AtomicU32> {
        if !self.fits(offset, 4) {
            return None;
        }
        // SAFETY: in bounds; alignment is checked before the cast.
        let p = unsafe { self.ptr.as_ptr().add(offset) };
        if p.align_offset(std::mem::align_of::<AtomicU32>()) != 0 {
            return None;
        }
        Some(unsafe { &*(p as *const AtomicU32) })
    }

    /// The `unsigned long` status word of a v1 frame.
    pub(crate) fn status_ulong(&self, offset: usize) -> Option<&AtomicUsize> {
        if !self.fits(offset, std::mem::size_of::<usize>()) {
            return None;
        }
        // SAFETY: in bounds; alignment is checked before the cast.
        let p = unsafe { self.ptr.as_ptr().add(offset) };
        if p.align_offset(std::mem::align_of::<AtomicUsize>()) != 0 {
            return None;
        }
        Some(unsafe { &*(p as *const AtomicUsize) })
    }

    /// `len` bytes at `offset`, clamped to the end of the region.
    pub(crate) fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        let start = offset.min(self.len);
        let end = offset.saturating_add(len).min(self.len);
        // SAFETY: start..end lies within the mapping, which lives as long as
        // &self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(start), end - start) }
    }

    #[cfg(test)]
    pub(crate) fn write(&self, offset: usize, bytes: &[u8]) {
        assert!(self.fits(offset, bytes.len()));
        // SAFETY: bounds asserted; tests own the heap region exclusively.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.ptr.as_ptr().add(offset),
                bytes.len(),
            )
        }
    }
}

impl Drop for MappedRing {
    fn drop(&mut self) {
        match self.backing {
            Backing::Mmap => {
                // SAFETY: ptr/len came from a successful mmap and nothing
                // borrowed from self can outlive it.
                if unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len) } != 0 {
                    tracing::warn!(
                        "munmap of {} byte ring failed: {}",
                        self.len,
                        std::io::Error::last_os_error()
                    );
                }
            }
            #[cfg(test)]
            Backing::Heap(layout) => unsafe { std::alloc::dealloc(self.ptr.as_ptr(), layout) },
        }
    }
}
