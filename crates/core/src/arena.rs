//! The per-query virtual-memory arena.
//!
//! One contiguous anonymous mapping serves as both the database's staging
//! area for a query (base-table images, string literals) and the guest's
//! linear memory. Host-side regions bump-allocate from the low end; the high
//! end stays free for the guest's own heap. Guest pointers are 32-bit
//! offsets from the arena base.
//!
//! With guard pages enabled, every appended region is followed by one
//! `PROT_NONE` page; the next region starts past it. A guest pointer that
//! overshoots a region traps in the engine instead of silently corrupting
//! its neighbor.

use memmap2::MmapMut;
use once_cell::sync::Lazy;
use std::io;
use thiserror::Error;

/// Size of one Wasm linear-memory page.
pub const WASM_PAGE_SIZE: usize = 64 * 1024;

/// The OS page size, queried once.
pub static OS_PAGE_SIZE: Lazy<usize> =
    Lazy::new(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize });

pub fn is_page_aligned(offset: usize) -> bool {
    offset % *OS_PAGE_SIZE == 0
}

fn ceil_to_page(offset: usize) -> usize {
    offset.next_multiple_of(*OS_PAGE_SIZE)
}

#[derive(Debug, Error)]
pub enum ArenaError {
    #[error("failed to reserve a {size} byte arena")]
    Reserve { size: usize, source: io::Error },
    #[error("failed to change page protection at offset {offset:#x}")]
    Protect { offset: usize, source: io::Error },
    #[error("arena exhausted: {requested} bytes requested, {available} available")]
    Exhausted { requested: usize, available: usize },
    #[error("arena access out of bounds: offset {offset:#x} + {len} exceeds {size} bytes")]
    OutOfBounds { offset: u32, len: usize, size: usize },
    #[error("no NUL terminator within the arena after offset {offset:#x}")]
    UnterminatedString { offset: u32 },
}

/// The reserved region. Host-side appends go through [`Arena::append`];
/// everything past [`Arena::guest_heap_base`] belongs to the guest.
pub struct Arena {
    map: MmapMut,
    base: *mut u8,
    size: usize,
    /// First byte past the last appended region, page-aligned. The guard
    /// page, when enabled, sits at `[heap, heap + page)`.
    heap: usize,
    guard_pages: bool,
    has_guard: bool,
}

// The arena is owned by exactly one query; the guest and all host callbacks
// that touch it run on the same thread, sequentially.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Reserves `size` bytes (rounded up to a whole number of Wasm pages).
    pub fn reserve(size: usize, guard_pages: bool) -> Result<Self, ArenaError> {
        let size = size.next_multiple_of(WASM_PAGE_SIZE);
        let mut map =
            MmapMut::map_anon(size).map_err(|source| ArenaError::Reserve { size, source })?;
        let base = map.as_mut_ptr();
        Ok(Arena {
            map,
            base,
            size,
            heap: 0,
            guard_pages,
            has_guard: false,
        })
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Offset of the first byte past the host-side regions. Always
    /// page-aligned; with guard pages enabled the page at this offset is
    /// inaccessible.
    pub fn heap(&self) -> usize {
        self.heap
    }

    /// Where the guest's own allocations may start: past the heap watermark
    /// and its guard page.
    pub fn guest_heap_base(&self) -> usize {
        if self.has_guard {
            self.heap + *OS_PAGE_SIZE
        } else {
            self.heap
        }
    }

    /// Appends a host-side region and returns its offset. The heap is
    /// rounded up to page granularity afterwards; with guard pages enabled
    /// the new region starts past the previous guard page and is itself
    /// followed by a fresh one.
    pub fn append(&mut self, bytes: &[u8]) -> Result<u32, ArenaError> {
        debug_assert!(is_page_aligned(self.heap));
        let offset = self.guest_heap_base();
        let end = ceil_to_page(offset + bytes.len());
        let tail = if self.guard_pages { *OS_PAGE_SIZE } else { 0 };
        if end + tail > self.size {
            return Err(ArenaError::Exhausted {
                requested: bytes.len(),
                available: self.size.saturating_sub(offset + tail),
            });
        }
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(offset), bytes.len());
        }
        self.heap = end;
        if self.guard_pages {
            self.protect(self.heap, *OS_PAGE_SIZE, libc::PROT_NONE)?;
            self.has_guard = true;
        }
        debug_assert!(is_page_aligned(self.heap));
        Ok(offset as u32)
    }

    fn protect(&mut self, offset: usize, len: usize, prot: libc::c_int) -> Result<(), ArenaError> {
        let rc = unsafe { libc::mprotect(self.base.add(offset).cast(), len, prot) };
        if rc != 0 {
            return Err(ArenaError::Protect {
                offset,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    fn check_bounds(&self, offset: u32, len: usize) -> Result<(), ArenaError> {
        let ok = (offset as usize)
            .checked_add(len)
            .map_or(false, |end| end <= self.size);
        if !ok {
            return Err(ArenaError::OutOfBounds {
                offset,
                len,
                size: self.size,
            });
        }
        Ok(())
    }

    /// A view of `len` bytes at `offset`.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that no write to the same range happens for
    /// the lifetime of the returned slice. Within a query this holds because
    /// the guest and all host callbacks run sequentially on one thread.
    pub unsafe fn slice(&self, offset: u32, len: usize) -> Result<&[u8], ArenaError> {
        self.check_bounds(offset, len)?;
        Ok(std::slice::from_raw_parts(
            self.base.add(offset as usize),
            len,
        ))
    }

    /// A mutable view of `len` bytes at `offset`.
    ///
    /// # Safety
    ///
    /// As for [`Arena::slice`]; additionally the range must not overlap any
    /// live view.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, offset: u32, len: usize) -> Result<&mut [u8], ArenaError> {
        self.check_bounds(offset, len)?;
        Ok(std::slice::from_raw_parts_mut(
            self.base.add(offset as usize),
            len,
        ))
    }

    /// Reads the NUL-terminated byte string at `offset`, without the NUL.
    ///
    /// # Safety
    ///
    /// As for [`Arena::slice`].
    pub unsafe fn c_str(&self, offset: u32, max_len: usize) -> Result<&[u8], ArenaError> {
        let available = self.size.saturating_sub(offset as usize);
        let hay = self.slice(offset, max_len.min(available))?;
        match hay.iter().position(|&b| b == 0) {
            Some(n) => Ok(&hay[..n]),
            None => Err(ArenaError::UnterminatedString { offset }),
        }
    }

    /// Whether a guard page is currently installed at the heap watermark.
    pub fn heap_page_is_guarded(&self) -> bool {
        self.has_guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_is_page_aligned() {
        let mut arena = Arena::reserve(4 * WASM_PAGE_SIZE, false).unwrap();
        let off = arena.append(b"hello").unwrap();
        assert_eq!(off, 0);
        assert!(is_page_aligned(arena.heap()));
        let off2 = arena.append(&[7u8; 5000]).unwrap();
        assert!(is_page_aligned(off2 as usize));
        assert!(arena.heap() >= off2 as usize + 5000);
        assert_eq!(unsafe { arena.slice(off, 5).unwrap() }, b"hello");
    }

    #[test]
    fn guard_pages_leave_a_hole_after_each_region() {
        let mut arena = Arena::reserve(16 * WASM_PAGE_SIZE, true).unwrap();
        let a = arena.append(&[1u8; 100]).unwrap();
        let heap_after_a = arena.heap();
        let b = arena.append(&[2u8; 100]).unwrap();
        // The second region starts past the first one's guard page.
        assert_eq!(b as usize, heap_after_a + *OS_PAGE_SIZE);
        assert_eq!(unsafe { arena.slice(a, 100).unwrap() }, &[1u8; 100][..]);
        assert_eq!(unsafe { arena.slice(b, 100).unwrap() }, &[2u8; 100][..]);
        assert!(arena.heap_page_is_guarded());
        assert!(is_page_aligned(arena.heap()));
        assert_eq!(arena.guest_heap_base(), arena.heap() + *OS_PAGE_SIZE);
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut arena = Arena::reserve(WASM_PAGE_SIZE, false).unwrap();
        assert!(arena.append(&[0u8; 2 * WASM_PAGE_SIZE]).is_err());
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let arena = Arena::reserve(WASM_PAGE_SIZE, false).unwrap();
        assert!(unsafe { arena.slice(0, WASM_PAGE_SIZE + 1) }.is_err());
        assert!(unsafe { arena.slice(u32::MAX, 1) }.is_err());
    }

    #[test]
    fn c_str_stops_at_nul() {
        let mut arena = Arena::reserve(WASM_PAGE_SIZE, false).unwrap();
        arena.append(b"abc\0def").unwrap();
        assert_eq!(unsafe { arena.c_str(0, 64).unwrap() }, b"abc");
        assert_eq!(unsafe { arena.c_str(4, 64).unwrap() }, b"def");
    }
}
