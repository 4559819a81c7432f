//! Explicit cache maintenance for chunks shared with non-coherent cores.
//!
//! A producer cleans ("flushes") the lines it wrote before handing the buffer
//! over; a consumer cleans and invalidates before reading. Nothing here runs
//! automatically on map, unmap or copy.

use crate::mem::Chunk;
use crate::utils::align_down;

/// Granule the range walk advances by.
pub const CACHE_LINE_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheOp {
    /// Write dirty lines back, keep them cached.
    Clean,
    /// Write dirty lines back, then drop them.
    CleanInvalidate,
}

#[cfg(target_arch = "aarch64")]
mod arch {
    use std::arch::asm;

    #[inline(always)]
    pub unsafe fn clean_line(addr: usize) {
        unsafe { asm!("dc cvac, {0}", in(reg) addr, options(nostack, preserves_flags)) }
    }

    #[inline(always)]
    pub unsafe fn clean_invalidate_line(addr: usize) {
        unsafe { asm!("dc civac, {0}", in(reg) addr, options(nostack, preserves_flags)) }
    }

    #[inline(always)]
    pub fn store_barrier() {
        unsafe { asm!("dsb st", options(nostack, preserves_flags)) }
    }

    #[inline(always)]
    pub fn full_barrier() {
        unsafe { asm!("dsb sy", options(nostack, preserves_flags)) }
    }
}

#[cfg(target_arch = "x86_64")]
mod arch {
    use std::arch::x86_64::{_mm_clflush, _mm_mfence, _mm_sfence};

    // x86 has no user-mode clean-only instruction; clflush writes back and evicts.
    #[inline(always)]
    pub unsafe fn clean_line(addr: usize) {
        unsafe { _mm_clflush(addr as *const u8) }
    }

    #[inline(always)]
    pub unsafe fn clean_invalidate_line(addr: usize) {
        unsafe { _mm_clflush(addr as *const u8) }
    }

    #[inline(always)]
    pub fn store_barrier() {
        unsafe { _mm_sfence() }
    }

    #[inline(always)]
    pub fn full_barrier() {
        unsafe { _mm_mfence() }
    }
}

#[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
mod arch {
    use std::sync::atomic::{Ordering, fence};

    #[inline(always)]
    pub unsafe fn clean_line(_addr: usize) {}

    #[inline(always)]
    pub unsafe fn clean_invalidate_line(_addr: usize) {}

    #[inline(always)]
    pub fn store_barrier() {
        fence(Ordering::SeqCst);
    }

    #[inline(always)]
    pub fn full_barrier() {
        fence(Ordering::SeqCst);
    }
}

unsafe fn maintain_range(op: CacheOp, start: *const u8, len: usize) {
    if len == 0 {
        return;
    }

    let end = start as usize + len;
    let mut line = align_down(start as usize, CACHE_LINE_SIZE);
    while line < end {
        unsafe {
            match op {
                CacheOp::Clean => arch::clean_line(line),
                CacheOp::CleanInvalidate => arch::clean_invalidate_line(line),
            }
        }
        line += CACHE_LINE_SIZE;
    }

    // One barrier for the whole range.
    match op {
        CacheOp::Clean => arch::store_barrier(),
        CacheOp::CleanInvalidate => arch::full_barrier(),
    }
}

/// Writes back every cache line touching `[start, start + len)`.
///
/// # Safety
/// The range must be mapped in this process.
pub unsafe fn clean_range(start: *const u8, len: usize) {
    unsafe { maintain_range(CacheOp::Clean, start, len) }
}

/// Writes back and invalidates every cache line touching `[start, start + len)`.
///
/// # Safety
/// The range must be mapped in this process.
pub unsafe fn clean_invalidate_range(start: *const u8, len: usize) {
    unsafe { maintain_range(CacheOp::CleanInvalidate, start, len) }
}

/// Resolves a `(offset, size)` request against a chunk of `len` bytes.
///
/// `size == 0` selects everything from `offset` to the end. The result never
/// extends past `len`; `None` means there is nothing to do.
fn clamp_range(len: usize, offset: usize, size: usize) -> Option<(usize, usize)> {
    if offset >= len {
        return None;
    }
    let avail = len - offset;
    let size = if size == 0 { avail } else { size.min(avail) };
    Some((offset, size))
}

impl Chunk {
    /// Cleans the whole chunk. Call after the last CPU write.
    pub fn flush_cache(&self) {
        self.flush_cache_part(0, 0);
    }

    /// Cleans `[offset, offset + size)`, clamped to the chunk. No-op when unmapped.
    pub fn flush_cache_part(&self, offset: usize, size: usize) {
        self.maintain(CacheOp::Clean, offset, size);
    }

    /// Cleans and invalidates the whole chunk. Call before the first CPU read.
    pub fn invalidate_cache(&self) {
        self.invalidate_cache_part(0, 0);
    }

    /// Cleans and invalidates `[offset, offset + size)`, clamped to the chunk.
    /// No-op when unmapped.
    pub fn invalidate_cache_part(&self, offset: usize, size: usize) {
        self.maintain(CacheOp::CleanInvalidate, offset, size);
    }

    fn maintain(&self, op: CacheOp, offset: usize, size: usize) {
        let Some(vaddr) = self.virtual_address() else {
            return;
        };
        let Some((offset, len)) = clamp_range(self.size(), offset, size) else {
            return;
        };
        unsafe { maintain_range(op, vaddr.as_ptr().add(offset), len) }
    }
}
