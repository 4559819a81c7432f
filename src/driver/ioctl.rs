//! Fixed-layout request structs for the contiguous memory allocator driver.
//!
//! This is the single ABI generation the library speaks. A deployment must run a
//! kernel driver with the same command numbers and struct layouts.

use crate::utils::iowr;

// ===============================================================================================
// Constants
// ===============================================================================================

pub const SIMAAI_IOCTL_BASE: u32 = 0x53; // 'S'

/// Upper bound on the number of segments in one batch transaction.
pub const SIMAAI_MAX_SEGMENTS: usize = 16;

// Memory flags
pub const SIMAAI_MEM_FLAG_CACHED: u32 = 1 << 0;
pub const SIMAAI_MEM_FLAG_RDONLY: u32 = 1 << 1;
pub const SIMAAI_MEM_FLAG_DEFAULT: u32 = 0;

// Memory targets
pub const SIMAAI_MEM_TARGET_GENERIC: u32 = 0;
pub const SIMAAI_MEM_TARGET_OCM: u32 = 1;
pub const SIMAAI_MEM_TARGET_DMS0: u32 = 2;
pub const SIMAAI_MEM_TARGET_DMS1: u32 = 3;
pub const SIMAAI_MEM_TARGET_DMS2: u32 = 4;
pub const SIMAAI_MEM_TARGET_DMS3: u32 = 5;
pub const SIMAAI_MEM_TARGET_EV74: u32 = 6;
pub const SIMAAI_MEM_TARGET_M4: u32 = 7;

// Info query selectors
pub const SIMAAI_INFO_BY_ID: u32 = 0;
pub const SIMAAI_INFO_BY_PHYS: u32 = 1;

// ===============================================================================================
// Allocation
// ===============================================================================================

/// Pageable allocation. `size` goes in as the request and comes back as the
/// (possibly rounded up) allocated length.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct AllocGenericArgs {
    pub size: u64,
    pub flags: u32,
    pub id: u32,
}

/// DMA-capable allocation for on-chip, core-local and 32-bit addressable memories.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct AllocCoherentArgs {
    pub size: u64,
    pub phys_addr: u64,
    pub bus_addr: u64,
    pub flags: u32,
    pub target: u32,
    pub id: u32,
    pub pad: u32,
}

/// Several segments reserved in one transaction.
///
/// `phys_addr[i]` and `bus_addr[i]` are the base of the mapping-capable unit the
/// segment lives in; `offset[i]` is the segment's position inside that unit.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct AllocSegmentsArgs {
    pub size: [u64; SIMAAI_MAX_SEGMENTS],
    pub phys_addr: [u64; SIMAAI_MAX_SEGMENTS],
    pub bus_addr: [u64; SIMAAI_MAX_SEGMENTS],
    pub offset: [u64; SIMAAI_MAX_SEGMENTS],
    pub num_segments: u32,
    pub flags: u32,
    pub target: u32,
    pub id: u32,
}

// ===============================================================================================
// Info
// ===============================================================================================

/// Looks up a live allocation either by `(id, segment)` or by `phys_addr`,
/// depending on `query`. The driver fills in the rest, including which segment
/// of how many the address belongs to.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct InfoArgs {
    pub query: u32,
    pub segment: u32,
    pub id: u32,
    pub target: u32,
    pub phys_addr: u64,
    pub bus_addr: u64,
    pub size: u64,
    pub offset: u64,
    pub flags: u32,
    pub num_segments: u32,
}

// ===============================================================================================
// Free
// ===============================================================================================

/// Releases one allocation unit. For a segment batch every member's effective
/// physical address must be listed.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct FreeArgs {
    pub phys_addr: [u64; SIMAAI_MAX_SEGMENTS],
    pub num_segments: u32,
    pub pad: u32,
}

// ===============================================================================================
// IOCTL Command Definitions
// ===============================================================================================

pub const SIMAAI_IOC_MEM_ALLOC_GENERIC: u32 = iowr::<AllocGenericArgs>(SIMAAI_IOCTL_BASE, 0x01);
pub const SIMAAI_IOC_MEM_ALLOC_COHERENT: u32 =
    iowr::<AllocCoherentArgs>(SIMAAI_IOCTL_BASE, 0x02);
pub const SIMAAI_IOC_MEM_ALLOC_SEGMENTS: u32 =
    iowr::<AllocSegmentsArgs>(SIMAAI_IOCTL_BASE, 0x03);
pub const SIMAAI_IOC_MEM_INFO: u32 = iowr::<InfoArgs>(SIMAAI_IOCTL_BASE, 0x04);
pub const SIMAAI_IOC_MEM_FREE: u32 = iowr::<FreeArgs>(SIMAAI_IOCTL_BASE, 0x05);
