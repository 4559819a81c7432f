use crate::driver::ioctl::{
    FreeArgs, SIMAAI_MEM_FLAG_CACHED, SIMAAI_MEM_FLAG_RDONLY, SIMAAI_MEM_TARGET_DMS0,
    SIMAAI_MEM_TARGET_DMS1, SIMAAI_MEM_TARGET_DMS2, SIMAAI_MEM_TARGET_DMS3,
    SIMAAI_MEM_TARGET_EV74, SIMAAI_MEM_TARGET_GENERIC, SIMAAI_MEM_TARGET_M4,
    SIMAAI_MEM_TARGET_OCM,
};
use crate::driver::{AllocatorDevice, DeviceNode};
use crate::error::{FreeError, FreeResult, MemError, MemResult};
use std::fmt;
use std::io;
use std::os::unix::io::AsRawFd;
use std::ptr::{self, NonNull};
use std::str::FromStr;
use std::sync::Arc;

// ===============================================================================================
// Targets & Flags
// ===============================================================================================

/// Hardware domain a chunk is reserved for.
///
/// Some targets only address 32 bits, others have dedicated local memories, so
/// the target decides both the device node and the allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Target {
    /// CMA-backed memory usable by the application cores.
    Generic = SIMAAI_MEM_TARGET_GENERIC,
    /// On-chip memory.
    Ocm = SIMAAI_MEM_TARGET_OCM,
    /// Core-local memory banks.
    Dms0 = SIMAAI_MEM_TARGET_DMS0,
    Dms1 = SIMAAI_MEM_TARGET_DMS1,
    Dms2 = SIMAAI_MEM_TARGET_DMS2,
    Dms3 = SIMAAI_MEM_TARGET_DMS3,
    /// Memory visible to the EV74 DSP cores.
    Ev74 = SIMAAI_MEM_TARGET_EV74,
    /// Memory visible to the M4 microcontroller.
    M4 = SIMAAI_MEM_TARGET_M4,
}

impl Target {
    pub const ALL: [Self; 8] = [
        Self::Generic,
        Self::Ocm,
        Self::Dms0,
        Self::Dms1,
        Self::Dms2,
        Self::Dms3,
        Self::Ev74,
        Self::M4,
    ];

    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Generic => "generic",
            Self::Ocm => "ocm",
            Self::Dms0 => "dms0",
            Self::Dms1 => "dms1",
            Self::Dms2 => "dms2",
            Self::Dms3 => "dms3",
            Self::Ev74 => "ev74",
            Self::M4 => "m4",
        }
    }
}

impl TryFrom<u32> for Target {
    type Error = MemError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_raw() == value)
            .ok_or(MemError::UnsupportedTarget(value))
    }
}

impl FromStr for Target {
    type Err = MemError;

    /// Accepts either the target name (`"ocm"`) or its numeric value (`"1"`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(t) = Self::ALL.into_iter().find(|t| t.name().eq_ignore_ascii_case(s)) {
            return Ok(t);
        }
        let raw = s
            .parse::<u32>()
            .map_err(|_| MemError::InvalidArgument(format!("unknown memory target '{s}'")))?;
        Self::try_from(raw)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Flags fixed at allocation time. The default is non-cacheable and writable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocFlags {
    pub cached: bool,
    pub read_only: bool,
}

impl AllocFlags {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn cached(mut self) -> Self {
        self.cached = true;
        self
    }

    #[must_use]
    pub const fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Converts high-level flags into the raw bitmask carried by the allocation requests.
    #[must_use]
    pub const fn to_ioctl_flags(self) -> u32 {
        let mut ioc_flags = 0;
        if self.cached {
            ioc_flags |= SIMAAI_MEM_FLAG_CACHED;
        }
        if self.read_only {
            ioc_flags |= SIMAAI_MEM_FLAG_RDONLY;
        }
        ioc_flags
    }

    /// Unknown bits reported by the driver are ignored.
    #[must_use]
    pub const fn from_ioctl_flags(raw: u32) -> Self {
        Self {
            cached: raw & SIMAAI_MEM_FLAG_CACHED != 0,
            read_only: raw & SIMAAI_MEM_FLAG_RDONLY != 0,
        }
    }
}

// ===============================================================================================
// Identifiers
// ===============================================================================================

const ID_SEGMENT_SHIFT: u32 = 32;
const ID_NODE_SHIFT: u32 = 40;

/// Opaque token naming a live allocation, suitable for passing to another process.
///
/// Layout: `node tag (8) | segment index (8) | driver id (32)`. The node tag tells
/// the attaching side which device node to query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkId(u64);

impl ChunkId {
    #[must_use]
    pub fn new(node: DeviceNode, segment: u8, raw: u32) -> Self {
        Self(
            (u64::from(node.tag()) << ID_NODE_SHIFT)
                | (u64::from(segment) << ID_SEGMENT_SHIFT)
                | u64::from(raw),
        )
    }

    #[must_use]
    pub const fn from_u64(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// # Errors
    /// Returns `InvalidArgument` when the embedded tag names no device node.
    pub fn node(self) -> MemResult<DeviceNode> {
        let tag = (self.0 >> ID_NODE_SHIFT) & 0xFF;
        if self.0 >> (ID_NODE_SHIFT + 8) != 0 {
            return Err(MemError::InvalidArgument(format!("malformed chunk id {self}")));
        }
        DeviceNode::from_tag(tag as u8)
    }

    #[must_use]
    pub const fn segment(self) -> u8 {
        ((self.0 >> ID_SEGMENT_SHIFT) & 0xFF) as u8
    }

    /// The id the driver assigned to the allocation unit.
    #[must_use]
    pub const fn raw(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl FromStr for ChunkId {
    type Err = MemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => s.parse::<u64>(),
        };
        parsed
            .map(Self)
            .map_err(|e| MemError::InvalidArgument(format!("bad chunk id '{s}': {e}")))
    }
}

// ===============================================================================================
// Chunk
// ===============================================================================================

/// How this handle came to exist, which decides what `free` does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Created by an allocation; `free` releases the kernel reservation.
    Owner,
    /// Created by attach; `free` only drops this process' mapping.
    Attached,
}

pub(crate) struct ChunkParts {
    pub device: Arc<dyn AllocatorDevice>,
    pub id: ChunkId,
    pub size: usize,
    pub target: Target,
    pub flags: AllocFlags,
    pub unit_phys: u64,
    pub unit_bus: u64,
    pub offset: usize,
    pub segment_count: u8,
    pub role: Role,
}

/// A handle to one physically contiguous region owned by the allocator driver.
///
/// The chunk keeps a reference to its device node, so mapping and freeing need
/// nothing else. Dropping a chunk unmaps it but leaves the kernel reservation
/// alone; only [`free`](Self::free) releases it.
#[derive(Debug)]
pub struct Chunk {
    device: Arc<dyn AllocatorDevice>,
    id: ChunkId,
    size: usize,
    target: Target,
    flags: AllocFlags,
    // Base of the mapping-capable unit this chunk lives in.
    unit_phys: u64,
    unit_bus: u64,
    offset: usize,
    segment_count: u8,
    role: Role,
    // Effective base: mapping start + offset.
    vaddr: Option<NonNull<u8>>,
}

// The mapping is owned by this handle; shared access only hands out `&[u8]`.
unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

impl Chunk {
    pub(crate) fn from_parts(parts: ChunkParts) -> Self {
        Self {
            device: parts.device,
            id: parts.id,
            size: parts.size,
            target: parts.target,
            flags: parts.flags,
            unit_phys: parts.unit_phys,
            unit_bus: parts.unit_bus,
            offset: parts.offset,
            segment_count: parts.segment_count,
            role: parts.role,
            vaddr: None,
        }
    }

    // ===========================================================================================
    // Accessors
    // ===========================================================================================

    /// Length reported by the driver, which may exceed the requested size.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub const fn target(&self) -> Target {
        self.target
    }

    #[must_use]
    pub const fn flags(&self) -> AllocFlags {
        self.flags
    }

    #[must_use]
    pub const fn physical_address(&self) -> u64 {
        self.unit_phys + self.offset as u64
    }

    #[must_use]
    pub const fn bus_address(&self) -> u64 {
        self.unit_bus + self.offset as u64
    }

    /// Position inside the shared allocation unit; nonzero only for batch members.
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub const fn id(&self) -> ChunkId {
        self.id
    }

    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub const fn segment_index(&self) -> u8 {
        self.id.segment()
    }

    /// Number of chunks sharing this chunk's kernel allocation (1 for a plain allocation).
    #[must_use]
    pub const fn segment_count(&self) -> u8 {
        self.segment_count
    }

    #[must_use]
    pub const fn is_mapped(&self) -> bool {
        self.vaddr.is_some()
    }

    /// Current mapping, if any. Never maps implicitly.
    #[must_use]
    pub const fn virtual_address(&self) -> Option<NonNull<u8>> {
        self.vaddr
    }

    #[must_use]
    pub fn as_slice(&self) -> Option<&[u8]> {
        self.vaddr
            .map(|p| unsafe { std::slice::from_raw_parts(p.as_ptr(), self.size) })
    }

    /// `None` when unmapped or read-only.
    #[must_use]
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        if self.flags.read_only {
            return None;
        }
        self.vaddr
            .map(|p| unsafe { std::slice::from_raw_parts_mut(p.as_ptr(), self.size) })
    }

    const fn mapping_len(&self) -> usize {
        self.size + self.offset
    }

    // ===========================================================================================
    // Map / Unmap
    // ===========================================================================================

    /// Maps the chunk into this process and returns its base address.
    ///
    /// The whole unit prefix (`offset + size` bytes) is mapped from the unit's
    /// physical base so that the returned address points at this chunk's first byte.
    /// Mapping an already-mapped chunk returns the existing address.
    ///
    /// # Errors
    /// Returns `MappingError` if the device rejects the mapping.
    pub fn map(&mut self) -> MemResult<NonNull<u8>> {
        if let Some(vaddr) = self.vaddr {
            return Ok(vaddr);
        }

        let len = self.mapping_len();
        let prot = if self.flags.read_only {
            libc::PROT_READ
        } else {
            libc::PROT_READ | libc::PROT_WRITE
        };
        let file_offset = libc::off_t::try_from(self.unit_phys)
            .map_err(|_| MemError::Mapping(io::Error::from_raw_os_error(libc::EOVERFLOW)))?;

        let ret = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                prot,
                libc::MAP_SHARED,
                self.device.as_raw_fd(),
                file_offset,
            )
        };
        if ret == libc::MAP_FAILED {
            return Err(MemError::Mapping(io::Error::last_os_error()));
        }

        let base = ret.cast::<u8>();
        let vaddr = NonNull::new(unsafe { base.add(self.offset) })
            .ok_or_else(|| MemError::Mapping(io::Error::from_raw_os_error(libc::EFAULT)))?;
        self.vaddr = Some(vaddr);

        tracing::debug!(id = %self.id, len, "mapped chunk at {:p}", vaddr);
        Ok(vaddr)
    }

    /// Releases the mapping. Unmapping an unmapped chunk does nothing.
    pub fn unmap(&mut self) {
        let Some(vaddr) = self.vaddr.take() else {
            return;
        };

        let base = unsafe { vaddr.as_ptr().sub(self.offset) };
        let ret = unsafe { libc::munmap(base.cast(), self.mapping_len()) };
        if ret < 0 {
            tracing::warn!(
                id = %self.id,
                "munmap failed: {}",
                io::Error::last_os_error()
            );
        }
    }

    // ===========================================================================================
    // Free
    // ===========================================================================================

    /// Unmaps the chunk and releases its kernel reservation.
    ///
    /// For an attached chunk this is the same as [`detach`](Self::detach): the
    /// allocating side stays responsible for the reservation.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for a member of a multi-segment batch (those are
    /// freed together through [`Session::free_segments`](crate::mem::Session::free_segments)),
    /// and `Free` if the driver rejects the request. Either way the chunk comes
    /// back inside the error and the reservation is still live.
    pub fn free(mut self) -> FreeResult<Chunk> {
        if self.role == Role::Attached {
            self.unmap();
            tracing::debug!(id = %self.id, "detached chunk");
            return Ok(());
        }

        if self.segment_count > 1 {
            let error = MemError::InvalidArgument(format!(
                "chunk {} is one of {} segments; free the whole batch",
                self.id, self.segment_count
            ));
            return Err(FreeError::new(error, self));
        }

        self.unmap();

        let mut args = FreeArgs {
            num_segments: 1,
            ..FreeArgs::default()
        };
        args.phys_addr[0] = self.physical_address();
        if let Err(e) = self.device.free(&mut args) {
            return Err(FreeError::new(MemError::Free(e), self));
        }

        tracing::debug!(id = %self.id, "freed chunk at phys {:#x}", args.phys_addr[0]);
        Ok(())
    }

    /// Drops this handle and its mapping without touching the kernel reservation.
    pub fn detach(mut self) {
        self.unmap();
    }

    pub(crate) fn device(&self) -> &Arc<dyn AllocatorDevice> {
        &self.device
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        self.unmap();
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "id = {} size = {}, target = {}, phys address = {:#x}, bus address = {:#x}",
            self.id,
            self.size,
            self.target,
            self.physical_address(),
            self.bus_address()
        )
    }
}
