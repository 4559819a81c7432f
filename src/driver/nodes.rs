//! Static routing of memory targets to device nodes and allocation requests.

use crate::error::{MemError, MemResult};
use crate::mem::Target;

/// Which allocation request a target is served by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocKind {
    /// Pageable memory, `ALLOC_GENERIC`.
    Generic,
    /// DMA-capable or 32-bit addressable memory, `ALLOC_COHERENT`.
    Coherent,
}

/// One allocator character device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeviceNode {
    Generic = 0,
    Ocm = 1,
    Dms0 = 2,
    Dms1 = 3,
    Dms2 = 4,
    Dms3 = 5,
}

impl DeviceNode {
    pub const COUNT: usize = 6;

    pub const ALL: [Self; Self::COUNT] = [
        Self::Generic,
        Self::Ocm,
        Self::Dms0,
        Self::Dms1,
        Self::Dms2,
        Self::Dms3,
    ];

    /// Tag embedded in a [`ChunkId`](crate::mem::ChunkId).
    #[must_use]
    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// Inverse of [`tag`](Self::tag).
    ///
    /// # Errors
    /// Returns `InvalidArgument` for a tag no node carries.
    pub fn from_tag(tag: u8) -> MemResult<Self> {
        Self::ALL
            .get(usize::from(tag))
            .copied()
            .ok_or_else(|| MemError::InvalidArgument(format!("unknown device node tag {tag}")))
    }

    #[must_use]
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::Generic => "simaai-mem",
            Self::Ocm => "simaai-mem-ocm",
            Self::Dms0 => "simaai-mem-dms0",
            Self::Dms1 => "simaai-mem-dms1",
            Self::Dms2 => "simaai-mem-dms2",
            Self::Dms3 => "simaai-mem-dms3",
        }
    }
}

struct Route {
    target: Target,
    node: DeviceNode,
    kind: AllocKind,
}

// Indexed by the target's numeric value.
const ROUTES: [Route; 8] = [
    Route { target: Target::Generic, node: DeviceNode::Generic, kind: AllocKind::Generic },
    Route { target: Target::Ocm, node: DeviceNode::Ocm, kind: AllocKind::Coherent },
    Route { target: Target::Dms0, node: DeviceNode::Dms0, kind: AllocKind::Coherent },
    Route { target: Target::Dms1, node: DeviceNode::Dms1, kind: AllocKind::Coherent },
    Route { target: Target::Dms2, node: DeviceNode::Dms2, kind: AllocKind::Coherent },
    Route { target: Target::Dms3, node: DeviceNode::Dms3, kind: AllocKind::Coherent },
    Route { target: Target::Ev74, node: DeviceNode::Generic, kind: AllocKind::Coherent },
    Route { target: Target::M4, node: DeviceNode::Generic, kind: AllocKind::Coherent },
];

fn route(target: Target) -> &'static Route {
    &ROUTES[target as usize]
}

/// Device node that owns allocations for `target`.
#[must_use]
pub fn node_for(target: Target) -> DeviceNode {
    route(target).node
}

/// Allocation request used for `target`.
#[must_use]
pub fn alloc_kind_for(target: Target) -> AllocKind {
    route(target).kind
}
