#![allow(clippy::cast_possible_truncation)]

use crate::driver::ioctl::{
    AllocCoherentArgs, AllocGenericArgs, InfoArgs, SIMAAI_INFO_BY_ID,
};
use crate::driver::nodes::{alloc_kind_for, node_for};
use crate::driver::{AllocKind, AllocatorDevice, DeviceNode, MemDevice};
use crate::error::{MemError, MemResult};
use crate::mem::chunk::{ChunkParts, Role};
use crate::mem::{AllocFlags, Chunk, ChunkId, Target};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

pub const DEFAULT_DEVICE_DIR: &str = "/dev";

/// Overrides the directory the allocator device nodes are looked up in.
pub const DEVICE_DIR_ENV: &str = "SIMAAI_MEM_DEVICE_DIR";

type DeviceOpener = dyn Fn(&Path) -> io::Result<Arc<dyn AllocatorDevice>> + Send + Sync;
type DeviceSlot = Mutex<Option<Arc<dyn AllocatorDevice>>>;

// ===============================================================================================
// Configuration
// ===============================================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Directory holding the `simaai-mem*` device nodes.
    pub device_dir: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device_dir: PathBuf::from(DEFAULT_DEVICE_DIR),
        }
    }
}

impl SessionConfig {
    /// Default configuration, with the device directory taken from
    /// `SIMAAI_MEM_DEVICE_DIR` when it is set and non-empty.
    #[must_use]
    pub fn from_env() -> Self {
        match std::env::var_os(DEVICE_DIR_ENV) {
            Some(dir) if !dir.is_empty() => Self {
                device_dir: PathBuf::from(dir),
            },
            _ => Self::default(),
        }
    }

    #[must_use]
    pub fn node_path(&self, node: DeviceNode) -> PathBuf {
        self.device_dir.join(node.file_name())
    }
}

// ===============================================================================================
// Session
// ===============================================================================================

/// An open connection to the allocator driver.
///
/// The session owns one descriptor per device node. The generic node is opened
/// when the session is created; per-target nodes are opened on first use, once,
/// even under concurrent callers. Chunks keep their node's descriptor alive, so
/// they may outlive the session.
pub struct Session {
    config: SessionConfig,
    opener: Box<DeviceOpener>,
    nodes: [DeviceSlot; DeviceNode::COUNT],
}

impl Session {
    /// Opens a session using the configuration from the environment.
    ///
    /// # Errors
    /// Returns `DeviceOpen` if the generic allocator node cannot be opened.
    pub fn open() -> MemResult<Self> {
        Self::new(SessionConfig::from_env())
    }

    /// # Errors
    /// Returns `DeviceOpen` if the generic allocator node cannot be opened.
    pub fn new(config: SessionConfig) -> MemResult<Self> {
        Self::with_opener(config, |path| {
            let device = MemDevice::open(path)?;
            Ok(Arc::new(device) as Arc<dyn AllocatorDevice>)
        })
    }

    /// Builds a session whose device nodes are produced by `opener`.
    ///
    /// # Errors
    /// Returns `DeviceOpen` if `opener` fails for the generic node.
    pub fn with_opener<F>(config: SessionConfig, opener: F) -> MemResult<Self>
    where
        F: Fn(&Path) -> io::Result<Arc<dyn AllocatorDevice>> + Send + Sync + 'static,
    {
        let session = Self {
            config,
            opener: Box::new(opener),
            nodes: std::array::from_fn(|_| Mutex::new(None)),
        };
        session.device(DeviceNode::Generic)?;
        Ok(session)
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The shared handle for `node`, opening it on first use.
    ///
    /// # Errors
    /// Returns `DeviceOpen` if the node cannot be opened.
    pub fn device(&self, node: DeviceNode) -> MemResult<Arc<dyn AllocatorDevice>> {
        let mut slot = self.nodes[usize::from(node.tag())]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(device) = slot.as_ref() {
            return Ok(Arc::clone(device));
        }

        let path = self.config.node_path(node);
        let device =
            (self.opener)(&path).map_err(|source| MemError::DeviceOpen {
                path: path.clone(),
                source,
            })?;
        tracing::debug!(node = ?node, "opened allocator device {}", path.display());

        *slot = Some(Arc::clone(&device));
        Ok(device)
    }

    // ===========================================================================================
    // Allocation
    // ===========================================================================================

    /// Allocates a non-cacheable, writable chunk.
    ///
    /// # Errors
    /// See [`allocate`](Self::allocate).
    pub fn alloc(&self, size: usize, target: Target) -> MemResult<Chunk> {
        self.allocate(size, target, AllocFlags::default())
    }

    /// Allocates one physically contiguous chunk of at least `size` bytes.
    ///
    /// The returned chunk's [`size`](Chunk::size) is what the driver actually
    /// reserved and may be larger than requested.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for a zero size, `DeviceOpen` if the target's
    /// node is unavailable and `Allocation` if the driver refuses the request.
    ///
    /// For [`Target::Generic`] the addresses come from a second request. If that
    /// one fails the result is `Allocation` and the reservation stays behind in
    /// the driver: without its physical address it cannot be freed from here.
    pub fn allocate(&self, size: usize, target: Target, flags: AllocFlags) -> MemResult<Chunk> {
        if size == 0 {
            return Err(MemError::InvalidArgument("allocation size must be nonzero".into()));
        }

        let node = node_for(target);
        let device = self.device(node)?;

        let (size, phys_addr, bus_addr, raw_id) = match alloc_kind_for(target) {
            AllocKind::Generic => {
                let mut args = AllocGenericArgs {
                    size: size as u64,
                    flags: flags.to_ioctl_flags(),
                    id: 0,
                };
                device.alloc_generic(&mut args).map_err(MemError::Allocation)?;

                // The pageable request only hands back an id; addresses come from INFO.
                let mut info = InfoArgs {
                    query: SIMAAI_INFO_BY_ID,
                    id: args.id,
                    ..InfoArgs::default()
                };
                if let Err(e) = device.query_info(&mut info) {
                    tracing::warn!(id = args.id, "allocation info query failed: {e}");
                    return Err(MemError::Allocation(e));
                }
                (info.size, info.phys_addr, info.bus_addr, args.id)
            }
            AllocKind::Coherent => {
                let mut args = AllocCoherentArgs {
                    size: size as u64,
                    flags: flags.to_ioctl_flags(),
                    target: target.as_raw(),
                    ..AllocCoherentArgs::default()
                };
                device.alloc_coherent(&mut args).map_err(MemError::Allocation)?;
                (args.size, args.phys_addr, args.bus_addr, args.id)
            }
        };

        let chunk = Chunk::from_parts(ChunkParts {
            device,
            id: ChunkId::new(node, 0, raw_id),
            size: size as usize,
            target,
            flags,
            unit_phys: phys_addr,
            unit_bus: bus_addr,
            offset: 0,
            segment_count: 1,
            role: Role::Owner,
        });

        tracing::debug!(%target, size = chunk.size(), "allocated chunk {}", chunk.id());
        Ok(chunk)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
