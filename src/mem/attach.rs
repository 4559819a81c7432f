//! Rebuilding a chunk handle for memory another handle or process allocated.
//!
//! Attach never copies and never takes ownership: the attached handle maps the
//! same physical pages, and only the allocating side frees them. Keeping the
//! allocator alive until every attacher is done is up to the caller.

use crate::driver::{AllocatorDevice, DeviceNode};
use crate::driver::ioctl::{InfoArgs, SIMAAI_INFO_BY_ID, SIMAAI_INFO_BY_PHYS};
use crate::error::{MemError, MemResult};
use crate::mem::chunk::{ChunkParts, Role};
use crate::mem::{AllocFlags, Chunk, ChunkId, Session, Target};
use std::io;
use std::sync::Arc;

/// What the other side handed over to identify a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachToken {
    /// Opaque id; its node tag picks the device node to ask.
    Id(ChunkId),
    /// Effective physical address; every available node is asked, generic first.
    Physical(u64),
}

impl From<ChunkId> for AttachToken {
    fn from(id: ChunkId) -> Self {
        Self::Id(id)
    }
}

impl From<u64> for AttachToken {
    fn from(phys_addr: u64) -> Self {
        Self::Physical(phys_addr)
    }
}

fn not_found() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOENT)
}

fn malformed(what: &str) -> MemError {
    tracing::warn!("driver returned malformed info: {what}");
    MemError::Attach(io::Error::from_raw_os_error(libc::EPROTO))
}

impl Session {
    /// Builds a handle for a live chunk allocated elsewhere.
    ///
    /// The returned chunk is unmapped and has [`Role::Attached`].
    ///
    /// # Errors
    /// Returns `Attach` if the token is malformed (`EINVAL`) or no node knows it
    /// (`ENOENT`: never allocated, or already freed), and `UnsupportedTarget` if
    /// the driver reports a target this library does not know.
    pub fn attach(&self, token: impl Into<AttachToken>) -> MemResult<Chunk> {
        let (node, device, args) = match token.into() {
            AttachToken::Id(id) => {
                let node = id
                    .node()
                    .map_err(|_| MemError::Attach(io::Error::from_raw_os_error(libc::EINVAL)))?;
                let device = self.device(node)?;
                let mut args = InfoArgs {
                    query: SIMAAI_INFO_BY_ID,
                    segment: u32::from(id.segment()),
                    id: id.raw(),
                    ..InfoArgs::default()
                };
                device.query_info(&mut args).map_err(MemError::Attach)?;
                (node, device, args)
            }
            AttachToken::Physical(phys_addr) => self.find_by_phys(phys_addr)?,
        };

        if args.size == 0 {
            return Err(malformed("zero-sized chunk"));
        }
        let target = Target::try_from(args.target)?;
        let segment = u8::try_from(args.segment).map_err(|_| malformed("segment index"))?;
        let segment_count = u8::try_from(args.num_segments.max(1))
            .map_err(|_| malformed("segment count"))?;
        let size = usize::try_from(args.size).map_err(|_| malformed("size"))?;
        let offset = usize::try_from(args.offset).map_err(|_| malformed("offset"))?;

        let chunk = Chunk::from_parts(ChunkParts {
            device,
            id: ChunkId::new(node, segment, args.id),
            size,
            target,
            flags: AllocFlags::from_ioctl_flags(args.flags),
            unit_phys: args.phys_addr,
            unit_bus: args.bus_addr,
            offset,
            segment_count,
            role: Role::Attached,
        });

        tracing::debug!(size, "attached to chunk {}", chunk.id());
        Ok(chunk)
    }

    /// Asks each node in turn which chunk starts at `phys_addr`.
    ///
    /// Nodes missing from this system are skipped.
    fn find_by_phys(
        &self,
        phys_addr: u64,
    ) -> MemResult<(DeviceNode, Arc<dyn AllocatorDevice>, InfoArgs)> {
        for node in DeviceNode::ALL {
            let device = match self.device(node) {
                Ok(device) => device,
                Err(e) if e.raw_os_error() == Some(libc::ENOENT) => continue,
                Err(e) => return Err(e),
            };

            let mut args = InfoArgs {
                query: SIMAAI_INFO_BY_PHYS,
                phys_addr,
                ..InfoArgs::default()
            };
            match device.query_info(&mut args) {
                Ok(()) => return Ok((node, device, args)),
                Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {}
                Err(e) => return Err(MemError::Attach(e)),
            }
        }

        Err(MemError::Attach(not_found()))
    }
}
