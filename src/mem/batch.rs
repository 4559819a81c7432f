//! Segment batches: several chunks reserved by one driver transaction.
//!
//! All members share one kernel allocation unit and one mapping base; each
//! member's `offset` says where it starts inside that unit. The batch is
//! reserved and released as a whole.

use crate::driver::ioctl::{AllocSegmentsArgs, FreeArgs, SIMAAI_MAX_SEGMENTS};
use crate::driver::nodes::node_for;
use crate::error::{FreeError, FreeResult, MemError, MemResult};
use crate::mem::chunk::{ChunkParts, Role};
use crate::mem::{AllocFlags, Chunk, ChunkId, Session, Target};
use std::sync::Arc;

pub const MAX_SEGMENTS: usize = SIMAAI_MAX_SEGMENTS;

impl Session {
    /// Reserves one chunk per entry of `sizes` in a single transaction.
    ///
    /// Either every segment is reserved or none is.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for an empty list, more than [`MAX_SEGMENTS`]
    /// entries or a zero size, and `Allocation` if the driver cannot satisfy the
    /// whole batch.
    pub fn allocate_segments(
        &self,
        sizes: &[usize],
        target: Target,
        flags: AllocFlags,
    ) -> MemResult<Vec<Chunk>> {
        if sizes.is_empty() || sizes.len() > MAX_SEGMENTS {
            return Err(MemError::InvalidArgument(format!(
                "segment count {} outside 1..={MAX_SEGMENTS}",
                sizes.len()
            )));
        }
        if sizes.contains(&0) {
            return Err(MemError::InvalidArgument("segment sizes must be nonzero".into()));
        }

        let node = node_for(target);
        let device = self.device(node)?;

        let count = sizes.len();
        let mut args = AllocSegmentsArgs {
            num_segments: count as u32,
            flags: flags.to_ioctl_flags(),
            target: target.as_raw(),
            ..AllocSegmentsArgs::default()
        };
        for (slot, &size) in args.size.iter_mut().zip(sizes) {
            *slot = size as u64;
        }

        device.alloc_segments(&mut args).map_err(MemError::Allocation)?;

        let chunks = (0..count)
            .map(|i| {
                Chunk::from_parts(ChunkParts {
                    device: Arc::clone(&device),
                    id: ChunkId::new(node, i as u8, args.id),
                    size: args.size[i] as usize,
                    target,
                    flags,
                    unit_phys: args.phys_addr[i],
                    unit_bus: args.bus_addr[i],
                    offset: args.offset[i] as usize,
                    segment_count: count as u8,
                    role: Role::Owner,
                })
            })
            .collect::<Vec<_>>();

        tracing::debug!(%target, count, id = args.id, "allocated segment batch");
        Ok(chunks)
    }

    /// Unmaps every member, then releases the batch in one transaction.
    ///
    /// `chunks` must be exactly the set returned by one
    /// [`allocate_segments`](Self::allocate_segments) call, in any order. A batch of
    /// attached handles is only unmapped.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for an empty or partial set, or for chunks from
    /// different batches; nothing is unmapped in that case. Returns `Free` if the
    /// driver rejects the request. The handles come back inside the error so the
    /// batch can still be released.
    pub fn free_segments(&self, mut chunks: Vec<Chunk>) -> FreeResult<Vec<Chunk>> {
        let (unit, count, role) = match check_batch(&chunks) {
            Ok(batch) => batch,
            Err(error) => return Err(FreeError::new(error, chunks)),
        };

        for chunk in &mut chunks {
            chunk.unmap();
        }

        if role == Role::Attached {
            tracing::debug!(count, "detached segment batch {unit:#x}");
            return Ok(());
        }

        let mut args = FreeArgs {
            num_segments: count as u32,
            ..FreeArgs::default()
        };
        for chunk in &chunks {
            args.phys_addr[usize::from(chunk.segment_index())] = chunk.physical_address();
        }
        if let Err(e) = chunks[0].device().free(&mut args) {
            return Err(FreeError::new(MemError::Free(e), chunks));
        }

        tracing::debug!(count, "freed segment batch {unit:#x}");
        Ok(())
    }
}

/// Checks that `chunks` is one complete batch and returns its driver id,
/// member count and role.
fn check_batch(chunks: &[Chunk]) -> MemResult<(u32, usize, Role)> {
    let Some(first) = chunks.first() else {
        return Err(MemError::InvalidArgument("empty segment batch".into()));
    };

    let unit = (first.id().node()?, first.id().raw());
    let count = usize::from(first.segment_count());
    let role = first.role();

    let mut seen = 0u32;
    for chunk in chunks {
        let index = usize::from(chunk.segment_index());
        if (chunk.id().node()?, chunk.id().raw()) != unit
            || usize::from(chunk.segment_count()) != count
            || chunk.role() != role
            || index >= count.min(MAX_SEGMENTS)
            || seen & (1 << index) != 0
        {
            return Err(MemError::InvalidArgument(format!(
                "chunk {} does not belong to segment batch {:#x}",
                chunk.id(),
                unit.1
            )));
        }
        seen |= 1 << index;
    }
    if chunks.len() != count {
        return Err(MemError::InvalidArgument(format!(
            "partial segment batch: {} of {count} segments",
            chunks.len()
        )));
    }

    Ok((unit.1, count, role))
}
