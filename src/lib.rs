//! User-space client for the SiMa.ai contiguous memory allocator.
//!
//! Chunks of physically contiguous memory are reserved through the allocator
//! device nodes, mapped into the process, shared with other processes or cores
//! by id or physical address, and kept coherent with explicit cache maintenance.
//!
//! ```no_run
//! use simaai_mem::mem::{AllocFlags, Session, Target};
//!
//! # fn main() -> simaai_mem::error::MemResult<()> {
//! let session = Session::open()?;
//! let mut chunk = session.allocate(4096, Target::Generic, AllocFlags::new().cached())?;
//! chunk.map()?;
//! if let Some(bytes) = chunk.as_mut_slice() {
//!     bytes.fill(0x41);
//! }
//! chunk.flush_cache();
//! // Hand `chunk.id()` to the consumer, which calls `session.attach(id)`.
//! chunk.free()?;
//! # Ok(())
//! # }
//! ```

pub mod driver;
pub mod error;
pub mod mem;
pub mod utils;

#[cfg(test)]
mod testing;

pub use error::{FreeError, FreeResult, MemError, MemResult};
pub use mem::{AllocFlags, AttachToken, Chunk, ChunkId, Session, SessionConfig, Target};
