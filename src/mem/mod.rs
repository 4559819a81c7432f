pub mod attach;
pub mod batch;
pub mod cache;
pub mod chunk;
pub mod session;

pub use attach::AttachToken;
pub use cache::CACHE_LINE_SIZE;
pub use chunk::{AllocFlags, Chunk, ChunkId, Role, Target};
pub use session::{Session, SessionConfig};
