pub mod device;
pub mod ioctl;
pub mod nodes;

pub use device::{AllocatorDevice, MemDevice};
pub use nodes::{AllocKind, DeviceNode};
