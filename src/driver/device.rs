use crate::driver::ioctl::{
    AllocCoherentArgs, AllocGenericArgs, AllocSegmentsArgs, FreeArgs, InfoArgs,
    SIMAAI_IOC_MEM_ALLOC_COHERENT, SIMAAI_IOC_MEM_ALLOC_GENERIC, SIMAAI_IOC_MEM_ALLOC_SEGMENTS,
    SIMAAI_IOC_MEM_FREE, SIMAAI_IOC_MEM_INFO,
};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::RawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// The four allocator transactions, plus the descriptor used for `mmap`.
///
/// `MemDevice` implements this on top of a real device node. Anything else that
/// speaks the same request structs (for example an in-process fake) can stand in
/// for it when constructing a [`Session`](crate::mem::Session).
pub trait AllocatorDevice: AsRawFd + fmt::Debug + Send + Sync {
    /// Pageable allocation. On success `args.size` and `args.id` are set by the driver.
    fn alloc_generic(&self, args: &mut AllocGenericArgs) -> io::Result<()>;

    /// DMA-capable allocation. On success size, addresses and id are set by the driver.
    fn alloc_coherent(&self, args: &mut AllocCoherentArgs) -> io::Result<()>;

    /// All-or-nothing multi-segment allocation.
    fn alloc_segments(&self, args: &mut AllocSegmentsArgs) -> io::Result<()>;

    /// Look up a live allocation by id or by physical address.
    fn query_info(&self, args: &mut InfoArgs) -> io::Result<()>;

    /// Release one allocation unit.
    fn free(&self, args: &mut FreeArgs) -> io::Result<()>;
}

/// A handle to one allocator character device (e.g. `/dev/simaai-mem`).
#[derive(Debug)]
pub struct MemDevice {
    file: File,
    path: PathBuf,
}

impl MemDevice {
    /// Opens an allocator device node read-write with `O_SYNC`.
    ///
    /// # Errors
    /// Returns an error if the node is missing or not accessible.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(path)?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Generic unsafe helper to execute an IOCTL.
    ///
    /// # Safety
    /// The caller must ensure that `arg` is the request struct `cmd` was encoded for.
    unsafe fn ioctl<T>(&self, cmd: u32, arg: &mut T) -> io::Result<()> {
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), cmd as _, arg as *mut T) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl AllocatorDevice for MemDevice {
    fn alloc_generic(&self, args: &mut AllocGenericArgs) -> io::Result<()> {
        unsafe { self.ioctl(SIMAAI_IOC_MEM_ALLOC_GENERIC, args) }
    }

    fn alloc_coherent(&self, args: &mut AllocCoherentArgs) -> io::Result<()> {
        unsafe { self.ioctl(SIMAAI_IOC_MEM_ALLOC_COHERENT, args) }
    }

    fn alloc_segments(&self, args: &mut AllocSegmentsArgs) -> io::Result<()> {
        unsafe { self.ioctl(SIMAAI_IOC_MEM_ALLOC_SEGMENTS, args) }
    }

    fn query_info(&self, args: &mut InfoArgs) -> io::Result<()> {
        unsafe { self.ioctl(SIMAAI_IOC_MEM_INFO, args) }
    }

    fn free(&self, args: &mut FreeArgs) -> io::Result<()> {
        unsafe { self.ioctl(SIMAAI_IOC_MEM_FREE, args) }
    }
}

impl AsRawFd for MemDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}
