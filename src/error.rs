use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MemError {
    #[error("Cannot open allocator device {path}: {source}")]
    DeviceOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Allocation failed: {0}")]
    Allocation(#[source] io::Error),

    #[error("Mapping failed: {0}")]
    Mapping(#[source] io::Error),

    #[error("Attach failed: {0}")]
    Attach(#[source] io::Error),

    #[error("Free failed: {0}")]
    Free(#[source] io::Error),

    #[error("Unsupported memory target: {0}")]
    UnsupportedTarget(u32),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl MemError {
    /// The errno reported by the failing system call, if there was one.
    #[must_use]
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::DeviceOpen { source, .. }
            | Self::Allocation(source)
            | Self::Mapping(source)
            | Self::Attach(source)
            | Self::Free(source) => source.raw_os_error(),
            Self::UnsupportedTarget(_) | Self::InvalidArgument(_) => None,
        }
    }
}

// A convenient alias
pub type MemResult<T> = Result<T, MemError>;

/// A release that did not happen, carrying back the handles it was given.
///
/// The kernel reservation is still live, so the caller can fix the request
/// (complete a partial batch, retry after a driver error) and free again.
/// Converting into [`MemError`] drops the handles.
#[derive(Error, Debug)]
#[error("{error}")]
pub struct FreeError<T> {
    pub error: MemError,
    pub handles: T,
}

impl<T> FreeError<T> {
    pub(crate) fn new(error: MemError, handles: T) -> Self {
        Self { error, handles }
    }

    #[must_use]
    pub fn raw_os_error(&self) -> Option<i32> {
        self.error.raw_os_error()
    }

    #[must_use]
    pub fn into_handles(self) -> T {
        self.handles
    }
}

impl<T> From<FreeError<T>> for MemError {
    fn from(err: FreeError<T>) -> Self {
        err.error
    }
}

pub type FreeResult<T> = Result<(), FreeError<T>>;
