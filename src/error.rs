//! Typed errors of the descriptor builder, the launcher and the device.

use std::time::Duration;

use thiserror::Error;

use crate::launch::Dim3;

/// A layout pair the copy engine cannot describe.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("global layout {gmem} and shared layout {smem} disagree on the contiguous dimension")]
    MajorMismatch { gmem: String, smem: String },

    #[error("shared layout {smem} is not compact")]
    SharedNotCompact { smem: String },

    #[error("global stride of {stride} bytes is not a multiple of 16")]
    GlobalStrideNotAligned { stride: u64 },

    #[error("box dimension {dim} has size {size}, expected 1..=256")]
    BoxDimOutOfRange { dim: usize, size: usize },

    #[error("inner box extent of {bytes} bytes is not a multiple of 16")]
    InnerBoxNotAligned { bytes: usize },

    #[error("global dimension {dim} has size {size}, expected 1..2^32")]
    GlobalDimOutOfRange { dim: usize, size: u64 },

    #[error("buffer holds {len} elements but the layout spans {required}")]
    BufferTooSmall { len: usize, required: usize },
}

/// A launch rejected before any work was queued.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
    #[error("grid {grid} has an empty dimension")]
    InvalidGrid { grid: Dim3 },

    #[error("block {block} has {threads} threads, expected 1..={limit}")]
    InvalidBlock { block: Dim3, threads: u32, limit: u32 },

    #[error("kernel `{kernel}` requests {requested} bytes of dynamic shared memory but is limited to {limit}")]
    SharedMemoryExceedsKernelLimit {
        kernel: String,
        requested: usize,
        limit: usize,
    },

    #[error("{requested} bytes of shared memory exceed the device maximum of {limit}")]
    SharedMemoryExceedsDevice { requested: usize, limit: usize },

    #[error("device context is unusable after an earlier fault: {0}")]
    ContextPoisoned(DeviceError),

    #[error("device stream has shut down")]
    StreamClosed,
}

/// A failure reported asynchronously by `Device::synchronize`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("kernel `{kernel}` faulted in block {block} thread {thread}: {message}")]
    KernelFault {
        kernel: String,
        block: Dim3,
        thread: u32,
        message: String,
    },

    #[error("copy engine faulted while serving block {block}: {message}")]
    EngineFault { block: Dim3, message: String },

    #[error("kernel `{kernel}` did not finish within {watchdog:?} and was terminated")]
    LaunchTimeout { kernel: String, watchdog: Duration },

    #[error("could not start execution group {block}: {message}")]
    OutOfResources { block: Dim3, message: String },
}
