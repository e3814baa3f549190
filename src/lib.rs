//! Tile copy through shared memory with the Tensor Memory Accelerator.
//!
//! Each execution group copies one tile of a 2D tensor from global memory
//! into shared memory with an asynchronous bulk tensor load, waits on a
//! transaction barrier until every byte has landed, and writes the tile
//! back with a bulk tensor store. One elected thread per group drives the
//! barrier and the copy engine.
//!
//! The default build runs on a simulated device ([`device`]); the `cuda`
//! feature adds the real-device backend ([`cuda`]) driving the PTX build of
//! the `tma-kernel` crate.

pub mod barrier;
pub mod config;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod descriptor;
pub mod device;
pub mod element;
pub mod error;
pub mod host;
pub mod kernel;
pub mod launch;
pub mod verify;

pub use barrier::TransactionBarrier;
pub use config::{Backend, CopyConfig, DType};
pub use descriptor::{L2Promotion, TensorMapMeta, TmaCopy, TmaLoad, TmaOp};
pub use device::{
    Device, DeviceBuffer, DeviceConfig, GroupReport, LaunchReport, SharedMemory, ThreadCtx,
};
pub use element::{TmaDataType, TmaElement};
pub use error::{DescriptorError, DeviceError, LaunchError};
pub use host::{copy_host_tma_load_and_store, CopyReport, TrialTiming};
pub use kernel::{copy_kernel, copy_tma_kernel, Params, SharedStorageLayout, SharedStorageTma, SmemTile};
pub use launch::{compute_scratch_bytes, set_smem_size, Dim3, Kernel, LaunchConfig};
pub use verify::{verify_copy, Verification};
