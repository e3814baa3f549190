//! Launch geometry and kernel handles.

use std::fmt;
use std::sync::Arc;

use tracing::debug;
use utils::{TensorLayout, TensorShape, TileShape};

use crate::device::{Device, ThreadCtx};
use crate::element::TmaElement;
use crate::error::LaunchError;
use crate::kernel::SharedStorageLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// One-dimensional extent `(x, 1, 1)`.
    pub const fn x(x: u32) -> Self {
        Self::new(x, 1, 1)
    }

    pub const fn size(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }

    /// Every index inside this extent, `x` fastest.
    pub fn indices(&self) -> impl Iterator<Item = Dim3> {
        let Dim3 { x, y, z } = *self;
        (0..z).flat_map(move |k| (0..y).flat_map(move |j| (0..x).map(move |i| Dim3::new(i, j, k))))
    }
}

impl fmt::Display for Dim3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    pub grid: Dim3,
    pub block: Dim3,
    pub shared_memory_bytes: usize,
}

impl LaunchConfig {
    pub const fn new(grid: Dim3, block: Dim3, shared_memory_bytes: usize) -> Self {
        Self {
            grid,
            block,
            shared_memory_bytes,
        }
    }

    /// One execution group per tile: `grid.x` walks tiles along M, `grid.y`
    /// along N. Partial edge tiles get a group of their own.
    pub fn for_tiles(
        shape: &TensorShape,
        tile: TileShape,
        threads: u32,
        shared_memory_bytes: usize,
    ) -> Self {
        let tiles = tile.grid(shape);
        Self::new(
            Dim3::new(tiles.tiles_m as u32, tiles.tiles_n as u32, 1),
            Dim3::x(threads),
            shared_memory_bytes,
        )
    }

    pub fn num_blocks(&self) -> u64 {
        self.grid.size()
    }

    pub fn threads_per_block(&self) -> u32 {
        self.block.size() as u32
    }
}

pub(crate) type KernelFn<P> = dyn Fn(&ThreadCtx<'_>, &P) + Send + Sync;

/// A device entry point taking parameters of type `P`.
pub struct Kernel<P> {
    name: String,
    func: Arc<KernelFn<P>>,
    max_dynamic_shared_memory: Option<usize>,
}

impl<P> Clone for Kernel<P> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            func: Arc::clone(&self.func),
            max_dynamic_shared_memory: self.max_dynamic_shared_memory,
        }
    }
}

impl<P> fmt::Debug for Kernel<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.name)
            .field("max_dynamic_shared_memory", &self.max_dynamic_shared_memory)
            .finish_non_exhaustive()
    }
}

impl<P> Kernel<P> {
    pub fn new<F>(name: &str, func: F) -> Self
    where
        F: Fn(&ThreadCtx<'_>, &P) + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            func: Arc::new(func),
            max_dynamic_shared_memory: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Opt-in dynamic shared memory limit; `None` means the device default.
    pub fn max_dynamic_shared_memory(&self) -> Option<usize> {
        self.max_dynamic_shared_memory
    }

    pub(crate) fn func(&self) -> Arc<KernelFn<P>> {
        Arc::clone(&self.func)
    }
}

/// Dynamic shared memory one group of the tile copy needs for
/// `smem_layout`.
pub fn compute_scratch_bytes<E: TmaElement>(smem_layout: &TensorLayout) -> usize {
    SharedStorageLayout::new::<E>(smem_layout).size
}

/// Raises the kernel's dynamic shared memory limit to `bytes`
/// (`cudaFuncAttributeMaxDynamicSharedMemorySize`).
pub fn set_smem_size<P>(kernel: &mut Kernel<P>, device: &Device, bytes: usize) -> Result<(), LaunchError> {
    let limit = device.config().max_shared_memory_per_block_optin;
    if bytes > limit {
        return Err(LaunchError::SharedMemoryExceedsDevice {
            requested: bytes,
            limit,
        });
    }
    if bytes > device.config().max_shared_memory_per_block {
        debug!(kernel = kernel.name(), bytes, "opting in to large dynamic shared memory");
        kernel.max_dynamic_shared_memory = Some(bytes);
    }
    Ok(())
}
