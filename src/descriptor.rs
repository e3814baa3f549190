//! Tensor-map descriptors for 2D tiled bulk copies.
//!
//! A [`TensorMapMeta`] is the host-side content of a `CUtensorMap` built with
//! `cuTensorMapEncodeTiled`: rank 2, no interleave, no swizzle, zero fill for
//! out-of-bounds elements. Dimensions and coordinates are innermost first,
//! the order the hardware uses.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;
use utils::{MemoryLayout, TensorLayout, TensorShape, TileView};

use crate::barrier::TransactionBarrier;
use crate::device::{DeviceBuffer, GlobalBuffer, ThreadCtx};
use crate::element::{TmaDataType, TmaElement};
use crate::error::DescriptorError;
use crate::kernel::SmemTile;

static NEXT_DESCRIPTOR_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TmaOp {
    /// Global to shared, completing on a transaction barrier.
    Load,
    /// Shared to global, completing through a bulk group.
    Store,
}

/// `CUtensorMapL2promotion`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum L2Promotion {
    None = 0,
    Bytes64 = 1,
    #[default]
    Bytes128 = 2,
    Bytes256 = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorMapMeta {
    pub data_type: TmaDataType,
    pub major: MemoryLayout,
    pub global_dims: [u64; 2],
    /// Byte stride of dimension 1; dimension 0 is contiguous.
    pub global_strides: [u64; 1],
    pub box_dims: [u32; 2],
    pub element_strides: [u32; 2],
    pub l2_promotion: L2Promotion,
}

impl TensorMapMeta {
    pub const RANK: u32 = 2;
    pub const MAX_BOX_DIM: usize = 256;
    pub const ALIGNMENT: usize = 16;
    /// Global dimensions must stay below this.
    pub const MAX_GLOBAL_DIM: u64 = 1 << 32;

    /// Describes copying `smem`-shaped boxes out of a tensor laid out as
    /// `gmem`.
    pub fn tiled<E: TmaElement>(
        gmem: &TensorLayout,
        smem: &TensorLayout,
    ) -> Result<Self, DescriptorError> {
        if gmem.layout != smem.layout {
            return Err(DescriptorError::MajorMismatch {
                gmem: gmem.to_string(),
                smem: smem.to_string(),
            });
        }
        if !smem.is_compact() {
            return Err(DescriptorError::SharedNotCompact {
                smem: smem.to_string(),
            });
        }

        let elem = E::DATA_TYPE.size_bytes();
        let global_dims = [gmem.contiguous_extent() as u64, gmem.strided_extent() as u64];
        for (dim, &size) in global_dims.iter().enumerate() {
            if size == 0 || size >= Self::MAX_GLOBAL_DIM {
                return Err(DescriptorError::GlobalDimOutOfRange { dim, size });
            }
        }

        let stride = (gmem.leading_dim * elem) as u64;
        if stride % Self::ALIGNMENT as u64 != 0 {
            return Err(DescriptorError::GlobalStrideNotAligned { stride });
        }

        let box_dims = [smem.contiguous_extent(), smem.strided_extent()];
        for (dim, &size) in box_dims.iter().enumerate() {
            if size == 0 || size > Self::MAX_BOX_DIM {
                return Err(DescriptorError::BoxDimOutOfRange { dim, size });
            }
        }
        let inner_bytes = box_dims[0] * elem;
        if inner_bytes % Self::ALIGNMENT != 0 {
            return Err(DescriptorError::InnerBoxNotAligned { bytes: inner_bytes });
        }

        Ok(Self {
            data_type: E::DATA_TYPE,
            major: gmem.layout,
            global_dims,
            global_strides: [stride],
            box_dims: box_dims.map(|d| d as u32),
            element_strides: [1, 1],
            l2_promotion: L2Promotion::default(),
        })
    }

    pub fn element_size(&self) -> usize {
        self.data_type.size_bytes()
    }

    /// Bytes one box occupies in shared memory, out-of-bounds fill included.
    pub fn box_bytes(&self) -> usize {
        self.box_dims.iter().map(|&d| d as usize).product::<usize>() * self.element_size()
    }

    /// Innermost-first coordinates of the tile's origin.
    ///
    /// Panics if the origin does not fit the engine's signed 32-bit
    /// coordinates.
    pub fn coords_for(&self, tile: &TileView) -> [i32; 2] {
        let coord = |origin: usize| {
            i32::try_from(origin).unwrap_or_else(|_| {
                panic!("tile origin {origin} exceeds the signed 32-bit coordinate range")
            })
        };
        let (row, col) = (coord(tile.origin_row), coord(tile.origin_col));
        match self.major {
            MemoryLayout::RowMajor => [col, row],
            MemoryLayout::ColumnMajor => [row, col],
        }
    }
}

/// A tensor map bound to the global buffer it describes.
pub struct TmaCopy<E> {
    id: u64,
    op: TmaOp,
    meta: TensorMapMeta,
    global: GlobalBuffer,
    _marker: PhantomData<fn() -> E>,
}

impl<E> Clone for TmaCopy<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            op: self.op,
            meta: self.meta,
            global: self.global.clone(),
            _marker: PhantomData,
        }
    }
}

impl<E> std::fmt::Debug for TmaCopy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TmaCopy")
            .field("id", &self.id)
            .field("op", &self.op)
            .field("meta", &self.meta)
            .field("global", &self.global)
            .finish()
    }
}

impl<E: TmaElement> TmaCopy<E> {
    /// Builds the descriptor for moving `smem_layout` boxes between shared
    /// memory and `buffer` viewed through `gmem_layout`.
    pub fn new(
        op: TmaOp,
        buffer: &DeviceBuffer<E>,
        gmem_layout: &TensorLayout,
        smem_layout: &TensorLayout,
    ) -> Result<Self, DescriptorError> {
        let meta = TensorMapMeta::tiled::<E>(gmem_layout, smem_layout)?;
        let required = gmem_layout.cosize();
        if buffer.len() < required {
            return Err(DescriptorError::BufferTooSmall {
                len: buffer.len(),
                required,
            });
        }

        let id = NEXT_DESCRIPTOR_ID.fetch_add(1, Ordering::Relaxed);
        debug!(
            id,
            ?op,
            dtype = %meta.data_type,
            dims = ?meta.global_dims,
            box_dims = ?meta.box_dims,
            "tensor map encoded"
        );
        Ok(Self {
            id,
            op,
            meta,
            global: buffer.as_global().clone(),
            _marker: PhantomData,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn op(&self) -> TmaOp {
        self.op
    }

    pub fn meta(&self) -> &TensorMapMeta {
        &self.meta
    }

    pub(crate) fn global(&self) -> &GlobalBuffer {
        &self.global
    }

    pub fn transaction_bytes(&self) -> u32 {
        self.meta.box_bytes() as u32
    }

    /// Innermost-first coordinates of `tile` in this descriptor's tensor.
    pub fn coords_for(&self, tile: &TileView) -> [i32; 2] {
        self.meta.coords_for(tile)
    }

    /// The coordinate tensor the descriptor addresses, shaped `shape`.
    pub fn tma_tensor(&self, shape: TensorShape) -> TensorLayout {
        let layout = match self.meta.major {
            MemoryLayout::RowMajor => TensorLayout::row_major(shape.rows, shape.cols),
            MemoryLayout::ColumnMajor => TensorLayout::column_major(shape.rows, shape.cols),
        };
        let leading_dim = self.meta.global_strides[0] as usize / self.meta.element_size();
        layout.with_leading_dim(leading_dim)
    }

    /// Binds a load to the barrier its bytes complete on.
    pub fn with<'a>(&'a self, barrier: &'a Arc<TransactionBarrier>) -> TmaLoad<'a, E> {
        assert_eq!(self.op, TmaOp::Load, "only load descriptors complete on a barrier");
        TmaLoad {
            copy: self,
            barrier,
        }
    }

    /// Stores the staged tile `src` to the global tile `dst`.
    pub fn copy(&self, ctx: &ThreadCtx<'_>, src: &SmemTile, dst: &TileView) {
        assert_eq!(self.op, TmaOp::Store, "load descriptors need a barrier, see `with`");
        ctx.tma_store_2d(self, src.offset, self.coords_for(dst));
    }
}

/// A load descriptor bound to a transaction barrier.
pub struct TmaLoad<'a, E> {
    copy: &'a TmaCopy<E>,
    barrier: &'a Arc<TransactionBarrier>,
}

impl<E: TmaElement> TmaLoad<'_, E> {
    pub fn copy(&self, ctx: &ThreadCtx<'_>, src: &TileView, dst: &SmemTile) {
        let coords = self.copy.coords_for(src);
        ctx.tma_load_2d(self.copy, self.barrier, dst.offset, coords);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use pretty_assertions::assert_eq;
    use utils::{local_tile, TileCoord, TileShape};

    #[test]
    fn test_row_major_meta() {
        let meta = TensorMapMeta::tiled::<f32>(
            &TensorLayout::row_major(256, 512),
            &TensorLayout::row_major(128, 64),
        )
        .unwrap();
        assert_eq!(meta.global_dims, [512, 256]);
        assert_eq!(meta.global_strides, [2048]);
        assert_eq!(meta.box_dims, [64, 128]);
        assert_eq!(meta.box_bytes(), 128 * 64 * 4);
        assert_eq!(meta.data_type, TmaDataType::Float32);
    }

    #[test]
    fn test_column_major_meta() {
        let meta = TensorMapMeta::tiled::<half::f16>(
            &TensorLayout::column_major(64, 32),
            &TensorLayout::column_major(64, 16),
        )
        .unwrap();
        assert_eq!(meta.global_dims, [64, 32]);
        assert_eq!(meta.global_strides, [128]);
        assert_eq!(meta.box_dims, [64, 16]);
    }

    #[test]
    fn test_rejects_bad_layouts() {
        let rm = TensorLayout::row_major(64, 64);
        assert!(matches!(
            TensorMapMeta::tiled::<f32>(&rm, &TensorLayout::column_major(32, 32)),
            Err(DescriptorError::MajorMismatch { .. })
        ));
        assert!(matches!(
            TensorMapMeta::tiled::<f32>(&rm, &TensorLayout::row_major(32, 32).with_leading_dim(40)),
            Err(DescriptorError::SharedNotCompact { .. })
        ));
        assert_eq!(
            TensorMapMeta::tiled::<f32>(&TensorLayout::row_major(8, 6), &TensorLayout::row_major(8, 4)),
            Err(DescriptorError::GlobalStrideNotAligned { stride: 24 })
        );
        assert_eq!(
            TensorMapMeta::tiled::<f32>(&rm, &TensorLayout::row_major(512, 16)),
            Err(DescriptorError::BoxDimOutOfRange { dim: 1, size: 512 })
        );
        assert_eq!(
            TensorMapMeta::tiled::<f32>(&rm, &TensorLayout::row_major(8, 2)),
            Err(DescriptorError::InnerBoxNotAligned { bytes: 8 })
        );
    }

    #[test]
    fn test_coords_are_innermost_first() {
        let gmem = TensorLayout::row_major(256, 256);
        let meta = TensorMapMeta::tiled::<f32>(&gmem, &TensorLayout::row_major(128, 128)).unwrap();
        let tile = local_tile(&gmem, TileShape::tma_default(), TileCoord::new(1, 0));
        assert_eq!(meta.coords_for(&tile), [0, 128]);
    }

    #[test]
    fn test_global_dims_stay_below_two_pow_32() {
        let smem = TensorLayout::row_major(1, 4);
        assert_eq!(
            TensorMapMeta::tiled::<u32>(&TensorLayout::row_major(1 << 32, 4), &smem),
            Err(DescriptorError::GlobalDimOutOfRange { dim: 1, size: 1 << 32 })
        );
        let meta = TensorMapMeta::tiled::<u32>(&TensorLayout::row_major((1 << 32) - 1, 4), &smem)
            .unwrap();
        assert_eq!(meta.global_dims, [4, (1 << 32) - 1]);
    }

    #[test]
    #[should_panic(expected = "exceeds the signed 32-bit coordinate range")]
    fn test_coords_reject_origins_past_i32() {
        let gmem = TensorLayout::row_major((1 << 32) - 1, 4);
        let meta = TensorMapMeta::tiled::<u32>(&gmem, &TensorLayout::row_major(1, 4)).unwrap();
        let tile = local_tile(&gmem, TileShape::new(1, 4), TileCoord::new(1 << 31, 0));
        meta.coords_for(&tile);
    }

    #[test]
    fn test_buffer_too_small() {
        let device = Device::default();
        let buffer = DeviceBuffer::<f32>::alloc_zeroed(&device, 100);
        let err = TmaCopy::new(
            TmaOp::Load,
            &buffer,
            &TensorLayout::row_major(16, 16),
            &TensorLayout::row_major(16, 16),
        )
        .unwrap_err();
        assert_eq!(err, DescriptorError::BufferTooSmall { len: 100, required: 256 });
    }

    #[test]
    fn test_tma_tensor_keeps_padding() {
        let device = Device::default();
        let gmem = TensorLayout::row_major(16, 16).with_leading_dim(32);
        let buffer = DeviceBuffer::<f32>::alloc_zeroed(&device, gmem.cosize());
        let copy = TmaCopy::new(TmaOp::Store, &buffer, &gmem, &TensorLayout::row_major(8, 8)).unwrap();
        assert_eq!(copy.tma_tensor(gmem.shape), gmem);
        assert_eq!(copy.transaction_bytes(), 256);
    }
}
