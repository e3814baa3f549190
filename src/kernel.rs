//! The tile-copy kernel: one execution group moves one tile
//! global -> shared (TMA load) -> global (TMA store).

use std::sync::Arc;

use utils::{local_tile, TensorLayout, TileCoord, TileShape};

use crate::barrier::TransactionBarrier;
use crate::descriptor::TmaCopy;
use crate::device::{ThreadCtx, SMEM_BOX_ALIGN};
use crate::element::TmaElement;
use crate::launch::Kernel;

/// Byte layout of the per-group scratch region: the tile, then the
/// barrier word, padded to the scratch alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedStorageLayout {
    pub tile_offset: usize,
    pub tile_bytes: usize,
    pub barrier_offset: usize,
    pub size: usize,
}

impl SharedStorageLayout {
    pub const ALIGN: usize = SMEM_BOX_ALIGN;

    pub fn new<E: TmaElement>(smem_layout: &TensorLayout) -> Self {
        let tile_bytes = smem_layout.cosize() * E::DATA_TYPE.size_bytes();
        let barrier_offset = tile_bytes.next_multiple_of(TransactionBarrier::ALIGN);
        let size = (barrier_offset + TransactionBarrier::SIZE_BYTES).next_multiple_of(Self::ALIGN);
        Self {
            tile_offset: 0,
            tile_bytes,
            barrier_offset,
            size,
        }
    }
}

/// The staging tile in shared memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmemTile {
    pub offset: usize,
    pub layout: TensorLayout,
}

/// Typed view over the scratch region of the calling group.
pub struct SharedStorageTma {
    pub smem: SmemTile,
    pub mbarrier: Arc<TransactionBarrier>,
}

impl SharedStorageTma {
    pub fn carve<E: TmaElement>(ctx: &ThreadCtx<'_>, smem_layout: &TensorLayout) -> Self {
        let layout = SharedStorageLayout::new::<E>(smem_layout);
        let shared = ctx.shared_memory();
        assert!(
            shared.size() >= layout.size,
            "dynamic shared memory of {} bytes cannot hold the {}-byte tile storage",
            shared.size(),
            layout.size
        );
        Self {
            smem: SmemTile {
                offset: layout.tile_offset,
                layout: *smem_layout,
            },
            mbarrier: shared.barrier_at(layout.barrier_offset),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Params<E> {
    pub tma_load: TmaCopy<E>,
    pub tma_store: TmaCopy<E>,
    pub gmem_layout: TensorLayout,
    pub smem_layout: TensorLayout,
    pub tile_shape: TileShape,
}

impl<E: TmaElement> Params<E> {
    pub fn new(
        tma_load: TmaCopy<E>,
        tma_store: TmaCopy<E>,
        gmem_layout: TensorLayout,
        smem_layout: TensorLayout,
        tile_shape: TileShape,
    ) -> Self {
        Self {
            tma_load,
            tma_store,
            gmem_layout,
            smem_layout,
            tile_shape,
        }
    }
}

/// Per-thread body of the copy. Exactly one thread of the group drives the
/// barrier and the copy engine; every thread waits for the tile to land.
pub fn copy_tma_kernel<E: TmaElement>(ctx: &ThreadCtx<'_>, params: &Params<E>) {
    let Params {
        tma_load,
        tma_store,
        gmem_layout,
        smem_layout,
        tile_shape,
    } = params;

    let shared_storage = SharedStorageTma::carve::<E>(ctx, smem_layout);
    let s_s = &shared_storage.smem;
    let mbarrier = &shared_storage.mbarrier;

    // Warp 0, one lane.
    let warp_idx = ctx.warp_idx();
    let lane_predicate = ctx.elect_one_sync();
    let elected = warp_idx == 0 && lane_predicate;

    if elected {
        ctx.prefetch_tma_descriptor(tma_load);
        ctx.prefetch_tma_descriptor(tma_store);
    }

    let block = ctx.block_idx();
    let blk_coord = TileCoord::new(block.x as usize, block.y as usize);
    let g_s = local_tile(&tma_load.tma_tensor(gmem_layout.shape), *tile_shape, blk_coord);

    // The full box is always counted, out-of-bounds fill included.
    let tma_transaction_bytes = SharedStorageLayout::new::<E>(smem_layout).tile_bytes as u32;

    if elected {
        mbarrier.init(1);
        mbarrier.arrive_and_expect_tx(tma_transaction_bytes);
        tma_load.with(mbarrier).copy(ctx, &g_s, s_s);
    }
    ctx.sync_threads();

    mbarrier.wait(0);
    ctx.fence_view_async_shared();

    let g_d = local_tile(&tma_store.tma_tensor(gmem_layout.shape), *tile_shape, blk_coord);
    if elected {
        tma_store.copy(ctx, s_s, &g_d);
        ctx.tma_store_arrive();
        ctx.tma_store_wait(0);
    }
}

pub fn copy_kernel<E: TmaElement>() -> Kernel<Params<E>> {
    Kernel::new("copy_tma_kernel", copy_tma_kernel::<E>)
}
