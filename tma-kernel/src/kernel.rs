use core::ptr::addr_of_mut;

use cuda_std::prelude::*;
use cuda_std::shared::dynamic_shared_mem;
use cuda_std::thread;

use crate::ptx;
use crate::{SharedStorageTma, TensorMap, TILE_ELEMS, TILE_M, TILE_N, TMA_TRANSACTION_BYTES};

/// Copies one `TILE_M x TILE_N` tile global -> shared -> global with TMA.
///
/// Block `(x, y)` handles tile row `x` and tile column `y`. Both tensor maps
/// must describe row-major `f32` tensors with a `TILE_N x TILE_M` box (inner
/// dimension first), and the launch must provide
/// `size_of::<SharedStorageTma<f32, TILE_ELEMS>>()` bytes of dynamic shared
/// memory.
///
/// # Safety
/// `tma_load` and `tma_store` must point to valid tensor maps in device
/// memory for the whole launch.
#[kernel]
pub unsafe fn copy_tma_kernel(tma_load: *const TensorMap, tma_store: *const TensorMap) {
    let storage = dynamic_shared_mem::<SharedStorageTma<f32, TILE_ELEMS>>();
    let smem = addr_of_mut!((*storage).smem) as *mut f32;
    let mbarrier = addr_of_mut!((*storage).mbarrier);

    let warp_idx = ptx::canonical_warp_idx_sync();
    let lane_predicate = ptx::elect_one_sync();
    let elected = warp_idx == 0 && lane_predicate;

    if elected {
        ptx::prefetch_tma_descriptor(tma_load);
        ptx::prefetch_tma_descriptor(tma_store);
    }

    // Tensor map coordinates are innermost first: (column, row).
    let col = (thread::block_idx_y() as usize * TILE_N) as i32;
    let row = (thread::block_idx_x() as usize * TILE_M) as i32;

    if elected {
        ptx::mbarrier_init(mbarrier, 1);
        ptx::mbarrier_arrive_expect_tx(mbarrier, TMA_TRANSACTION_BYTES);
        ptx::tma_load_2d(tma_load, mbarrier, smem, col, row);
    }
    thread::sync_threads();

    ptx::mbarrier_wait(mbarrier, 0);
    ptx::fence_view_async_shared();

    if elected {
        ptx::tma_store_2d(tma_store, smem, col, row);
        ptx::tma_store_arrive();
        ptx::tma_store_wait_all();
    }
}
