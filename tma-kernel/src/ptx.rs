//! Inline PTX for the sm_90 async copy path.
//!
//! Barrier and shared-memory operands are 32-bit shared-window addresses;
//! tensor maps are passed as generic 64-bit pointers.

use core::arch::asm;

use cuda_std::thread;

use crate::{TensorMap, WARP_SIZE};

#[inline(always)]
unsafe fn smem_addr<T>(ptr: *const T) -> u32 {
    let addr: u32;
    asm!(
        "{{ .reg .u64 t; cvta.to.shared.u64 t, {ptr}; cvt.u32.u64 {addr}, t; }}",
        ptr = in(reg64) ptr,
        addr = out(reg32) addr,
    );
    addr
}

/// Warp index made uniform across the warp.
#[inline(always)]
pub fn canonical_warp_idx_sync() -> u32 {
    let warp = thread::thread_idx_x() / WARP_SIZE;
    let uniform: u32;
    unsafe {
        asm!(
            "shfl.sync.idx.b32 {out}, {warp}, 0, 0x1f, 0xffffffff;",
            out = out(reg32) uniform,
            warp = in(reg32) warp,
        );
    }
    uniform
}

/// True on exactly one active lane of the calling warp.
#[inline(always)]
pub fn elect_one_sync() -> bool {
    let elected: u32;
    unsafe {
        asm!(
            "{{ .reg .pred p; .reg .b32 r; elect.sync r|p, 0xffffffff; selp.u32 {e}, 1, 0, p; }}",
            e = out(reg32) elected,
        );
    }
    elected != 0
}

#[inline(always)]
pub unsafe fn prefetch_tma_descriptor(map: *const TensorMap) {
    asm!("prefetch.tensormap [{map}];", map = in(reg64) map);
}

#[inline(always)]
pub unsafe fn mbarrier_init(bar: *mut u64, arrive_count: u32) {
    asm!(
        "mbarrier.init.shared::cta.b64 [{bar}], {count};",
        bar = in(reg32) smem_addr(bar),
        count = in(reg32) arrive_count,
    );
}

#[inline(always)]
pub unsafe fn mbarrier_arrive_expect_tx(bar: *mut u64, bytes: u32) {
    asm!(
        "mbarrier.arrive.expect_tx.shared::cta.b64 _, [{bar}], {bytes};",
        bar = in(reg32) smem_addr(bar),
        bytes = in(reg32) bytes,
    );
}

#[inline(always)]
unsafe fn mbarrier_try_wait_parity(bar: u32, phase: u32) -> bool {
    let done: u32;
    asm!(
        "{{ .reg .pred p; mbarrier.try_wait.parity.shared::cta.b64 p, [{bar}], {phase}; selp.u32 {done}, 1, 0, p; }}",
        bar = in(reg32) bar,
        phase = in(reg32) phase,
        done = out(reg32) done,
    );
    done != 0
}

/// Spins until the barrier has moved past the phase with parity `phase`.
#[inline(always)]
pub unsafe fn mbarrier_wait(bar: *mut u64, phase: u32) {
    let addr = smem_addr(bar);
    while !mbarrier_try_wait_parity(addr, phase) {}
}

#[inline(always)]
pub fn fence_view_async_shared() {
    unsafe { asm!("fence.proxy.async.shared::cta;") }
}

/// Global -> shared copy of one box; completion is reported to `bar`.
#[inline(always)]
pub unsafe fn tma_load_2d(map: *const TensorMap, bar: *mut u64, dst: *mut f32, c0: i32, c1: i32) {
    asm!(
        "cp.async.bulk.tensor.2d.shared::cluster.global.mbarrier::complete_tx::bytes [{dst}], [{map}, {{{c0}, {c1}}}], [{bar}];",
        dst = in(reg32) smem_addr(dst),
        map = in(reg64) map,
        c0 = in(reg32) c0,
        c1 = in(reg32) c1,
        bar = in(reg32) smem_addr(bar),
    );
}

/// Shared -> global copy of one box into the current bulk group.
#[inline(always)]
pub unsafe fn tma_store_2d(map: *const TensorMap, src: *const f32, c0: i32, c1: i32) {
    asm!(
        "cp.async.bulk.tensor.2d.global.shared::cta.bulk_group [{map}, {{{c0}, {c1}}}], [{src}];",
        map = in(reg64) map,
        c0 = in(reg32) c0,
        c1 = in(reg32) c1,
        src = in(reg32) smem_addr(src),
    );
}

#[inline(always)]
pub fn tma_store_arrive() {
    unsafe { asm!("cp.async.bulk.commit_group;") }
}

/// Waits until every committed bulk group has completed, writes included.
#[inline(always)]
pub fn tma_store_wait_all() {
    unsafe { asm!("cp.async.bulk.wait_group 0;") }
}
