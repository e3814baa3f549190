use std::panic;
use std::sync::atomic::{self, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use tracing::trace;

use super::engine::{BulkCopy, BulkGroups, CopyEngine, CopyKind};
use super::report::GroupReport;
use super::{GridAborted, GridControl, SharedMemory};
use crate::barrier::TransactionBarrier;
use crate::descriptor::TmaCopy;
use crate::element::TmaElement;
use crate::launch::Dim3;

pub const WARP_SIZE: u32 = 32;

/// Alignment the copy engine requires of a shared-memory box.
pub const SMEM_BOX_ALIGN: usize = 128;

#[derive(Debug, Default)]
struct SyncState {
    arrived: u32,
    generation: u64,
    poisoned: bool,
}

/// `__syncthreads()` for one execution group.
pub(crate) struct GroupBarrier {
    threads: u32,
    state: Mutex<SyncState>,
    cv: Condvar,
}

impl GroupBarrier {
    fn new(threads: u32) -> Self {
        Self {
            threads,
            state: Mutex::new(SyncState::default()),
            cv: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.threads {
            state.arrived = 0;
            state.generation += 1;
            self.cv.notify_all();
            return;
        }
        while state.generation == generation {
            if state.poisoned {
                drop(state);
                panic::resume_unwind(Box::new(GridAborted));
            }
            state = self.cv.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn poison(&self) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).poisoned = true;
        self.cv.notify_all();
    }
}

#[derive(Default)]
struct GroupCounters {
    prefetches: AtomicU32,
    loads_issued: AtomicU32,
    stores_issued: AtomicU32,
    bytes_loaded: AtomicU64,
    bytes_stored: AtomicU64,
    load_coords: Mutex<Vec<[i32; 2]>>,
    store_coords: Mutex<Vec<[i32; 2]>>,
}

/// Everything the threads of one resident execution group share.
pub(crate) struct GroupState {
    pub(crate) block_idx: Dim3,
    pub(crate) shared: Arc<SharedMemory>,
    sync: GroupBarrier,
    bulk: BulkGroups,
    counters: GroupCounters,
}

impl GroupState {
    pub(crate) fn new(block_idx: Dim3, shared_bytes: usize, threads: u32) -> Self {
        Self {
            block_idx,
            shared: Arc::new(SharedMemory::new(shared_bytes)),
            sync: GroupBarrier::new(threads),
            bulk: BulkGroups::default(),
            counters: GroupCounters::default(),
        }
    }

    pub(crate) fn poison(&self) {
        self.shared.poison();
        self.sync.poison();
        self.bulk.poison();
    }

    pub(crate) fn report(&self) -> GroupReport {
        let c = &self.counters;
        let coords = |m: &Mutex<Vec<[i32; 2]>>| m.lock().unwrap_or_else(PoisonError::into_inner).clone();
        GroupReport {
            block_idx: self.block_idx,
            barrier_inits: self.shared.barrier_inits(),
            tx_expectations: self.shared.barrier_expectations(),
            prefetches: c.prefetches.load(Ordering::Relaxed),
            loads_issued: c.loads_issued.load(Ordering::Relaxed),
            stores_issued: c.stores_issued.load(Ordering::Relaxed),
            bytes_loaded: c.bytes_loaded.load(Ordering::Relaxed),
            bytes_stored: c.bytes_stored.load(Ordering::Relaxed),
            load_coords: coords(&c.load_coords),
            store_coords: coords(&c.store_coords),
        }
    }
}

/// The view one simulated thread has of the machine.
///
/// Index queries mirror the CUDA built-ins; the remaining methods are the
/// TMA instructions a Hopper kernel issues.
pub struct ThreadCtx<'a> {
    thread_idx: Dim3,
    linear_idx: u32,
    block_dim: Dim3,
    grid_dim: Dim3,
    group: &'a GroupState,
    engine: &'a CopyEngine,
    control: &'a Arc<GridControl>,
}

impl<'a> ThreadCtx<'a> {
    pub(crate) fn new(
        linear_idx: u32,
        block_dim: Dim3,
        grid_dim: Dim3,
        group: &'a GroupState,
        engine: &'a CopyEngine,
        control: &'a Arc<GridControl>,
    ) -> Self {
        let thread_idx = Dim3::new(
            linear_idx % block_dim.x,
            (linear_idx / block_dim.x) % block_dim.y,
            linear_idx / (block_dim.x * block_dim.y),
        );
        Self {
            thread_idx,
            linear_idx,
            block_dim,
            grid_dim,
            group,
            engine,
            control,
        }
    }

    pub fn thread_idx(&self) -> Dim3 {
        self.thread_idx
    }

    pub fn block_idx(&self) -> Dim3 {
        self.group.block_idx
    }

    pub fn block_dim(&self) -> Dim3 {
        self.block_dim
    }

    pub fn grid_dim(&self) -> Dim3 {
        self.grid_dim
    }

    /// Linear thread index within the group.
    pub fn linear_thread_idx(&self) -> u32 {
        self.linear_idx
    }

    /// Warp index, uniform across the lanes of a warp.
    pub fn warp_idx(&self) -> u32 {
        self.linear_idx / WARP_SIZE
    }

    pub fn lane_idx(&self) -> u32 {
        self.linear_idx % WARP_SIZE
    }

    /// `elect.sync`: true for exactly one lane of the calling warp. All lanes
    /// are active here, so the lowest lane wins.
    pub fn elect_one_sync(&self) -> bool {
        self.lane_idx() == 0
    }

    pub fn sync_threads(&self) {
        self.group.sync.wait();
    }

    pub fn shared_memory(&self) -> &SharedMemory {
        &self.group.shared
    }

    /// `fence.proxy.async.shared::cta`: orders generic-proxy shared memory
    /// accesses with the async proxy.
    pub fn fence_view_async_shared(&self) {
        atomic::fence(Ordering::SeqCst);
    }

    pub fn prefetch_tma_descriptor<E: TmaElement>(&self, copy: &TmaCopy<E>) {
        self.group.counters.prefetches.fetch_add(1, Ordering::Relaxed);
        let cached = self.engine.prefetch(copy.id());
        trace!(descriptor = copy.id(), cached, "prefetch tensor map");
    }

    fn check_box(&self, meta_bytes: usize, smem_offset: usize) {
        assert!(
            smem_offset % SMEM_BOX_ALIGN == 0,
            "shared memory box at offset {smem_offset} is not {SMEM_BOX_ALIGN}-byte aligned"
        );
        assert!(
            smem_offset + meta_bytes <= self.group.shared.size(),
            "shared memory box of {meta_bytes} bytes at offset {smem_offset} exceeds the {}-byte window",
            self.group.shared.size()
        );
    }

    fn bulk_copy<E: TmaElement>(
        &self,
        copy: &TmaCopy<E>,
        smem_offset: usize,
        coords: [i32; 2],
        kind: CopyKind,
    ) -> BulkCopy {
        BulkCopy {
            descriptor: copy.id(),
            meta: *copy.meta(),
            global: copy.global().clone(),
            coords,
            shared: Arc::clone(&self.group.shared),
            smem_offset,
            kind,
            block: self.group.block_idx,
            control: Arc::clone(self.control),
        }
    }

    /// `cp.async.bulk.tensor.2d.shared::cluster.global.mbarrier::complete_tx::bytes`.
    ///
    /// Queues a box load whose landed bytes are reported to `barrier`.
    /// `coords` are innermost first.
    pub fn tma_load_2d<E: TmaElement>(
        &self,
        copy: &TmaCopy<E>,
        barrier: &Arc<TransactionBarrier>,
        smem_offset: usize,
        coords: [i32; 2],
    ) {
        let bytes = copy.meta().box_bytes();
        self.check_box(bytes, smem_offset);
        let counters = &self.group.counters;
        counters.loads_issued.fetch_add(1, Ordering::Relaxed);
        counters.bytes_loaded.fetch_add(bytes as u64, Ordering::Relaxed);
        counters
            .load_coords
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(coords);
        trace!(block = %self.group.block_idx, ?coords, bytes, "tma load");

        let kind = CopyKind::Load(Arc::clone(barrier));
        self.engine.submit(self.bulk_copy(copy, smem_offset, coords, kind));
    }

    /// `cp.async.bulk.tensor.2d.global.shared::cta.bulk_group`.
    pub fn tma_store_2d<E: TmaElement>(&self, copy: &TmaCopy<E>, smem_offset: usize, coords: [i32; 2]) {
        let bytes = copy.meta().box_bytes();
        self.check_box(bytes, smem_offset);
        let counters = &self.group.counters;
        counters.stores_issued.fetch_add(1, Ordering::Relaxed);
        counters.bytes_stored.fetch_add(bytes as u64, Ordering::Relaxed);
        counters
            .store_coords
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(coords);
        trace!(block = %self.group.block_idx, ?coords, bytes, "tma store");

        let kind = CopyKind::Store(self.group.bulk.track());
        self.engine.submit(self.bulk_copy(copy, smem_offset, coords, kind));
    }

    /// `cp.async.bulk.commit_group`.
    pub fn tma_store_arrive(&self) {
        self.group.bulk.commit();
    }

    /// `cp.async.bulk.wait_group N`: returns once at most `max_pending`
    /// committed store groups are still in flight.
    pub fn tma_store_wait(&self, max_pending: usize) {
        self.group.bulk.wait(max_pending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_thread_indexing() {
        let group = GroupState::new(Dim3::new(1, 2, 0), 0, 64);
        let engine = CopyEngine::new(1, 64, 8);
        let control = Arc::new(GridControl::new("test"));
        let block = Dim3::new(16, 4, 1);

        let ctx = ThreadCtx::new(37, block, Dim3::new(2, 3, 1), &group, &engine, &control);
        assert_eq!(ctx.thread_idx(), Dim3::new(5, 2, 0));
        assert_eq!(ctx.warp_idx(), 1);
        assert_eq!(ctx.lane_idx(), 5);
        assert!(!ctx.elect_one_sync());
        assert_eq!(ctx.block_idx(), Dim3::new(1, 2, 0));

        let leader = ThreadCtx::new(32, block, Dim3::new(2, 3, 1), &group, &engine, &control);
        assert!(leader.elect_one_sync());
    }

    #[test]
    fn test_group_barrier_reuse() {
        let barrier = GroupBarrier::new(4);
        let counter = AtomicU32::new(0);
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for round in 1..=3 {
                        counter.fetch_add(1, Ordering::SeqCst);
                        barrier.wait();
                        assert!(counter.load(Ordering::SeqCst) >= 4 * round);
                        barrier.wait();
                    }
                });
            }
        });
        assert_eq!(counter.load(Ordering::SeqCst), 12);
    }

    #[test]
    fn test_poisoned_group_barrier_unwinds() {
        let barrier = GroupBarrier::new(2);
        barrier.poison();
        let payload = panic::catch_unwind(panic::AssertUnwindSafe(|| barrier.wait())).unwrap_err();
        assert!(payload.is::<GridAborted>());
    }
}
