//! Asynchronous copy engine.
//!
//! A fixed pool of workers drains bulk tensor copies issued by kernel
//! threads. Loads stream rows into shared memory and report landed bytes to
//! the bound transaction barrier in `chunk_bytes` pieces; stores read the
//! staged tile back and signal a per-copy completion that bulk groups wait
//! on. Box elements outside the global tensor read as zero and are never
//! written.

use std::collections::{HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, trace};

use super::{panic_message, GlobalBuffer, GridAborted, GridControl, SharedMemory};
use crate::barrier::TransactionBarrier;
use crate::descriptor::TensorMapMeta;
use crate::error::DeviceError;
use crate::launch::Dim3;

pub(crate) enum CopyKind {
    Load(Arc<TransactionBarrier>),
    Store(Arc<Completion>),
}

/// One in-flight `cp.async.bulk.tensor` operation.
pub(crate) struct BulkCopy {
    pub(crate) descriptor: u64,
    pub(crate) meta: TensorMapMeta,
    pub(crate) global: GlobalBuffer,
    pub(crate) coords: [i32; 2],
    pub(crate) shared: Arc<SharedMemory>,
    pub(crate) smem_offset: usize,
    pub(crate) kind: CopyKind,
    pub(crate) block: Dim3,
    pub(crate) control: Arc<GridControl>,
}

impl BulkCopy {
    fn row_bytes(&self) -> usize {
        self.meta.box_dims[0] as usize * self.meta.element_size()
    }

    /// In-bounds element range of box row `r`, or `None` if the whole row
    /// lies outside the tensor. Returns `(box_start, global_start, count)`.
    fn clip_row(&self, r: usize) -> Option<(usize, usize, usize)> {
        let [dim0, dim1] = self.meta.global_dims.map(|d| d as i64);
        let outer = i64::from(self.coords[1]) + r as i64;
        if outer < 0 || outer >= dim1 {
            return None;
        }
        let inner = i64::from(self.coords[0]);
        let lo = inner.max(0);
        let hi = (inner + i64::from(self.meta.box_dims[0])).min(dim0);
        if lo >= hi {
            return None;
        }
        let elem = self.meta.element_size();
        let global = outer as usize * self.meta.global_strides[0] as usize + lo as usize * elem;
        Some(((lo - inner) as usize * elem, global, (hi - lo) as usize * elem))
    }

    fn execute(&self, chunk_bytes: usize) {
        let rows = self.meta.box_dims[1] as usize;
        let row_bytes = self.row_bytes();
        let mut row = vec![0u8; row_bytes];

        match &self.kind {
            CopyKind::Load(barrier) => {
                let mut pending = 0usize;
                for r in 0..rows {
                    row.fill(0);
                    if let Some((start, global, len)) = self.clip_row(r) {
                        self.global.read(global, &mut row[start..start + len]);
                    }
                    self.shared.write_bytes(self.smem_offset + r * row_bytes, &row);

                    pending += row_bytes;
                    while pending >= chunk_bytes {
                        barrier.complete_tx(chunk_bytes as u32);
                        pending -= chunk_bytes;
                    }
                }
                if pending > 0 {
                    barrier.complete_tx(pending as u32);
                }
            }
            CopyKind::Store(done) => {
                for r in 0..rows {
                    if let Some((start, global, len)) = self.clip_row(r) {
                        self.shared
                            .read_bytes(self.smem_offset + r * row_bytes + start, &mut row[..len]);
                        self.global.write(global, &row[..len]);
                    }
                }
                done.complete();
            }
        }
    }

    fn skip(&self) {
        if let CopyKind::Store(done) = &self.kind {
            done.complete();
        }
    }
}

/// Resident tensor maps, evicted oldest first.
#[derive(Debug, Default)]
struct DescriptorCache {
    capacity: usize,
    resident: HashSet<u64>,
    order: VecDeque<u64>,
}

impl DescriptorCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ..Self::default()
        }
    }

    /// Returns whether `descriptor` was already resident.
    fn touch(&mut self, descriptor: u64) -> bool {
        if self.resident.contains(&descriptor) {
            return true;
        }
        while self.order.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.resident.remove(&evicted);
                trace!(descriptor = evicted, "descriptor evicted");
            }
        }
        self.resident.insert(descriptor);
        self.order.push_back(descriptor);
        false
    }
}

pub(crate) struct CopyEngine {
    sender: Option<Sender<BulkCopy>>,
    workers: Vec<JoinHandle<()>>,
    descriptors: Mutex<DescriptorCache>,
}

impl CopyEngine {
    pub(crate) fn new(workers: usize, chunk_bytes: usize, cache_entries: usize) -> Self {
        let (sender, receiver) = channel::unbounded::<BulkCopy>();
        let chunk_bytes = chunk_bytes.max(1);
        let workers = (0..workers.max(1))
            .map(|id| {
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("copy-engine-{id}"))
                    .spawn(move || worker_loop(&receiver, chunk_bytes))
            })
            .filter_map(Result::ok)
            .collect::<Vec<_>>();
        debug!(workers = workers.len(), chunk_bytes, "copy engine started");

        Self {
            sender: Some(sender),
            workers,
            descriptors: Mutex::new(DescriptorCache::new(cache_entries)),
        }
    }

    fn descriptors(&self) -> MutexGuard<'_, DescriptorCache> {
        self.descriptors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pulls a descriptor into the engine's cache. Returns whether it was
    /// already resident.
    pub(crate) fn prefetch(&self, descriptor: u64) -> bool {
        self.descriptors().touch(descriptor)
    }

    pub(crate) fn cached_descriptors(&self) -> usize {
        self.descriptors().resident.len()
    }

    pub(crate) fn submit(&self, copy: BulkCopy) {
        if self.prefetch(copy.descriptor) {
            trace!(descriptor = copy.descriptor, "descriptor cache hit");
        }
        copy.control.begin_job();
        let rejected = match &self.sender {
            Some(sender) => sender.send(copy).err().map(|err| err.into_inner()),
            None => Some(copy),
        };
        if let Some(copy) = rejected {
            copy.control.fault(DeviceError::EngineFault {
                block: copy.block,
                message: "copy engine has shut down".to_string(),
            });
            copy.skip();
            copy.control.end_job();
        }
    }
}

impl Drop for CopyEngine {
    fn drop(&mut self) {
        drop(self.sender.take());
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(receiver: &Receiver<BulkCopy>, chunk_bytes: usize) {
    for copy in receiver.iter() {
        if copy.control.is_aborted() {
            copy.skip();
        } else {
            let result = panic::catch_unwind(AssertUnwindSafe(|| copy.execute(chunk_bytes)));
            if let Err(payload) = result {
                if !payload.is::<GridAborted>() {
                    copy.control.fault(DeviceError::EngineFault {
                        block: copy.block,
                        message: panic_message(payload.as_ref()),
                    });
                }
                copy.skip();
            }
        }
        copy.control.end_job();
    }
}

#[derive(Debug, Default)]
struct CompletionState {
    done: bool,
    poisoned: bool,
}

/// Completion flag of one bulk store.
#[derive(Debug, Default)]
pub(crate) struct Completion {
    state: Mutex<CompletionState>,
    cv: Condvar,
}

impl Completion {
    fn lock(&self) -> MutexGuard<'_, CompletionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn complete(&self) {
        self.lock().done = true;
        self.cv.notify_all();
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.lock().done
    }

    pub(crate) fn wait(&self) {
        let mut state = self.lock();
        while !state.done {
            if state.poisoned {
                drop(state);
                panic::resume_unwind(Box::new(GridAborted));
            }
            state = self.cv.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn poison(&self) {
        self.lock().poisoned = true;
        self.cv.notify_all();
    }
}

#[derive(Default)]
struct BulkState {
    open: Vec<Arc<Completion>>,
    committed: VecDeque<Vec<Arc<Completion>>>,
    poisoned: bool,
}

/// Per-group bookkeeping of `cp.async.bulk.commit_group` /
/// `cp.async.bulk.wait_group`.
#[derive(Default)]
pub(crate) struct BulkGroups {
    state: Mutex<BulkState>,
}

impl BulkGroups {
    fn lock(&self) -> MutexGuard<'_, BulkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn track(&self) -> Arc<Completion> {
        let completion = Arc::new(Completion::default());
        let mut state = self.lock();
        if state.poisoned {
            completion.poison();
        }
        state.open.push(Arc::clone(&completion));
        completion
    }

    pub(crate) fn commit(&self) {
        let mut state = self.lock();
        let group = std::mem::take(&mut state.open);
        state.committed.push_back(group);
    }

    /// Blocks until at most `max_pending` committed groups are unfinished.
    pub(crate) fn wait(&self, max_pending: usize) {
        loop {
            let next = {
                let mut state = self.lock();
                while state
                    .committed
                    .front()
                    .is_some_and(|group| group.iter().all(|c| c.is_complete()))
                {
                    state.committed.pop_front();
                }
                if state.committed.len() <= max_pending {
                    return;
                }
                state
                    .committed
                    .front()
                    .and_then(|group| group.iter().find(|c| !c.is_complete()).cloned())
            };
            if let Some(completion) = next {
                completion.wait();
            }
        }
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.lock().committed.len()
    }

    pub(crate) fn poison(&self) {
        let mut state = self.lock();
        state.poisoned = true;
        for completion in state.open.iter().chain(state.committed.iter().flatten()) {
            completion.poison();
        }
    }
}
