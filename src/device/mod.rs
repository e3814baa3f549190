//! A simulated Hopper device.
//!
//! Execution groups (thread blocks) run as scoped OS threads, at most
//! `max_resident_blocks` at a time. Bulk tensor copies go to a pool of
//! copy-engine workers and complete asynchronously against transaction
//! barriers and bulk groups. Launches are queued on one in-order stream;
//! `synchronize` reports the first fault, which stays sticky until `reset`.
//!
//! A fault anywhere in a grid aborts the whole grid: every group barrier,
//! transaction barrier and bulk group it owns is poisoned, so blocked
//! threads unwind with [`GridAborted`] instead of hanging.

mod engine;
mod memory;
mod report;
mod thread;

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use crate::error::{DeviceError, LaunchError};
use crate::launch::{Dim3, Kernel, KernelFn, LaunchConfig};

pub use memory::{DeviceBuffer, GlobalBuffer, SharedMemory};
pub use report::{GroupReport, LaunchReport};
pub use thread::{ThreadCtx, SMEM_BOX_ALIGN, WARP_SIZE};

pub(crate) use engine::CopyEngine;
pub(crate) use thread::GroupState;

/// Unwind payload of threads released from a poisoned wait.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GridAborted;

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub name: String,
    /// Execution groups that run concurrently.
    pub max_resident_blocks: usize,
    pub max_threads_per_block: u32,
    /// Dynamic shared memory a kernel gets without opting in.
    pub max_shared_memory_per_block: usize,
    pub max_shared_memory_per_block_optin: usize,
    pub copy_engine_workers: usize,
    /// Granularity at which loads report landed bytes.
    pub copy_chunk_bytes: usize,
    /// Grids running longer than this are terminated by `synchronize`.
    pub watchdog: Option<Duration>,
    pub thread_stack_bytes: usize,
    /// Launch reports kept for [`Device::take_reports`]; older ones are dropped.
    pub max_reports: usize,
    /// Tensor maps the copy engine keeps resident.
    pub descriptor_cache_entries: usize,
}

impl DeviceConfig {
    pub fn hopper() -> Self {
        Self {
            name: "Simulated H100 (sm_90)".to_string(),
            max_resident_blocks: 8,
            max_threads_per_block: 1024,
            max_shared_memory_per_block: 48 * 1024,
            max_shared_memory_per_block_optin: 227 * 1024,
            copy_engine_workers: 4,
            copy_chunk_bytes: 8 * 1024,
            watchdog: Some(Duration::from_secs(30)),
            thread_stack_bytes: 256 * 1024,
            max_reports: 16,
            descriptor_cache_entries: 64,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::hopper()
    }
}

/// Lifetime and fault state of one launched grid.
pub(crate) struct GridControl {
    kernel: String,
    aborted: AtomicBool,
    fault: Mutex<Option<DeviceError>>,
    resident: Mutex<Vec<Arc<GroupState>>>,
    inflight: Mutex<usize>,
    idle: Condvar,
}

impl GridControl {
    pub(crate) fn new(kernel: &str) -> Self {
        Self {
            kernel: kernel.to_string(),
            aborted: AtomicBool::new(false),
            fault: Mutex::new(None),
            resident: Mutex::new(Vec::new()),
            inflight: Mutex::new(0),
            idle: Condvar::new(),
        }
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Records `fault` (the first one wins) and aborts the grid.
    pub(crate) fn fault(&self, fault: DeviceError) {
        {
            let mut slot = lock(&self.fault);
            if slot.is_none() {
                warn!(kernel = %self.kernel, %fault, "grid fault");
                *slot = Some(fault);
            }
        }
        self.abort();
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        for group in lock(&self.resident).iter() {
            group.poison();
        }
    }

    fn register(&self, group: &Arc<GroupState>) {
        let mut resident = lock(&self.resident);
        resident.push(Arc::clone(group));
        if self.is_aborted() {
            group.poison();
        }
    }

    fn unregister(&self, group: &Arc<GroupState>) {
        lock(&self.resident).retain(|g| !Arc::ptr_eq(g, group));
    }

    pub(crate) fn begin_job(&self) {
        *lock(&self.inflight) += 1;
    }

    pub(crate) fn end_job(&self) {
        let mut inflight = lock(&self.inflight);
        *inflight -= 1;
        if *inflight == 0 {
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut inflight = lock(&self.inflight);
        while *inflight > 0 {
            inflight = self.idle.wait(inflight).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn take_fault(&self) -> Option<DeviceError> {
        lock(&self.fault).take()
    }
}

/// A typed launch, erased to a closure once it is queued.
struct GridLaunch<P> {
    kernel: String,
    func: Arc<KernelFn<P>>,
    params: Arc<P>,
    config: LaunchConfig,
    control: Arc<GridControl>,
    engine: Arc<CopyEngine>,
    resident: usize,
    stack_bytes: usize,
}

impl<P: Send + Sync + 'static> GridLaunch<P> {
    fn run(self) -> LaunchReport {
        let start = Instant::now();
        let blocks: Vec<Dim3> = self.config.grid.indices().collect();
        let mut groups = Vec::with_capacity(blocks.len());

        for wave in blocks.chunks(self.resident.max(1)) {
            if self.control.is_aborted() {
                break;
            }
            let this = &self;
            let reports: Vec<GroupReport> = std::thread::scope(|scope| {
                let handles: Vec<_> = wave
                    .iter()
                    .map(|&block| scope.spawn(move || this.run_group(block)))
                    .collect();
                handles.into_iter().filter_map(|h| h.join().ok()).collect()
            });
            groups.extend(reports);
        }

        LaunchReport {
            kernel: self.kernel.clone(),
            config: self.config,
            elapsed: start.elapsed(),
            faulted: false,
            groups,
        }
    }

    fn run_group(&self, block_idx: Dim3) -> GroupReport {
        let threads = self.config.threads_per_block();
        let group = Arc::new(GroupState::new(
            block_idx,
            self.config.shared_memory_bytes,
            threads,
        ));
        self.control.register(&group);

        std::thread::scope(|scope| {
            let group = &group;
            for t in 0..threads {
                let spawned = std::thread::Builder::new()
                    .stack_size(self.stack_bytes)
                    .spawn_scoped(scope, move || self.run_thread(group, t));
                if let Err(err) = spawned {
                    self.control.fault(DeviceError::OutOfResources {
                        block: block_idx,
                        message: err.to_string(),
                    });
                    break;
                }
            }
        });

        self.control.unregister(&group);
        group.report()
    }

    fn run_thread(&self, group: &GroupState, t: u32) {
        let ctx = ThreadCtx::new(
            t,
            self.config.block,
            self.config.grid,
            group,
            &self.engine,
            &self.control,
        );
        let result = panic::catch_unwind(AssertUnwindSafe(|| (self.func)(&ctx, self.params.as_ref())));
        if let Err(payload) = result {
            if !payload.is::<GridAborted>() {
                self.control.fault(DeviceError::KernelFault {
                    kernel: self.kernel.clone(),
                    block: group.block_idx,
                    thread: t,
                    message: panic_message(payload.as_ref()),
                });
            }
        }
    }
}

enum StreamCommand {
    Launch {
        control: Arc<GridControl>,
        grid: Box<dyn FnOnce() -> LaunchReport + Send>,
    },
    Sync(Sender<()>),
}

/// The grid the stream is executing.
#[derive(Clone)]
struct RunningGrid {
    control: Arc<GridControl>,
    started: Instant,
}

struct StreamState {
    fault: Mutex<Option<DeviceError>>,
    current: Mutex<Option<RunningGrid>>,
    reports: Mutex<VecDeque<LaunchReport>>,
    max_reports: usize,
    shutting_down: AtomicBool,
}

impl StreamState {
    fn new(max_reports: usize) -> Self {
        Self {
            fault: Mutex::new(None),
            current: Mutex::new(None),
            reports: Mutex::new(VecDeque::new()),
            max_reports,
            shutting_down: AtomicBool::new(false),
        }
    }

    fn record(&self, report: LaunchReport) {
        if self.max_reports == 0 {
            return;
        }
        let mut reports = lock(&self.reports);
        while reports.len() >= self.max_reports {
            reports.pop_front();
        }
        reports.push_back(report);
    }
}

fn stream_loop(commands: Receiver<StreamCommand>, state: Arc<StreamState>) {
    for command in commands.iter() {
        match command {
            StreamCommand::Launch { control, grid } => {
                if state.shutting_down.load(Ordering::SeqCst) || lock(&state.fault).is_some() {
                    debug!(kernel = %control.kernel, "skipping launch on faulted stream");
                    continue;
                }
                *lock(&state.current) = Some(RunningGrid {
                    control: Arc::clone(&control),
                    started: Instant::now(),
                });
                let mut report = grid();
                control.wait_idle();
                *lock(&state.current) = None;

                if let Some(fault) = control.take_fault() {
                    error!(%fault, "launch failed");
                    report.faulted = true;
                    lock(&state.fault).get_or_insert(fault);
                } else {
                    debug!(
                        kernel = %report.kernel,
                        elapsed_us = report.elapsed.as_micros() as u64,
                        "grid complete"
                    );
                }
                state.record(report);
            }
            StreamCommand::Sync(reply) => {
                let _ = reply.send(());
            }
        }
    }
}

pub struct Device {
    config: DeviceConfig,
    engine: Arc<CopyEngine>,
    next_address: AtomicU64,
    commands: Option<Sender<StreamCommand>>,
    stream: Option<JoinHandle<()>>,
    state: Arc<StreamState>,
}

impl Device {
    const BASE_ADDRESS: u64 = 0x7f40_0000_0000;
    const ALLOC_ALIGN: u64 = 256;
    const WATCHDOG_POLL: Duration = Duration::from_millis(10);

    pub fn new(config: DeviceConfig) -> Self {
        let engine = Arc::new(CopyEngine::new(
            config.copy_engine_workers,
            config.copy_chunk_bytes,
            config.descriptor_cache_entries,
        ));
        let state = Arc::new(StreamState::new(config.max_reports));
        let (commands, receiver) = channel::unbounded();
        let stream = {
            let state = Arc::clone(&state);
            std::thread::Builder::new()
                .name("device-stream".to_string())
                .spawn(move || stream_loop(receiver, state))
                .ok()
        };
        info!(device = %config.name, "device initialized");

        Self {
            config,
            engine,
            next_address: AtomicU64::new(Self::BASE_ADDRESS),
            commands: stream.as_ref().map(|_| commands),
            stream,
            state,
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub(crate) fn allocate(&self, bytes: usize) -> GlobalBuffer {
        let span = (bytes.max(1) as u64).div_ceil(Self::ALLOC_ALIGN) * Self::ALLOC_ALIGN;
        let address = self.next_address.fetch_add(span, Ordering::Relaxed);
        GlobalBuffer::new(address, bytes)
    }

    /// Queues `kernel` on the stream. Returns once the launch is accepted;
    /// execution errors surface from [`Device::synchronize`].
    pub fn launch<P: Send + Sync + 'static>(
        &self,
        kernel: &Kernel<P>,
        config: LaunchConfig,
        params: P,
    ) -> Result<(), LaunchError> {
        if let Some(fault) = lock(&self.state.fault).clone() {
            return Err(LaunchError::ContextPoisoned(fault));
        }
        self.validate(kernel, &config)?;

        debug!(
            kernel = kernel.name(),
            grid = %config.grid,
            block = %config.block,
            smem = config.shared_memory_bytes,
            "launch"
        );

        let control = Arc::new(GridControl::new(kernel.name()));
        let grid = GridLaunch {
            kernel: kernel.name().to_string(),
            func: kernel.func(),
            params: Arc::new(params),
            config,
            control: Arc::clone(&control),
            engine: Arc::clone(&self.engine),
            resident: self.config.max_resident_blocks,
            stack_bytes: self.config.thread_stack_bytes,
        };
        let command = StreamCommand::Launch {
            control,
            grid: Box::new(move || grid.run()),
        };
        self.commands
            .as_ref()
            .ok_or(LaunchError::StreamClosed)?
            .send(command)
            .map_err(|_| LaunchError::StreamClosed)
    }

    fn validate<P>(&self, kernel: &Kernel<P>, config: &LaunchConfig) -> Result<(), LaunchError> {
        if config.grid.size() == 0 {
            return Err(LaunchError::InvalidGrid { grid: config.grid });
        }
        let limit = self.config.max_threads_per_block;
        let threads = config.block.size();
        if threads == 0 || threads > u64::from(limit) {
            return Err(LaunchError::InvalidBlock {
                block: config.block,
                threads: threads.min(u64::from(u32::MAX)) as u32,
                limit,
            });
        }
        let requested = config.shared_memory_bytes;
        if requested > self.config.max_shared_memory_per_block_optin {
            return Err(LaunchError::SharedMemoryExceedsDevice {
                requested,
                limit: self.config.max_shared_memory_per_block_optin,
            });
        }
        let kernel_limit = kernel
            .max_dynamic_shared_memory()
            .unwrap_or(self.config.max_shared_memory_per_block);
        if requested > kernel_limit {
            return Err(LaunchError::SharedMemoryExceedsKernelLimit {
                kernel: kernel.name().to_string(),
                requested,
                limit: kernel_limit,
            });
        }
        Ok(())
    }

    /// Waits for every queued launch and returns the sticky fault, if any.
    pub fn synchronize(&self) -> Result<(), DeviceError> {
        let (reply, done) = channel::bounded(1);
        let queued = self
            .commands
            .as_ref()
            .is_some_and(|commands| commands.send(StreamCommand::Sync(reply)).is_ok());

        if queued {
            match self.config.watchdog {
                Some(watchdog) => loop {
                    let remaining = match self.current_elapsed() {
                        Some(elapsed) => watchdog.saturating_sub(elapsed).max(Self::WATCHDOG_POLL),
                        None => watchdog,
                    };
                    match done.recv_timeout(remaining) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => self.terminate_overdue(watchdog),
                    }
                },
                None => {
                    let _ = done.recv();
                }
            }
        }

        match lock(&self.state.fault).clone() {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    fn current_elapsed(&self) -> Option<Duration> {
        lock(&self.state.current)
            .as_ref()
            .map(|grid| grid.started.elapsed())
    }

    /// Terminates the running grid once it alone has exceeded `watchdog`.
    /// Grids still queued behind it are not charged.
    fn terminate_overdue(&self, watchdog: Duration) {
        let Some(grid) = lock(&self.state.current).clone() else {
            return;
        };
        if grid.started.elapsed() >= watchdog && !grid.control.is_aborted() {
            grid.control.fault(DeviceError::LaunchTimeout {
                kernel: grid.control.kernel.clone(),
                watchdog,
            });
        }
    }

    /// Clears a sticky fault so the device accepts launches again.
    pub fn reset(&self) {
        if let Some(fault) = lock(&self.state.fault).take() {
            info!(%fault, "device reset");
        }
    }

    /// Reports of the launches completed since the last call, at most
    /// `max_reports` of the most recent ones.
    pub fn take_reports(&self) -> Vec<LaunchReport> {
        std::mem::take(&mut *lock(&self.state.reports)).into()
    }

    /// Descriptors resident in the copy engine's cache.
    pub fn cached_descriptors(&self) -> usize {
        self.engine.cached_descriptors()
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::new(DeviceConfig::default())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.state.shutting_down.store(true, Ordering::SeqCst);
        if let Some(grid) = lock(&self.state.current).clone() {
            grid.control.abort();
        }
        drop(self.commands.take());
        if let Some(stream) = self.stream.take() {
            let _ = stream.join();
        }
    }
}
