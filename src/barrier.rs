//! Transaction-counting barrier (the `mbarrier` of one execution group).
//!
//! A phase completes once the configured number of arrivals has been
//! signalled *and* every byte declared with [`TransactionBarrier::expect_tx`]
//! has been reported by the copy engine through
//! [`TransactionBarrier::complete_tx`]. Completing a phase flips its parity,
//! re-arms the arrival count and releases every waiter.
//!
//! The protocol is single-writer: exactly one elected thread initialises the
//! barrier, declares the expected bytes and issues the transfer, while every
//! thread of the group waits. Violations are not recoverable at this layer;
//! they panic here, which the simulated device turns into a grid fault.

use std::panic;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use tracing::trace;

use crate::device::GridAborted;

#[derive(Debug, Default)]
struct State {
    initialized: bool,
    arrival_count: u32,
    pending_arrivals: u32,
    tx_count: u64,
    phase: u32,
    poisoned: bool,
}

impl State {
    fn require_init(&self, op: &str) {
        assert!(self.initialized, "{op} on an uninitialized transaction barrier");
    }

    /// Parity semantics: waiting on `phase` returns once the barrier has
    /// moved to a phase of the other parity.
    fn phase_complete(&self, phase: u32) -> bool {
        (self.phase & 1) != (phase & 1)
    }
}

#[derive(Debug, Default)]
pub struct TransactionBarrier {
    state: Mutex<State>,
    completed: Condvar,
    inits: AtomicU32,
    expectations: AtomicU32,
}

impl TransactionBarrier {
    /// Footprint of the hardware barrier word in shared memory.
    pub const SIZE_BYTES: usize = 8;
    pub const ALIGN: usize = 8;

    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arms phase 0 with `arrival_count` expected arrivals and no pending
    /// transactions. Must be called by exactly one thread, before any other
    /// operation.
    pub fn init(&self, arrival_count: u32) {
        assert!(arrival_count > 0, "transaction barrier needs at least one arrival");
        let prior = self.inits.fetch_add(1, Ordering::Relaxed);
        debug_assert_eq!(prior, 0, "transaction barrier initialized more than once");

        let mut state = self.lock();
        state.initialized = true;
        state.arrival_count = arrival_count;
        state.pending_arrivals = arrival_count;
        state.tx_count = 0;
        state.phase = 0;
    }

    /// Declares `bytes` more bytes for the current phase without arriving.
    pub fn expect_tx(&self, bytes: u32) {
        let mut state = self.lock();
        state.require_init("expect_tx");
        self.expectations.fetch_add(1, Ordering::Relaxed);
        state.tx_count += u64::from(bytes);
    }

    /// Declares `bytes` for the current phase and arrives. The caller must
    /// issue the matching transfer afterwards.
    pub fn arrive_and_expect_tx(&self, bytes: u32) {
        let mut state = self.lock();
        state.require_init("arrive_and_expect_tx");
        self.expectations.fetch_add(1, Ordering::Relaxed);
        state.tx_count += u64::from(bytes);
        self.arrive_locked(&mut state);
    }

    pub fn arrive(&self) {
        let mut state = self.lock();
        state.require_init("arrive");
        self.arrive_locked(&mut state);
    }

    /// Engine side: `bytes` of a bound transfer have landed.
    pub fn complete_tx(&self, bytes: u32) {
        let mut state = self.lock();
        state.require_init("complete_tx");
        let Some(remaining) = state.tx_count.checked_sub(u64::from(bytes)) else {
            let (expected, phase) = (state.tx_count, state.phase);
            drop(state);
            panic!(
                "complete_tx of {bytes} bytes exceeds the {expected} bytes still expected in phase {phase}"
            );
        };
        state.tx_count = remaining;
        trace!(bytes, remaining, phase = state.phase, "transaction bytes landed");
        self.try_complete(&mut state);
    }

    fn arrive_locked(&self, state: &mut State) {
        assert!(
            state.pending_arrivals > 0,
            "more arrivals than the configured count of {}",
            state.arrival_count
        );
        state.pending_arrivals -= 1;
        self.try_complete(state);
    }

    fn try_complete(&self, state: &mut State) {
        if state.pending_arrivals == 0 && state.tx_count == 0 {
            state.phase = state.phase.wrapping_add(1);
            state.pending_arrivals = state.arrival_count;
            self.completed.notify_all();
        }
    }

    /// Non-blocking check of [`TransactionBarrier::wait`].
    pub fn try_wait(&self, phase: u32) -> bool {
        let state = self.lock();
        state.require_init("try_wait");
        state.phase_complete(phase)
    }

    /// Blocks until the phase with parity `phase` has completed. There is no
    /// timeout: if the declared bytes never arrive the caller hangs.
    pub fn wait(&self, phase: u32) {
        let mut state = self.lock();
        state.require_init("wait");
        while !state.phase_complete(phase) {
            if state.poisoned {
                drop(state);
                panic::resume_unwind(Box::new(GridAborted));
            }
            state = self
                .completed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Number of completed phases.
    pub fn phase(&self) -> u32 {
        self.lock().phase
    }

    pub fn init_count(&self) -> u32 {
        self.inits.load(Ordering::Relaxed)
    }

    pub fn expectation_count(&self) -> u32 {
        self.expectations.load(Ordering::Relaxed)
    }

    /// Releases every waiter; they unwind instead of returning.
    pub(crate) fn poison(&self) {
        self.lock().poisoned = true;
        self.completed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_phase_completes_after_arrival_and_bytes() {
        let barrier = TransactionBarrier::new();
        barrier.init(1);
        assert!(!barrier.try_wait(0));

        barrier.arrive_and_expect_tx(64);
        assert!(!barrier.try_wait(0), "arrival alone must not complete the phase");

        barrier.complete_tx(64);
        assert!(barrier.try_wait(0));
        assert_eq!(barrier.phase(), 1);
        // Phase 1 is armed again and has not completed.
        assert!(!barrier.try_wait(1));
    }

    #[test]
    fn test_bytes_before_arrival() {
        let barrier = TransactionBarrier::new();
        barrier.init(1);
        barrier.expect_tx(32);
        barrier.complete_tx(32);
        assert!(!barrier.try_wait(0));
        barrier.arrive();
        assert!(barrier.try_wait(0));
    }

    #[test]
    fn test_wait_holds_until_last_chunk() {
        const TILE_BYTES: u32 = 128 * 128 * 4;

        let barrier = Arc::new(TransactionBarrier::new());
        barrier.init(1);
        barrier.arrive_and_expect_tx(TILE_BYTES);

        let (first_tx, first_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let engine = {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.complete_tx(TILE_BYTES / 2);
                first_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                barrier.complete_tx(TILE_BYTES / 2);
            })
        };

        let (done_tx, done_rx) = mpsc::channel();
        let waiter = {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait(0);
                done_tx.send(()).unwrap();
            })
        };

        first_rx.recv().unwrap();
        assert!(
            done_rx.recv_timeout(Duration::from_millis(100)).is_err(),
            "wait returned after only half of the bytes landed"
        );
        assert!(!barrier.try_wait(0));

        release_tx.send(()).unwrap();
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        engine.join().unwrap();
        waiter.join().unwrap();
    }

    #[test]
    fn test_many_waiters_released_together() {
        let barrier = Arc::new(TransactionBarrier::new());
        barrier.init(1);
        barrier.arrive_and_expect_tx(16);

        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || barrier.wait(0))
            })
            .collect();

        barrier.complete_tx(16);
        for waiter in waiters {
            waiter.join().unwrap();
        }
    }

    #[test]
    fn test_counts_arrivals() {
        let barrier = TransactionBarrier::new();
        barrier.init(2);
        barrier.arrive();
        assert!(!barrier.try_wait(0));
        barrier.arrive();
        assert!(barrier.try_wait(0));
        assert_eq!(barrier.init_count(), 1);
    }

    #[test]
    #[should_panic(expected = "exceeds the 8 bytes still expected")]
    fn test_overrun_panics() {
        let barrier = TransactionBarrier::new();
        barrier.init(1);
        barrier.expect_tx(8);
        barrier.complete_tx(16);
    }

    #[test]
    #[should_panic(expected = "uninitialized transaction barrier")]
    fn test_use_before_init_panics() {
        TransactionBarrier::new().arrive_and_expect_tx(4);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "initialized more than once")]
    fn test_double_init_panics_in_debug() {
        let barrier = TransactionBarrier::new();
        barrier.init(1);
        barrier.init(1);
    }

    #[test]
    fn test_poison_releases_waiters() {
        let barrier = Arc::new(TransactionBarrier::new());
        barrier.init(1);
        let waiter = {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || barrier.wait(0))
        };
        thread::sleep(Duration::from_millis(20));
        barrier.poison();
        let payload = waiter.join().unwrap_err();
        assert!(payload.is::<GridAborted>());
    }
}
