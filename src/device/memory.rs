use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use anyhow::{ensure, Result};
use bytemuck::Pod;

use super::Device;
use crate::barrier::TransactionBarrier;

struct Allocation {
    address: u64,
    bytes: RwLock<Vec<u8>>,
}

/// Untyped handle to a global-memory allocation. Clones share the storage.
#[derive(Clone)]
pub struct GlobalBuffer {
    inner: Arc<Allocation>,
}

impl GlobalBuffer {
    pub(crate) fn new(address: u64, len: usize) -> Self {
        Self {
            inner: Arc::new(Allocation {
                address,
                bytes: RwLock::new(vec![0; len]),
            }),
        }
    }

    pub fn address(&self) -> u64 {
        self.inner.address
    }

    pub fn len_bytes(&self) -> usize {
        self.inner.bytes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn check_range(&self, offset: usize, len: usize, total: usize) {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= total),
            "illegal address: access of {len} bytes at {:#x} outside the {total}-byte allocation at {:#x}",
            self.inner.address + offset as u64,
            self.inner.address
        );
    }

    pub(crate) fn read(&self, offset: usize, dst: &mut [u8]) {
        let bytes = self.inner.bytes.read().unwrap_or_else(PoisonError::into_inner);
        self.check_range(offset, dst.len(), bytes.len());
        dst.copy_from_slice(&bytes[offset..offset + dst.len()]);
    }

    pub(crate) fn write(&self, offset: usize, src: &[u8]) {
        let mut bytes = self.inner.bytes.write().unwrap_or_else(PoisonError::into_inner);
        self.check_range(offset, src.len(), bytes.len());
        bytes[offset..offset + src.len()].copy_from_slice(src);
    }
}

impl fmt::Debug for GlobalBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalBuffer")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("len_bytes", &self.len_bytes())
            .finish()
    }
}

/// Typed global-memory array of `len` elements.
pub struct DeviceBuffer<T> {
    buffer: GlobalBuffer,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T: Pod> DeviceBuffer<T> {
    pub fn alloc_zeroed(device: &Device, len: usize) -> Self {
        Self {
            buffer: device.allocate(len * std::mem::size_of::<T>()),
            len,
            _marker: PhantomData,
        }
    }

    pub fn from_slice(device: &Device, data: &[T]) -> Self {
        let buffer = Self::alloc_zeroed(device, data.len());
        buffer.buffer.write(0, bytemuck::cast_slice(data));
        buffer
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn copy_from_host(&mut self, data: &[T]) -> Result<()> {
        ensure!(
            data.len() == self.len,
            "Failed to copy data to device: host slice has {} elements, buffer has {}",
            data.len(),
            self.len
        );
        self.buffer.write(0, bytemuck::cast_slice(data));
        Ok(())
    }

    pub fn copy_to_host(&self, data: &mut [T]) -> Result<()> {
        ensure!(
            data.len() == self.len,
            "Failed to copy data from device: host slice has {} elements, buffer has {}",
            data.len(),
            self.len
        );
        self.buffer.read(0, bytemuck::cast_slice_mut(data));
        Ok(())
    }

    pub fn to_vec(&self) -> Vec<T> {
        let mut data = vec![T::zeroed(); self.len];
        self.buffer.read(0, bytemuck::cast_slice_mut(&mut data));
        data
    }

    pub fn as_global(&self) -> &GlobalBuffer {
        &self.buffer
    }

    pub fn address(&self) -> u64 {
        self.buffer.address()
    }
}

#[derive(Default)]
struct BarrierSlots {
    slots: BTreeMap<usize, Arc<TransactionBarrier>>,
    poisoned: bool,
}

/// Dynamic shared memory of one execution group.
///
/// Plain bytes plus the transaction barriers that live at fixed offsets in
/// the same window. Writing data over a barrier slot is a fault.
pub struct SharedMemory {
    data: Mutex<Vec<u8>>,
    barriers: Mutex<BarrierSlots>,
    size: usize,
}

impl SharedMemory {
    pub fn new(size: usize) -> Self {
        Self {
            data: Mutex::new(vec![0; size]),
            barriers: Mutex::new(BarrierSlots::default()),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn slots(&self) -> MutexGuard<'_, BarrierSlots> {
        self.barriers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_range(&self, offset: usize, len: usize) {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.size),
            "shared memory access of {len} bytes at offset {offset} outside the {}-byte window",
            self.size
        );
    }

    /// The barrier occupying the 8-byte slot at `offset`.
    pub fn barrier_at(&self, offset: usize) -> Arc<TransactionBarrier> {
        assert!(
            offset % TransactionBarrier::ALIGN == 0,
            "transaction barrier at offset {offset} is not {}-byte aligned",
            TransactionBarrier::ALIGN
        );
        self.check_range(offset, TransactionBarrier::SIZE_BYTES);

        let mut slots = self.slots();
        let poisoned = slots.poisoned;
        Arc::clone(slots.slots.entry(offset).or_insert_with(|| {
            let barrier = Arc::new(TransactionBarrier::new());
            if poisoned {
                barrier.poison();
            }
            barrier
        }))
    }

    fn check_no_barrier(&self, offset: usize, len: usize) {
        let slots = self.slots();
        let start = offset.saturating_sub(TransactionBarrier::SIZE_BYTES - 1);
        if let Some((&slot, _)) = slots.slots.range(start..offset + len).next() {
            panic!("shared memory write of {len} bytes at offset {offset} clobbers the transaction barrier at offset {slot}");
        }
    }

    pub fn read_bytes(&self, offset: usize, dst: &mut [u8]) {
        self.check_range(offset, dst.len());
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        dst.copy_from_slice(&data[offset..offset + dst.len()]);
    }

    pub fn write_bytes(&self, offset: usize, src: &[u8]) {
        self.check_range(offset, src.len());
        self.check_no_barrier(offset, src.len());
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        data[offset..offset + src.len()].copy_from_slice(src);
    }

    pub fn read_elements<T: Pod>(&self, offset: usize, count: usize) -> Vec<T> {
        let mut out = vec![T::zeroed(); count];
        self.read_bytes(offset, bytemuck::cast_slice_mut(&mut out));
        out
    }

    pub fn barrier_inits(&self) -> u32 {
        self.slots().slots.values().map(|b| b.init_count()).sum()
    }

    pub fn barrier_expectations(&self) -> u32 {
        self.slots().slots.values().map(|b| b.expectation_count()).sum()
    }

    pub(crate) fn poison(&self) {
        let mut slots = self.slots();
        slots.poisoned = true;
        for barrier in slots.slots.values() {
            barrier.poison();
        }
    }
}
