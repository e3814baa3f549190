use std::collections::BTreeSet;
use std::time::Duration;

use half::{bf16, f16};
use pretty_assertions::assert_eq;
use tma_copy::{
    compute_scratch_bytes, copy_host_tma_load_and_store, copy_kernel, set_smem_size, CopyConfig,
    Device, DeviceBuffer, DeviceConfig, DeviceError, Dim3, Kernel, LaunchConfig, LaunchError,
    Params, SharedStorageLayout, SharedStorageTma, ThreadCtx, TmaCopy, TmaElement, TmaOp,
};
use utils::{local_tile, MemoryLayout, TensorLayout, TileCoord, TileShape};

fn test_device() -> Device {
    Device::new(DeviceConfig {
        watchdog: Some(Duration::from_millis(300)),
        ..DeviceConfig::default()
    })
}

struct Setup<E> {
    params: Params<E>,
    src: Vec<E>,
    dst: DeviceBuffer<E>,
    launch: LaunchConfig,
}

fn setup<E: TmaElement>(device: &Device, gmem: TensorLayout, tile: TileShape, threads: u32) -> Setup<E> {
    let src: Vec<E> = (0..gmem.cosize()).map(E::from_index).collect();
    let d_s = DeviceBuffer::from_slice(device, &src);
    let dst = DeviceBuffer::alloc_zeroed(device, gmem.cosize());

    let smem = match gmem.layout {
        MemoryLayout::RowMajor => TensorLayout::row_major(tile.tile_m, tile.tile_n),
        MemoryLayout::ColumnMajor => TensorLayout::column_major(tile.tile_m, tile.tile_n),
    };
    let tma_load = TmaCopy::new(TmaOp::Load, &d_s, &gmem, &smem).unwrap();
    let tma_store = TmaCopy::new(TmaOp::Store, &dst, &gmem, &smem).unwrap();
    let smem_bytes = compute_scratch_bytes::<E>(&smem);

    Setup {
        params: Params::new(tma_load, tma_store, gmem, smem, tile),
        src,
        dst,
        launch: LaunchConfig::for_tiles(&gmem.shape, tile, threads, smem_bytes),
    }
}

fn run<E: TmaElement>(device: &Device, setup: &Setup<E>) {
    let mut kernel = copy_kernel::<E>();
    set_smem_size(&mut kernel, device, setup.launch.shared_memory_bytes).unwrap();
    device.launch(&kernel, setup.launch, setup.params.clone()).unwrap();
    device.synchronize().unwrap();
}

#[test]
fn test_square_tensor_copies_exactly() {
    let device = test_device();
    let s = setup::<f32>(&device, TensorLayout::row_major(256, 256), TileShape::tma_default(), 32);
    assert_eq!(s.launch.grid, Dim3::new(2, 2, 1));
    assert_eq!(s.launch.shared_memory_bytes, 65664);

    run(&device, &s);

    let out = s.dst.to_vec();
    assert_eq!(out[0], 0.0);
    assert_eq!(out[65535], 65535.0);
    assert!(out == s.src);
}

#[test]
fn test_wide_tensor_uses_one_group_per_tile() {
    let device = test_device();
    let s = setup::<f32>(&device, TensorLayout::row_major(128, 384), TileShape::tma_default(), 32);
    assert_eq!(s.launch.grid, Dim3::new(1, 3, 1));

    run(&device, &s);
    assert!(s.dst.to_vec() == s.src);

    let reports = device.take_reports();
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert_eq!(report.groups.len(), 3);

    let mut stores = BTreeSet::new();
    for group in &report.groups {
        assert_eq!(group.barrier_inits, 1);
        assert_eq!(group.tx_expectations, 1);
        assert_eq!(group.prefetches, 2);
        assert_eq!(group.loads_issued, 1);
        assert_eq!(group.stores_issued, 1);
        assert_eq!(group.bytes_loaded, 128 * 128 * 4);
        assert_eq!(group.load_coords, group.store_coords);
        stores.extend(group.store_coords.iter().copied());
    }
    let expected: BTreeSet<[i32; 2]> = [[0, 0], [128, 0], [256, 0]].into_iter().collect();
    assert_eq!(stores, expected);
    assert_eq!(report.bytes_stored(), 128 * 384 * 4);
}

#[test]
fn test_one_thread_elected_across_warps() {
    let device = test_device();
    let s = setup::<u32>(&device, TensorLayout::row_major(64, 64), TileShape::new(32, 32), 128);
    run(&device, &s);
    assert!(s.dst.to_vec() == s.src);

    for group in &device.take_reports()[0].groups {
        assert_eq!(group.barrier_inits, 1, "group {}", group.block_idx);
        assert_eq!(group.loads_issued, 1);
        assert_eq!(group.stores_issued, 1);
    }
}

#[test]
fn test_ragged_tensor_round_trips() {
    let device = test_device();
    let s = setup::<f32>(&device, TensorLayout::row_major(200, 100), TileShape::new(64, 32), 32);
    assert_eq!(s.launch.grid, Dim3::new(4, 4, 1));
    run(&device, &s);
    assert!(s.dst.to_vec() == s.src);

    // Edge boxes still count the full box.
    let report = &device.take_reports()[0];
    assert!(report.groups.iter().all(|g| g.bytes_loaded == 64 * 32 * 4));
}

#[test]
fn test_column_major_round_trips() {
    let device = test_device();
    let s = setup::<f32>(&device, TensorLayout::column_major(128, 96), TileShape::new(64, 32), 32);
    run(&device, &s);
    assert!(s.dst.to_vec() == s.src);

    let group = device.take_reports()[0].group(Dim3::new(1, 2, 0)).cloned().unwrap();
    assert_eq!(group.store_coords, vec![[64, 64]]);
}

#[test]
fn test_small_chunks_and_few_resident_blocks() {
    let device = Device::new(DeviceConfig {
        max_resident_blocks: 1,
        copy_engine_workers: 2,
        copy_chunk_bytes: 100,
        watchdog: Some(Duration::from_secs(5)),
        ..DeviceConfig::default()
    });
    let s = setup::<f32>(&device, TensorLayout::row_major(128, 128), TileShape::new(32, 64), 32);
    run(&device, &s);
    assert!(s.dst.to_vec() == s.src);
}

#[test]
fn test_half_precision_via_driver() {
    let device = test_device();
    let config = CopyConfig {
        iterations: 2,
        ..CopyConfig::default()
    };

    let report = copy_host_tma_load_and_store::<f16>(&device, &config).unwrap();
    assert_eq!(report.trials.len(), 2);
    assert_eq!(report.smem_bytes, 32896);
    assert_eq!(report.verification.unwrap().bad, 0);

    let report = copy_host_tma_load_and_store::<bf16>(&device, &config).unwrap();
    assert_eq!(report.verification.unwrap().good, 65536);
}

#[test]
fn test_launch_without_opt_in_is_rejected() {
    let device = test_device();
    let s = setup::<f32>(&device, TensorLayout::row_major(128, 128), TileShape::tma_default(), 32);
    let err = device.launch(&copy_kernel::<f32>(), s.launch, s.params.clone()).unwrap_err();
    assert_eq!(
        err,
        LaunchError::SharedMemoryExceedsKernelLimit {
            kernel: "copy_tma_kernel".to_string(),
            requested: 65664,
            limit: 48 * 1024,
        }
    );
}

#[test]
fn test_undersized_shared_memory_faults() {
    let device = test_device();
    let mut s = setup::<u32>(&device, TensorLayout::row_major(64, 64), TileShape::new(32, 32), 32);
    s.launch.shared_memory_bytes = 1024;

    device.launch(&copy_kernel::<u32>(), s.launch, s.params.clone()).unwrap();
    match device.synchronize() {
        Err(DeviceError::KernelFault { kernel, message, .. }) => {
            assert_eq!(kernel, "copy_tma_kernel");
            assert!(message.contains("cannot hold"), "{message}");
        }
        other => panic!("expected a kernel fault, got {other:?}"),
    }
    assert!(device.take_reports()[0].faulted);
}

/// Declares more bytes than the load delivers, so the phase never completes.
fn overcommitting_kernel(ctx: &ThreadCtx<'_>, params: &Params<f32>) {
    let storage = SharedStorageTma::carve::<f32>(ctx, &params.smem_layout);
    let layout = SharedStorageLayout::new::<f32>(&params.smem_layout);
    let tile = local_tile(&params.gmem_layout, params.tile_shape, TileCoord::new(0, 0));
    if ctx.linear_thread_idx() == 0 {
        storage.mbarrier.init(1);
        storage.mbarrier.arrive_and_expect_tx(layout.tile_bytes as u32 + 16);
        params.tma_load.with(&storage.mbarrier).copy(ctx, &tile, &storage.smem);
    }
    ctx.sync_threads();
    storage.mbarrier.wait(0);
}

#[test]
fn test_missing_bytes_hit_the_watchdog() {
    let device = test_device();
    let s = setup::<f32>(&device, TensorLayout::row_major(32, 32), TileShape::new(32, 32), 32);
    let kernel = Kernel::new("overcommit", overcommitting_kernel);

    device.launch(&kernel, s.launch, s.params.clone()).unwrap();
    match device.synchronize() {
        Err(DeviceError::LaunchTimeout { kernel, watchdog }) => {
            assert_eq!(kernel, "overcommit");
            assert_eq!(watchdog, Duration::from_millis(300));
        }
        other => panic!("expected a watchdog timeout, got {other:?}"),
    }

    assert!(matches!(
        device.launch(&copy_kernel::<f32>(), s.launch, s.params.clone()),
        Err(LaunchError::ContextPoisoned(DeviceError::LaunchTimeout { .. }))
    ));
    device.reset();
    run(&device, &s);
    assert!(s.dst.to_vec() == s.src);
}
