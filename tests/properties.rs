//! Property-based tests for the simulated tile copy.
//!
//! Shapes are kept small: every case spins up a device and one OS thread per
//! simulated thread.

use std::time::Duration;

use proptest::prelude::*;
use tma_copy::{
    compute_scratch_bytes, copy_kernel, set_smem_size, Device, DeviceBuffer, DeviceConfig,
    LaunchConfig, Params, TmaCopy, TmaOp,
};
use utils::{TensorLayout, TensorShape, TileShape};

/// Row-major f32 shapes whose rows are 16-byte aligned, with tiles the
/// copy engine accepts.
fn case_strategy() -> impl Strategy<Value = (TensorShape, TileShape)> {
    (
        1usize..=80,
        1usize..=20,
        prop::sample::select(vec![8usize, 16, 32]),
        prop::sample::select(vec![4usize, 8, 16, 32]),
    )
        .prop_map(|(rows, col_quads, tile_m, tile_n)| {
            (TensorShape::new(rows, col_quads * 4), TileShape::new(tile_m, tile_n))
        })
}

struct Outcome {
    src: Vec<f32>,
    dst: Vec<f32>,
    store_coords: Vec<[i32; 2]>,
}

fn copy(shape: TensorShape, tile: TileShape) -> Outcome {
    let device = Device::new(DeviceConfig {
        copy_engine_workers: 2,
        watchdog: Some(Duration::from_secs(10)),
        ..DeviceConfig::default()
    });
    let gmem = TensorLayout::row_major(shape.rows, shape.cols);
    let smem = TensorLayout::row_major(tile.tile_m, tile.tile_n);

    let src: Vec<f32> = (0..shape.size()).map(|i| i as f32 + 0.5).collect();
    let d_s = DeviceBuffer::from_slice(&device, &src);
    let d_d = DeviceBuffer::<f32>::alloc_zeroed(&device, shape.size());
    let params = Params::new(
        TmaCopy::new(TmaOp::Load, &d_s, &gmem, &smem).unwrap(),
        TmaCopy::new(TmaOp::Store, &d_d, &gmem, &smem).unwrap(),
        gmem,
        smem,
        tile,
    );

    let smem_bytes = compute_scratch_bytes::<f32>(&smem);
    let mut kernel = copy_kernel::<f32>();
    set_smem_size(&mut kernel, &device, smem_bytes).unwrap();
    device
        .launch(&kernel, LaunchConfig::for_tiles(&shape, tile, 32, smem_bytes), params)
        .unwrap();
    device.synchronize().unwrap();

    let store_coords = device
        .take_reports()
        .into_iter()
        .flat_map(|r| r.groups)
        .flat_map(|g| g.store_coords)
        .collect();
    Outcome {
        src,
        dst: d_d.to_vec(),
        store_coords,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// D equals S after the copy, whether or not the tile divides the shape.
    #[test]
    fn test_copy_is_identity((shape, tile) in case_strategy()) {
        let outcome = copy(shape, tile);
        prop_assert!(outcome.dst == outcome.src);
    }

    /// The clipped store boxes cover every element exactly once.
    #[test]
    fn test_stores_cover_tensor_once((shape, tile) in case_strategy()) {
        let outcome = copy(shape, tile);
        let grid = tile.grid(&shape);
        prop_assert_eq!(outcome.store_coords.len(), grid.size());

        let mut hits = vec![0u32; shape.size()];
        for [col0, row0] in outcome.store_coords {
            let (row0, col0) = (row0 as usize, col0 as usize);
            for row in row0..(row0 + tile.tile_m).min(shape.rows) {
                for col in col0..(col0 + tile.tile_n).min(shape.cols) {
                    hits[row * shape.cols + col] += 1;
                }
            }
        }
        prop_assert!(hits.iter().all(|&h| h == 1));
    }
}
