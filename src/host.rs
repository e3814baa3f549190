//! Host driver: allocate, describe, launch, time and verify a tile copy.

use std::time::{Duration, Instant};

use anyhow::{ensure, Context, Result};
use tracing::info;
use utils::TensorLayout;

use crate::config::CopyConfig;
use crate::descriptor::{TmaCopy, TmaOp};
use crate::device::{Device, DeviceBuffer};
use crate::element::{TmaDataType, TmaElement};
use crate::kernel::{copy_kernel, Params};
use crate::launch::{compute_scratch_bytes, set_smem_size, LaunchConfig};
use crate::verify::{verify_copy, Verification};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrialTiming {
    pub trial: usize,
    pub elapsed: Duration,
    /// Read plus write traffic over elapsed time.
    pub bandwidth_gbps: f64,
}

impl TrialTiming {
    pub fn new(trial: usize, elapsed: Duration, tensor_bytes: usize) -> Self {
        let ms = elapsed.as_secs_f64() * 1e3;
        Self {
            trial,
            elapsed,
            bandwidth_gbps: 2e-6 * tensor_bytes as f64 / ms,
        }
    }

    pub fn millis(&self) -> f64 {
        self.elapsed.as_secs_f64() * 1e3
    }
}

#[derive(Debug, Clone)]
pub struct CopyReport {
    pub data_type: TmaDataType,
    pub smem_bytes: usize,
    pub trials: Vec<TrialTiming>,
    pub verification: Option<Verification>,
}

impl CopyReport {
    pub fn best_bandwidth_gbps(&self) -> Option<f64> {
        self.trials.iter().map(|t| t.bandwidth_gbps).reduce(f64::max)
    }

    pub fn is_success(&self) -> bool {
        self.verification.map_or(true, |v| v.is_success())
    }
}

/// Copies an `m x n` tensor S into D through shared memory, one tile per
/// execution group, and checks D == S.
pub fn copy_host_tma_load_and_store<E: TmaElement>(
    device: &Device,
    config: &CopyConfig,
) -> Result<CopyReport> {
    let tensor_shape = config.tensor_shape();
    let tile_shape = config.tile_shape();
    ensure!(tensor_shape.is_valid(), "tensor shape {tensor_shape} is empty");
    ensure!(
        tile_shape.tile_m > 0 && tile_shape.tile_n > 0,
        "tile shape {tile_shape} is empty"
    );
    info!(%tensor_shape, %tile_shape, dtype = %E::DATA_TYPE, "Copy with TMA load and store -- no swizzling.");

    let h_s: Vec<E> = (0..tensor_shape.size()).map(E::from_index).collect();
    let mut h_d = vec![E::zeroed(); tensor_shape.size()];

    let d_s = DeviceBuffer::from_slice(device, &h_s);
    let d_d = DeviceBuffer::from_slice(device, &h_d);

    let gmem_layout_s = TensorLayout::row_major(tensor_shape.rows, tensor_shape.cols);
    let gmem_layout_d = TensorLayout::row_major(tensor_shape.rows, tensor_shape.cols);
    let smem_layout = TensorLayout::row_major(tile_shape.tile_m, tile_shape.tile_n);

    let tma_load = TmaCopy::new(TmaOp::Load, &d_s, &gmem_layout_s, &smem_layout)
        .context("Failed to build the TMA load descriptor")?;
    let tma_store = TmaCopy::new(TmaOp::Store, &d_d, &gmem_layout_d, &smem_layout)
        .context("Failed to build the TMA store descriptor")?;
    let params = Params::new(tma_load, tma_store, gmem_layout_s, smem_layout, tile_shape);

    let smem_size = compute_scratch_bytes::<E>(&smem_layout);
    info!(smem_size, "smem size");

    let mut kernel = copy_kernel::<E>();
    set_smem_size(&mut kernel, device, smem_size).context("Failed to set kernel shared memory size")?;

    let launch = LaunchConfig::for_tiles(&tensor_shape, tile_shape, config.threads, smem_size);
    let tensor_bytes = tensor_shape.size() * E::DATA_TYPE.size_bytes();

    let mut trials = Vec::with_capacity(config.iterations);
    for trial in 0..config.iterations {
        let start = Instant::now();
        device
            .launch(&kernel, launch, params.clone())
            .context("Failed to launch copy kernel")?;
        device.synchronize().context("Copy kernel failed")?;
        let timing = TrialTiming::new(trial, start.elapsed(), tensor_bytes);
        let (bytes_loaded, bytes_stored) = device
            .take_reports()
            .iter()
            .fold((0, 0), |(l, s), r| (l + r.bytes_loaded(), s + r.bytes_stored()));
        info!(
            trial,
            ms = timing.millis(),
            gbps = timing.bandwidth_gbps,
            bytes_loaded,
            bytes_stored,
            "trial completed"
        );
        trials.push(timing);
    }

    let verification = if config.verify {
        d_d.copy_to_host(&mut h_d)?;
        let verification = verify_copy(&h_s, &h_d);
        info!(good = verification.good, bad = verification.bad, "verification");
        Some(verification)
    } else {
        None
    };

    Ok(CopyReport {
        data_type: E::DATA_TYPE,
        smem_bytes: smem_size,
        trials,
        verification,
    })
}
