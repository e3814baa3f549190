//! Real-device backend: runs the PTX build of `tma-kernel` on a Hopper GPU
//! through the CUDA driver.

use std::ffi::c_void;
use std::mem::size_of;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{bail, ensure, Context as _, Result};
use cust::memory::DeviceBox;
use cust::prelude::*;
use cust::sys::{CUfunction_attribute, CUresult};
use tma_kernel::{SharedStorageTma, TensorMap, TILE_ELEMS, TILE_M, TILE_N};
use tracing::{debug, info};
use utils::{TensorLayout, TensorShape, TileShape};

use crate::config::{CopyConfig, DType};
use crate::descriptor::TensorMapMeta;
use crate::element::TmaElement;
use crate::host::{CopyReport, TrialTiming};
use crate::launch::LaunchConfig;
use crate::verify::verify_copy;

const INTERLEAVE_NONE: u32 = 0;
const SWIZZLE_NONE: u32 = 0;
const FLOAT_OOB_FILL_NONE: u32 = 0;

#[link(name = "cuda")]
extern "C" {
    fn cuTensorMapEncodeTiled(
        tensor_map: *mut TensorMap,
        data_type: u32,
        rank: u32,
        global_address: *mut c_void,
        global_dim: *const u64,
        global_strides: *const u64,
        box_dim: *const u32,
        element_strides: *const u32,
        interleave: u32,
        swizzle: u32,
        l2_promotion: u32,
        oob_fill: u32,
    ) -> i32;
}

pub struct CudaContext {
    _context: Context,
    device: Device,
}

impl CudaContext {
    pub fn new() -> Result<Self> {
        cust::init(CudaFlags::empty()).context("Failed to initialize the CUDA driver")?;

        let device = Device::get_device(0).context("No CUDA device found")?;
        let _context = Context::new(device).context("Failed to create CUDA context")?;

        let major = device.get_attribute(DeviceAttribute::ComputeCapabilityMajor)?;
        let minor = device.get_attribute(DeviceAttribute::ComputeCapabilityMinor)?;
        info!(device = %device.name()?, major, minor, "initialized CUDA device");
        ensure!(
            major >= 9,
            "TMA needs compute capability 9.0 or newer, found {major}.{minor}"
        );

        Ok(Self { _context, device })
    }

    pub fn device(&self) -> Device {
        self.device
    }
}

/// A tensor map the kernel can take by device pointer.
#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct DeviceTensorMap(pub TensorMap);

// SAFETY: `TensorMap` is plain bytes with no host pointers.
unsafe impl DeviceCopy for DeviceTensorMap {}

impl DeviceTensorMap {
    pub fn encode(meta: &TensorMapMeta, address: u64) -> Result<Self> {
        let mut map = TensorMap { opaque: [0; 16] };
        // SAFETY: every array outlives the call and has `RANK` entries
        // (`RANK - 1` for the strides).
        let status = unsafe {
            cuTensorMapEncodeTiled(
                &mut map,
                meta.data_type as u32,
                TensorMapMeta::RANK,
                address as *mut c_void,
                meta.global_dims.as_ptr(),
                meta.global_strides.as_ptr(),
                meta.box_dims.as_ptr(),
                meta.element_strides.as_ptr(),
                INTERLEAVE_NONE,
                SWIZZLE_NONE,
                meta.l2_promotion as u32,
                FLOAT_OOB_FILL_NONE,
            )
        };
        ensure!(status == 0, "cuTensorMapEncodeTiled failed with CUresult {status}");
        Ok(Self(map))
    }
}

pub struct TmaCopyKernel {
    module: Module,
    stream: Stream,
}

impl TmaCopyKernel {
    pub const NAME: &'static str = "copy_tma_kernel";

    pub fn load<P: AsRef<Path>>(ptx_path: P) -> Result<Self> {
        let ptx = std::fs::read_to_string(ptx_path).context("Failed to read PTX file")?;

        let module = Module::from_ptx(&ptx, &[]).context("Failed to load PTX module")?;

        let stream = Stream::new(StreamFlags::NON_BLOCKING, None)
            .context("Failed to create CUDA stream")?;

        Ok(Self { module, stream })
    }

    /// Copies `src` into `dst` (both row-major `shape`) and returns the
    /// wall time of launch plus synchronize.
    pub fn launch(
        &self,
        shape: TensorShape,
        threads: u32,
        src: &DeviceBuffer<f32>,
        dst: &DeviceBuffer<f32>,
    ) -> Result<Duration> {
        let gmem = TensorLayout::row_major(shape.rows, shape.cols);
        let smem = TensorLayout::row_major(TILE_M, TILE_N);
        let meta = TensorMapMeta::tiled::<f32>(&gmem, &smem)?;

        let tma_load = DeviceBox::new(&DeviceTensorMap::encode(&meta, src.as_device_ptr().as_raw())?)
            .context("Failed to upload the load tensor map")?;
        let tma_store = DeviceBox::new(&DeviceTensorMap::encode(&meta, dst.as_device_ptr().as_raw())?)
            .context("Failed to upload the store tensor map")?;

        let smem_size = size_of::<SharedStorageTma<f32, TILE_ELEMS>>();
        let function = self
            .module
            .get_function(Self::NAME)
            .context("Failed to get kernel function")?;
        // SAFETY: `function` is a live handle of `self.module`.
        let status = unsafe {
            cust::sys::cuFuncSetAttribute(
                function.to_raw(),
                CUfunction_attribute::CU_FUNC_ATTRIBUTE_MAX_DYNAMIC_SHARED_SIZE_BYTES,
                smem_size as i32,
            )
        };
        if !matches!(status, CUresult::CUDA_SUCCESS) {
            bail!("Failed to raise the dynamic shared memory limit to {smem_size} bytes: {status:?}");
        }

        let config = LaunchConfig::for_tiles(&shape, TileShape::new(TILE_M, TILE_N), threads, smem_size);
        let grid = (config.grid.x, config.grid.y, config.grid.z);
        let block = (config.block.x, config.block.y, config.block.z);
        debug!(?grid, ?block, smem_size, "launching copy_tma_kernel");

        let stream = &self.stream;
        let start = Instant::now();
        // SAFETY: both tensor maps stay alive until the stream is synchronized.
        unsafe {
            launch!(
                function<<<grid, block, smem_size as u32, stream>>>(
                    tma_load.as_device_ptr(),
                    tma_store.as_device_ptr()
                )
            )?;
        }
        self.stream
            .synchronize()
            .context("Kernel execution failed")?;

        Ok(start.elapsed())
    }
}

/// The host driver against a real device. The PTX kernel is built for
/// `f32` and the default tile only.
pub fn run_cuda_copy(config: &CopyConfig) -> Result<CopyReport> {
    ensure!(config.dtype == DType::F32, "the CUDA kernel is built for f32 only");
    ensure!(
        config.tile_shape() == TileShape::new(TILE_M, TILE_N),
        "the CUDA kernel is built for {TILE_M}x{TILE_N} tiles"
    );

    let _ctx = CudaContext::new()?;
    let kernel = TmaCopyKernel::load(&config.ptx)?;

    let shape = config.tensor_shape();
    let h_s: Vec<f32> = (0..shape.size()).map(f32::from_index).collect();
    let mut h_d = vec![0.0f32; shape.size()];
    let d_s = DeviceBuffer::from_slice(&h_s).context("Failed to allocate device memory")?;
    let d_d = DeviceBuffer::from_slice(&h_d).context("Failed to allocate device memory")?;

    let tensor_bytes = shape.size() * size_of::<f32>();
    let mut trials = Vec::with_capacity(config.iterations);
    for trial in 0..config.iterations {
        let elapsed = kernel.launch(shape, config.threads, &d_s, &d_d)?;
        let timing = TrialTiming::new(trial, elapsed, tensor_bytes);
        info!(trial, ms = timing.millis(), gbps = timing.bandwidth_gbps, "trial completed");
        trials.push(timing);
    }

    let verification = if config.verify {
        d_d.copy_to(&mut h_d[..]).context("Failed to copy data from device")?;
        Some(verify_copy(&h_s, &h_d))
    } else {
        None
    };

    Ok(CopyReport {
        data_type: <f32 as TmaElement>::DATA_TYPE,
        smem_bytes: size_of::<SharedStorageTma<f32, TILE_ELEMS>>(),
        trials,
        verification,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore = "needs a Hopper GPU"]
    fn test_cuda_context_creation() {
        let ctx = CudaContext::new();
        assert!(ctx.is_ok(), "Failed to create CUDA context");
    }
}
