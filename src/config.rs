//! Command-line configuration of the `tma-copy` driver.

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser, ValueEnum};
use utils::{TensorShape, TileShape};

use crate::device::DeviceConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DType {
    F32,
    F16,
    Bf16,
    U32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// Simulated device, runs anywhere
    Sim,
    /// Real Hopper GPU through the CUDA driver (needs the `cuda` feature)
    Cuda,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "tma-copy",
    about = "Copy a 2D tensor global -> shared -> global with TMA, one tile per block"
)]
pub struct CopyConfig {
    /// Rows of the tensor
    #[arg(short, long, default_value_t = 256)]
    pub m: usize,

    /// Columns of the tensor
    #[arg(short, long, default_value_t = 256)]
    pub n: usize,

    #[arg(long, default_value_t = 128)]
    pub tile_m: usize,

    #[arg(long, default_value_t = 128)]
    pub tile_n: usize,

    /// Threads per block
    #[arg(long, default_value_t = 32)]
    pub threads: u32,

    /// Timed trials
    #[arg(short, long, default_value_t = 1)]
    pub iterations: usize,

    /// Skip the element-wise check of the destination
    #[arg(long = "no-verify", action = ArgAction::SetFalse)]
    pub verify: bool,

    #[arg(long, value_enum, default_value_t = DType::F32)]
    pub dtype: DType,

    #[arg(long, value_enum, default_value_t = Backend::Sim)]
    pub backend: Backend,

    /// Copy-engine worker threads of the simulated device
    #[arg(long, default_value_t = 4)]
    pub engine_workers: usize,

    /// Granularity at which the simulated engine reports landed bytes
    #[arg(long, default_value_t = 8192)]
    pub chunk_bytes: usize,

    /// Terminate grids still running after this many milliseconds (0 disables)
    #[arg(long)]
    pub watchdog_ms: Option<u64>,

    /// Blocks the simulated device runs concurrently
    #[arg(long, default_value_t = 8)]
    pub resident_blocks: usize,

    /// PTX of `tma-kernel` for the CUDA backend
    #[arg(
        long,
        default_value = "target/nvptx64-nvidia-cuda/release/tma_kernel.ptx"
    )]
    pub ptx: PathBuf,
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self::parse_from(["tma-copy"])
    }
}

impl CopyConfig {
    pub fn tensor_shape(&self) -> TensorShape {
        TensorShape::new(self.m, self.n)
    }

    pub fn tile_shape(&self) -> TileShape {
        TileShape::new(self.tile_m, self.tile_n)
    }

    pub fn device_config(&self) -> DeviceConfig {
        let defaults = DeviceConfig::default();
        DeviceConfig {
            max_resident_blocks: self.resident_blocks,
            copy_engine_workers: self.engine_workers,
            copy_chunk_bytes: self.chunk_bytes,
            watchdog: match self.watchdog_ms {
                Some(0) => None,
                Some(ms) => Some(Duration::from_millis(ms)),
                None => defaults.watchdog,
            },
            ..defaults
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CopyConfig::default();
        assert_eq!(config.tensor_shape(), TensorShape::new(256, 256));
        assert_eq!(config.tile_shape(), TileShape::tma_default());
        assert_eq!(config.threads, 32);
        assert_eq!(config.iterations, 1);
        assert!(config.verify);
        assert_eq!(config.dtype, DType::F32);
        assert_eq!(config.backend, Backend::Sim);
    }

    #[test]
    fn test_parse_flags() {
        let config = CopyConfig::parse_from([
            "tma-copy", "-m", "128", "-n", "384", "--dtype", "bf16", "--no-verify",
            "--watchdog-ms", "250",
        ]);
        assert_eq!(config.tensor_shape(), TensorShape::new(128, 384));
        assert_eq!(config.dtype, DType::Bf16);
        assert!(!config.verify);
        assert_eq!(config.device_config().watchdog, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_zero_watchdog_disables_it() {
        let config = CopyConfig::parse_from(["tma-copy", "--watchdog-ms", "0"]);
        assert_eq!(config.device_config().watchdog, None);
        assert_eq!(
            CopyConfig::default().device_config().watchdog,
            DeviceConfig::default().watchdog
        );
    }
}
