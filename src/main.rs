use anyhow::{bail, Result};
use clap::Parser;
use half::{bf16, f16};
use tma_copy::{copy_host_tma_load_and_store, Backend, CopyConfig, CopyReport, DType, Device};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = CopyConfig::parse();

    println!("🦀 TMA Tile Copy");
    println!("================\n");
    println!("Copy with TMA load and store -- no swizzling.");
    println!(
        "Tensor: {}x{}, tile: {}x{}, threads: {}, dtype: {:?}, backend: {:?}\n",
        config.m, config.n, config.tile_m, config.tile_n, config.threads, config.dtype, config.backend
    );

    let report = match config.backend {
        Backend::Sim => run_simulated(&config)?,
        Backend::Cuda => run_cuda(&config)?,
    };

    println!("smem size: {}.", report.smem_bytes);
    for trial in &report.trials {
        println!(
            "Trial {} Completed in {:.3}ms ({:.3} GB/s)",
            trial.trial,
            trial.millis(),
            trial.bandwidth_gbps
        );
    }
    if let Some(best) = report.best_bandwidth_gbps() {
        println!("Best bandwidth: {best:.3} GB/s");
    }

    if let Some(verification) = report.verification {
        println!("Success {}, Fail {}", verification.good, verification.bad);
        if !verification.is_success() {
            bail!("verification failed: {} mismatching elements", verification.bad);
        }
    }

    Ok(())
}

fn run_simulated(config: &CopyConfig) -> Result<CopyReport> {
    let device = Device::new(config.device_config());
    match config.dtype {
        DType::F32 => copy_host_tma_load_and_store::<f32>(&device, config),
        DType::F16 => copy_host_tma_load_and_store::<f16>(&device, config),
        DType::Bf16 => copy_host_tma_load_and_store::<bf16>(&device, config),
        DType::U32 => copy_host_tma_load_and_store::<u32>(&device, config),
    }
}

#[cfg(feature = "cuda")]
fn run_cuda(config: &CopyConfig) -> Result<CopyReport> {
    tma_copy::cuda::run_cuda_copy(config)
}

#[cfg(not(feature = "cuda"))]
fn run_cuda(_config: &CopyConfig) -> Result<CopyReport> {
    bail!("this binary was built without the `cuda` feature")
}
