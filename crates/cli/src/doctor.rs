//! System diagnostics for batch inference
//!
//! Implements `pixel doctor`: reports host memory, the GPU memory picture
//! from `nvidia-smi`, and what that means for probed batch sizes.

use crate::cli_options::DoctorCliOptions;
use crate::commands::format_bytes;
use pixel_inference::{AcceleratorProfile, CpuMemory, MemoryIntrospection};
use pixel_shared::{get_gpu_memory_info, GpuMemoryInfo, PixelError, Result};
use serde::{Deserialize, Serialize};
use sysinfo::System;

/// Host memory below which large image batches are likely to swap
const LOW_HOST_MEMORY_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// GPU utilization above which other processes leave little room
const BUSY_GPU_UTILIZATION: f64 = 0.9;

/// CPU information structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuInfo {
    pub name: String,
    pub threads: usize,
    pub frequency_mhz: u64,
}

/// Overall diagnostics result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsResult {
    pub cpu: CpuInfo,
    pub host_memory: AcceleratorProfile,
    pub gpu: Option<GpuMemoryInfo>,
    pub gpu_error: Option<String>,
    pub recommendations: Vec<String>,
    pub gpu_ready: bool,
}

/// Main entry point for the doctor command
pub fn run_diagnostics(opts: &DoctorCliOptions) -> Result<()> {
    let result = collect_diagnostics(opts.device_id)?;

    if opts.json {
        let json = serde_json::to_string_pretty(&result).map_err(|e| {
            PixelError::internal("failed to serialize diagnostics", Some(Box::new(e)))
        })?;
        println!("{json}");
        return Ok(());
    }

    print_report(&result, opts.verbose);
    Ok(())
}

/// Gather host and GPU information
pub fn collect_diagnostics(device_id: u32) -> Result<DiagnosticsResult> {
    let host_memory = CpuMemory::new().profile()?;
    let cpu = detect_cpu_info();

    let (gpu, gpu_error) = match get_gpu_memory_info(device_id) {
        Ok(info) => (Some(info), None),
        Err(e) => {
            tracing::debug!(error = %e, "GPU query failed");
            (None, Some(e.to_string()))
        }
    };

    let recommendations = recommendations(&host_memory, gpu.as_ref());
    Ok(DiagnosticsResult {
        cpu,
        host_memory,
        gpu_ready: gpu.as_ref().is_some_and(|g| g.free_mb > 0),
        gpu,
        gpu_error,
        recommendations,
    })
}

/// Detect CPU information
pub fn detect_cpu_info() -> CpuInfo {
    let mut system = System::new();
    system.refresh_cpu();

    let cpus = system.cpus();
    let (name, frequency_mhz) = cpus
        .first()
        .map(|cpu| (cpu.brand().trim().to_string(), cpu.frequency()))
        .unwrap_or_else(|| ("Unknown CPU".to_string(), 0));

    CpuInfo {
        name,
        threads: cpus.len(),
        frequency_mhz,
    }
}

/// Advice derived from the memory picture
pub fn recommendations(host: &AcceleratorProfile, gpu: Option<&GpuMemoryInfo>) -> Vec<String> {
    let mut advice = Vec::new();

    match gpu {
        None => advice.push(
            "No NVIDIA GPU detected; probing falls back to the CPU batch size (default 1)"
                .to_string(),
        ),
        Some(info) if info.free_mb == 0 => advice.push(format!(
            "GPU {} reports no free memory; every probe will fail with device-cannot-serve",
            info.device_id
        )),
        Some(info) if info.utilization() > BUSY_GPU_UTILIZATION => advice.push(format!(
            "GPU {} is {:.0}% used by other processes; probed batch sizes will be small",
            info.device_id,
            info.utilization() * 100.0
        )),
        Some(_) => {}
    }

    if host.free_memory_bytes < LOW_HOST_MEMORY_BYTES {
        advice.push(format!(
            "Only {} of host memory available; decode fewer images per submission",
            format_bytes(host.free_memory_bytes)
        ));
    }

    advice
}

fn print_report(result: &DiagnosticsResult, verbose: bool) {
    println!("Pixel Detective System Diagnostics");
    println!("==================================\n");

    println!(
        "CPU:   {} ({} threads, {} MHz)",
        result.cpu.name, result.cpu.threads, result.cpu.frequency_mhz
    );
    println!(
        "Host:  {} available of {}",
        format_bytes(result.host_memory.free_memory_bytes),
        format_bytes(result.host_memory.total_memory_bytes)
    );

    match (&result.gpu, &result.gpu_error) {
        (Some(gpu), _) => {
            println!(
                "GPU {}: {} ({} free of {})",
                gpu.device_id,
                gpu.gpu_name,
                format_bytes(gpu.free_bytes()),
                format_bytes(gpu.total_bytes())
            );
            if verbose {
                println!("       {} MB used, {:.1}% utilization", gpu.used_mb, gpu.utilization() * 100.0);
            }
        }
        (None, Some(error)) if verbose => println!("GPU:   unavailable ({error})"),
        (None, _) => println!("GPU:   unavailable"),
    }

    if !result.recommendations.is_empty() {
        println!("\nRecommendations:");
        for advice in &result.recommendations {
            println!("  - {advice}");
        }
    }
}
