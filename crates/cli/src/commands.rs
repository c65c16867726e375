//! `probe` and `run` command implementations

use crate::cli_options::{ProbeCliOptions, RunCliOptions};
use pixel_inference::{
    AcceleratorHandle, BatchService, BatcherError, CapabilityProber, ExecutorStats,
    HealthCheckResult, ProbeReport,
};
use pixel_shared::{MemoryEvolution, PixelError, Result};
use serde::Serialize;
use std::time::Instant;
use tracing::{info, warn};

/// Outcome of `pixel run`
#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub model_id: String,
    pub device: String,
    pub items: usize,
    pub outputs: usize,
    pub initial_safe_size: u32,
    pub final_safe_size: Option<u32>,
    pub reprobe_pending: bool,
    pub elapsed_ms: u128,
    pub stats: ExecutorStats,
    pub health: HealthCheckResult,
}

/// Probe the configured model and print the safe batch size
pub async fn run_probe(opts: ProbeCliOptions) -> Result<()> {
    let report = probe(&opts).await?;

    if opts.json {
        println!("{}", to_json(&report)?);
    } else {
        println!("Model:          {}", report.safe_batch_size.model_id());
        println!("Device:         {}", report.profile.device_kind);
        println!("Free memory:    {}", format_bytes(report.profile.free_memory_bytes));
        match report.mem_per_item {
            Some(bytes) => println!("Memory/item:    {bytes} bytes"),
            None => println!("Memory/item:    not measured"),
        }
        println!("Safe batch size: {}", report.safe_batch_size.get());
    }
    Ok(())
}

/// Probe only, returning the full report
pub async fn probe(opts: &ProbeCliOptions) -> Result<ProbeReport> {
    let config = opts.device.to_config()?;
    let (memory, handle) = opts.device.build_device(&config)?;
    let model = opts.device.build_model(&config.model_id, memory)?;

    let prober = CapabilityProber::new(handle, config.memory_ceiling_fraction)
        .with_max_batch_size(config.max_batch_size)
        .with_cpu_batch_size(config.cpu_batch_size);

    prober
        .probe_detailed(&model)
        .await
        .map_err(|e| PixelError::from(BatcherError::from(e)))
}

/// Probe, then process synthetic images and print a summary
pub async fn run_batch(opts: RunCliOptions) -> Result<()> {
    let summary = execute(&opts).await?;

    if opts.json {
        println!("{}", to_json(&summary)?);
    } else {
        println!(
            "Processed {} of {} images on {} in {}ms",
            summary.outputs, summary.items, summary.device, summary.elapsed_ms
        );
        println!("Safe batch size: {}", summary.initial_safe_size);
        println!(
            "Batches: {}  accelerator calls: {}  bisections: {}",
            summary.stats.batches, summary.stats.accelerator_calls, summary.stats.bisections
        );
        if summary.reprobe_pending {
            println!("Out-of-memory recovery occurred; the next submission will re-probe");
        }
        println!("Health: {:?}", summary.health.status);
    }
    Ok(())
}

/// Run the whole `run` flow, returning the summary
pub async fn execute(opts: &RunCliOptions) -> Result<RunSummary> {
    let config = opts.to_config()?;
    let contention = opts.contention_bytes()?;
    let (memory, handle) = opts.device.build_device(&config)?;
    let model = opts.device.build_model(&config.model_id, memory.clone())?;
    let input_len = model.input_len();

    let mut evolution = MemoryEvolution::new(handle.device_label());
    snapshot(&mut evolution, &handle, "start");

    let service = BatchService::start(model, handle.clone(), &config).await?;
    let initial = service.safe_batch_size().await?;
    snapshot(&mut evolution, &handle, "after probe");

    if let Some(bytes) = contention {
        memory.allocate(bytes).map_err(|e| {
            PixelError::resource_exhausted(handle.device_label(), format!("contention: {e}"))
        })?;
        warn!(bytes, "Reserved device memory for a simulated second tenant");
        snapshot(&mut evolution, &handle, "contention");
    }

    #[allow(clippy::cast_precision_loss)]
    let images: Vec<Vec<f32>> = (0..opts.items)
        .map(|i| vec![i as f32 / opts.items.max(1) as f32; input_len])
        .collect();

    let started = Instant::now();
    let outputs = service.execute_batched(&images).await?;
    let elapsed_ms = started.elapsed().as_millis();
    snapshot(&mut evolution, &handle, "after run");

    info!(summary = %evolution.summary(), "Device memory");
    let health = service
        .health_checker()
        .check_health_detailed()
        .await
        .map_err(PixelError::from)?;

    Ok(RunSummary {
        model_id: config.model_id.clone(),
        device: handle.device_label(),
        items: images.len(),
        outputs: outputs.len(),
        initial_safe_size: initial.get(),
        final_safe_size: service.current_safe_size().map(|s| s.get()),
        reprobe_pending: service.is_stale(),
        elapsed_ms,
        stats: service.stats(),
        health,
    })
}

fn snapshot(evolution: &mut MemoryEvolution, handle: &AcceleratorHandle, label: &str) {
    match handle.profile() {
        Ok(profile) => evolution.add_snapshot(
            profile.used_memory_bytes(),
            profile.free_memory_bytes,
            Some(label.to_string()),
        ),
        Err(e) => warn!(error = %e, label, "Could not read device memory"),
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| PixelError::internal("failed to serialize output", Some(Box::new(e))))
}

/// Render bytes with a binary unit
#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
