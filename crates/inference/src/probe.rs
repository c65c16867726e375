//! Capability probing
//!
//! Estimates the largest batch a device can sustain for a model by running
//! one single-item inference and measuring the allocator peak it causes:
//!
//! ```text
//! mem_per_item = peak_allocated - baseline_allocated
//! safe_size    = floor(free_memory * ceiling_fraction / mem_per_item)   (>= 1)
//! ```
//!
//! The estimate is a heuristic. OOM-adaptive retry in the executor covers
//! the cases where it is too optimistic.

use crate::accelerator::{AcceleratorHandle, AcceleratorProfile, DeviceKind};
use crate::error::{ExecutionError, FatalProbeError};
use crate::model::BatchModel;
use crate::types::SafeBatchSize;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Default fraction of free memory a batch may occupy
pub const DEFAULT_CEILING_FRACTION: f64 = 0.8;

/// Default upper clamp for probed batch sizes
pub const DEFAULT_MAX_BATCH_SIZE: u32 = 1024;

/// Outcome of one probe, with the measurements behind it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeReport {
    /// The resulting safe size
    pub safe_batch_size: SafeBatchSize,
    /// Device profile after the probe ran
    pub profile: AcceleratorProfile,
    /// Measured bytes for one item; `None` when measurement was skipped (CPU)
    pub mem_per_item: Option<i128>,
    /// Size before clamping to `[1, max_batch_size]`
    pub unclamped_size: u64,
}

/// Runs capability probes against one accelerator
#[derive(Debug, Clone)]
pub struct CapabilityProber {
    accelerator: AcceleratorHandle,
    ceiling_fraction: f64,
    max_batch_size: u32,
    cpu_batch_size: u32,
}

impl CapabilityProber {
    /// Create a prober with the given memory ceiling fraction
    pub fn new(accelerator: AcceleratorHandle, ceiling_fraction: f64) -> Self {
        Self {
            accelerator,
            ceiling_fraction,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            cpu_batch_size: 1,
        }
    }

    /// Upper clamp for probed sizes
    #[must_use]
    pub fn with_max_batch_size(mut self, max_batch_size: u32) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self
    }

    /// Fixed size returned for CPU devices without measuring
    #[must_use]
    pub fn with_cpu_batch_size(mut self, cpu_batch_size: u32) -> Self {
        self.cpu_batch_size = cpu_batch_size.max(1);
        self
    }

    /// Accelerator this prober measures
    #[must_use]
    pub const fn accelerator(&self) -> &AcceleratorHandle {
        &self.accelerator
    }

    /// Probe and return only the safe size
    pub async fn probe<M: BatchModel + ?Sized>(
        &self,
        model: &M,
    ) -> Result<SafeBatchSize, FatalProbeError> {
        self.probe_detailed(model)
            .await
            .map(|report| report.safe_batch_size)
    }

    /// Probe and return the measurements as well
    pub async fn probe_detailed<M: BatchModel + ?Sized>(
        &self,
        model: &M,
    ) -> Result<ProbeReport, FatalProbeError> {
        let model_id = model.model_id().to_string();
        let profile = self.refresh_profile()?;

        if profile.device_kind == DeviceKind::Cpu {
            let safe_batch_size = SafeBatchSize::new(&model_id, self.cpu_batch_size);
            info!(
                model_id = %model_id,
                safe_size = safe_batch_size.get(),
                "CPU device, skipping memory measurement"
            );
            return Ok(ProbeReport {
                safe_batch_size,
                profile,
                mem_per_item: None,
                unclamped_size: u64::from(self.cpu_batch_size),
            });
        }

        let _device = self.accelerator.lock().await;
        let memory = self.accelerator.memory();

        memory.clear_cache();
        memory.reset_peak_stats();
        let baseline = memory.allocated_bytes();

        let input = model.synthetic_input();
        let outcome = model.infer(std::slice::from_ref(&input)).await;

        let peak = memory.peak_allocated_bytes();
        drop(input);
        memory.clear_cache();

        match outcome {
            Ok(outputs) if outputs.len() == 1 => {}
            Ok(outputs) => {
                return Err(FatalProbeError::ProbeFailed {
                    model_id,
                    cause: format!("probe returned {} outputs for 1 input", outputs.len()),
                });
            }
            Err(ExecutionError::OutOfMemory) => {
                warn!(model_id = %model_id, device = %self.accelerator.device_label(), "Single-item probe ran out of memory");
                return Err(FatalProbeError::DeviceCannotServe {
                    model_id,
                    device: self.accelerator.device_label(),
                });
            }
            Err(e) => {
                return Err(FatalProbeError::ProbeFailed {
                    model_id,
                    cause: e.to_string(),
                });
            }
        }

        let mem_per_item = i128::from(peak) - i128::from(baseline);
        let profile = self.refresh_profile()?;
        let unclamped_size =
            compute_safe_size(profile.free_memory_bytes, self.ceiling_fraction, mem_per_item);
        let clamped = unclamped_size.min(u64::from(self.max_batch_size));
        let safe_size = u32::try_from(clamped).unwrap_or(u32::MAX);

        if mem_per_item <= 0 {
            warn!(
                model_id = %model_id,
                mem_per_item,
                "Probe measured no memory growth, falling back to minimum batch size"
            );
        } else if clamped < unclamped_size {
            debug!(
                model_id = %model_id,
                unclamped_size,
                max_batch_size = self.max_batch_size,
                "Clamped probed batch size"
            );
        }

        let safe_batch_size = SafeBatchSize::new(&model_id, safe_size);
        info!(
            model_id = %model_id,
            device = %self.accelerator.device_label(),
            mem_per_item,
            free_memory = profile.free_memory_bytes,
            safe_size = safe_batch_size.get(),
            "Capability probe complete"
        );

        Ok(ProbeReport {
            safe_batch_size,
            profile,
            mem_per_item: Some(mem_per_item),
            unclamped_size,
        })
    }

    fn refresh_profile(&self) -> Result<AcceleratorProfile, FatalProbeError> {
        self.accelerator
            .profile()
            .map_err(|e| FatalProbeError::Introspection(e.to_string()))
    }
}

/// Probe `model` on `accelerator` with default clamps
pub async fn probe_capability<M: BatchModel + ?Sized>(
    accelerator: &AcceleratorHandle,
    model: &M,
    ceiling_fraction: f64,
) -> Result<SafeBatchSize, FatalProbeError> {
    CapabilityProber::new(accelerator.clone(), ceiling_fraction)
        .probe(model)
        .await
}

/// `floor(free_memory * ceiling_fraction / mem_per_item)`, never below one
///
/// A non-positive `mem_per_item` means the measurement is unusable and the
/// minimum size is returned. The ceiling fraction is clamped into `[0, 1]`.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn compute_safe_size(free_memory: u64, ceiling_fraction: f64, mem_per_item: i128) -> u64 {
    if mem_per_item <= 0 {
        return 1;
    }
    let ceiling = if ceiling_fraction.is_nan() {
        0.0
    } else {
        ceiling_fraction.clamp(0.0, 1.0)
    };
    let budget = (free_memory as f64 * ceiling).floor() as u128;
    let per_item = mem_per_item as u128;
    u64::try_from(budget / per_item).unwrap_or(u64::MAX).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_safe_size_formula() {
        // 10 GiB free, 80% ceiling, 100 MiB per item -> floor(8192 / 100) = 81
        let gib = 1024 * 1024 * 1024;
        let mib = 1024 * 1024;
        assert_eq!(compute_safe_size(10 * gib, 0.8, 100 * mib), 81);
        assert_eq!(compute_safe_size(1000, 1.0, 10), 100);
        assert_eq!(compute_safe_size(1000, 0.5, 300), 1);
    }

    #[test]
    fn test_compute_safe_size_fallbacks() {
        assert_eq!(compute_safe_size(1000, 0.8, 0), 1);
        assert_eq!(compute_safe_size(1000, 0.8, -512), 1);
        assert_eq!(compute_safe_size(0, 0.8, 10), 1);
        assert_eq!(compute_safe_size(1000, f64::NAN, 10), 1);
        assert_eq!(compute_safe_size(1000, 7.0, 10), 100);
    }
}
