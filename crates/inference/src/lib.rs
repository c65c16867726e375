//! # Pixel Inference
//!
//! GPU batch inference core for the Pixel Detective image pipeline. Given a
//! model and an ordered list of images, it produces one output per image in
//! order while keeping accelerator memory in check.
//!
//! ## Features
//!
//! - **Capability probing**: measure one single-item inference and derive the
//!   largest batch the device can hold under a memory ceiling
//! - **Batched execution**: consecutive ranges of the safe size, one at a time
//!   under a process-wide device lock
//! - **OOM-adaptive retry**: out-of-memory batches are bisected down to single
//!   items; every other failure is surfaced immediately
//! - **Re-probing**: the safe size is refreshed after out-of-memory pressure
//! - **Health monitoring**: executor statistics and device utilization
//!
//! ## Usage
//!
//! ```rust,no_run
//! use pixel_inference::{AcceleratorHandle, BatchService, BatcherConfig, SyntheticModel, TrackedMemory};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BatcherConfig::from_env()?;
//!     let memory = Arc::new(TrackedMemory::gpu(8 << 30));
//!     let model = SyntheticModel::new(&config.model_id, memory.clone(), 64 << 20);
//!
//!     let service = BatchService::start(model, AcceleratorHandle::new(memory), &config).await?;
//!     let images = vec![vec![0.5_f32; 3 * 224 * 224]; 100];
//!     let embeddings = service.execute_batched(&images).await?;
//!     assert_eq!(embeddings.len(), images.len());
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery
)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::uninlined_format_args,
    clippy::significant_drop_tightening,
    clippy::future_not_send
)]

// Core modules
pub mod config;
pub mod error;
pub mod types;

// Device
pub mod accelerator;
pub mod memory;

// Execution pipeline
pub mod executor;
pub mod model;
pub mod probe;
pub mod retry;
pub mod stats;

// Service integration
pub mod health;
pub mod service;

pub use accelerator::{
    AcceleratorHandle, AcceleratorProfile, CpuMemory, DeviceAllocation, DeviceKind,
    MemoryIntrospection, TrackedMemory,
};
pub use config::{
    BatcherConfig, BatcherConfigBuilder, HealthConfig, LoggingConfig, ReprobePolicy,
};
pub use error::{
    BatcherConfigError, BatcherError, BatcherResult, ExecutionError, FatalProbeError,
};
pub use executor::{execute_batched, BatchExecutor};
pub use health::{BatcherHealthChecker, HealthCheckResult, HealthChecker, HealthStatus};
pub use memory::{AllocationError, MemoryStats, MemoryTracker};
pub use model::{BatchModel, SyntheticModel};
pub use probe::{
    compute_safe_size, probe_capability, CapabilityProber, ProbeReport,
    DEFAULT_CEILING_FRACTION, DEFAULT_MAX_BATCH_SIZE,
};
pub use retry::OomAdaptiveRetry;
pub use service::BatchService;
pub use stats::{ExecutionCounters, ExecutorStats};
pub use types::{BatchRange, BatchResult, SafeBatchSize};

/// Current version of the batch inference core
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
