//! CLI options for the `pixel` command
//!
//! Every subcommand builds its accelerator and model from [`DeviceOptions`],
//! so probing and running always see the same device setup.

use clap::{Args, Parser, Subcommand};
use pixel_inference::{
    AcceleratorHandle, BatcherConfig, BatcherConfigBuilder, DeviceKind, ReprobePolicy,
    SyntheticModel, TrackedMemory,
};
use pixel_shared::{get_gpu_memory_info, parse_byte_size, LoggingOptions, PixelError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sysinfo::System;

/// Pixel Detective - GPU batch inference probe and runner
#[derive(Parser, Debug)]
#[command(name = "pixel", author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub logging: LoggingOptions,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Measure the safe batch size for a model on a device
    Probe(ProbeCliOptions),

    /// Probe, then run a batch of synthetic images through the executor
    Run(RunCliOptions),

    /// Report host and GPU memory available for inference
    Doctor(DoctorCliOptions),
}

impl Cli {
    /// Logging options, replaced by the `[logging]` section of `--config`
    ///
    /// An unreadable config file falls back to the flags; the command
    /// itself reports the error.
    pub fn logging_options(&self) -> LoggingOptions {
        let config_path = match &self.command {
            Commands::Probe(opts) => opts.device.config.as_deref(),
            Commands::Run(opts) => opts.device.config.as_deref(),
            Commands::Doctor(_) => None,
        };

        match config_path.map(BatcherConfig::from_file) {
            Some(Ok(config)) => LoggingOptions {
                log_json: config.logging.is_json(),
                log_level: config.logging.level,
            },
            _ => self.logging.clone(),
        }
    }

    /// Run the selected command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Probe(opts) => crate::commands::run_probe(opts).await,
            Commands::Run(opts) => crate::commands::run_batch(opts).await,
            Commands::Doctor(opts) => crate::doctor::run_diagnostics(&opts),
        }
    }
}

/// Device and model selection shared by `probe` and `run`
#[derive(Args, Debug, Clone)]
pub struct DeviceOptions {
    /// CUDA device to mirror (-1 for CPU); unset simulates a GPU of `--capacity`
    /// unless `--config` names a device
    #[arg(long, env = "PIXEL_DEVICE_ID", allow_negative_numbers = true)]
    pub device_id: Option<i32>,

    /// Capacity of the simulated GPU (e.g. 8GiB, 512MB)
    #[arg(long, default_value = "8GiB")]
    pub capacity: String,

    /// Memory the synthetic model needs per image
    #[arg(long, default_value = "48MiB")]
    pub bytes_per_item: String,

    /// Fixed memory the synthetic model needs per call
    #[arg(long, default_value = "0")]
    pub workspace: String,

    /// Model identifier
    #[arg(long, default_value = "synthetic-vit", env = "PIXEL_MODEL_ID")]
    pub model_id: String,

    /// Fraction of free memory a batch may use
    #[arg(long, default_value_t = pixel_inference::DEFAULT_CEILING_FRACTION, env = "PIXEL_MEMORY_CEILING")]
    pub memory_ceiling: f64,

    /// Upper clamp for the probed batch size
    #[arg(long, default_value_t = pixel_inference::DEFAULT_MAX_BATCH_SIZE, env = "PIXEL_MAX_BATCH_SIZE")]
    pub max_batch_size: u32,

    /// Batch size used on CPU devices
    #[arg(long, default_value_t = 1, env = "PIXEL_CPU_BATCH_SIZE")]
    pub cpu_batch_size: u32,

    /// Batcher configuration file (TOML); replaces the batching and logging
    /// flags, except an explicit `--device-id`
    #[arg(long, env = "PIXEL_CONFIG")]
    pub config: Option<PathBuf>,
}

impl DeviceOptions {
    /// Batcher configuration from the config file or the flags
    pub fn to_config(&self) -> Result<BatcherConfig> {
        let config = match &self.config {
            Some(path) => self.file_config(path)?,
            None => BatcherConfigBuilder::new()
                .model_id(self.model_id.clone())
                .device_id(self.device_id.unwrap_or(0))
                .memory_ceiling_fraction(self.memory_ceiling)
                .max_batch_size(self.max_batch_size)
                .cpu_batch_size(self.cpu_batch_size)
                .build()?,
        };
        Ok(config)
    }

    fn file_config(&self, path: &Path) -> Result<BatcherConfig> {
        let mut config = BatcherConfig::from_file(path)?;
        if let Some(device_id) = self.device_id {
            config.device_id = device_id;
            config.validate()?;
        }
        Ok(config)
    }

    /// Build the accounting device and its handle for `config`
    ///
    /// Without `--device-id` or `--config` the device is simulated;
    /// otherwise `config.device_id` selects the host or a real GPU.
    pub fn build_device(
        &self,
        config: &BatcherConfig,
    ) -> Result<(Arc<TrackedMemory>, AcceleratorHandle)> {
        let memory = if self.device_id.is_none() && self.config.is_none() {
            TrackedMemory::gpu(byte_size("capacity", &self.capacity)?).with_label("gpu:simulated")
        } else if !config.uses_gpu() {
            let mut system = System::new();
            system.refresh_memory();
            TrackedMemory::with_capacity(DeviceKind::Cpu, system.available_memory())
                .with_label("cpu")
        } else {
            let device = u32::try_from(config.device_id)
                .map_err(|_| PixelError::configuration("invalid device id", None))?;
            TrackedMemory::from_gpu_info(&get_gpu_memory_info(device)?)
        };

        let memory = Arc::new(memory);
        let handle = AcceleratorHandle::new(memory.clone());
        Ok((memory, handle))
    }

    /// Synthetic model allocating on `memory`
    pub fn build_model(&self, model_id: &str, memory: Arc<TrackedMemory>) -> Result<SyntheticModel> {
        Ok(
            SyntheticModel::new(model_id, memory, byte_size("bytes-per-item", &self.bytes_per_item)?)
                .with_workspace_bytes(byte_size("workspace", &self.workspace)?),
        )
    }
}

/// Options for `pixel probe`
#[derive(Args, Debug, Clone)]
pub struct ProbeCliOptions {
    #[command(flatten)]
    pub device: DeviceOptions,

    /// Print the probe report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Options for `pixel run`
#[derive(Args, Debug, Clone)]
pub struct RunCliOptions {
    #[command(flatten)]
    pub device: DeviceOptions,

    /// Number of synthetic images to process
    #[arg(long, default_value_t = 256)]
    pub items: usize,

    /// Memory another tenant takes after probing (forces bisection)
    #[arg(long)]
    pub contention: Option<String>,

    /// Per-batch time limit in milliseconds
    #[arg(long, env = "PIXEL_BATCH_TIMEOUT_MS")]
    pub batch_timeout_ms: Option<u64>,

    /// When to re-measure the safe batch size (never, on-out-of-memory)
    #[arg(long, default_value = "on-out-of-memory", env = "PIXEL_REPROBE_POLICY")]
    pub reprobe_policy: ReprobePolicy,

    /// Print the run summary as JSON
    #[arg(long)]
    pub json: bool,
}

impl RunCliOptions {
    /// Batcher configuration including the run-only settings
    pub fn to_config(&self) -> Result<BatcherConfig> {
        let mut config = self.device.to_config()?;
        if self.device.config.is_none() {
            config.batch_timeout_ms = self.batch_timeout_ms;
            config.reprobe_policy = self.reprobe_policy;
            config.validate()?;
        }
        Ok(config)
    }

    /// Bytes held by the simulated second tenant
    pub fn contention_bytes(&self) -> Result<Option<u64>> {
        self.contention
            .as_deref()
            .map(|s| byte_size("contention", s))
            .transpose()
    }
}

/// Options for `pixel doctor`
#[derive(Args, Debug, Clone)]
pub struct DoctorCliOptions {
    /// CUDA device to inspect
    #[arg(long, default_value_t = 0)]
    pub device_id: u32,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,

    /// Show memory details even when everything looks fine
    #[arg(short, long)]
    pub verbose: bool,
}

fn byte_size(flag: &str, value: &str) -> Result<u64> {
    parse_byte_size(value).ok_or_else(|| {
        PixelError::configuration(format!("invalid --{flag} value '{value}'"), None)
    })
}
