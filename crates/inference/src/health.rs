//! Health monitoring for the batcher

use crate::accelerator::DeviceKind;
use crate::config::HealthConfig;
use crate::error::BatcherResult;
use crate::executor::BatchExecutor;
use crate::stats::ExecutorStats;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Health status enumeration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum HealthStatus {
    /// Batcher is operating normally
    Healthy,
    /// Batcher is operational but something needs attention
    Degraded(String),
    /// Batcher is not operational
    Unhealthy(String),
}

/// Health checker trait
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Health status type returned by this checker
    type Status;

    /// Perform a health check
    async fn check_health(&self) -> BatcherResult<Self::Status>;

    /// Get the name of this health checker
    fn name(&self) -> &'static str;
}

/// Health checker over one executor and its accelerator
pub struct BatcherHealthChecker {
    config: HealthConfig,
    executor: Option<BatchExecutor>,
    last_check: std::sync::Mutex<Option<Instant>>,
}

impl BatcherHealthChecker {
    /// Create a new health checker
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HealthConfig::default())
    }

    /// Create a new health checker with configuration
    #[must_use]
    pub const fn with_config(config: HealthConfig) -> Self {
        Self {
            config,
            executor: None,
            last_check: std::sync::Mutex::new(None),
        }
    }

    /// Watch `executor` statistics and its accelerator
    #[must_use]
    pub fn with_executor(mut self, executor: BatchExecutor) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Get the last health check timestamp
    pub fn last_check_time(&self) -> Option<Instant> {
        self.last_check.lock().ok().and_then(|guard| *guard)
    }

    /// Check if health checking is enabled
    pub const fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Get health configuration
    pub const fn config(&self) -> &HealthConfig {
        &self.config
    }
}

impl Default for BatcherHealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthChecker for BatcherHealthChecker {
    type Status = HealthStatus;

    async fn check_health(&self) -> BatcherResult<Self::Status> {
        if !self.config.enabled {
            return Ok(HealthStatus::Healthy);
        }

        if let Ok(mut last_check) = self.last_check.lock() {
            *last_check = Some(Instant::now());
        }

        let Some(executor) = &self.executor else {
            return Ok(HealthStatus::Healthy);
        };

        let stats = executor.stats();
        if stats.consecutive_failures >= self.config.max_consecutive_failures {
            return Ok(HealthStatus::Unhealthy(format!(
                "{} consecutive submissions failed",
                stats.consecutive_failures
            )));
        }

        let mut issues = Vec::new();

        match executor.accelerator().profile() {
            Ok(profile) if profile.device_kind == DeviceKind::Gpu => {
                let utilization = profile.utilization();
                if utilization > self.config.memory_utilization_threshold {
                    issues.push(format!(
                        "Memory usage {:.1}% exceeds threshold {:.1}%",
                        utilization * 100.0,
                        self.config.memory_utilization_threshold * 100.0
                    ));
                }
            }
            Ok(_) => {}
            Err(e) => issues.push(format!("Device introspection failed: {e}")),
        }

        if stats.consecutive_failures > 0 {
            issues.push(format!(
                "Last submission failed ({} of {} allowed)",
                stats.consecutive_failures, self.config.max_consecutive_failures
            ));
        }

        if issues.is_empty() {
            Ok(HealthStatus::Healthy)
        } else {
            Ok(HealthStatus::Degraded(issues.join("; ")))
        }
    }

    fn name(&self) -> &'static str {
        "pixel-batcher"
    }
}

/// Health check result with detailed information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    /// Overall health status
    pub status: HealthStatus,
    /// Timestamp of the check
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Duration of the health check in milliseconds
    pub check_duration_ms: u64,
    /// Optional detailed metrics
    pub metrics: Option<HealthMetrics>,
}

/// Detailed health metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMetrics {
    /// Device label
    pub device: String,
    /// Memory utilization (0.0-1.0), when the device could be queried
    pub memory_utilization: Option<f64>,
    /// Whether the device is a GPU
    pub gpu_available: bool,
    /// Executor counters
    pub executor: ExecutorStats,
}

impl BatcherHealthChecker {
    /// Perform detailed health check with metrics
    #[allow(clippy::cast_possible_truncation)]
    pub async fn check_health_detailed(&self) -> BatcherResult<HealthCheckResult> {
        let start_time = Instant::now();
        let status = self.check_health().await?;
        let duration = start_time.elapsed();

        let metrics = self.executor.as_ref().map(|executor| {
            let accelerator = executor.accelerator();
            let profile = accelerator.profile().ok();
            HealthMetrics {
                device: accelerator.device_label(),
                memory_utilization: profile.map(|p| p.utilization()),
                gpu_available: profile.is_some_and(|p| p.device_kind == DeviceKind::Gpu),
                executor: executor.stats(),
            }
        });

        Ok(HealthCheckResult {
            status,
            timestamp: chrono::Utc::now(),
            check_duration_ms: duration.as_millis() as u64,
            metrics,
        })
    }
}
