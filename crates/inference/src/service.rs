//! Model-level batching service
//!
//! Owns one model together with its probed [`SafeBatchSize`] and applies the
//! configured [`ReprobePolicy`]: the safe size is measured when the model is
//! loaded, again on every `reload`, and, under `OnOutOfMemory`, before the
//! first submission following one during which the executor had to bisect.

use crate::accelerator::AcceleratorHandle;
use crate::config::{BatcherConfig, HealthConfig, ReprobePolicy};
use crate::error::BatcherResult;
use crate::executor::BatchExecutor;
use crate::health::BatcherHealthChecker;
use crate::model::BatchModel;
use crate::probe::{CapabilityProber, ProbeReport};
use crate::stats::ExecutorStats;
use crate::types::SafeBatchSize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::info;

#[derive(Debug, Default)]
struct SizeState {
    safe_size: Option<SafeBatchSize>,
    stale: bool,
}

/// A model with its prober, executor and current safe batch size
pub struct BatchService<M> {
    model: M,
    prober: CapabilityProber,
    executor: BatchExecutor,
    policy: ReprobePolicy,
    health: HealthConfig,
    state: Mutex<SizeState>,
}

impl<M: BatchModel> BatchService<M> {
    /// Build a service without probing; the first submission probes
    pub fn new(model: M, accelerator: AcceleratorHandle, config: &BatcherConfig) -> Self {
        let prober = CapabilityProber::new(accelerator.clone(), config.memory_ceiling_fraction)
            .with_max_batch_size(config.max_batch_size)
            .with_cpu_batch_size(config.cpu_batch_size);
        let executor = BatchExecutor::new(accelerator).with_batch_timeout(config.batch_timeout());

        Self {
            model,
            prober,
            executor,
            policy: config.reprobe_policy,
            health: config.health.clone(),
            state: Mutex::new(SizeState::default()),
        }
    }

    /// Build a service and probe the model immediately
    pub async fn start(
        model: M,
        accelerator: AcceleratorHandle,
        config: &BatcherConfig,
    ) -> BatcherResult<Self> {
        let service = Self::new(model, accelerator, config);
        service.reload().await?;
        Ok(service)
    }

    fn state(&self) -> MutexGuard<'_, SizeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The wrapped model
    pub const fn model(&self) -> &M {
        &self.model
    }

    /// The executor, shared with health checks
    pub const fn executor(&self) -> &BatchExecutor {
        &self.executor
    }

    /// Executor statistics
    pub fn stats(&self) -> ExecutorStats {
        self.executor.stats()
    }

    /// Cached safe size, if one has been probed
    pub fn current_safe_size(&self) -> Option<SafeBatchSize> {
        self.state().safe_size.clone()
    }

    /// Whether the next submission will re-probe
    pub fn is_stale(&self) -> bool {
        let state = self.state();
        state.stale || state.safe_size.is_none()
    }

    /// Re-probe unconditionally, as on a model reload
    pub async fn reload(&self) -> BatcherResult<SafeBatchSize> {
        self.reprobe().await.map(|report| report.safe_batch_size)
    }

    /// Re-probe and return the measurements
    pub async fn reprobe(&self) -> BatcherResult<ProbeReport> {
        let report = self.prober.probe_detailed(&self.model).await?;
        let previous = {
            let mut state = self.state();
            state.stale = false;
            state.safe_size.replace(report.safe_batch_size.clone())
        };

        if let Some(previous) = previous {
            info!(
                model_id = self.model.model_id(),
                previous = previous.get(),
                safe_size = report.safe_batch_size.get(),
                "Re-probed safe batch size"
            );
        }
        Ok(report)
    }

    /// Current safe size, probing first when missing or stale
    pub async fn safe_batch_size(&self) -> BatcherResult<SafeBatchSize> {
        let cached = {
            let state = self.state();
            state.safe_size.clone().filter(|_| !state.stale)
        };
        match cached {
            Some(size) => Ok(size),
            None => self.reload().await,
        }
    }

    /// Run the model over `items`, returning outputs in input order
    pub async fn execute_batched(&self, items: &[M::Input]) -> BatcherResult<Vec<M::Output>> {
        let safe_size = self.safe_batch_size().await?;

        let bisections_before = self.executor.counters().bisections();
        let result = self
            .executor
            .execute_batched(&self.model, items, &safe_size)
            .await;
        let bisected = self.executor.counters().bisections() > bisections_before;

        if bisected && self.policy == ReprobePolicy::OnOutOfMemory {
            self.state().stale = true;
            info!(
                model_id = self.model.model_id(),
                safe_size = safe_size.get(),
                "Submission needed bisection, safe batch size will be re-probed"
            );
        }

        result.map_err(Into::into)
    }

    /// Health checker watching this service's executor
    pub fn health_checker(&self) -> BatcherHealthChecker {
        BatcherHealthChecker::with_config(self.health.clone()).with_executor(self.executor.clone())
    }
}
