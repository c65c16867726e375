//! Batch execution
//!
//! Splits a submission into consecutive ranges of at most the safe size and
//! runs each under the device lock through [`OomAdaptiveRetry`]. Outputs are
//! returned in submission order; any failure aborts the whole submission.

use crate::accelerator::AcceleratorHandle;
use crate::error::ExecutionError;
use crate::model::BatchModel;
use crate::retry::OomAdaptiveRetry;
use crate::stats::{ExecutionCounters, ExecutorStats};
use crate::types::{BatchRange, BatchResult, SafeBatchSize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Executes submissions against one accelerator
#[derive(Debug, Clone)]
pub struct BatchExecutor {
    accelerator: AcceleratorHandle,
    retry: OomAdaptiveRetry,
    counters: Arc<ExecutionCounters>,
    batch_timeout: Option<Duration>,
}

impl BatchExecutor {
    /// Create an executor sharing `accelerator`'s device lock
    pub fn new(accelerator: AcceleratorHandle) -> Self {
        let counters = Arc::new(ExecutionCounters::new());
        Self {
            retry: OomAdaptiveRetry::new(accelerator.clone(), Arc::clone(&counters)),
            accelerator,
            counters,
            batch_timeout: None,
        }
    }

    /// Fail a range that takes longer than `timeout`, bisection included
    #[must_use]
    pub const fn with_batch_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.batch_timeout = timeout;
        self
    }

    /// Accelerator this executor runs on
    #[must_use]
    pub const fn accelerator(&self) -> &AcceleratorHandle {
        &self.accelerator
    }

    /// Statistics snapshot
    pub fn stats(&self) -> ExecutorStats {
        self.counters.snapshot()
    }

    pub(crate) fn counters(&self) -> &ExecutionCounters {
        &self.counters
    }

    /// Run `model` over `items` in batches of at most `safe_size`
    ///
    /// Returns exactly one output per input, in input order. An empty
    /// submission returns immediately without touching the device.
    pub async fn execute_batched<M: BatchModel + ?Sized>(
        &self,
        model: &M,
        items: &[M::Input],
        safe_size: &SafeBatchSize,
    ) -> Result<Vec<M::Output>, ExecutionError> {
        self.counters.record_submission();
        if items.is_empty() {
            return Ok(Vec::new());
        }

        if safe_size.model_id() != model.model_id() {
            warn!(
                model_id = model.model_id(),
                probed_for = safe_size.model_id(),
                "Safe batch size was probed for a different model"
            );
        }

        let started = Instant::now();
        let total = items.len();
        let mut outputs = Vec::with_capacity(total);

        for range in BatchRange::partition(total, safe_size.as_usize()) {
            self.counters.record_batch();
            let device = self.accelerator.lock().await;
            let result = self.run_range(model, items, range).await;
            drop(device);
            self.accelerator.clear_cache();

            match result {
                Ok(batch) => {
                    debug!(model_id = model.model_id(), range = %range, "Batch complete");
                    outputs.extend(batch.into_outputs());
                }
                Err(e) => {
                    self.counters.record_failure();
                    error!(
                        model_id = model.model_id(),
                        range = %range,
                        error = %e,
                        "Submission failed"
                    );
                    return Err(e);
                }
            }
        }

        if outputs.len() != total {
            self.counters.record_failure();
            return Err(ExecutionError::unrecoverable(format!(
                "produced {} outputs for {} items",
                outputs.len(),
                total
            )));
        }

        self.counters.record_success(total);
        info!(
            model_id = model.model_id(),
            items = total,
            safe_size = safe_size.get(),
            elapsed_ms = started.elapsed().as_millis(),
            "Submission complete"
        );
        Ok(outputs)
    }

    async fn run_range<M: BatchModel + ?Sized>(
        &self,
        model: &M,
        items: &[M::Input],
        range: BatchRange,
    ) -> Result<BatchResult<M::Output>, ExecutionError> {
        let attempt = self.retry.execute(model, items, range);
        match self.batch_timeout {
            Some(timeout) => tokio::time::timeout(timeout, attempt)
                .await
                .unwrap_or_else(|_| {
                    Err(ExecutionError::Unrecoverable {
                        cause: format!("batch timed out after {}ms", timeout.as_millis()),
                        range: Some(range),
                    })
                }),
            None => attempt.await,
        }
    }
}

/// Run one submission on a fresh executor over `accelerator`
pub async fn execute_batched<M: BatchModel + ?Sized>(
    accelerator: &AcceleratorHandle,
    model: &M,
    items: &[M::Input],
    safe_size: &SafeBatchSize,
) -> Result<Vec<M::Output>, ExecutionError> {
    BatchExecutor::new(accelerator.clone())
        .execute_batched(model, items, safe_size)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accelerator::{MemoryIntrospection, TrackedMemory};
    use crate::model::SyntheticModel;

    fn device(capacity: u64) -> (Arc<TrackedMemory>, AcceleratorHandle) {
        let memory = Arc::new(TrackedMemory::gpu(capacity));
        let handle = AcceleratorHandle::new(memory.clone());
        (memory, handle)
    }

    #[tokio::test]
    async fn test_empty_submission_skips_device() {
        let (memory, handle) = device(1024);
        let model = SyntheticModel::new("clip", memory, 16);
        let executor = BatchExecutor::new(handle);

        let outputs = executor
            .execute_batched(&model, &[], &SafeBatchSize::new("clip", 4))
            .await
            .unwrap();
        assert!(outputs.is_empty());

        let stats = executor.stats();
        assert_eq!(stats.submissions, 1);
        assert_eq!(stats.batches, 0);
        assert_eq!(stats.accelerator_calls, 0);
    }

    #[tokio::test]
    async fn test_optimistic_safe_size_recovers_by_bisection() {
        // Room for 4 items; the safe size claims 8
        let (memory, handle) = device(4 * 100);
        let model = SyntheticModel::new("clip", memory.clone(), 100).with_embedding_dim(1);
        let executor = BatchExecutor::new(handle);

        let items: Vec<Vec<f32>> = (0..8u8).map(|i| vec![f32::from(i)]).collect();
        let outputs = executor
            .execute_batched(&model, &items, &SafeBatchSize::new("clip", 8))
            .await
            .unwrap();

        let expected: Vec<Vec<f32>> = (0..8u8).map(|i| vec![f32::from(i)]).collect();
        assert_eq!(outputs, expected);

        let stats = executor.stats();
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.bisections, 1);
        assert_eq!(stats.accelerator_calls, 3);
        assert_eq!(memory.stats().cached_bytes, 0);
    }

    #[tokio::test]
    async fn test_batch_timeout_is_unrecoverable() {
        let (memory, handle) = device(1 << 20);
        let model = SyntheticModel::new("slow", memory, 1)
            .with_latency_per_item(Duration::from_millis(200));
        let executor = BatchExecutor::new(handle).with_batch_timeout(Some(Duration::from_millis(10)));

        let err = executor
            .execute_batched(&model, &[vec![1.0], vec![2.0]], &SafeBatchSize::new("slow", 2))
            .await
            .unwrap_err();
        match err {
            ExecutionError::Unrecoverable { cause, range } => {
                assert!(cause.contains("timed out"));
                assert_eq!(range, Some(BatchRange::new(0, 2)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(executor.stats().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_timed_out_batches_return_their_memory() {
        let (memory, handle) = device(1000);
        let slow = SyntheticModel::new("slow", memory.clone(), 100)
            .with_latency_per_item(Duration::from_millis(200));
        let executor = BatchExecutor::new(handle).with_batch_timeout(Some(Duration::from_millis(10)));
        let safe = SafeBatchSize::new("slow", 2);

        for _ in 0..3 {
            let err = executor
                .execute_batched(&slow, &[vec![1.0], vec![2.0]], &safe)
                .await
                .unwrap_err();
            assert!(matches!(err, ExecutionError::Unrecoverable { .. }));
        }
        assert_eq!(memory.allocated_bytes(), 0);
        assert_eq!(memory.profile().unwrap().free_memory_bytes, 1000);

        // Five items need 500 of the 1000 bytes: no bisection once nothing leaked
        let fast = SyntheticModel::new("slow", memory.clone(), 100);
        let items: Vec<Vec<f32>> = (0..5u8).map(|i| vec![f32::from(i)]).collect();
        let outputs = executor
            .execute_batched(&fast, &items, &SafeBatchSize::new("slow", 5))
            .await
            .unwrap();
        assert_eq!(outputs.len(), 5);
        assert_eq!(executor.stats().bisections, 0);
    }
}
