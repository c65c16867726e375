//! Instrumented accelerator and model for executor tests

#![allow(dead_code)]

use async_trait::async_trait;
use pixel_inference::{
    AcceleratorProfile, BatchModel, BatchRange, DeviceKind, ExecutionError, MemoryIntrospection,
};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Memory API whose readings are set by the test
#[derive(Debug)]
pub struct ScriptedMemory {
    pub kind: DeviceKind,
    pub total: u64,
    pub free: AtomicU64,
    pub allocated: AtomicU64,
    pub peak: AtomicU64,
    pub cache_clears: AtomicUsize,
}

impl ScriptedMemory {
    pub fn gpu(total: u64) -> Self {
        Self {
            kind: DeviceKind::Gpu,
            total,
            free: AtomicU64::new(total),
            allocated: AtomicU64::new(0),
            peak: AtomicU64::new(0),
            cache_clears: AtomicUsize::new(0),
        }
    }

    pub fn clears(&self) -> usize {
        self.cache_clears.load(Ordering::SeqCst)
    }
}

impl MemoryIntrospection for ScriptedMemory {
    fn device_label(&self) -> String {
        "scripted:0".to_string()
    }

    fn profile(&self) -> pixel_shared::Result<AcceleratorProfile> {
        Ok(AcceleratorProfile {
            device_kind: self.kind,
            total_memory_bytes: self.total,
            free_memory_bytes: self.free.load(Ordering::SeqCst),
        })
    }

    fn allocated_bytes(&self) -> u64 {
        self.allocated.load(Ordering::SeqCst)
    }

    fn peak_allocated_bytes(&self) -> u64 {
        self.peak.load(Ordering::SeqCst)
    }

    fn reset_peak_stats(&self) {}

    fn clear_cache(&self) {
        self.cache_clears.fetch_add(1, Ordering::SeqCst);
    }
}

/// Concurrent-entry counter shared by every model on one device
#[derive(Debug, Default)]
pub struct ConcurrencyGauge {
    active: AtomicUsize,
    max: AtomicUsize,
}

impl ConcurrencyGauge {
    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

type FailurePlan = Box<dyn Fn(BatchRange) -> Option<ExecutionError> + Send + Sync>;

/// Model over `usize` inputs that records every range it is called with
///
/// Inputs are their own indices, so the received slice identifies the range.
/// Each output is `(input, call_number)`.
pub struct RecordingModel {
    id: String,
    calls: Mutex<Vec<BatchRange>>,
    failure: FailurePlan,
    delay: Duration,
    gauge: Arc<ConcurrencyGauge>,
}

impl RecordingModel {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            calls: Mutex::new(Vec::new()),
            failure: Box::new(|_| None),
            delay: Duration::ZERO,
            gauge: Arc::default(),
        }
    }

    pub fn failing_with(
        mut self,
        plan: impl Fn(BatchRange) -> Option<ExecutionError> + Send + Sync + 'static,
    ) -> Self {
        self.failure = Box::new(plan);
        self
    }

    /// Fail with out-of-memory for any batch longer than `k`
    pub fn oom_above(self, k: usize) -> Self {
        self.failing_with(move |range| (range.len() > k).then_some(ExecutionError::OutOfMemory))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Share one concurrency gauge across models
    pub fn with_gauge(mut self, gauge: Arc<ConcurrencyGauge>) -> Self {
        self.gauge = gauge;
        self
    }

    pub fn calls(&self) -> Vec<BatchRange> {
        self.calls.lock().unwrap().clone()
    }

    pub fn max_active(&self) -> usize {
        self.gauge.max()
    }
}

#[async_trait]
impl BatchModel for RecordingModel {
    type Input = usize;
    type Output = (usize, usize);

    fn model_id(&self) -> &str {
        &self.id
    }

    fn synthetic_input(&self) -> usize {
        0
    }

    async fn infer(&self, batch: &[usize]) -> Result<Vec<(usize, usize)>, ExecutionError> {
        let start = batch.first().copied().unwrap_or(0);
        let range = BatchRange::new(start, start + batch.len());
        let call = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(range);
            calls.len() - 1
        };

        self.gauge.enter();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.gauge.exit();

        if let Some(err) = (self.failure)(range) {
            return Err(err);
        }
        Ok(batch.iter().map(|&i| (i, call)).collect())
    }
}

pub fn indices(n: usize) -> Vec<usize> {
    (0..n).collect()
}

pub fn ranges(pairs: &[(usize, usize)]) -> Vec<BatchRange> {
    pairs.iter().map(|&(s, e)| BatchRange::new(s, e)).collect()
}
