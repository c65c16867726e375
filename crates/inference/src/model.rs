//! Model invocation interface
//!
//! The core depends on exactly one capability of a model: take an ordered
//! batch of inputs, return an ordered batch of outputs or a classified
//! [`ExecutionError`]. Everything framework-specific stays behind this trait.

use crate::accelerator::TrackedMemory;
use crate::error::ExecutionError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Batch inference primitive
#[async_trait]
pub trait BatchModel: Send + Sync {
    /// One work item (e.g. one decoded image)
    type Input: Send + Sync;
    /// Result for one work item (e.g. one embedding)
    type Output: Send;

    /// Identifier used for logging and for the probed `SafeBatchSize`
    fn model_id(&self) -> &str;

    /// A single input of the expected shape, used by the capability probe
    fn synthetic_input(&self) -> Self::Input;

    /// Run one batch. Must return exactly one output per input, in order.
    ///
    /// Memory exhaustion must be reported as [`ExecutionError::OutOfMemory`]
    /// so the retry layer can bisect. A range attached to any other error
    /// indexes into `batch`; the retry layer maps it to submission indices.
    async fn infer(&self, batch: &[Self::Input]) -> Result<Vec<Self::Output>, ExecutionError>;
}

#[async_trait]
impl<M: BatchModel + ?Sized> BatchModel for Arc<M> {
    type Input = M::Input;
    type Output = M::Output;

    fn model_id(&self) -> &str {
        (**self).model_id()
    }

    fn synthetic_input(&self) -> Self::Input {
        (**self).synthetic_input()
    }

    async fn infer(&self, batch: &[Self::Input]) -> Result<Vec<Self::Output>, ExecutionError> {
        (**self).infer(batch).await
    }
}

/// Deterministic embedding model over a [`TrackedMemory`] device
///
/// Each call allocates `workspace_bytes + bytes_per_item * batch.len()` for
/// its duration, so memory behaviour matches a real model closely enough for
/// probing and bisection to be observable. Inputs are flattened pixel
/// buffers; outputs are `embedding_dim`-wide vectors derived from them.
pub struct SyntheticModel {
    model_id: String,
    device: Arc<TrackedMemory>,
    bytes_per_item: u64,
    workspace_bytes: u64,
    input_len: usize,
    embedding_dim: usize,
    latency_per_item: Duration,
}

impl SyntheticModel {
    /// Create a model charging `bytes_per_item` per batch element
    pub fn new(model_id: impl Into<String>, device: Arc<TrackedMemory>, bytes_per_item: u64) -> Self {
        Self {
            model_id: model_id.into(),
            device,
            bytes_per_item,
            workspace_bytes: 0,
            input_len: 3 * 8 * 8,
            embedding_dim: 8,
            latency_per_item: Duration::ZERO,
        }
    }

    /// Fixed per-call workspace charged on top of the per-item cost
    #[must_use]
    pub const fn with_workspace_bytes(mut self, bytes: u64) -> Self {
        self.workspace_bytes = bytes;
        self
    }

    /// Width of each output embedding
    #[must_use]
    pub const fn with_embedding_dim(mut self, dim: usize) -> Self {
        self.embedding_dim = dim;
        self
    }

    /// Simulated compute time per item
    #[must_use]
    pub const fn with_latency_per_item(mut self, latency: Duration) -> Self {
        self.latency_per_item = latency;
        self
    }

    /// Length of the synthetic probe input
    #[must_use]
    pub const fn input_len(&self) -> usize {
        self.input_len
    }

    /// Memory charged for a batch of `len` items
    #[must_use]
    pub fn batch_bytes(&self, len: usize) -> u64 {
        let len = u64::try_from(len).unwrap_or(u64::MAX);
        self.workspace_bytes
            .saturating_add(self.bytes_per_item.saturating_mul(len))
    }

    #[allow(clippy::cast_precision_loss)]
    fn embed(&self, pixels: &[f32]) -> Vec<f32> {
        let mean = pixels.iter().sum::<f32>() / pixels.len() as f32;
        (1..=self.embedding_dim).map(|i| mean * i as f32).collect()
    }
}

#[async_trait]
impl BatchModel for SyntheticModel {
    type Input = Vec<f32>;
    type Output = Vec<f32>;

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn synthetic_input(&self) -> Self::Input {
        vec![0.5; self.input_len]
    }

    async fn infer(&self, batch: &[Self::Input]) -> Result<Vec<Self::Output>, ExecutionError> {
        if let Some(pos) = batch.iter().position(Vec::is_empty) {
            return Err(ExecutionError::unrecoverable(format!(
                "item {pos} of batch has an empty pixel buffer"
            )));
        }

        let _allocation = self.device.reserve(self.batch_bytes(batch.len()))?;

        if !self.latency_per_item.is_zero() {
            let items = u32::try_from(batch.len()).unwrap_or(u32::MAX);
            tokio::time::sleep(self.latency_per_item.saturating_mul(items)).await;
        }

        Ok(batch.iter().map(|pixels| self.embed(pixels)).collect())
    }
}
