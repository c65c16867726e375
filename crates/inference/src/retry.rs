//! OOM-adaptive retry
//!
//! Runs one range of a submission and recovers from out-of-memory by
//! bisection. States, per range:
//!
//! - `Attempting(range)`: call the model on the range.
//!   - success: `Succeeded(outputs)`
//!   - non-OOM failure: `Failed`, no retry (halving cannot fix bad data)
//!   - OOM and `len == 1`: `Failed`, the item itself does not fit
//!   - OOM and `len > 1`: clear the allocator cache, then `Bisecting(left, right)`
//! - `Bisecting(left, right)`: resolve `left` completely, then `right`; the
//!   result is their concatenation, or the first failure.
//!
//! The split point is `start + ceil(len / 2)` (see [`BatchRange::bisect`]).
//! Recursion is expressed as an explicit depth-first stack, with the left
//! half on top, so outputs are produced in index order.

use crate::accelerator::AcceleratorHandle;
use crate::error::ExecutionError;
use crate::model::BatchModel;
use crate::stats::ExecutionCounters;
use crate::types::{BatchRange, BatchResult};
use std::sync::Arc;
use tracing::{debug, warn};

/// Executes ranges with bisection on out-of-memory
#[derive(Debug, Clone)]
pub struct OomAdaptiveRetry {
    accelerator: AcceleratorHandle,
    counters: Arc<ExecutionCounters>,
}

impl OomAdaptiveRetry {
    /// Create a retry wrapper clearing caches on `accelerator`
    pub fn new(accelerator: AcceleratorHandle, counters: Arc<ExecutionCounters>) -> Self {
        Self {
            accelerator,
            counters,
        }
    }

    /// Run `range` of `items`
    ///
    /// The caller must hold the device lock. Returned errors always carry a
    /// range, and are never [`ExecutionError::OutOfMemory`].
    pub async fn execute<M: BatchModel + ?Sized>(
        &self,
        model: &M,
        items: &[M::Input],
        range: BatchRange,
    ) -> Result<BatchResult<M::Output>, ExecutionError> {
        if range.end > items.len() {
            return Err(ExecutionError::unrecoverable(format!(
                "range exceeds submission of {} items",
                items.len()
            ))
            .with_range(range));
        }

        let mut outputs = Vec::with_capacity(range.len());
        let mut pending = vec![range];

        while let Some(current) = pending.pop() {
            match self.attempt(model, items, current).await {
                Ok(mut batch) => outputs.append(&mut batch),
                Err(ExecutionError::OutOfMemory) => {
                    self.counters.record_oom();
                    let Some((left, right)) = current.bisect() else {
                        warn!(model_id = model.model_id(), range = %current, "Single item does not fit in memory");
                        return Err(ExecutionError::Unrecoverable {
                            cause: "out of memory on a single item".to_string(),
                            range: Some(current),
                        });
                    };

                    warn!(
                        model_id = model.model_id(),
                        range = %current,
                        left = %left,
                        right = %right,
                        "Out of memory, bisecting batch"
                    );
                    self.accelerator.clear_cache();
                    self.counters.record_bisection();
                    pending.push(right);
                    pending.push(left);
                }
                Err(e) => return Err(e.within(current)),
            }
        }

        BatchResult::new(range, outputs).map_err(|outputs| {
            ExecutionError::unrecoverable(format!(
                "merged {} outputs for {} items",
                outputs.len(),
                range.len()
            ))
            .with_range(range)
        })
    }

    async fn attempt<M: BatchModel + ?Sized>(
        &self,
        model: &M,
        items: &[M::Input],
        range: BatchRange,
    ) -> Result<Vec<M::Output>, ExecutionError> {
        self.counters.record_accelerator_call();
        debug!(model_id = model.model_id(), range = %range, "Accelerator call");

        let outputs = model.infer(&items[range.as_std()]).await?;
        if outputs.len() != range.len() {
            return Err(ExecutionError::unrecoverable(format!(
                "model returned {} outputs for {} inputs",
                outputs.len(),
                range.len()
            )));
        }
        Ok(outputs)
    }
}
