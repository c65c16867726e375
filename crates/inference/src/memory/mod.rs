//! Device memory accounting
//!
//! `MemoryTracker` models a caching allocator: released bytes stay reserved
//! in the cache until `clear_cache` hands them back to the device. New
//! allocations reuse cached blocks, but cached bytes are not free from the
//! device's point of view, so free-memory readings are stale until the cache
//! is cleared.

use crate::error::ExecutionError;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Memory allocation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    /// Insufficient memory available for allocation
    #[error("Out of memory: requested {requested} bytes, available {available} bytes")]
    OutOfMemory {
        /// Number of bytes requested
        requested: u64,
        /// Number of bytes available
        available: u64,
    },

    /// Release of more bytes than are allocated
    #[error("Invalid release: {released} bytes released, {allocated} bytes allocated")]
    InvalidRelease {
        /// Bytes passed to `release`
        released: u64,
        /// Bytes currently allocated
        allocated: u64,
    },
}

impl From<AllocationError> for ExecutionError {
    fn from(err: AllocationError) -> Self {
        match err {
            AllocationError::OutOfMemory { .. } => Self::OutOfMemory,
            AllocationError::InvalidRelease { .. } => Self::unrecoverable(err.to_string()),
        }
    }
}

/// Memory usage statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    /// Bytes held by live allocations
    pub allocated_bytes: u64,
    /// Highest `allocated_bytes` since the last peak reset
    pub peak_allocated_bytes: u64,
    /// Bytes released but still reserved by the cache
    pub cached_bytes: u64,
    /// Number of live allocations
    pub active_allocations: u64,
    /// Allocations performed since creation
    pub num_allocations: u64,
    /// Allocations refused for lack of memory
    pub num_oom_events: u64,
    /// Number of cache clears
    pub num_cache_clears: u64,
}

/// Memory tracker for a single device
#[derive(Debug, Default)]
pub struct MemoryTracker {
    state: Mutex<MemoryStats>,
}

impl MemoryTracker {
    /// Create an empty tracker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryStats> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve `bytes`, failing if live allocations would exceed `capacity`
    ///
    /// Cached blocks are reused before fresh device memory.
    pub fn try_allocate(&self, bytes: u64, capacity: u64) -> Result<(), AllocationError> {
        let mut state = self.state();
        let available = capacity.saturating_sub(state.allocated_bytes);

        if bytes > available {
            state.num_oom_events += 1;
            tracing::debug!(
                requested = bytes,
                available,
                cached = state.cached_bytes,
                "Allocation refused"
            );
            return Err(AllocationError::OutOfMemory {
                requested: bytes,
                available,
            });
        }

        let reused = bytes.min(state.cached_bytes);
        state.cached_bytes -= reused;
        state.allocated_bytes += bytes;
        state.active_allocations += 1;
        state.num_allocations += 1;
        state.peak_allocated_bytes = state.peak_allocated_bytes.max(state.allocated_bytes);
        Ok(())
    }

    /// Release an allocation into the cache
    pub fn release(&self, bytes: u64) -> Result<(), AllocationError> {
        let mut state = self.state();
        if bytes > state.allocated_bytes {
            return Err(AllocationError::InvalidRelease {
                released: bytes,
                allocated: state.allocated_bytes,
            });
        }

        state.allocated_bytes -= bytes;
        state.cached_bytes += bytes;
        state.active_allocations = state.active_allocations.saturating_sub(1);
        Ok(())
    }

    /// Return all cached bytes to the device
    pub fn clear_cache(&self) -> u64 {
        let mut state = self.state();
        let freed = std::mem::take(&mut state.cached_bytes);
        state.num_cache_clears += 1;
        freed
    }

    /// Restart peak tracking from the current allocation level
    pub fn reset_peak(&self) {
        let mut state = self.state();
        state.peak_allocated_bytes = state.allocated_bytes;
    }

    /// Bytes held by live allocations
    pub fn allocated_bytes(&self) -> u64 {
        self.state().allocated_bytes
    }

    /// Peak allocated bytes since the last reset
    pub fn peak_allocated_bytes(&self) -> u64 {
        self.state().peak_allocated_bytes
    }

    /// Bytes reserved by the cache
    pub fn cached_bytes(&self) -> u64 {
        self.state().cached_bytes
    }

    /// Snapshot of all counters
    pub fn stats(&self) -> MemoryStats {
        self.state().clone()
    }
}
