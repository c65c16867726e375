//! Accelerator handle and memory introspection
//!
//! The accelerator is one exclusive resource per process. It is modelled as
//! an explicit handle instead of ambient global state: an
//! [`AcceleratorHandle`] bundles the memory-introspection implementation with
//! the single device lock, and every prober and executor is built from a
//! clone of the same handle. Cloning shares the lock, so exclusivity holds
//! across models.

use crate::memory::{AllocationError, MemoryStats, MemoryTracker};
use pixel_shared::{GpuMemoryInfo, PixelError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use sysinfo::System;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

/// Kind of compute device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Host CPU
    Cpu,
    /// Discrete or integrated GPU
    Gpu,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Gpu => write!(f, "gpu"),
        }
    }
}

/// Memory picture of a device at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceleratorProfile {
    /// Kind of device
    pub device_kind: DeviceKind,
    /// Total device memory in bytes
    pub total_memory_bytes: u64,
    /// Memory currently available in bytes
    pub free_memory_bytes: u64,
}

impl AcceleratorProfile {
    /// Bytes not free
    #[must_use]
    pub const fn used_memory_bytes(&self) -> u64 {
        self.total_memory_bytes.saturating_sub(self.free_memory_bytes)
    }

    /// Memory utilization as a fraction (0.0-1.0)
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn utilization(&self) -> f64 {
        if self.total_memory_bytes == 0 {
            return 0.0;
        }
        self.used_memory_bytes() as f64 / self.total_memory_bytes as f64
    }
}

/// Accelerator memory-introspection API
///
/// Mirrors what a GPU runtime allocator exposes: device-wide free/total
/// memory, this process's allocated and peak-allocated bytes, peak reset and
/// cache release.
pub trait MemoryIntrospection: Send + Sync {
    /// Human readable device label, e.g. `cuda:0`
    fn device_label(&self) -> String;

    /// Query total and free memory
    fn profile(&self) -> pixel_shared::Result<AcceleratorProfile>;

    /// Bytes currently allocated by this process
    fn allocated_bytes(&self) -> u64;

    /// Peak allocated bytes since the last `reset_peak_stats`
    fn peak_allocated_bytes(&self) -> u64;

    /// Restart peak tracking
    fn reset_peak_stats(&self);

    /// Release cached allocator blocks back to the device
    fn clear_cache(&self);
}

/// Shared handle to the process-wide accelerator
#[derive(Clone)]
pub struct AcceleratorHandle {
    memory: Arc<dyn MemoryIntrospection>,
    lock: Arc<AsyncMutex<()>>,
}

impl AcceleratorHandle {
    /// Wrap a memory-introspection implementation with a fresh device lock
    pub fn new(memory: Arc<dyn MemoryIntrospection>) -> Self {
        Self {
            memory,
            lock: Arc::new(AsyncMutex::new(())),
        }
    }

    /// Handle for the host CPU
    #[must_use]
    pub fn cpu() -> Self {
        Self::new(Arc::new(CpuMemory::new()))
    }

    /// Acquire exclusive use of the device
    ///
    /// Waiters are admitted in FIFO order.
    pub async fn lock(&self) -> AsyncMutexGuard<'_, ()> {
        self.lock.lock().await
    }

    /// Memory-introspection API
    #[must_use]
    pub fn memory(&self) -> &dyn MemoryIntrospection {
        self.memory.as_ref()
    }

    /// Fresh memory profile
    pub fn profile(&self) -> pixel_shared::Result<AcceleratorProfile> {
        self.memory.profile()
    }

    /// Release cached allocator blocks
    pub fn clear_cache(&self) {
        self.memory.clear_cache();
    }

    /// Device label
    #[must_use]
    pub fn device_label(&self) -> String {
        self.memory.device_label()
    }

    /// Whether two handles share the same device lock
    #[must_use]
    pub fn shares_lock_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.lock, &other.lock)
    }
}

impl fmt::Debug for AcceleratorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceleratorHandle")
            .field("device", &self.memory.device_label())
            .finish_non_exhaustive()
    }
}

/// Host memory introspection backed by `sysinfo`
///
/// The host has no allocator statistics, so allocated/peak report zero and
/// cache clears are no-ops. The prober never measures CPU devices.
pub struct CpuMemory {
    system: Mutex<System>,
}

impl CpuMemory {
    /// Create a host memory reader
    #[must_use]
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for CpuMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIntrospection for CpuMemory {
    fn device_label(&self) -> String {
        "cpu".to_string()
    }

    fn profile(&self) -> pixel_shared::Result<AcceleratorProfile> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_memory();
        Ok(AcceleratorProfile {
            device_kind: DeviceKind::Cpu,
            total_memory_bytes: system.total_memory(),
            free_memory_bytes: system.available_memory(),
        })
    }

    fn allocated_bytes(&self) -> u64 {
        0
    }

    fn peak_allocated_bytes(&self) -> u64 {
        0
    }

    fn reset_peak_stats(&self) {}

    fn clear_cache(&self) {}
}

/// Fixed-capacity device with full allocator accounting
///
/// Stands in for a GPU runtime: models allocate against it during
/// inference, and allocations beyond capacity fail with out-of-memory.
#[derive(Debug)]
pub struct TrackedMemory {
    label: String,
    kind: DeviceKind,
    total_bytes: u64,
    capacity_bytes: u64,
    tracker: MemoryTracker,
}

impl TrackedMemory {
    /// Device of `capacity_bytes`, all of it usable
    pub fn with_capacity(kind: DeviceKind, capacity_bytes: u64) -> Self {
        Self {
            label: format!("{kind}:tracked"),
            kind,
            total_bytes: capacity_bytes,
            capacity_bytes,
            tracker: MemoryTracker::new(),
        }
    }

    /// GPU of `capacity_bytes`
    pub fn gpu(capacity_bytes: u64) -> Self {
        Self::with_capacity(DeviceKind::Gpu, capacity_bytes)
    }

    /// Mirror a real GPU: usable capacity is what the driver reports free
    pub fn from_gpu_info(info: &GpuMemoryInfo) -> Self {
        Self {
            label: format!("cuda:{}", info.device_id),
            kind: DeviceKind::Gpu,
            total_bytes: info.total_bytes(),
            capacity_bytes: info.free_bytes(),
            tracker: MemoryTracker::new(),
        }
    }

    /// Override the device label
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Reserve device memory
    pub fn allocate(&self, bytes: u64) -> Result<(), AllocationError> {
        self.tracker.try_allocate(bytes, self.capacity_bytes)
    }

    /// Release device memory into the allocator cache
    pub fn release(&self, bytes: u64) -> Result<(), AllocationError> {
        self.tracker.release(bytes)
    }

    /// Reserve device memory for the lifetime of the returned guard
    ///
    /// The bytes go back to the allocator cache when the guard drops, so a
    /// forward pass abandoned mid-flight (timeout, cancelled future) does not
    /// leave them allocated.
    pub fn reserve(&self, bytes: u64) -> Result<DeviceAllocation<'_>, AllocationError> {
        self.allocate(bytes)?;
        Ok(DeviceAllocation {
            device: self,
            bytes,
        })
    }

    /// Usable capacity in bytes
    #[must_use]
    pub const fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    /// Allocator counters
    pub fn stats(&self) -> MemoryStats {
        self.tracker.stats()
    }
}

/// Bytes held on a [`TrackedMemory`] until dropped
#[derive(Debug)]
#[must_use = "the reservation is released as soon as the guard drops"]
pub struct DeviceAllocation<'a> {
    device: &'a TrackedMemory,
    bytes: u64,
}

impl DeviceAllocation<'_> {
    /// Reserved bytes
    pub const fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for DeviceAllocation<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.device.release(self.bytes) {
            tracing::warn!(device = %self.device.label, error = %e, "Failed to release device allocation");
        }
    }
}

impl MemoryIntrospection for TrackedMemory {
    fn device_label(&self) -> String {
        self.label.clone()
    }

    fn profile(&self) -> pixel_shared::Result<AcceleratorProfile> {
        if self.capacity_bytes > self.total_bytes {
            return Err(PixelError::device(
                self.label.clone(),
                "usable capacity exceeds total memory",
            ));
        }
        let stats = self.tracker.stats();
        let in_use = stats.allocated_bytes + stats.cached_bytes;
        Ok(AcceleratorProfile {
            device_kind: self.kind,
            total_memory_bytes: self.total_bytes,
            free_memory_bytes: self.capacity_bytes.saturating_sub(in_use),
        })
    }

    fn allocated_bytes(&self) -> u64 {
        self.tracker.allocated_bytes()
    }

    fn peak_allocated_bytes(&self) -> u64 {
        self.tracker.peak_allocated_bytes()
    }

    fn reset_peak_stats(&self) {
        self.tracker.reset_peak();
    }

    fn clear_cache(&self) {
        let freed = self.tracker.clear_cache();
        if freed > 0 {
            tracing::trace!(device = %self.label, freed, "Cleared allocator cache");
        }
    }
}
