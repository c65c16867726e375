//! GPU Diagnostics and Memory Monitoring
//!
//! Device-level memory queries through `nvidia-smi`, plus a small snapshot
//! tracker for watching memory evolve across a probe or a batch run.
//!
//! Allocator-level numbers (allocated / peak bytes of this process) are not
//! available from `nvidia-smi`; those come from the accelerator handle of the
//! inference crate. This module only reports what the driver sees.

use crate::{PixelError, Result};
use serde::{Deserialize, Serialize};
use std::process::Command;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

const MIB: u64 = 1024 * 1024;

/// GPU memory information in MB
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GpuMemoryInfo {
    /// GPU device ID
    pub device_id: u32,
    /// GPU name/model
    pub gpu_name: String,
    /// Total memory in MB
    pub total_mb: u32,
    /// Used memory in MB
    pub used_mb: u32,
    /// Free memory in MB
    pub free_mb: u32,
    /// Timestamp when this measurement was taken
    pub timestamp: u64,
}

impl Default for GpuMemoryInfo {
    fn default() -> Self {
        Self {
            device_id: 0,
            gpu_name: "Unknown".to_string(),
            total_mb: 0,
            used_mb: 0,
            free_mb: 0,
            timestamp: unix_now(),
        }
    }
}

impl GpuMemoryInfo {
    /// Total memory in bytes
    pub fn total_bytes(&self) -> u64 {
        u64::from(self.total_mb) * MIB
    }

    /// Free memory in bytes
    pub fn free_bytes(&self) -> u64 {
        u64::from(self.free_mb) * MIB
    }

    /// Memory utilization as a fraction (0.0-1.0)
    pub fn utilization(&self) -> f64 {
        if self.total_mb == 0 {
            return 0.0;
        }
        f64::from(self.used_mb) / f64::from(self.total_mb)
    }
}

/// Memory usage snapshot for tracking evolution over time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySnapshot {
    /// Milliseconds since tracking started
    pub timestamp_ms: u64,
    /// Memory used in bytes
    pub used_bytes: u64,
    /// Memory free in bytes
    pub free_bytes: u64,
    /// Optional label for this snapshot (e.g., "probe_start")
    pub label: Option<String>,
}

/// Memory evolution tracker
#[derive(Debug, Clone)]
pub struct MemoryEvolution {
    /// Device label being monitored
    pub device: String,
    /// Memory snapshots over time
    pub snapshots: Vec<MemorySnapshot>,
    /// Start time of monitoring
    pub start_time: Instant,
}

impl MemoryEvolution {
    /// Create a new memory evolution tracker
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            snapshots: Vec::new(),
            start_time: Instant::now(),
        }
    }

    /// Add a memory snapshot
    pub fn add_snapshot(&mut self, used_bytes: u64, free_bytes: u64, label: Option<String>) {
        let timestamp_ms = u64::try_from(self.start_time.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.snapshots.push(MemorySnapshot {
            timestamp_ms,
            used_bytes,
            free_bytes,
            label,
        });
    }

    /// Memory usage delta between the first and last snapshot
    pub fn memory_delta_bytes(&self) -> Option<i128> {
        match (self.snapshots.first(), self.snapshots.last()) {
            (Some(first), Some(last)) => {
                Some(i128::from(last.used_bytes) - i128::from(first.used_bytes))
            }
            _ => None,
        }
    }

    /// Peak memory usage across all snapshots
    pub fn peak_used_bytes(&self) -> Option<u64> {
        self.snapshots.iter().map(|s| s.used_bytes).max()
    }

    /// Snapshot recorded under a given label
    pub fn memory_at_label(&self, label: &str) -> Option<&MemorySnapshot> {
        self.snapshots
            .iter()
            .find(|s| s.label.as_deref() == Some(label))
    }

    /// Render a short textual summary
    pub fn summary(&self) -> String {
        let mut output = format!("Memory evolution for {}\n", self.device);
        if let Some(delta) = self.memory_delta_bytes() {
            output.push_str(&format!("Memory delta: {:+} bytes\n", delta));
        }
        if let Some(peak) = self.peak_used_bytes() {
            output.push_str(&format!("Peak used: {} bytes\n", peak));
        }
        for snapshot in &self.snapshots {
            output.push_str(&format!(
                "  {:6.3}s: {} bytes used ({})\n",
                snapshot.timestamp_ms as f64 / 1000.0,
                snapshot.used_bytes,
                snapshot.label.as_deref().unwrap_or("measurement"),
            ));
        }
        output
    }
}

/// Parse one line of
/// `nvidia-smi --query-gpu=index,name,memory.used,memory.free,memory.total --format=csv,noheader,nounits`
pub fn parse_memory_query(line: &str) -> Result<GpuMemoryInfo> {
    let line = line.trim();
    if line.is_empty() {
        return Err(PixelError::device(
            "cuda",
            "No GPU found with the specified device ID",
        ));
    }

    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() < 5 {
        return Err(PixelError::device(
            "cuda",
            format!("Invalid nvidia-smi output format: {line}"),
        ));
    }

    let field = |idx: usize, name: &str| -> Result<u32> {
        parts[idx].parse().map_err(|_| {
            PixelError::device(
                "cuda",
                format!("Invalid {name} in nvidia-smi output: {}", parts[idx]),
            )
        })
    };

    Ok(GpuMemoryInfo {
        device_id: field(0, "index")?,
        gpu_name: parts[1].to_string(),
        used_mb: field(2, "memory.used")?,
        free_mb: field(3, "memory.free")?,
        total_mb: field(4, "memory.total")?,
        timestamp: unix_now(),
    })
}

/// Get GPU memory information using nvidia-smi
pub fn get_gpu_memory_info(device_id: u32) -> Result<GpuMemoryInfo> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,name,memory.used,memory.free,memory.total",
            "--format=csv,noheader,nounits",
            &format!("--id={}", device_id),
        ])
        .output()
        .map_err(|e| {
            PixelError::device(format!("cuda:{device_id}"), format!("nvidia-smi unavailable: {e}"))
        })?;

    if !output.status.success() {
        return Err(PixelError::device(
            format!("cuda:{device_id}"),
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    let output_str = String::from_utf8_lossy(&output.stdout);
    let line = output_str.lines().next().unwrap_or_default();
    parse_memory_query(line)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_query() {
        let info = parse_memory_query("0, NVIDIA GeForce RTX 4090, 1200, 23000, 24564").unwrap();
        assert_eq!(info.device_id, 0);
        assert_eq!(info.gpu_name, "NVIDIA GeForce RTX 4090");
        assert_eq!(info.used_mb, 1200);
        assert_eq!(info.free_mb, 23000);
        assert_eq!(info.total_mb, 24564);
        assert_eq!(info.free_bytes(), 23000 * 1024 * 1024);
    }

    #[test]
    fn test_parse_memory_query_errors() {
        assert!(parse_memory_query("").is_err());
        assert!(parse_memory_query("0, GPU, 12").is_err());
        assert!(parse_memory_query("0, GPU, lots, 1, 2").is_err());
    }

    #[test]
    fn test_utilization() {
        let info = GpuMemoryInfo {
            total_mb: 1000,
            used_mb: 250,
            free_mb: 750,
            ..Default::default()
        };
        assert!((info.utilization() - 0.25).abs() < f64::EPSILON);
        assert_eq!(GpuMemoryInfo::default().utilization(), 0.0);
    }

    #[test]
    fn test_memory_evolution() {
        let mut evolution = MemoryEvolution::new("cuda:0");
        evolution.add_snapshot(1000, 23000, Some("start".to_string()));
        evolution.add_snapshot(5000, 19000, Some("probe".to_string()));
        evolution.add_snapshot(4500, 19500, Some("end".to_string()));

        assert_eq!(evolution.memory_delta_bytes(), Some(3500));
        assert_eq!(evolution.peak_used_bytes(), Some(5000));
        assert!(evolution.memory_at_label("probe").is_some());
        assert!(evolution.summary().contains("cuda:0"));
    }

    #[test]
    fn test_gpu_memory_info_when_available() {
        // Only meaningful where nvidia-smi exists
        match get_gpu_memory_info(0) {
            Ok(info) => {
                assert!(info.total_mb > 0);
                assert!(info.used_mb <= info.total_mb);
            }
            Err(e) => assert!(matches!(e, PixelError::Device { .. })),
        }
    }
}
