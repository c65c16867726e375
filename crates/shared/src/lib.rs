//! # Pixel Detective Shared Library
//!
//! Shared utilities for Pixel Detective components: the workspace error
//! type, common CLI option groups and GPU diagnostics.

pub mod cli;
pub mod error;
pub mod gpu_diagnostics;

// Re-export commonly used types for convenience
pub use cli::{parse_byte_size, LoggingOptions};
pub use error::{PixelError, Result};
pub use gpu_diagnostics::{
    get_gpu_memory_info, parse_memory_query, GpuMemoryInfo, MemoryEvolution, MemorySnapshot,
};
