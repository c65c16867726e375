//! # Shared Error Handling Module
//!
//! Workspace-wide error type used by the command line tooling and by the
//! diagnostics helpers. The inference core keeps its own, narrower error
//! types (`ExecutionError`, `FatalProbeError`) and converts into this one at
//! the binary boundary.
//!
//! ## Error Categories
//!
//! - **Configuration Errors**: invalid options, unreadable config files
//! - **Device Errors**: accelerator discovery and introspection failures
//! - **System Errors**: resource exhaustion, timeouts, OS-level failures

use thiserror::Error;
use tracing::warn;

/// Result type alias for Pixel Detective operations
pub type Result<T> = std::result::Result<T, PixelError>;

/// Error types shared across Pixel Detective components
#[derive(Error, Debug)]
pub enum PixelError {
    /// Configuration validation errors
    ///
    /// Raised during startup when options or files are invalid.
    ///
    /// **Recovery Strategy**: Fix configuration and restart
    #[error("Configuration error: {message}")]
    Configuration {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// Optional source error for additional context
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Accelerator discovery or introspection errors
    ///
    /// Raised when a device cannot be found or its memory cannot be queried,
    /// for example when `nvidia-smi` is missing.
    ///
    /// **Recovery Strategy**: Fall back to CPU or a simulated device
    #[error("Device error on {device}: {message}")]
    Device {
        /// Device identifier (e.g. `cuda:0`, `cpu`)
        device: String,
        /// Descriptive error message
        message: String,
    },

    /// Operation timeout errors
    #[error("Operation timed out after {timeout_ms}ms: {operation}")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
        /// Description of the operation that timed out
        operation: String,
    },

    /// Resource exhaustion errors
    ///
    /// Raised when the accelerator cannot serve the requested work at all.
    #[error("Resource exhausted: {resource} - {message}")]
    ResourceExhausted {
        /// Type of resource that was exhausted
        resource: String,
        /// Descriptive error message
        message: String,
    },

    /// Internal errors
    #[error("Internal error: {message}")]
    Internal {
        /// Error message
        message: String,
        /// Underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl PixelError {
    /// Creates a configuration error
    pub fn configuration(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Configuration {
            message: message.into(),
            source,
        }
    }

    /// Creates a device error
    pub fn device(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Device {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Creates a timeout error
    pub fn timeout(timeout: std::time::Duration, operation: impl Into<String>) -> Self {
        Self::Timeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            operation: operation.into(),
        }
    }

    /// Creates a resource exhausted error
    pub fn resource_exhausted(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Creates an internal error
    pub fn internal(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Internal {
            message: message.into(),
            source,
        }
    }

    /// Process exit code used by the `pixel` binary
    pub fn exit_code(&self) -> i32 {
        match self {
            PixelError::Configuration { .. } => 2,
            PixelError::Device { .. } => 3,
            PixelError::ResourceExhausted { .. } => 4,
            PixelError::Timeout { .. } => 5,
            PixelError::Internal { .. } => {
                warn!("Internal error reached process exit mapping");
                1
            }
        }
    }

    /// Whether retrying the same operation later might succeed
    pub fn is_temporary(&self) -> bool {
        match self {
            PixelError::Configuration { .. } => false,
            PixelError::Device { .. } => true,
            PixelError::Timeout { .. } => true,
            PixelError::ResourceExhausted { .. } => false,
            PixelError::Internal { .. } => false,
        }
    }
}

impl From<std::io::Error> for PixelError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => {
                PixelError::timeout(std::time::Duration::from_secs(30), "I/O operation")
            }
            std::io::ErrorKind::NotFound => {
                PixelError::configuration("File or program not found", Some(Box::new(err)))
            }
            _ => PixelError::internal("I/O error", Some(Box::new(err))),
        }
    }
}
