//! Error types for the batch inference core

use crate::types::BatchRange;
use thiserror::Error;

/// Result type for crate-level operations
pub type BatcherResult<T> = Result<T, BatcherError>;

/// Classified failure of one accelerator call
///
/// Model implementations create these without a range; the retry layer
/// attaches the range it was attempting before the error leaves it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// Accelerator memory exhausted. Resolved by bisection inside the retry
    /// layer and never returned from `execute_batched`.
    #[error("accelerator out of memory")]
    OutOfMemory,

    /// Failure that aborts the submission
    #[error("unrecoverable failure{}: {cause}", fmt_range(.range))]
    Unrecoverable {
        /// What went wrong
        cause: String,
        /// Items that could not be processed
        range: Option<BatchRange>,
    },

    /// Environment-level failure (device lost, driver reset). Not retried.
    #[error("transient failure{}: {cause}", fmt_range(.range))]
    Transient {
        /// What went wrong
        cause: String,
        /// Items that could not be processed
        range: Option<BatchRange>,
    },
}

fn fmt_range(range: &Option<BatchRange>) -> String {
    range.map(|r| format!(" on items {r}")).unwrap_or_default()
}

impl ExecutionError {
    /// Create an unrecoverable error with no range attached yet
    pub fn unrecoverable(cause: impl Into<String>) -> Self {
        Self::Unrecoverable {
            cause: cause.into(),
            range: None,
        }
    }

    /// Create a transient error with no range attached yet
    pub fn transient(cause: impl Into<String>) -> Self {
        Self::Transient {
            cause: cause.into(),
            range: None,
        }
    }

    /// Whether this is the out-of-memory signal
    #[must_use]
    pub const fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory)
    }

    /// Range of items the failure applies to, if known
    #[must_use]
    pub const fn range(&self) -> Option<BatchRange> {
        match self {
            Self::OutOfMemory => None,
            Self::Unrecoverable { range, .. } | Self::Transient { range, .. } => *range,
        }
    }

    /// Resolve the range against the batch the model was given
    ///
    /// A model only sees its slice, so a range it reports is relative to
    /// `attempted`; it is shifted to submission indices and clipped to the
    /// attempted range. Without one, the whole attempted range is attached.
    #[must_use]
    pub fn within(self, attempted: BatchRange) -> Self {
        let resolve = |range: Option<BatchRange>| {
            Some(range.map_or(attempted, |r| {
                let start = attempted.start.saturating_add(r.start).min(attempted.end);
                let end = attempted.start.saturating_add(r.end).min(attempted.end);
                BatchRange::new(start, end)
            }))
        };
        match self {
            Self::Unrecoverable { cause, range } => Self::Unrecoverable {
                cause,
                range: resolve(range),
            },
            Self::Transient { cause, range } => Self::Transient {
                cause,
                range: resolve(range),
            },
            Self::OutOfMemory => Self::OutOfMemory,
        }
    }

    /// Attach a range unless one is already present
    #[must_use]
    pub fn with_range(self, new_range: BatchRange) -> Self {
        match self {
            Self::Unrecoverable { cause, range } => Self::Unrecoverable {
                cause,
                range: range.or(Some(new_range)),
            },
            Self::Transient { cause, range } => Self::Transient {
                cause,
                range: range.or(Some(new_range)),
            },
            Self::OutOfMemory => Self::OutOfMemory,
        }
    }
}

/// Failure of the single-item capability probe
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FatalProbeError {
    /// A batch of one item does not fit on the device
    #[error("device {device} cannot serve model {model_id}: a single item does not fit in memory")]
    DeviceCannotServe {
        /// Model that was probed
        model_id: String,
        /// Device that was probed
        device: String,
    },

    /// The probe inference failed for a reason other than memory
    #[error("capability probe for model {model_id} failed: {cause}")]
    ProbeFailed {
        /// Model that was probed
        model_id: String,
        /// Underlying failure
        cause: String,
    },

    /// Memory introspection API failed
    #[error("memory introspection failed: {0}")]
    Introspection(String),
}

/// Crate-level error type
#[derive(Error, Debug)]
pub enum BatcherError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(#[from] BatcherConfigError),

    /// Capability probe errors
    #[error("Probe error: {0}")]
    Probe(#[from] FatalProbeError),

    /// Batch execution errors
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Errors from shared tooling (diagnostics, logging setup)
    #[error(transparent)]
    Shared(#[from] pixel_shared::PixelError),
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum BatcherConfigError {
    /// Missing required configuration field
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Invalid configuration value provided
    #[error("Invalid value for {field}: {value} (reason: {reason})")]
    InvalidValue {
        /// Configuration field name
        field: String,
        /// Invalid value provided
        value: String,
        /// Reason why value is invalid
        reason: String,
    },

    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// File read/write error
    #[error("File read error: {0}")]
    FileRead(String),

    /// Configuration parsing error
    #[error("Parse error: {0}")]
    Parse(String),
}

/// Convert from validator errors
impl From<validator::ValidationErrors> for BatcherError {
    fn from(err: validator::ValidationErrors) -> Self {
        let mut messages: Vec<String> = err
            .field_errors()
            .iter()
            .flat_map(|(field, errors)| {
                errors.iter().map(move |error| {
                    format!(
                        "{}: {}",
                        field,
                        error
                            .message
                            .as_ref()
                            .unwrap_or(&std::borrow::Cow::Borrowed("validation error"))
                    )
                })
            })
            .collect();
        messages.sort();

        Self::Configuration(BatcherConfigError::ValidationFailed(messages.join(", ")))
    }
}

/// Map into the workspace error at the binary boundary
impl From<BatcherError> for pixel_shared::PixelError {
    fn from(err: BatcherError) -> Self {
        match err {
            BatcherError::Configuration(e) => Self::configuration(e.to_string(), Some(Box::new(e))),
            BatcherError::Probe(FatalProbeError::DeviceCannotServe { model_id, device }) => {
                Self::resource_exhausted(
                    device,
                    format!("model {model_id} does not fit; choose a smaller model or the CPU"),
                )
            }
            BatcherError::Probe(FatalProbeError::Introspection(msg)) => Self::device("unknown", msg),
            BatcherError::Shared(e) => e,
            other => Self::internal(other.to_string(), None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_range_attaches_once() {
        let first = BatchRange::new(10, 15);
        let second = BatchRange::new(0, 25);

        let err = ExecutionError::unrecoverable("bad pixel data").with_range(first);
        assert_eq!(err.range(), Some(first));

        let err = err.with_range(second);
        assert_eq!(err.range(), Some(first));

        assert_eq!(ExecutionError::OutOfMemory.with_range(first).range(), None);
    }

    #[test]
    fn test_within_shifts_slice_relative_range() {
        let attempted = BatchRange::new(10, 15);

        let err = ExecutionError::Unrecoverable {
            cause: "corrupt image".to_string(),
            range: Some(BatchRange::new(2, 3)),
        };
        assert_eq!(err.within(attempted).range(), Some(BatchRange::new(12, 13)));

        let err = ExecutionError::transient("device lost").within(attempted);
        assert_eq!(err.range(), Some(attempted));

        // Ranges past the slice are clipped to it
        let err = ExecutionError::Unrecoverable {
            cause: "bad".to_string(),
            range: Some(BatchRange::new(3, 9)),
        };
        assert_eq!(err.within(attempted).range(), Some(BatchRange::new(13, 15)));
    }

    #[test]
    fn test_execution_error_display() {
        let err = ExecutionError::unrecoverable("decode failed").with_range(BatchRange::new(3, 4));
        assert_eq!(err.to_string(), "unrecoverable failure on items [3, 4): decode failed");

        let err = ExecutionError::transient("device lost");
        assert_eq!(err.to_string(), "transient failure: device lost");
        assert!(!err.is_out_of_memory());
        assert!(ExecutionError::OutOfMemory.is_out_of_memory());
    }

    #[test]
    fn test_probe_error_maps_to_resource_exhausted() {
        let err = BatcherError::from(FatalProbeError::DeviceCannotServe {
            model_id: "clip-vit-l14".to_string(),
            device: "cuda:0".to_string(),
        });
        let shared = pixel_shared::PixelError::from(err);
        assert!(matches!(
            shared,
            pixel_shared::PixelError::ResourceExhausted { .. }
        ));
    }
}
