//! Shared CLI functionality for Pixel Detective components
//!
//! Common clap option groups so every binary exposes logging the same way.

use clap::Args;
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Common logging options shared across all components
#[derive(Args, Debug, Clone)]
pub struct LoggingOptions {
    /// Logging level (error, warn, info, debug, trace) or filter directives
    /// such as `pixel_inference=debug`; `RUST_LOG` takes precedence
    #[arg(long, default_value = "info", env = "PIXEL_LOG_LEVEL")]
    pub log_level: String,

    /// Emit logs as JSON lines instead of human readable text
    #[arg(long, default_value_t = false, env = "PIXEL_LOG_JSON")]
    pub log_json: bool,
}

impl LoggingOptions {
    /// Initialize logging with the configured filter
    ///
    /// Returns an error if a global subscriber is already installed.
    pub fn init_logging(&self) -> crate::Result<()> {
        let builder = FmtSubscriber::builder()
            .with_env_filter(self.env_filter())
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true);

        let result = if self.log_json {
            tracing::subscriber::set_global_default(builder.json().finish())
        } else {
            tracing::subscriber::set_global_default(builder.finish())
        };

        result.map_err(|e| {
            crate::PixelError::configuration("Failed to set logging subscriber", Some(Box::new(e)))
        })
    }

    /// Filter from `RUST_LOG` when set, otherwise from `log_level`
    pub fn env_filter(&self) -> EnvFilter {
        self.filter_with(std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref())
    }

    fn filter_with(&self, rust_log: Option<&str>) -> EnvFilter {
        if let Some(filter) = rust_log.and_then(|d| EnvFilter::try_new(d).ok()) {
            return filter;
        }
        // A bare word would parse as a target name, so only `target=level`
        // directives are passed through as-is
        if self.log_level.contains('=') {
            if let Ok(filter) = EnvFilter::try_new(&self.log_level) {
                return filter;
            }
        }
        EnvFilter::default().add_directive(LevelFilter::from_level(self.parse_log_level()).into())
    }

    /// Parse the log level string into a tracing Level
    pub fn parse_log_level(&self) -> Level {
        match self.log_level.to_lowercase().as_str() {
            "error" => Level::ERROR,
            "warn" => Level::WARN,
            "info" => Level::INFO,
            "debug" => Level::DEBUG,
            "trace" => Level::TRACE,
            _ => Level::INFO,
        }
    }
}

/// Parse a human readable byte size such as `512`, `64KB`, `1.5GB` or `8GiB`
pub fn parse_byte_size(input: &str) -> Option<u64> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let value: f64 = number.parse().ok()?;

    let multiplier: f64 = match unit.trim().to_uppercase().as_str() {
        "" | "B" => 1.0,
        "KB" | "KIB" | "K" => 1024.0,
        "MB" | "MIB" | "M" => 1024.0 * 1024.0,
        "GB" | "GIB" | "G" => 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };

    let bytes = value * multiplier;
    if !bytes.is_finite() || bytes < 0.0 || bytes > u64::MAX as f64 {
        return None;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Some(bytes.round() as u64)
}
