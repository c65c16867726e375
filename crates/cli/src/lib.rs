//! # Pixel Detective CLI
//!
//! Command-line front end for the batch inference core. Provides
//! subcommands for measuring the safe batch size of a model, running
//! synthetic workloads through the executor and checking the host.
//!
//! ## Usage
//!
//! ```bash
//! # Probe a simulated 8GiB GPU for a model needing 48MiB per image
//! pixel probe --capacity 8GiB --bytes-per-item 48MiB
//!
//! # Process 512 images while another tenant grabs 2GiB after the probe
//! pixel run --items 512 --contention 2GiB
//!
//! # Inspect host and GPU memory
//! pixel doctor --verbose
//! ```

pub mod cli_options;
pub mod commands;
pub mod doctor;

pub use cli_options::{Cli, Commands};
