//! # Pixel Detective CLI - Main Entry Point

use clap::Parser;
use pixel_cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = cli.logging_options().init_logging() {
        eprintln!("Failed to initialize logging: {e}");
    }

    if let Err(e) = cli.run().await {
        eprintln!("Error: {e}");
        std::process::exit(e.exit_code());
    }
}
