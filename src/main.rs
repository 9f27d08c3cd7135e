//! Thin binary entry point: parse CLI flags and dispatch into
//! [`hyprspace::cli`]. Everything that actually dials peers, frames
//! packets, and drives the TUN device lives in the library crate so it
//! can be exercised directly in tests.

use clap::Parser;
use hyprspace::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	hyprspace::cli::run(cli).await
}
