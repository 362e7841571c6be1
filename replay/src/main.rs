//! isolate replay
//!
//! Reads a capture directory written by the isolate agent, rebuilds the
//! captured process's device-address-space topology at the same numeric
//! addresses, reloads the kernel binary, and re-issues the captured dispatch.
//!
//! Exit codes: 0 success, 1 any reconstruction or load error, 2 when a
//! captured region could not be reserved at its original address.

mod error;
mod plan;
mod reconstruct;
mod steering;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::reconstruct::ReplayOptions;

#[derive(Parser, Debug)]
#[command(name = "isolate-replay")]
#[command(about = "Replay a captured GPU kernel dispatch in isolation", long_about = None)]
#[command(version)]
struct Args {
    /// Capture directory written by the isolate capture agent
    capture_dir: PathBuf,

    /// Only verify that every captured region reserves at its original
    /// address; skip mapping, restore, and dispatch
    #[arg(long)]
    reserve_only: bool,

    /// Wall-clock bound on the dispatch completion wait, in seconds
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let options = ReplayOptions {
        reserve_only: args.reserve_only,
        timeout_secs: args.timeout_secs,
    };

    match reconstruct::run(&args.capture_dir, &options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("replay failed: {e}");
            eprintln!("{e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
