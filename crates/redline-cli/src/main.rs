// crates/redline-cli/src/main.rs
//
// Argument parsing, directory creation, and metrics printing — the thin
// process entry point around `build_config` / `run_pipeline`.

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use redline_cli::{build_config, Cli};
use redline_media::pipeline::run_pipeline;

fn main() -> ExitCode {
    env_logger::init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = build_config(cli)?;
    let report = run_pipeline(config)?;

    log::info!(
        "[redline] decoded={} encoded={} dropped_invalid={}",
        report.frames_decoded, report.frames_encoded, report.frames_dropped,
    );
    println!("{}", report.metrics_report);

    Ok(())
}
