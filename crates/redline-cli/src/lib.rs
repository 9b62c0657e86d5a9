// crates/redline-cli/src/lib.rs
//
// CLI argument surface and config construction, split from `main.rs` so the
// argument-to-config wiring (engine selection, prompt requirement, output
// dir creation) is exercisable from `tests/` without a real video/model
// fixture.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use redline_media::pipeline::{run_pipeline, PipelineConfig, PipelineReport};
use redline_media::EngineKind;

/// Neural redaction over a segmented streaming video asset.
#[derive(Parser, Debug)]
#[command(name = "redline", version, about)]
pub struct Cli {
    /// Redaction engine: `seg` (fixed-class segmentation) or `text` (open-vocabulary).
    #[arg(long, default_value = "seg")]
    pub engine: String,

    /// Init segment, if the media segment doesn't carry its own moov/ftyp.
    #[arg(long)]
    pub init: Option<PathBuf>,

    /// Media segment to process.
    #[arg(long)]
    pub media: PathBuf,

    /// Output directory for the DASH manifest and segment files.
    #[arg(long)]
    pub out: PathBuf,

    /// Path to the ONNX model artifact.
    #[arg(long)]
    pub model: PathBuf,

    /// Natural-language prompt. Required when `--engine text`.
    #[arg(long)]
    pub prompt: Option<String>,

    /// Cap the number of frames processed (benchmarking / tests).
    #[arg(long)]
    pub checkframes: Option<u64>,

    /// Also zero the chroma planes under a segmentation mask, instead of the
    /// default luma-only redaction.
    #[arg(long, default_value_t = false)]
    pub zero_chroma: bool,

    /// Override the decode/inference channel capacity (default 50).
    #[arg(long, default_value_t = 0)]
    pub channel_capacity: usize,
}

/// Resolves `--engine`/`--prompt` into a `PipelineConfig`, creating the
/// output directory as a side effect. Pure enough to test without ffmpeg or
/// an ONNX runtime: no frame is decoded and no model is loaded here.
pub fn build_config(cli: Cli) -> Result<PipelineConfig> {
    let engine_kind = EngineKind::from_flag(&cli.engine)?;
    let prompt = match engine_kind {
        EngineKind::TextGrounded => cli.prompt.clone()
            .context("--prompt is required when --engine text")?,
        EngineKind::Segmentation => cli.prompt.clone().unwrap_or_default(),
    };

    std::fs::create_dir_all(&cli.out)
        .with_context(|| format!("create output dir '{}'", cli.out.display()))?;

    Ok(PipelineConfig {
        init_segment: cli.init,
        media_segment: cli.media,
        out_dir: cli.out,
        model_path: cli.model,
        engine_kind,
        prompt,
        checkframes: cli.checkframes,
        zero_chroma: cli.zero_chroma,
        channel_capacity: cli.channel_capacity,
    })
}

/// Parses `args` (e.g. `std::env::args()`) and runs the full pipeline.
/// Kept separate from `main` so integration tests can drive argument
/// parsing through to a `PipelineConfig` without going through a process.
pub fn run_from_args<I, T>(args: I) -> Result<PipelineReport>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let cli = Cli::try_parse_from(args)?;
    let config = build_config(cli)?;
    run_pipeline(config)
}
