// crates/redline-media/src/pipeline.rs
//
// The pipeline orchestrator. Wires the decoder thread, N inference threads,
// and the reorder+encode stage (run on the calling thread), then joins and
// tears down in a fixed lifecycle order.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use ffmpeg_the_third::util::rational::Rational;
use redline_core::{BoundedChannel, Metrics};

use crate::decode::{self, probe_source};
use crate::encode::{run_reorder_and_encode, EncoderHandle};
use crate::engine::{EngineKind, EnginePool};
use crate::infer::{run_inference_worker, InferShared};

/// Default capacity for both channels, bounding live-frame memory while
/// still giving the decoder enough headroom to stay ahead of inference.
const DEFAULT_CHANNEL_CAPACITY: usize = 50;

pub struct PipelineConfig {
    pub init_segment:  Option<PathBuf>,
    pub media_segment: PathBuf,
    pub out_dir:       PathBuf,
    pub model_path:    PathBuf,
    pub engine_kind:   EngineKind,
    pub prompt:        String,
    pub checkframes:   Option<u64>,
    pub zero_chroma:   bool,
    pub channel_capacity: usize,
}

impl PipelineConfig {
    pub fn channel_capacity_or_default(&self) -> usize {
        if self.channel_capacity == 0 { DEFAULT_CHANNEL_CAPACITY } else { self.channel_capacity }
    }
}

pub struct PipelineReport {
    pub frames_decoded:  u64,
    pub frames_encoded:  u64,
    pub frames_dropped:  u64,
    pub metrics_report:  String,
}

/// Concatenates `init` followed by `media` into a fresh temp file, matching
/// this pipeline's C++ lineage's `temp_full_input.<ext>` step. The returned
/// path stays alive until the caller deletes it once processing completes.
fn concat_segments(init: &Path, media: &Path, ext: &str) -> Result<PathBuf> {
    let mut tmp = tempfile::Builder::new()
        .prefix("redline_full_input_")
        .suffix(&format!(".{ext}"))
        .tempfile()
        .context("create temp concat file")?;

    let mut init_f = File::open(init).with_context(|| format!("open init segment '{}'", init.display()))?;
    std::io::copy(&mut init_f, &mut tmp).context("copy init segment")?;
    let mut media_f = File::open(media).with_context(|| format!("open media segment '{}'", media.display()))?;
    std::io::copy(&mut media_f, &mut tmp).context("copy media segment")?;
    tmp.flush().context("flush temp concat file")?;

    // into_temp_path() keeps the file on disk without dropping it; the
    // orchestrator deletes it explicitly once processing completes.
    let path = tmp.into_temp_path();
    let path_buf = path.to_path_buf();
    path.keep().context("persist temp concat file")?;
    Ok(path_buf)
}

pub fn run_pipeline(config: PipelineConfig) -> Result<PipelineReport> {
    let metrics = Arc::new(Metrics::new());
    metrics.start();

    let ext = config.media_segment.extension().and_then(|e| e.to_str()).unwrap_or("mp4");
    let (input_path, temp_path) = match &config.init_segment {
        Some(init) if init.as_os_str().len() > 0 => {
            let tmp = concat_segments(init, &config.media_segment, ext)?;
            (tmp.clone(), Some(tmp))
        }
        _ => (config.media_segment.clone(), None),
    };

    let result = run_pipeline_inner(&config, &input_path, &metrics);

    if let Some(tmp) = temp_path {
        if let Err(e) = std::fs::remove_file(&tmp) {
            log::warn!("[pipeline] failed to delete temp input '{}': {e}", tmp.display());
        }
    }

    metrics.stop();
    result.map(|(decoded, encoded, dropped)| PipelineReport {
        frames_decoded: decoded,
        frames_encoded: encoded,
        frames_dropped: dropped,
        metrics_report: metrics.report(),
    })
}

fn run_pipeline_inner(config: &PipelineConfig, input_path: &Path, metrics: &Arc<Metrics>) -> Result<(u64, u64, u64)> {
    let source = probe_source(input_path)?;
    metrics.set_frame_size(source.width, source.height);

    // ffmpeg time_base is usually very fine-grained (e.g. 1/90000); use it
    // directly as the encoder's frame time_base so pts-as-frame-index values
    // (assigned at decode time, not the container's own pts) still land on
    // sane presentation times for a constant-framerate source.
    let time_base: Rational = source.time_base;

    let engine_pool = EnginePool::new(config.engine_kind, &config.model_path)?;
    let hw = engine_pool.hw_concurrency();
    let n = engine_pool.num_workers() as u32;
    let engines = engine_pool.into_engines();
    if let Some(first) = engines.first() {
        let info = first.info();
        metrics.set_thread_info(n, hw, info.optimal_intra_threads);
        metrics.set_engine_info(&info.backend, &info.precision, info.tensor_w, info.tensor_h);
    }

    let capacity = config.channel_capacity_or_default();
    let decode_ch = Arc::new(BoundedChannel::new(capacity));
    let infer_ch = Arc::new(BoundedChannel::new(capacity));

    // Open the encoder before spawning any worker. If this fails (bad output
    // dir, missing libx264, ...), no thread has started yet and there is
    // nothing to join or drain — an `Err` here returns cleanly.
    let mut encoder = EncoderHandle::open(&config.out_dir, source.width, source.height, time_base)?;

    let decoder_path = input_path.to_path_buf();
    let decode_ch_for_thread = Arc::clone(&decode_ch);
    let checkframes = config.checkframes;
    let decoder_metrics = Arc::clone(metrics);
    let decoder_handle = thread::spawn(move || {
        decode::run_decoder(&decoder_path, decode_ch_for_thread, checkframes, decoder_metrics)
    });

    let shared = Arc::new(InferShared::new(n));
    let mut worker_handles = Vec::with_capacity(n as usize);
    for (i, engine) in engines.into_iter().enumerate() {
        let decode_rx = Arc::clone(&decode_ch);
        let infer_tx = Arc::clone(&infer_ch);
        let shared = Arc::clone(&shared);
        let metrics = Arc::clone(metrics);
        let kind = config.engine_kind;
        let prompt = config.prompt.clone();
        let zero_chroma = config.zero_chroma;
        worker_handles.push(thread::spawn(move || {
            run_inference_worker(i, engine, kind, prompt, zero_chroma, decode_rx, infer_tx, shared, metrics);
        }));
    }

    let (frames_encoded, frames_dropped) = run_reorder_and_encode(&infer_ch, &mut encoder, metrics)?;
    encoder.finish()?;

    for h in worker_handles {
        let _ = h.join();
    }
    let frames_decoded = decoder_handle.join().map_err(|_| anyhow::anyhow!("decoder thread panicked"))??;

    Ok((frames_decoded, frames_encoded, frames_dropped))
}
