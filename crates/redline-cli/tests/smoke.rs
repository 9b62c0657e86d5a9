// crates/redline-cli/tests/smoke.rs
//
// CLI-level smoke tests. No real video file or ONNX model artifact is
// available to this test binary, so the pipeline proper (C5-C8) is driven
// with the same synthetic in-memory decoder/engine/encoder fakes
// `redline-media`'s own `pipeline_scenarios.rs` uses, anchored to a
// `PipelineConfig` built from parsed CLI args — this covers the thing that
// is genuinely this crate's own: that `--engine`/`--prompt`/`--checkframes`/
// `--channel-capacity` flow correctly from argv into a config that then
// drives a real decode -> infer -> encode run.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::Result;
use ffmpeg_the_third::format::Pixel;
use ffmpeg_the_third::util::frame::video::Video as VideoFrame;

use redline_core::{BoundedChannel, Detection, Metrics};
use redline_media::encode::{run_reorder_and_encode, FrameSink};
use redline_media::engine::{Engine, EngineInfo, EngineKind};
use redline_media::infer::{run_inference_worker, InferShared};
use redline_media::PipelineFrame;

use redline_cli::{build_config, Cli};

fn raw_frame() -> VideoFrame {
    VideoFrame::new(Pixel::YUV420P, 4, 4)
}

fn bgr_frame() -> VideoFrame {
    VideoFrame::new(Pixel::BGR24, 4, 4)
}

fn payload(pts: u64) -> PipelineFrame {
    PipelineFrame::new(raw_frame(), bgr_frame(), pts)
}

fn fake_decode_stage(tx: Arc<BoundedChannel<PipelineFrame>>, total: u64, cap: Option<u64>) -> u64 {
    let limit = cap.unwrap_or(total).min(total);
    let mut pushed = 0;
    for pts in 0..limit {
        if tx.push(payload(pts)) == redline_core::channel::PushOutcome::Rejected {
            break;
        }
        pushed += 1;
    }
    tx.close();
    pushed
}

/// No-detection engine — enough to exercise the worker/reorder/encode wiring
/// without a real ONNX model.
struct NoopEngine {
    calls: AtomicUsize,
}

impl Engine for NoopEngine {
    fn infer(&mut self, _bgr: &[u8], _width: u32, _height: u32, _prompt: &str) -> Result<Vec<Detection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }
    fn info(&self) -> EngineInfo {
        EngineInfo {
            backend: "noop".into(),
            precision: "fp32".into(),
            tensor_w: 4,
            tensor_h: 4,
            optimal_intra_threads: 1,
        }
    }
}

struct CountingSink {
    written: Vec<i64>,
}

impl FrameSink for CountingSink {
    fn write_frame(&mut self, _raw: &mut VideoFrame, pts: i64) -> Result<()> {
        self.written.push(pts);
        Ok(())
    }
}

fn base_args(tmp_out: &std::path::Path) -> Vec<String> {
    vec![
        "redline".into(),
        "--media".into(),
        "input.mp4".into(),
        "--model".into(),
        "model.onnx".into(),
        "--out".into(),
        tmp_out.to_string_lossy().into_owned(),
    ]
}

#[test]
fn text_engine_without_prompt_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let mut args = base_args(tmp.path());
    args.extend(["--engine".into(), "text".into()]);

    let cli = Cli::try_parse_from(args.clone()).expect("clap parses the flags themselves");
    let err = build_config(cli).expect_err("text engine with no --prompt must fail");
    assert!(err.to_string().contains("--prompt"));
}

#[test]
fn unknown_engine_value_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let mut args = base_args(tmp.path());
    args.extend(["--engine".into(), "bogus".into()]);

    let cli = Cli::try_parse_from(args.clone()).unwrap();
    let err = build_config(cli).expect_err("unknown --engine value must fail");
    assert!(err.to_string().contains("bogus"));
}

#[test]
fn valid_args_build_expected_config_and_create_out_dir() {
    let tmp = tempfile::tempdir().unwrap();
    let out_dir = tmp.path().join("nested").join("out");
    let mut args = vec![
        "redline".to_string(),
        "--media".into(),
        "input.mp4".into(),
        "--model".into(),
        "model.onnx".into(),
        "--out".into(),
        out_dir.to_string_lossy().into_owned(),
        "--engine".into(),
        "text".into(),
        "--prompt".into(),
        "license plate".into(),
        "--checkframes".into(),
        "10".into(),
        "--channel-capacity".into(),
        "7".into(),
    ];
    args.push("--zero-chroma".into());

    let cli = Cli::try_parse_from(args.clone()).unwrap();
    let config = build_config(cli).expect("valid args must build a config");

    assert_eq!(config.engine_kind, EngineKind::TextGrounded);
    assert_eq!(config.prompt, "license plate");
    assert_eq!(config.checkframes, Some(10));
    assert_eq!(config.channel_capacity, 7);
    assert!(config.zero_chroma);
    assert!(out_dir.is_dir(), "build_config must create the output directory");
}

/// End-to-end smoke test: a config built from parsed CLI args drives a full
/// decode -> infer -> encode run through synthetic in-memory stages (no real
/// media file or model artifact involved).
#[test]
fn cli_config_drives_full_synthetic_pipeline_run() {
    let tmp = tempfile::tempdir().unwrap();
    let mut args = base_args(tmp.path());
    args.extend(["--checkframes".into(), "6".into(), "--channel-capacity".into(), "4".into()]);

    let cli = Cli::try_parse_from(args.clone()).unwrap();
    let config = build_config(cli).unwrap();

    let metrics = Arc::new(Metrics::new());
    let decode_ch = Arc::new(BoundedChannel::<PipelineFrame>::new(config.channel_capacity));
    let infer_ch = Arc::new(BoundedChannel::<PipelineFrame>::new(config.channel_capacity));

    let decode_ch_for_thread = Arc::clone(&decode_ch);
    let checkframes = config.checkframes;
    let decoder = thread::spawn(move || fake_decode_stage(decode_ch_for_thread, 100, checkframes));

    let shared = Arc::new(InferShared::new(1));
    let engine: Box<dyn Engine + Send> = Box::new(NoopEngine { calls: AtomicUsize::new(0) });
    let worker_decode_rx = Arc::clone(&decode_ch);
    let worker_infer_tx = Arc::clone(&infer_ch);
    let worker_metrics = Arc::clone(&metrics);
    let kind = config.engine_kind;
    let prompt = config.prompt.clone();
    let zero_chroma = config.zero_chroma;
    let shared_for_worker = Arc::clone(&shared);
    let worker = thread::spawn(move || {
        run_inference_worker(0, engine, kind, prompt, zero_chroma, worker_decode_rx, worker_infer_tx, shared_for_worker, worker_metrics);
    });

    let mut sink = CountingSink { written: Vec::new() };
    let (encoded, dropped) = run_reorder_and_encode(&infer_ch, &mut sink, &metrics).unwrap();

    worker.join().unwrap();
    let decoded = decoder.join().unwrap();

    assert_eq!(decoded, 6, "checkframes cap from CLI args must limit decoded frames");
    assert_eq!(encoded, 6);
    assert_eq!(dropped, 0);
    assert_eq!(sink.written, vec![0, 1, 2, 3, 4, 5]);
}
