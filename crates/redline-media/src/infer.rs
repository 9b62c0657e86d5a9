// crates/redline-media/src/infer.rs
//
// The inference stage. N workers, one per engine instance. Each worker pops
// the decode channel, runs its own engine (never another worker's —
// enforced by construction, not a lock), mutates the luma plane in place,
// and forwards to the inference channel.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use redline_core::channel::PushOutcome;
use redline_core::{BoundedChannel, Metrics};

use crate::engine::{Engine, EngineKind};
use crate::helpers::redact;
use crate::PipelineFrame;

/// Shared state across all inference workers: the live-worker count used to
/// decide who closes the inference channel on the way out — the last worker
/// to finish is the one that closes it.
pub struct InferShared {
    pub live_workers: AtomicU32,
}

impl InferShared {
    pub fn new(n: u32) -> Self {
        Self { live_workers: AtomicU32::new(n) }
    }
}

/// Runs one inference worker to completion. `engine` is this worker's
/// exclusive instance — never shared with another worker.
pub fn run_inference_worker(
    worker_index: usize,
    mut engine: Box<dyn Engine + Send>,
    kind: EngineKind,
    prompt: String,
    zero_chroma: bool,
    decode_rx: Arc<BoundedChannel<PipelineFrame>>,
    infer_tx: Arc<BoundedChannel<PipelineFrame>>,
    shared: Arc<InferShared>,
    metrics: Arc<Metrics>,
) {
    loop {
        let mut payload = match decode_rx.pop() {
            Some(p) => p,
            None => break,
        };

        if payload.valid {
            let t0 = std::time::Instant::now();
            let width = payload.bgr.width();
            let height = payload.bgr.height();
            let stride = payload.bgr.stride(0);
            let bgr_data = payload.bgr.data(0);
            // Pack the strided BGR view into a contiguous buffer for the
            // engine, which expects row-major w*h*3 bytes.
            let mut packed = vec![0u8; width as usize * height as usize * 3];
            for row in 0..height as usize {
                let src = &bgr_data[row * stride..row * stride + width as usize * 3];
                packed[row * width as usize * 3..(row + 1) * width as usize * 3].copy_from_slice(src);
            }

            match engine.infer(&packed, width, height, &prompt) {
                Ok(detections) => {
                    match kind {
                        EngineKind::Segmentation => redact::apply_segmentation_redaction(&mut payload.raw_frame, &detections, zero_chroma),
                        EngineKind::TextGrounded  => redact::apply_text_grounded_redaction(&mut payload.raw_frame, &detections),
                    }
                }
                Err(e) => {
                    // A single frame's inference failure shouldn't abort the
                    // run: mark it invalid and forward, preserving pts order.
                    log::warn!("[infer:{worker_index}] engine error at pts={}: {e}", payload.pts);
                    payload.valid = false;
                }
            }
            metrics.add_time_to_inference_ms(t0.elapsed().as_secs_f64() * 1000.0);
            metrics.incr_inferred();
        }

        if infer_tx.push(payload) == PushOutcome::Rejected {
            break;
        }
    }

    if shared.live_workers.fetch_sub(1, Ordering::AcqRel) == 1 {
        infer_tx.close();
    }
}
