// crates/redline-core/src/metrics.rs
//
// Process-wide metrics for one processing run. Integer counters are atomic;
// floating-point accumulators are mutex-guarded; report() reads a consistent
// snapshot by acquiring the same mutex used for accumulation.
//
// Ported from this pipeline's C++ lineage (a getInstance() singleton) to a
// plain struct the orchestrator owns and shares via Arc — one run, one
// Metrics instance, no global mutable state to reset between runs or tests.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

#[derive(Default)]
struct Accumulators {
    time_to_frame_ms:      f64,
    time_to_conversion_ms: f64,
    time_to_inference_ms:  f64,
}

pub struct Metrics {
    start_time: Mutex<Option<Instant>>,
    end_time:   Mutex<Option<Instant>>,

    frames_decoded:        AtomicU64,
    frames_inferred:       AtomicU64,
    frames_encoded:        AtomicU64,
    frames_dropped_invalid: AtomicU64,

    frame_width:  AtomicU32,
    frame_height: AtomicU32,

    num_workers:     AtomicU32,
    hw_concurrency:  AtomicU32,
    intra_op_threads: AtomicU32,

    accum: Mutex<Accumulators>,

    inference_backend: Mutex<String>,
    model_precision:   Mutex<String>,
    tensor_width:      AtomicI64,
    tensor_height:     AtomicI64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            start_time: Mutex::new(None),
            end_time:   Mutex::new(None),
            frames_decoded:         AtomicU64::new(0),
            frames_inferred:        AtomicU64::new(0),
            frames_encoded:         AtomicU64::new(0),
            frames_dropped_invalid: AtomicU64::new(0),
            frame_width:  AtomicU32::new(0),
            frame_height: AtomicU32::new(0),
            num_workers:      AtomicU32::new(0),
            hw_concurrency:   AtomicU32::new(0),
            intra_op_threads: AtomicU32::new(0),
            accum: Mutex::new(Accumulators::default()),
            inference_backend: Mutex::new("CPU".to_string()),
            model_precision:   Mutex::new("FP32".to_string()),
            tensor_width:  AtomicI64::new(0),
            tensor_height: AtomicI64::new(0),
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self) {
        *self.start_time.lock().unwrap() = Some(Instant::now());
    }

    pub fn stop(&self) {
        *self.end_time.lock().unwrap() = Some(Instant::now());
    }

    pub fn incr_decoded(&self) {
        self.frames_decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_inferred(&self) {
        self.frames_inferred.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_encoded(&self) {
        self.frames_encoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_dropped_invalid(&self) {
        self.frames_dropped_invalid.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_time_to_frame_ms(&self, ms: f64) {
        self.accum.lock().unwrap().time_to_frame_ms += ms;
    }

    pub fn add_time_to_conversion_ms(&self, ms: f64) {
        self.accum.lock().unwrap().time_to_conversion_ms += ms;
    }

    pub fn add_time_to_inference_ms(&self, ms: f64) {
        self.accum.lock().unwrap().time_to_inference_ms += ms;
    }

    pub fn set_frame_size(&self, w: u32, h: u32) {
        self.frame_width.store(w, Ordering::Relaxed);
        self.frame_height.store(h, Ordering::Relaxed);
    }

    pub fn set_thread_info(&self, workers: u32, hw_concurrency: u32, intra_op_threads: u32) {
        self.num_workers.store(workers, Ordering::Relaxed);
        self.hw_concurrency.store(hw_concurrency, Ordering::Relaxed);
        self.intra_op_threads.store(intra_op_threads, Ordering::Relaxed);
    }

    pub fn set_engine_info(&self, backend: &str, precision: &str, tensor_w: i64, tensor_h: i64) {
        *self.inference_backend.lock().unwrap() = backend.to_string();
        *self.model_precision.lock().unwrap() = precision.to_string();
        self.tensor_width.store(tensor_w, Ordering::Relaxed);
        self.tensor_height.store(tensor_h, Ordering::Relaxed);
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded.load(Ordering::Relaxed)
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded.load(Ordering::Relaxed)
    }

    pub fn frames_dropped_invalid(&self) -> u64 {
        self.frames_dropped_invalid.load(Ordering::Relaxed)
    }

    /// Snapshot the metrics into a human-readable report. Acquires `accum`'s
    /// mutex once for a consistent read of all three accumulators.
    pub fn report(&self) -> String {
        let start = *self.start_time.lock().unwrap();
        let end   = *self.end_time.lock().unwrap();
        let duration_ms = match (start, end) {
            (Some(s), Some(e)) => e.duration_since(s).as_millis() as f64,
            _ => 0.0,
        };

        let decoded  = self.frames_decoded.load(Ordering::Relaxed);
        let inferred = self.frames_inferred.load(Ordering::Relaxed);
        let encoded  = self.frames_encoded.load(Ordering::Relaxed);

        let fps = if encoded > 0 && duration_ms > 0.0 {
            (encoded as f64 * 1000.0) / duration_ms
        } else {
            0.0
        };

        let acc = self.accum.lock().unwrap();
        let avg_t2f = if decoded > 0 { acc.time_to_frame_ms / decoded as f64 } else { 0.0 };
        let avg_ttc = if decoded > 0 { acc.time_to_conversion_ms / decoded as f64 } else { 0.0 };
        let avg_tti = if inferred > 0 { acc.time_to_inference_ms / inferred as f64 } else { 0.0 };
        drop(acc);

        let backend   = self.inference_backend.lock().unwrap().clone();
        let precision = self.model_precision.lock().unwrap().clone();

        format!(
            "\n=== Video Processing Metrics ===\n\
             Hardware Concurrency: {hw} Cores\n\
             Inference Workers: {workers} Threads\n\
             IntraOp Threads/Worker: {intra}\n\
             Inference Backend: {backend} ({precision})\n\
             Frame Size: {fw}x{fh}\n\
             Tensor Resolution: {tw}x{th}\n\
             Total Time: {duration_ms} ms\n\
             Frames Decoded: {decoded}\n\
             Frames Inferred: {inferred}\n\
             Frames Encoded: {encoded}\n\
             Frames Dropped (invalid): {dropped}\n\
             Average FPS: {fps:.2}\n\
             Average Time to Frame (T2F): {avg_t2f:.2} ms\n\
             Average Time to Conversion (TTC): {avg_ttc:.2} ms\n\
             Average Time to Inference (TTI): {avg_tti:.2} ms\n\
             ================================\n",
            hw = self.hw_concurrency.load(Ordering::Relaxed),
            workers = self.num_workers.load(Ordering::Relaxed),
            intra = self.intra_op_threads.load(Ordering::Relaxed),
            fw = self.frame_width.load(Ordering::Relaxed),
            fh = self.frame_height.load(Ordering::Relaxed),
            tw = self.tensor_width.load(Ordering::Relaxed),
            th = self.tensor_height.load(Ordering::Relaxed),
            dropped = self.frames_dropped_invalid.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = Metrics::new();
        m.incr_decoded();
        m.incr_decoded();
        m.incr_encoded();
        assert_eq!(m.frames_decoded(), 2);
        assert_eq!(m.frames_encoded(), 1);
    }

    #[test]
    fn report_handles_zero_frames_without_divide_by_zero() {
        let m = Metrics::new();
        m.start();
        m.stop();
        let report = m.report();
        assert!(report.contains("Average FPS: 0.00"));
    }
}
