// crates/redline-media/src/encode.rs
//
// Reorder + encode stage. Runs on the orchestrator's own thread (no
// dedicated worker) — pops the inference channel, buffers out-of-order
// arrivals keyed by pts, and hands frames to the encoder in strictly
// increasing order with no gaps.
//
// Encoder: single H.264 video stream, DASH-muxed (`init.mp4` / `chunk-$N$.m4s`
// / `manifest.mpd`), following this codebase's own video-stream setup in its
// MP4 export path (codec context built independently of the output stream,
// then copied into codecpar via avcodec_parameters_from_context since
// Stream::codec() isn't exposed by this ffmpeg-the-third version).

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use ffmpeg_the_third as ffmpeg;
use ffmpeg::codec::{self, Id as CodecId};
use ffmpeg::encoder;
use ffmpeg::format::{output_as, Pixel};
use ffmpeg::util::rational::Rational;
use ffmpeg::Packet;
use redline_core::{BoundedChannel, Metrics};

use crate::PipelineFrame;

/// DASH segment duration and window sizing.
const SEGMENT_DURATION_SECS: u32 = 2;
const SEGMENT_WINDOW: u32 = 5;
const EXTRA_WINDOW: u32 = 5;

pub struct EncoderHandle {
    octx:     ffmpeg::format::context::Output,
    encoder:  ffmpeg::encoder::video::Video,
    frame_tb: Rational,
    ost_tb:   Rational,
    frames_written: u64,
}

impl EncoderHandle {
    /// Opens a DASH muxer at `out_dir/manifest.mpd` sized for `width`x`height`
    /// at `time_base` (typically the decoder's frame rate as a rational).
    pub fn open(out_dir: &Path, width: u32, height: u32, time_base: Rational) -> Result<Self> {
        std::fs::create_dir_all(out_dir)
            .with_context(|| format!("create output dir '{}'", out_dir.display()))?;
        let manifest_path = out_dir.join("manifest.mpd");

        let mut octx = output_as(&manifest_path, "dash")
            .with_context(|| format!("open dash muxer at '{}'", manifest_path.display()))?;

        let h264 = encoder::find(CodecId::H264)
            .context("H.264 encoder not found — is libx264 available?")?;

        let mut ost = octx.add_stream(h264).context("add video stream")?;
        ost.set_time_base(time_base);

        let enc_ctx = codec::context::Context::new_with_codec(h264);
        let mut enc = enc_ctx.encoder().video().context("create video encoder context")?;
        enc.set_width(width);
        enc.set_height(height);
        enc.set_format(Pixel::YUV420P);
        enc.set_time_base(time_base);
        enc.set_bit_rate(0); // CRF controls quality

        let mut opts = ffmpeg::Dictionary::new();
        opts.set("crf", "23");
        opts.set("preset", "veryfast");

        let video_encoder = enc.open_as_with(h264, opts).context("open H.264 encoder")?;

        // Stream::codec() isn't exposed by this ffmpeg-the-third version, so
        // copy encoder params into codecpar directly.
        unsafe {
            let ret = ffmpeg::ffi::avcodec_parameters_from_context(
                (**(*octx.as_mut_ptr()).streams.add(0)).codecpar,
                video_encoder.as_ptr() as *mut ffmpeg::ffi::AVCodecContext,
            );
            if ret < 0 {
                anyhow::bail!("avcodec_parameters_from_context (video) failed: {ret}");
            }
        }

        let mut dash_opts = ffmpeg::Dictionary::new();
        dash_opts.set("init_seg_name", "init.mp4");
        dash_opts.set("media_seg_name", "chunk-$Number$.m4s");
        dash_opts.set("use_template", "1");
        dash_opts.set("use_timeline", "1");
        dash_opts.set("seg_duration", &SEGMENT_DURATION_SECS.to_string());
        dash_opts.set("window_size", &SEGMENT_WINDOW.to_string());
        dash_opts.set("extra_window_size", &EXTRA_WINDOW.to_string());

        octx.write_header_with(dash_opts).context("write dash header")?;

        let ost_tb = octx.stream(0).unwrap().time_base();

        Ok(Self { octx, encoder: video_encoder, frame_tb: time_base, ost_tb, frames_written: 0 })
    }

    fn write(&mut self, raw: &mut ffmpeg::util::frame::video::Video, pts: i64) -> Result<()> {
        raw.set_pts(Some(pts));
        self.encoder.send_frame(raw).context("send frame to encoder")?;
        self.drain_packets()?;
        self.frames_written += 1;
        Ok(())
    }

    fn drain_packets(&mut self) -> Result<()> {
        let mut pkt = Packet::empty();
        while self.encoder.receive_packet(&mut pkt).is_ok() {
            pkt.set_stream(0);
            pkt.rescale_ts(self.frame_tb, self.ost_tb);
            pkt.write_interleaved(&mut self.octx).context("write video packet")?;
        }
        Ok(())
    }

    /// Flushes the encoder and writes the trailer. If zero frames reached the
    /// encoder, the trailer is NOT written — a zero-frame DASH stream
    /// triggers divide-by-zero in manifest duration computation.
    pub fn finish(mut self) -> Result<u64> {
        self.encoder.send_eof().context("send EOF to video encoder")?;
        self.drain_packets()?;

        if self.frames_written > 0 {
            self.octx.write_trailer().context("write trailer")?;
        } else {
            log::warn!("[encode] zero frames encoded, skipping trailer write");
        }

        Ok(self.frames_written)
    }
}

/// Anything that can accept a decoded (and possibly redacted) frame at a
/// given pts, in the order C7 decides to hand them over. `EncoderHandle` is
/// the production sink; tests substitute a recording sink to exercise the
/// reorder buffer's invariants without a real libav encoder.
pub trait FrameSink {
    fn write_frame(&mut self, raw: &mut ffmpeg::util::frame::video::Video, pts: i64) -> Result<()>;
}

impl FrameSink for EncoderHandle {
    fn write_frame(&mut self, raw: &mut ffmpeg::util::frame::video::Video, pts: i64) -> Result<()> {
        self.write(raw, pts)
    }
}

/// Drives C7: pops the inference channel, reassembles in pts order, writes
/// to `sink`. Returns `(frames_encoded, frames_dropped_invalid)`.
pub fn run_reorder_and_encode<S: FrameSink>(
    infer_rx: &BoundedChannel<PipelineFrame>,
    sink: &mut S,
    metrics: &Metrics,
) -> Result<(u64, u64)> {
    let mut buffer: BTreeMap<u64, PipelineFrame> = BTreeMap::new();
    let mut next_pts: u64 = 0;
    let mut frames_encoded = 0u64;
    let mut frames_dropped = 0u64;

    loop {
        let payload = match infer_rx.pop() {
            Some(p) => p,
            None => break,
        };
        if buffer.contains_key(&payload.pts) {
            // A duplicate pts in the reorder buffer means an upstream stage
            // violated the dense/unique pts contract — not a per-frame
            // recoverable case, abort the run rather than silently overwrite.
            anyhow::bail!("duplicate pts {} in reorder buffer", payload.pts);
        }
        buffer.insert(payload.pts, payload);

        while let Some(payload) = buffer.remove(&next_pts) {
            if payload.valid {
                let mut raw = payload.raw_frame;
                if let Err(e) = sink.write_frame(&mut raw, next_pts as i64) {
                    // An encoder write error is per-frame recoverable: log
                    // and skip, preserving pts ordering, rather than
                    // aborting the whole reorder/encode stage.
                    log::warn!("[encode] write failed at pts={next_pts}, skipping frame: {e:#}");
                    frames_dropped += 1;
                    metrics.incr_dropped_invalid();
                } else {
                    frames_encoded += 1;
                    metrics.incr_encoded();
                }
            } else {
                frames_dropped += 1;
                metrics.incr_dropped_invalid();
            }
            next_pts += 1;
        }
    }

    // Drain any residual buffer in ascending pts order — covers the case
    // where the channel drained with a gap still unfilled, which shouldn't
    // happen in practice but is handled defensively rather than silently
    // dropping tail frames.
    for (pts, payload) in buffer.into_iter() {
        if payload.valid {
            let mut raw = payload.raw_frame;
            if let Err(e) = sink.write_frame(&mut raw, pts as i64) {
                log::warn!("[encode] write failed at pts={pts}, skipping frame: {e:#}");
                frames_dropped += 1;
                metrics.incr_dropped_invalid();
            } else {
                frames_encoded += 1;
                metrics.incr_encoded();
            }
        } else {
            frames_dropped += 1;
            metrics.incr_dropped_invalid();
        }
    }

    Ok((frames_encoded, frames_dropped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use redline_core::FramePayload;
    use std::sync::Mutex;

    fn raw_frame() -> ffmpeg::util::frame::video::Video {
        ffmpeg::util::frame::video::Video::new(Pixel::YUV420P, 4, 4)
    }

    fn payload(pts: u64) -> PipelineFrame {
        FramePayload::new(raw_frame(), raw_frame(), pts)
    }

    struct RecordingSink {
        order: Mutex<Vec<i64>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self { order: Mutex::new(Vec::new()) }
        }
    }

    impl FrameSink for RecordingSink {
        fn write_frame(&mut self, _raw: &mut ffmpeg::util::frame::video::Video, pts: i64) -> Result<()> {
            self.order.lock().unwrap().push(pts);
            Ok(())
        }
    }

    /// Fails every `n`th write; used to exercise the per-frame-recoverable
    /// encoder-write-error path without a real libav encoder.
    struct FlakySink {
        fail_every: u64,
        calls: u64,
        order: Vec<i64>,
    }

    impl FrameSink for FlakySink {
        fn write_frame(&mut self, _raw: &mut ffmpeg::util::frame::video::Video, pts: i64) -> Result<()> {
            self.calls += 1;
            if self.calls % self.fail_every == 0 {
                anyhow::bail!("simulated encoder write failure");
            }
            self.order.push(pts);
            Ok(())
        }
    }

    #[test]
    fn duplicate_pts_in_reorder_buffer_is_fatal() {
        let infer_ch = BoundedChannel::<PipelineFrame>::new(4);
        infer_ch.push(payload(0));
        infer_ch.push(payload(0)); // duplicate pts — invariant violation
        infer_ch.close();

        let metrics = Metrics::new();
        let mut sink = RecordingSink::new();
        let result = run_reorder_and_encode(&infer_ch, &mut sink, &metrics);
        assert!(result.is_err());
    }

    #[test]
    fn encoder_write_failure_is_skipped_not_fatal() {
        let infer_ch = BoundedChannel::<PipelineFrame>::new(8);
        for pts in 0..5u64 {
            infer_ch.push(payload(pts));
        }
        infer_ch.close();

        let metrics = Metrics::new();
        let mut sink = FlakySink { fail_every: 3, calls: 0, order: Vec::new() };
        let (encoded, dropped) = run_reorder_and_encode(&infer_ch, &mut sink, &metrics).unwrap();

        // pts 2 (the 3rd write) fails and is skipped; the rest still encode
        // in order, and pts tracking isn't disturbed by the failure.
        assert_eq!(encoded, 4);
        assert_eq!(dropped, 1);
        assert_eq!(sink.order, vec![0, 1, 3, 4]);
    }
}
