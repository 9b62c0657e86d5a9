// crates/redline-media/src/decode.rs
//
// The decoder stage. Single producer — pulls frames from the source file,
// assigns dense monotonic PTS at decode time (never the container's raw
// timestamp, since some inputs yield non-dense or repeated container PTS
// values), and pushes into the decode channel.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use ffmpeg_the_third as ffmpeg;
use ffmpeg::format::{input, Pixel};
use ffmpeg::media::Type;
use ffmpeg::software::scaling::{context::Context as SwsContext, flag::Flags};
use ffmpeg::util::frame::video::Video as VideoFrame;
use redline_core::channel::PushOutcome;
use redline_core::{BoundedChannel, FramePayload, Metrics};

use crate::PipelineFrame;

pub struct SourceInfo {
    pub width:  u32,
    pub height: u32,
    pub video_stream_index: usize,
    pub time_base: ffmpeg::Rational,
}

/// Opens `path` and returns its video stream's dimensions and index, without
/// decoding any frames. Used by the orchestrator to size the encoder before
/// the decoder thread starts.
pub fn probe_source(path: &Path) -> Result<SourceInfo> {
    let ictx = input(path).with_context(|| format!("open input '{}'", path.display()))?;
    let stream = ictx.streams().best(Type::Video)
        .ok_or_else(|| anyhow::anyhow!("no video stream in '{}'", path.display()))?;
    let video_stream_index = stream.index();
    let time_base = stream.time_base();

    let dec_ctx = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
        .context("build decoder context from stream parameters")?;
    let decoder = dec_ctx.decoder().video().context("open video decoder")?;

    Ok(SourceInfo { width: decoder.width(), height: decoder.height(), video_stream_index, time_base })
}

/// RAII release guard — closes the decode channel on every exit path (normal
/// EOF, cap reached, rejected push, or an `?`-propagated error), so a
/// mid-stream failure can never leave downstream workers parked in
/// `decode_rx.pop()` forever.
struct CloseOnDrop<'a>(&'a BoundedChannel<PipelineFrame>);

impl Drop for CloseOnDrop<'_> {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Runs the decode loop to completion on the calling thread. Intended to be
/// spawned on its own `std::thread`. `frame_cap`, if set, stops the stage
/// after that many frames regardless of EOF (`--checkframes`).
///
/// On any decoder error the stage logs and stops; `CloseOnDrop` guarantees
/// the channel closes regardless of whether the loop below returns via `?`
/// or runs to completion, draining the pipeline gracefully rather than
/// leaving downstream workers blocked forever.
pub fn run_decoder(
    path: &Path,
    decode_tx: Arc<BoundedChannel<PipelineFrame>>,
    frame_cap: Option<u64>,
    metrics: Arc<Metrics>,
) -> Result<u64> {
    let _close_guard = CloseOnDrop(&decode_tx);
    decode_loop(path, &decode_tx, frame_cap, &metrics)
}

fn decode_loop(
    path: &Path,
    decode_tx: &BoundedChannel<PipelineFrame>,
    frame_cap: Option<u64>,
    metrics: &Metrics,
) -> Result<u64> {
    let mut ictx = input(path).with_context(|| format!("open input '{}'", path.display()))?;
    let video_stream_index = ictx.streams().best(Type::Video)
        .ok_or_else(|| anyhow::anyhow!("no video stream in '{}'", path.display()))?
        .index();

    // Second context for decoder construction — Parameters borrows from the
    // first context's Stream, so building the decoder from the same ictx
    // used for packet iteration would conflict.
    let ictx2 = input(path).with_context(|| format!("reopen input '{}'", path.display()))?;
    let stream2 = ictx2.stream(video_stream_index)
        .ok_or_else(|| anyhow::anyhow!("stream {video_stream_index} missing on reopen"))?;
    let dec_ctx = ffmpeg::codec::context::Context::from_parameters(stream2.parameters())
        .context("build decoder context")?;
    let mut decoder = dec_ctx.decoder().video().context("open video decoder")?;

    let mut scaler = SwsContext::get(
        decoder.format(), decoder.width(), decoder.height(),
        Pixel::BGR24, decoder.width(), decoder.height(),
        Flags::BILINEAR,
    ).context("build BGR scaler")?;

    let mut pts: u64 = 0;

    'packets: for result in ictx.packets() {
        // A packet-read error is treated as a terminal decoder failure: log and
        // stop the stage rather than propagating via `?`, which would skip
        // straight past the channel close below on a raw `Result::Err` path
        // were it not for `CloseOnDrop` — stopping explicitly here also keeps
        // the frames decoded so far in `pts` instead of discarding them.
        let (stream, packet) = match result {
            Ok(sp) => sp,
            Err(e) => {
                log::warn!("[decode] packet read failed at pts={pts}, stopping decode stage: {e}");
                break 'packets;
            }
        };
        if stream.index() != video_stream_index { continue; }
        if decoder.send_packet(&packet).is_err() {
            log::warn!("[decode] send_packet failed, stopping decode stage");
            break 'packets;
        }

        let mut decoded = VideoFrame::empty();
        loop {
            let t_frame = std::time::Instant::now();
            let received = decoder.receive_frame(&mut decoded).is_ok();
            if !received { break; }
            metrics.add_time_to_frame_ms(t_frame.elapsed().as_secs_f64() * 1000.0);

            let mut bgr = VideoFrame::empty();
            let t_conv = std::time::Instant::now();
            let scaled = scaler.run(&decoded, &mut bgr);
            metrics.add_time_to_conversion_ms(t_conv.elapsed().as_secs_f64() * 1000.0);
            if scaled.is_err() {
                log::warn!("[decode] scale to BGR failed at pts={pts}, skipping frame");
                continue;
            }

            // `decoded` is reused by the decoder on the next receive_frame
            // call; clone it so ownership transfers cleanly through the
            // channel and the decoder is free to overwrite its own buffer.
            let raw_frame = decoded.clone();
            let payload = FramePayload::new(raw_frame, bgr, pts);

            if decode_tx.push(payload) == PushOutcome::Rejected {
                log::info!("[decode] decode channel closed, stopping at pts={pts}");
                break 'packets;
            }
            metrics.incr_decoded();

            pts += 1;
            if let Some(cap) = frame_cap {
                if pts >= cap {
                    log::info!("[decode] reached --checkframes cap ({cap}), stopping");
                    break 'packets;
                }
            }
        }
    }

    Ok(pts)
}
