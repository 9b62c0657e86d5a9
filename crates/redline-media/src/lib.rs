// crates/redline-media/src/lib.rs

pub mod decode;
pub mod encode;
pub mod engine;
pub mod infer;
pub mod pipeline;
mod helpers; // internal — not pub, not re-exported

pub use engine::{Engine, EngineInfo, EngineKind, EnginePool};
pub use pipeline::{PipelineConfig, PipelineReport, run_pipeline};

use ffmpeg_the_third::util::frame::video::Video as FfmpegFrame;
use redline_core::FramePayload;

/// This crate's concrete instantiation of `redline_core::FramePayload`: both
/// the decoder's native frame and the BGR inference view are
/// `ffmpeg_the_third` video frames.
pub type PipelineFrame = FramePayload<FfmpegFrame, FfmpegFrame>;
