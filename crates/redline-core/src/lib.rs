// crates/redline-core/src/lib.rs

pub mod channel;
pub mod frame;
pub mod geometry;
pub mod metrics;

pub use channel::BoundedChannel;
pub use frame::{Detection, FramePayload, Mask};
pub use geometry::Rect;
pub use metrics::Metrics;
