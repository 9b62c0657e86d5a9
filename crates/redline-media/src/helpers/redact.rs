// crates/redline-media/src/helpers/redact.rs
//
// Luma-plane redaction routines. Both routines mutate the decoder's native
// YUV frame in place so the encoder sees modified luma without a BGR→YUV
// re-conversion round-trip — the `bgr` view was only an inference input and
// is discarded after this stage.
//
// Stride-aware plane access follows the same convention as this codebase's
// existing YUV plane helpers: `stride(0)`/`data_mut(0)` for the Y plane,
// rows addressed as `row * stride`.

use ffmpeg_the_third::util::frame::video::Video as VideoFrame;
use redline_core::{Detection, Rect};

/// The luma plane's own bounds.
fn frame_rect(w: i32, h: i32) -> Rect {
    Rect::new(0, 0, w, h)
}

/// Zero the luma plane's pixels under `mask` within `clipped_box`, optionally
/// also zeroing U/V at the corresponding downsampled coordinates
/// (`--zero-chroma`: fully zeroed redaction instead of luma-only).
pub fn apply_segmentation_redaction(raw: &mut VideoFrame, detections: &[Detection], zero_chroma: bool) {
    let (w, h) = (raw.width() as i32, raw.height() as i32);
    let frame = frame_rect(w, h);

    for det in detections {
        let Detection::Segmentation { class_id, rect: box_, mask } = det else { continue };
        if *class_id != 0 { continue; } // person only
        if mask.data.is_empty() { continue; }

        let clipped = frame.intersect(box_);
        if clipped.area() == 0 { continue; }

        // Map the clipped box into mask-local coordinates; skip if the mask
        // doesn't cover the clipped region (guards against a malformed mask).
        let local = clipped.translated((box_.x, box_.y));
        if local.right() > mask.w || local.bottom() > mask.h || local.x < 0 || local.y < 0 {
            continue;
        }

        paint_luma_masked(raw, &clipped, &local, mask);
        if zero_chroma {
            paint_chroma_masked(raw, &clipped, &local, mask);
        }
    }
}

/// Draw a black rectangle outline (stroke width 4) on the luma plane at each
/// detection's clipped box. No class filter — every text-grounded match is
/// redacted.
pub fn apply_text_grounded_redaction(raw: &mut VideoFrame, detections: &[Detection]) {
    const STROKE: i32 = 4;
    let (w, h) = (raw.width() as i32, raw.height() as i32);
    let frame = frame_rect(w, h);

    for det in detections {
        let Detection::TextGrounded { rect: box_, .. } = det else { continue };
        let clipped = frame.intersect(box_);
        if clipped.area() == 0 { continue; }
        draw_outline_luma(raw, &clipped, STROKE);
    }
}

fn paint_luma_masked(raw: &mut VideoFrame, clipped: &Rect, local: &Rect, mask: &redline_core::Mask) {
    let stride = raw.stride(0);
    let data = raw.data_mut(0);
    for y in 0..clipped.h {
        let row_start = ((clipped.y + y) as usize) * stride;
        for x in 0..clipped.w {
            if mask.at(local.x + x, local.y + y) {
                let idx = row_start + (clipped.x + x) as usize;
                if idx < data.len() {
                    data[idx] = 0;
                }
            }
        }
    }
}

/// Zero U/V at `clipped_box / 2` (4:2:0 subsampling halves both dimensions).
fn paint_chroma_masked(raw: &mut VideoFrame, clipped: &Rect, local: &Rect, mask: &redline_core::Mask) {
    for plane in [1usize, 2usize] {
        let stride = raw.stride(plane);
        let data = raw.data_mut(plane);
        let (cx, cy, cw, ch) = (clipped.x / 2, clipped.y / 2, clipped.w.div_ceil(2), clipped.h.div_ceil(2));
        for y in 0..ch {
            let row_start = ((cy + y) as usize) * stride;
            for x in 0..cw {
                // Sample the mask at the corresponding full-resolution pixel
                // (top-left of each 2x2 luma block) to decide chroma coverage.
                if mask.at(local.x + x * 2, local.y + y * 2) {
                    let idx = row_start + (cx + x) as usize;
                    if idx < data.len() {
                        data[idx] = 0;
                    }
                }
            }
        }
    }
}

fn draw_outline_luma(raw: &mut VideoFrame, clipped: &Rect, stroke: i32) {
    let stride = raw.stride(0);
    let data = raw.data_mut(0);
    let (x0, y0, x1, y1) = (clipped.x, clipped.y, clipped.right(), clipped.bottom());

    let mut set = |x: i32, y: i32| {
        if x < 0 || y < 0 { return; }
        let idx = (y as usize) * stride + x as usize;
        if idx < data.len() {
            data[idx] = 0;
        }
    };

    for y in y0..y1 {
        for t in 0..stroke {
            set(x0 + t, y);
            set(x1 - 1 - t, y);
        }
    }
    for x in x0..x1 {
        for t in 0..stroke {
            set(x, y0 + t);
            set(x, y1 - 1 - t);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redline_core::Mask;

    fn black_frame(w: u32, h: u32) -> VideoFrame {
        let mut f = VideoFrame::new(ffmpeg_the_third::format::Pixel::YUV420P, w, h);
        for plane in 0..3 {
            let stride = f.stride(plane);
            let data = f.data_mut(plane);
            data[..stride * (h as usize)].fill(200);
        }
        f
    }

    #[test]
    fn segmentation_redaction_clips_out_of_bounds_box() {
        let mut frame = black_frame(80, 80);
        let mask = Mask::new(50, 50, vec![255u8; 50 * 50]);
        let dets = vec![Detection::Segmentation {
            class_id: 0,
            rect: Rect::new(100, 100, 50, 50), // fully outside an 80x80 frame
            mask,
        }];
        apply_segmentation_redaction(&mut frame, &dets, false);
        // No mutation should occur: intersection is empty.
        let stride = frame.stride(0);
        let data = frame.data(0);
        assert!(data[..stride * 80].iter().all(|&b| b == 200));
    }

    #[test]
    fn segmentation_redaction_paints_intersection_only() {
        let mut frame = black_frame(140, 140);
        let mask = Mask::new(50, 50, vec![255u8; 50 * 50]);
        let dets = vec![Detection::Segmentation {
            class_id: 0,
            rect: Rect::new(100, 100, 50, 50), // extends past right/bottom
            mask,
        }];
        apply_segmentation_redaction(&mut frame, &dets, false);
        let stride = frame.stride(0);
        let data = frame.data(0);
        // A pixel inside the clipped intersection (100..140, 100..140) is zeroed.
        assert_eq!(data[120 * stride + 120], 0);
        // A pixel outside the box is untouched.
        assert_eq!(data[10 * stride + 10], 200);
    }

    #[test]
    fn text_grounded_no_match_leaves_luma_untouched() {
        let mut frame = black_frame(64, 64);
        let before = frame.data(0).to_vec();
        apply_text_grounded_redaction(&mut frame, &[]);
        assert_eq!(frame.data(0), before.as_slice());
    }
}
