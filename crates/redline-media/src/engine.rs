// crates/redline-media/src/engine.rs
//
// Inference engines and the pool that owns one instance per worker.
//
// Both engines are concrete ONNX Runtime graphs loaded via `ort`, following
// the same Session::builder() construction used for CPU inference elsewhere
// in this stack. Class filtering (person-only for segmentation) happens in
// the inference stage, not here — an engine's job is strictly
// `infer(frame) -> detections`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ndarray::Array4;
use ort::execution_providers::CPUExecutionProvider;
use ort::session::Session;
use redline_core::{Detection, Mask, Rect};
use tokenizers::Tokenizer;

/// Static info reported to the metrics registry; never affects inference.
#[derive(Debug, Clone)]
pub struct EngineInfo {
    pub backend:             String,
    pub precision:           String,
    pub tensor_w:            i64,
    pub tensor_h:            i64,
    pub optimal_intra_threads: u32,
}

/// Engine kind selected on the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Segmentation,
    TextGrounded,
}

impl EngineKind {
    pub fn from_flag(s: &str) -> Result<Self> {
        match s {
            "seg"  => Ok(EngineKind::Segmentation),
            "text" => Ok(EngineKind::TextGrounded),
            other  => anyhow::bail!("unknown --engine value '{other}' (expected seg|text)"),
        }
    }
}

/// One worker's private inference engine. Not `Send + Sync` by contract —
/// `EnginePool` enforces the 1:1 worker/engine mapping instead of sharing.
pub trait Engine {
    /// Run inference on a BGR24 frame of `(width, height)`. `prompt` is only
    /// consulted by text-grounded engines.
    fn infer(&mut self, bgr: &[u8], width: u32, height: u32, prompt: &str) -> Result<Vec<Detection>>;
    fn info(&self) -> EngineInfo;
}

/// HxWx3 BGR bytes, row-major, no stride padding, letterboxed into a square
/// `size x size` CHW float32 tensor normalized to [0,1]. Returns the tensor
/// plus the scale and padding needed to map model-space boxes back to frame
/// space.
struct Letterbox {
    tensor: Array4<f32>,
    scale:  f32,
    pad_x:  i32,
    pad_y:  i32,
}

fn letterbox_bgr(bgr: &[u8], width: u32, height: u32, size: u32) -> Letterbox {
    let (w, h, size) = (width as usize, height as usize, size as usize);
    let scale = (size as f32 / h as f32).min(size as f32 / w as f32);
    let new_w = ((w as f32) * scale).round() as usize;
    let new_h = ((h as f32) * scale).round() as usize;
    let pad_x = (size - new_w) / 2;
    let pad_y = (size - new_h) / 2;

    let mut tensor = Array4::<f32>::from_elem((1, 3, size, size), 0.5);
    let scale_h = h as f32 / new_h.max(1) as f32;
    let scale_w = w as f32 / new_w.max(1) as f32;

    for dy in 0..new_h {
        let sy = (((dy as f32 + 0.5) * scale_h) as usize).min(h.saturating_sub(1));
        for dx in 0..new_w {
            let sx = (((dx as f32 + 0.5) * scale_w) as usize).min(w.saturating_sub(1));
            let src = (sy * w + sx) * 3;
            // BGR -> RGB, normalize to [0,1].
            let b = bgr[src] as f32 / 255.0;
            let g = bgr[src + 1] as f32 / 255.0;
            let r = bgr[src + 2] as f32 / 255.0;
            tensor[[0, 0, pad_y + dy, pad_x + dx]] = r;
            tensor[[0, 1, pad_y + dy, pad_x + dx]] = g;
            tensor[[0, 2, pad_y + dy, pad_x + dx]] = b;
        }
    }

    Letterbox { tensor, scale, pad_x: pad_x as i32, pad_y: pad_y as i32 }
}

impl Letterbox {
    /// Map a box in letterboxed tensor coordinates back to frame coordinates.
    fn unletterbox_rect(&self, x0: f32, y0: f32, x1: f32, y1: f32) -> Rect {
        let fx0 = (x0 - self.pad_x as f32) / self.scale;
        let fy0 = (y0 - self.pad_y as f32) / self.scale;
        let fx1 = (x1 - self.pad_x as f32) / self.scale;
        let fy1 = (y1 - self.pad_y as f32) / self.scale;
        Rect::new(fx0.round() as i32, fy0.round() as i32,
                  (fx1 - fx0).round() as i32, (fy1 - fy0).round() as i32)
    }
}

// ── Segmentation engine ──────────────────────────────────────────────────────

pub struct SegmentationEngine {
    session:     Session,
    tensor_size: u32,
    confidence:  f32,
    intra_threads: u32,
}

const SEG_TENSOR_SIZE: u32 = 640;
const SEG_CONFIDENCE: f32 = 0.35;

impl SegmentationEngine {
    pub fn load(model_path: &Path, intra_threads: u32) -> Result<Self> {
        let session = Session::builder()
            .context("build ort session builder")?
            .with_intra_threads(intra_threads as usize)
            .context("set intra-op thread count")?
            .with_execution_providers([CPUExecutionProvider::default().build()])
            .context("register CPU execution provider")?
            .commit_from_file(model_path)
            .with_context(|| format!("load segmentation model '{}'", model_path.display()))?;

        Ok(Self { session, tensor_size: SEG_TENSOR_SIZE, confidence: SEG_CONFIDENCE, intra_threads })
    }
}

impl Engine for SegmentationEngine {
    fn infer(&mut self, bgr: &[u8], width: u32, height: u32, _prompt: &str) -> Result<Vec<Detection>> {
        let lb = letterbox_bgr(bgr, width, height, self.tensor_size);
        let shape = lb.tensor.shape().to_vec();
        let data: Vec<f32> = lb.tensor.iter().copied().collect();
        let input = ort::value::Value::from_array((shape.as_slice(), data))
            .context("build input tensor")?;

        let outputs = self.session.run(ort::inputs!["images" => input])
            .context("run segmentation inference")?;

        // Output layout: boxes [1, N, 6] (x0,y0,x1,y1,conf,class) and
        // proto masks [1, N, mask_h, mask_w] packed 0/1 per pixel,
        // matching this stack's YOLOv8-seg ONNX export convention.
        let boxes_name = outputs.keys().next().context("no detection output from segmentation model")?;
        let (boxes_shape, boxes_data) = outputs[boxes_name].try_extract_tensor::<f32>()
            .context("extract detection tensor")?;
        let boxes_data = boxes_data.to_vec();

        let mask_name = outputs.keys().nth(1);
        let mask_tensor = mask_name.map(|n| outputs[n].try_extract_tensor::<f32>());

        let n = boxes_shape.get(1).copied().unwrap_or(0) as usize;
        let mut detections = Vec::new();

        for i in 0..n {
            let base = i * 6;
            if base + 5 >= boxes_data.len() { break; }
            let (x0, y0, x1, y1, conf, class_id) = (
                boxes_data[base], boxes_data[base + 1],
                boxes_data[base + 2], boxes_data[base + 3],
                boxes_data[base + 4], boxes_data[base + 5],
            );
            if conf < self.confidence { continue; }

            let rect = lb.unletterbox_rect(x0, y0, x1, y1);
            if rect.area() <= 0 { continue; }

            let mask = match &mask_tensor {
                Some(Ok((mshape, mdata))) => {
                    let mh = *mshape.get(2).unwrap_or(&0) as i32;
                    let mw = *mshape.get(3).unwrap_or(&0) as i32;
                    if mh > 0 && mw > 0 {
                        let stride = (mh as usize) * (mw as usize);
                        let start = i * stride;
                        let packed: Vec<u8> = mdata
                            .to_vec()
                            .get(start..start + stride)
                            .map(|s| s.iter().map(|&v| if v > 0.5 { 255 } else { 0 }).collect())
                            .unwrap_or_else(|| vec![255u8; stride]);
                        Mask::new(mw, mh, packed)
                    } else {
                        Mask::new(rect.w.max(1), rect.h.max(1), vec![255u8; (rect.w.max(1) * rect.h.max(1)) as usize])
                    }
                }
                _ => Mask::new(rect.w.max(1), rect.h.max(1), vec![255u8; (rect.w.max(1) * rect.h.max(1)) as usize]),
            };

            detections.push(Detection::Segmentation { class_id: class_id.round() as i32, rect, mask });
        }

        Ok(detections)
    }

    fn info(&self) -> EngineInfo {
        EngineInfo {
            backend: "ort/CPU".into(),
            precision: "FP32".into(),
            tensor_w: self.tensor_size as i64,
            tensor_h: self.tensor_size as i64,
            optimal_intra_threads: self.intra_threads,
        }
    }
}

// ── Text-grounded engine ─────────────────────────────────────────────────────

const TEXT_TENSOR_SIZE: u32 = 800;
const TEXT_CONFIDENCE: f32 = 0.3;
const TEXT_MAX_TOKENS: usize = 64;

pub struct TextGroundedEngine {
    session:      Session,
    tokenizer:    Tokenizer,
    tensor_size:  u32,
    confidence:   f32,
    intra_threads: u32,
}

impl TextGroundedEngine {
    pub fn load(model_path: &Path, intra_threads: u32) -> Result<Self> {
        let vocab_path = vocab_path_for(model_path);
        let tokenizer = Tokenizer::from_file(&vocab_path)
            .map_err(|e| anyhow::anyhow!("load tokenizer from '{}': {e}", vocab_path.display()))?;

        let session = Session::builder()
            .context("build ort session builder")?
            .with_intra_threads(intra_threads as usize)
            .context("set intra-op thread count")?
            .with_execution_providers([CPUExecutionProvider::default().build()])
            .context("register CPU execution provider")?
            .commit_from_file(model_path)
            .with_context(|| format!("load text-grounded model '{}'", model_path.display()))?;

        Ok(Self { session, tokenizer, tensor_size: TEXT_TENSOR_SIZE, confidence: TEXT_CONFIDENCE, intra_threads })
    }
}

fn vocab_path_for(model_path: &Path) -> PathBuf {
    let mut p = model_path.as_os_str().to_owned();
    p.push(".vocab.txt");
    PathBuf::from(p)
}

impl Engine for TextGroundedEngine {
    fn infer(&mut self, bgr: &[u8], width: u32, height: u32, prompt: &str) -> Result<Vec<Detection>> {
        let lb = letterbox_bgr(bgr, width, height, self.tensor_size);

        let encoding = self.tokenizer.encode(prompt, true)
            .map_err(|e| anyhow::anyhow!("tokenize prompt '{prompt}': {e}"))?;
        let mut ids: Vec<i64> = encoding.get_ids().iter().map(|&x| x as i64).collect();
        let mut type_ids: Vec<i64> = encoding.get_type_ids().iter().map(|&x| x as i64).collect();
        let mut attn: Vec<i64> = encoding.get_attention_mask().iter().map(|&x| x as i64).collect();
        ids.resize(TEXT_MAX_TOKENS, 0);
        type_ids.resize(TEXT_MAX_TOKENS, 0);
        attn.resize(TEXT_MAX_TOKENS, 0);

        let pixel_shape = lb.tensor.shape().to_vec();
        let pixel_data: Vec<f32> = lb.tensor.iter().copied().collect();
        let pixel_values = ort::value::Value::from_array((pixel_shape.as_slice(), pixel_data))
            .context("build pixel_values tensor")?;

        let seq_shape = vec![1usize, TEXT_MAX_TOKENS];
        let input_ids = ort::value::Value::from_array((seq_shape.as_slice(), ids))
            .context("build input_ids tensor")?;
        let token_type_ids = ort::value::Value::from_array((seq_shape.as_slice(), type_ids))
            .context("build token_type_ids tensor")?;
        let attention_mask = ort::value::Value::from_array((seq_shape.as_slice(), attn.clone()))
            .context("build attention_mask tensor")?;
        let pixel_mask_shape = vec![1usize, self.tensor_size as usize, self.tensor_size as usize];
        let pixel_mask_data: Vec<i64> = vec![1i64; self.tensor_size as usize * self.tensor_size as usize];
        let pixel_mask = ort::value::Value::from_array((pixel_mask_shape.as_slice(), pixel_mask_data))
            .context("build pixel_mask tensor")?;

        let outputs = self.session.run(ort::inputs![
            "pixel_values" => pixel_values,
            "input_ids" => input_ids,
            "token_type_ids" => token_type_ids,
            "attention_mask" => attention_mask,
            "pixel_mask" => pixel_mask,
        ]).context("run text-grounded inference")?;

        let logits_name = outputs.keys().find(|k| k.contains("logits"))
            .or_else(|| outputs.keys().next())
            .context("no logits output from text-grounded model")?;
        let boxes_name = outputs.keys().find(|k| k.contains("box"))
            .context("no pred_boxes output from text-grounded model")?;

        let (logits_shape, logits_data) = outputs[logits_name].try_extract_tensor::<f32>()
            .context("extract logits tensor")?;
        let (_boxes_shape, boxes_data) = outputs[boxes_name].try_extract_tensor::<f32>()
            .context("extract pred_boxes tensor")?;
        let logits_data = logits_data.to_vec();
        let boxes_data = boxes_data.to_vec();

        let num_queries = logits_shape.get(1).copied().unwrap_or(0) as usize;
        let num_classes = logits_shape.get(2).copied().unwrap_or(1) as usize;

        let mut detections = Vec::new();
        for q in 0..num_queries {
            let logit_base = q * num_classes;
            let score = logits_data.get(logit_base..logit_base + num_classes)
                .map(|row| row.iter().cloned().fold(f32::MIN, f32::max))
                .unwrap_or(f32::MIN);
            let score = 1.0 / (1.0 + (-score).exp()); // sigmoid
            if score < self.confidence { continue; }

            let bbase = q * 4;
            if bbase + 3 >= boxes_data.len() { continue; }
            // Grounding-DINO boxes are normalized (cx, cy, w, h) in [0,1].
            let (cx, cy, bw, bh) = (boxes_data[bbase], boxes_data[bbase + 1],
                                     boxes_data[bbase + 2], boxes_data[bbase + 3]);
            let size = self.tensor_size as f32;
            let x0 = (cx - bw / 2.0) * size;
            let y0 = (cy - bh / 2.0) * size;
            let x1 = (cx + bw / 2.0) * size;
            let y1 = (cy + bh / 2.0) * size;

            let rect = lb.unletterbox_rect(x0, y0, x1, y1);
            if rect.area() <= 0 { continue; }

            detections.push(Detection::TextGrounded { rect, text: prompt.to_string(), score });
        }

        Ok(detections)
    }

    fn info(&self) -> EngineInfo {
        EngineInfo {
            backend: "ort/CPU".into(),
            precision: "FP32".into(),
            tensor_w: self.tensor_size as i64,
            tensor_h: self.tensor_size as i64,
            optimal_intra_threads: self.intra_threads,
        }
    }
}

// ── Engine pool ───────────────────────────────────────────────────────────────

/// Owns N independently-constructed engine instances, one per worker. Workers
/// never migrate between instances — enforced by construction, not a lock.
pub struct EnginePool {
    engines: Vec<Box<dyn Engine + Send>>,
}

impl EnginePool {
    /// Builds the pool's worker count and per-engine intra-op thread count
    /// from hardware concurrency: segmentation favors more workers with
    /// single-threaded engines (light per-frame compute); the heavier
    /// text-grounded model favors fewer workers with wide intra-op
    /// parallelism each (self-attention benefits from it).
    pub fn new(kind: EngineKind, model_path: &Path) -> Result<Self> {
        let hw = num_cpus::get().max(1) as u32;
        let (n, intra) = match kind {
            EngineKind::Segmentation => (1u32.max(hw / 2), 1u32),
            EngineKind::TextGrounded => {
                let n = 1u32.max(hw / 10);
                (n, 1u32.max(hw / n))
            }
        };

        let mut engines: Vec<Box<dyn Engine + Send>> = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let engine: Box<dyn Engine + Send> = match kind {
                EngineKind::Segmentation => Box::new(SegmentationEngine::load(model_path, intra)?),
                EngineKind::TextGrounded => Box::new(TextGroundedEngine::load(model_path, intra)?),
            };
            engines.push(engine);
        }

        Ok(Self { engines })
    }

    pub fn num_workers(&self) -> usize {
        self.engines.len()
    }

    pub fn hw_concurrency(&self) -> u32 {
        num_cpus::get().max(1) as u32
    }

    pub fn into_engines(self) -> Vec<Box<dyn Engine + Send>> {
        self.engines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_kind_parses_flag() {
        assert!(matches!(EngineKind::from_flag("seg").unwrap(), EngineKind::Segmentation));
        assert!(matches!(EngineKind::from_flag("text").unwrap(), EngineKind::TextGrounded));
        assert!(EngineKind::from_flag("bogus").is_err());
    }

    #[test]
    fn vocab_path_appends_suffix() {
        let p = vocab_path_for(Path::new("/models/grounding.onnx"));
        assert_eq!(p, PathBuf::from("/models/grounding.onnx.vocab.txt"));
    }

    #[test]
    fn letterbox_centers_non_square_frame() {
        let bgr = vec![128u8; 100 * 50 * 3];
        let lb = letterbox_bgr(&bgr, 100, 50, 64);
        assert!(lb.pad_x >= 0 && lb.pad_y >= 0);
        // Wider-than-tall source should pad vertically, not horizontally.
        assert!(lb.pad_y > lb.pad_x);
    }
}
