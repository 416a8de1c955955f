//! Segment Anything backed by `candle-transformers`.

use std::cell::OnceCell;

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::segment_anything::sam::{self, Sam};
use image::{imageops, RgbImage};
use reqwest::Client;
use tracing::{info, warn};

use crate::{
    config::{Config, GeneratorConfig, ModelType},
    download::ensure_weights,
    mask::{Mask, RegionMode},
    model::{LabeledPoint, Prompt, ScoredMask, SegmentModel},
};

/// Mask logits above this value are inside the object.
const MASK_THRESHOLD: f32 = 0.0;

/// candle's generator leaves crop-layer masks in crop-local coordinates and
/// does not say which crop a mask came from, so only the full-image layer runs.
const CROP_N_LAYERS: usize = 0;
const CROP_OVERLAP_RATIO: f64 = 512.0 / 1500.0;
const CROP_N_POINTS_DOWNSCALE_FACTOR: usize = 1;

pub struct SamModel {
    sam: Sam,
    device: Device,
    generator: GeneratorConfig,
}

/// Image state for one `set_image` call.
pub struct SamEmbedding {
    /// `(3, h, w)` u8 tensor, longest side resized to the model input size.
    image: Tensor,
    /// Encoder output, computed on the first prompt. Automatic generation
    /// encodes on its own and never fills it.
    embeddings: OnceCell<Tensor>,
    resized: (usize, usize),
    original: (usize, usize),
}

impl SamModel {
    /// Downloads the weights if needed and loads them on the configured device.
    pub async fn initialize(config: &Config) -> Result<Self> {
        let path = config.weights_path();
        let client = Client::new();
        ensure_weights(&client, &path, config.weights_url().as_deref()).await?;

        let device = device(config.cpu)?;
        let model_type = config.model_type;
        let generator = config.generator.clone();
        info!("Loading {model_type} weights from {}", path.display());
        tokio::task::spawn_blocking(move || Self::load(&path, model_type, device, generator))
            .await
            .context("Model loading task failed")?
    }

    pub fn load(
        weights: &std::path::Path,
        model_type: ModelType,
        device: Device,
        generator: GeneratorConfig,
    ) -> Result<Self> {
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, &device)? };
        let sam = match model_type {
            ModelType::VitT => Sam::new_tiny(vb)?,
            ModelType::VitB => Sam::new(768, 12, 12, &[2, 5, 8, 11], vb)?,
            ModelType::VitL => Sam::new(1024, 24, 16, &[5, 11, 17, 23], vb)?,
            ModelType::VitH => Sam::new(1280, 32, 16, &[7, 15, 23, 31], vb)?,
        };
        Ok(Self {
            sam,
            device,
            generator,
        })
    }

    fn image_to_tensor(&self, image: &RgbImage) -> Result<Tensor> {
        let (width, height) = resized_dims(image.width(), image.height());
        let image = imageops::resize(image, width, height, imageops::FilterType::CatmullRom);
        let data = image.into_raw();
        let tensor = Tensor::from_vec(data, (height as usize, width as usize, 3), &self.device)?
            .permute((2, 0, 1))?;
        Ok(tensor)
    }
}

impl SegmentModel for SamModel {
    type Embedding = SamEmbedding;

    fn embed(&self, image: &RgbImage) -> Result<SamEmbedding> {
        let tensor = self.image_to_tensor(image)?;
        let (_c, h, w) = tensor.dims3()?;
        Ok(SamEmbedding {
            image: tensor,
            embeddings: OnceCell::new(),
            resized: (w, h),
            original: (image.width() as usize, image.height() as usize),
        })
    }

    fn decode(
        &self,
        embedding: &SamEmbedding,
        prompt: &Prompt,
        multimask_output: bool,
    ) -> Result<Vec<ScoredMask>> {
        let (orig_w, orig_h) = embedding.original;
        let (w, h) = embedding.resized;

        // The decoder takes coordinates relative to the image size.
        let normalize = |p: &LabeledPoint| (p.x / orig_w as f64, p.y / orig_h as f64, p.foreground);
        let points: Vec<(f64, f64, bool)> = match prompt {
            Prompt::Points(points) => points.iter().map(normalize).collect(),
            Prompt::Box([x1, y1, x2, y2]) => vec![normalize(&LabeledPoint {
                x: (x1 + x2) / 2.0,
                y: (y1 + y2) / 2.0,
                foreground: true,
            })],
        };

        let embeddings = cached(&embedding.embeddings, || {
            Ok(self.sam.embeddings(&embedding.image)?)
        })?;
        let (low_res, iou) =
            self.sam
                .forward_for_embeddings(embeddings, h, w, &points, multimask_output)?;
        let scores = iou.flatten_all()?.to_vec1::<f32>()?;

        let mut masks = padded_to_image(&low_res.get(0)?, embedding.resized, embedding.original)?;
        if let Prompt::Box([x1, y1, x2, y2]) = prompt {
            for mask in masks.iter_mut() {
                mask.clip(*x1, *y1, *x2, *y2);
            }
        }

        Ok(masks
            .into_iter()
            .zip(scores)
            .map(|(mask, score)| ScoredMask { mask, score })
            .collect())
    }

    fn generate(&self, embedding: &SamEmbedding) -> Result<Vec<ScoredMask>> {
        let g = &self.generator;
        let bboxes = self.sam.generate_masks(
            &embedding.image,
            g.points_per_side,
            CROP_N_LAYERS,
            CROP_OVERLAP_RATIO,
            CROP_N_POINTS_DOWNSCALE_FACTOR,
        )?;

        let mut masks = Vec::with_capacity(bboxes.len());
        for bbox in bboxes {
            let decoded = padded_to_image(&bbox.data, embedding.resized, embedding.original)?;
            let Some(mut mask) = decoded.into_iter().next() else {
                continue;
            };
            if g.min_mask_region_area > 0 {
                mask.remove_small_regions(g.min_mask_region_area, RegionMode::Holes);
                mask.remove_small_regions(g.min_mask_region_area, RegionMode::Islands);
            }
            if !mask.is_empty() {
                masks.push(ScoredMask {
                    mask,
                    score: bbox.confidence,
                });
            }
        }
        info!("Generated {} masks", masks.len());
        Ok(masks)
    }
}

/// Maps masks predicted for the zero-padded square model input back onto the
/// image.
///
/// `padded` is `(n, s, s)` or `(s, s)` at any square resolution (the decoder's
/// low-res 256 or the full input size). Only the top-left `resized` region of
/// the upsampled square is image; it is thresholded and scaled to `original`.
fn padded_to_image(
    padded: &Tensor,
    resized: (usize, usize),
    original: (usize, usize),
) -> Result<Vec<Mask>> {
    let padded = match padded.rank() {
        2 => padded.unsqueeze(0)?,
        _ => padded.clone(),
    };
    let (_n, ph, pw) = padded.dims3()?;
    let mut padded = padded.to_dtype(DType::F32)?;
    if (ph, pw) != (sam::IMAGE_SIZE, sam::IMAGE_SIZE) {
        padded = padded
            .unsqueeze(0)?
            .upsample_nearest2d(sam::IMAGE_SIZE, sam::IMAGE_SIZE)?
            .get(0)?;
    }

    let (w, h) = resized;
    let masks = padded
        .i((.., ..h, ..w))?
        .gt(MASK_THRESHOLD)?
        .to_dtype(DType::U8)?
        .to_vec3::<u8>()?;
    masks
        .into_iter()
        .map(|rows| -> Result<Mask> {
            let data = rows.into_iter().flatten().map(|v| v > 0).collect();
            Ok(Mask::from_vec(w, h, data)?.resize(original.0, original.1))
        })
        .collect()
}

/// Returns the cached tensor, computing it on first use.
fn cached(cell: &OnceCell<Tensor>, compute: impl FnOnce() -> Result<Tensor>) -> Result<&Tensor> {
    if let Some(tensor) = cell.get() {
        return Ok(tensor);
    }
    let tensor = compute()?;
    Ok(cell.get_or_init(|| tensor))
}

/// Scales `(width, height)` so the longest side matches the model input size.
fn resized_dims(width: u32, height: u32) -> (u32, u32) {
    let longest = sam::IMAGE_SIZE as u32;
    let (width, height) = if height < width {
        (longest, longest * height / width)
    } else {
        (longest * width / height.max(1), longest)
    };
    (width.max(1), height.max(1))
}

fn device(cpu: bool) -> Result<Device> {
    if cpu {
        info!("Using device: cpu");
        return Ok(Device::Cpu);
    }
    let device = Device::cuda_if_available(0)?;
    if device.is_cuda() {
        info!("Using device: cuda");
    } else {
        warn!("Using device: cpu (build with `--features cuda` to run on GPU)");
    }
    Ok(device)
}
