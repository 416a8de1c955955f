use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_with::{
    base64::{Base64, Standard},
    formats::Padded,
    serde_as,
};

use crate::mask::Mask;

/// Body of `POST /segment`.
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct SegmentRequest {
    /// Data URL or bare base64 of an encoded image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points: Option<Vec<PointPrompt>>,
    /// `[x1, y1, x2, y2]` in image pixels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boxes: Option<Vec<[f64; 4]>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct PointPrompt {
    pub x: f64,
    pub y: f64,
    /// 1 marks foreground, 0 background.
    #[serde(default = "PointPrompt::foreground")]
    pub label: i32,
}

impl PointPrompt {
    fn foreground() -> i32 {
        1
    }

    pub fn is_foreground(&self) -> bool {
        self.label > 0
    }
}

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub id: String,
    /// Row-major, one byte per pixel: 255 inside the mask, 0 outside.
    #[serde_as(as = "Base64<Standard, Padded>")]
    pub mask_data: Vec<u8>,
    pub mask_shape: MaskShape,
    pub bounds: Bounds,
}

impl Segment {
    /// Returns `None` when the mask has no set pixels.
    pub fn from_mask(mask: &Mask) -> Option<Self> {
        let bounds = mask.bounds()?;
        let id = format!("segment-{}", rand::thread_rng().gen_range(0..1_000_000));
        Some(Self {
            id,
            mask_data: mask.to_bytes(),
            mask_shape: MaskShape {
                height: mask.height() as u32,
                width: mask.width() as u32,
            },
            bounds,
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskShape {
    pub height: u32,
    pub width: u32,
}

/// Axis-aligned box given as origin plus size.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct SegmentResponse {
    pub segments: Vec<Segment>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HealthResponse {
    pub status: String,
    pub model_loaded: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ErrorResponse {
    pub error: String,
}
