use anyhow::{Context, Result};
use base64::{
    engine::general_purpose::{STANDARD, STANDARD_NO_PAD},
    Engine,
};
use image::RgbImage;

/// Decodes the `image` field of a segmentation request.
///
/// Accepts either a data URL (`data:image/png;base64,...`) or bare base64,
/// in any raster format the `image` crate can sniff.
pub fn decode_image(field: &str) -> Result<RgbImage> {
    let payload = match field.split_once(',') {
        Some((_, data)) => data,
        None => field,
    };
    let payload: String = payload
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    let bytes = STANDARD
        .decode(&payload)
        .or_else(|_| STANDARD_NO_PAD.decode(&payload))
        .context("Invalid base64 image data")?;
    let image = image::load_from_memory(&bytes).context("Failed to decode image")?;
    Ok(image.to_rgb8())
}
