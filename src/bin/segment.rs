use anyhow::{anyhow, bail, ensure, Context, Result};
use clap::Parser;
use png::{BitDepth, ColorType, Encoder};
use sam_rest::segment::{Bounds, Segment, SegmentResponse};
use serde_json::from_str;
use std::{
    collections::HashSet,
    fs::{create_dir, read_dir, read_to_string, File},
    io::BufWriter,
    path::{Path, PathBuf},
};

/// Cuts a segment out of its image using a response saved by `infer`.
#[derive(Parser, Debug)]
struct Args {
    #[arg(short, long)]
    input: PathBuf,

    #[arg(short, long)]
    output: PathBuf,

    /// Response JSON file, or a directory of `<stem>.json` files.
    #[arg(short, long)]
    mask: PathBuf,

    #[arg(long)]
    index: Option<usize>,

    #[arg(long)]
    id: Option<String>,

    /// Crop the output to the segment bounds.
    #[arg(long)]
    crop: bool,
}

fn select_segment<'a>(
    segments: &'a [Segment],
    index: Option<usize>,
    id: Option<&str>,
) -> Result<&'a Segment> {
    match (index, id) {
        (Some(index), _) => segments
            .get(index)
            .ok_or_else(|| anyhow!("Segment index {index} is out of range")),
        (None, Some(id)) => segments
            .iter()
            .find(|segment| segment.id == id)
            .ok_or_else(|| anyhow!("Segment \"{id}\" was not found.")),
        (None, None) => segments
            .first()
            .ok_or_else(|| anyhow!("Response contains no segments.")),
    }
}

/// RGBA pixels of `image` with the mask as alpha, restricted to `region`.
fn cut_out(image: &image::RgbImage, segment: &Segment, region: Bounds) -> Result<Vec<u8>> {
    let (width, height) = image.dimensions();
    ensure!(
        segment.mask_shape.width == width && segment.mask_shape.height == height,
        "Mask is {}x{} but image is {}x{}",
        segment.mask_shape.width,
        segment.mask_shape.height,
        width,
        height
    );
    let (width, height) = (width as usize, height as usize);
    ensure!(
        segment.mask_data.len() == width * height,
        "Mask data does not match its shape"
    );
    let (x0, y0) = (region.x as usize, region.y as usize);
    let (x1, y1) = (x0 + region.width as usize, y0 + region.height as usize);
    ensure!(
        x1 <= width && y1 <= height,
        "Region {}x{} at ({}, {}) lies outside the {}x{} image",
        region.width,
        region.height,
        region.x,
        region.y,
        width,
        height
    );

    let mut pixels = Vec::with_capacity((x1 - x0) * (y1 - y0) * 4);
    for y in y0..y1 {
        for x in x0..x1 {
            let [r, g, b] = image.get_pixel(x as u32, y as u32).0;
            let alpha = segment.mask_data[y * width + x];
            pixels.extend_from_slice(&[r, g, b, alpha]);
        }
    }
    Ok(pixels)
}

fn perform_segmentation(
    image_filepath: &Path,
    segment_filepath: &Path,
    mask_filepath: &Path,
    args: &Args,
) -> Result<()> {
    let image = image::open(image_filepath)
        .with_context(|| format!("Failed to read {}", image_filepath.display()))?
        .to_rgb8();

    let content = read_to_string(mask_filepath)?;
    let response: SegmentResponse = from_str(&content)?;
    let segment = select_segment(&response.segments, args.index, args.id.as_deref())?;

    let region = if args.crop {
        segment.bounds
    } else {
        Bounds {
            x: 0,
            y: 0,
            width: image.width(),
            height: image.height(),
        }
    };
    let pixels = cut_out(&image, segment, region)?;

    let file = File::create(segment_filepath)?;
    let mut encoder = Encoder::new(BufWriter::new(file), region.width, region.height);
    encoder.set_color(ColorType::Rgba);
    encoder.set_depth(BitDepth::Eight);
    let mut writer = encoder.write_header()?;
    writer.write_image_data(&pixels)?;

    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    match (
        args.input.is_dir(),
        args.mask.is_dir(),
        args.output.is_dir(),
        args.output.exists(),
    ) {
        (false, false, false, _) => {
            perform_segmentation(&args.input, &args.output, &args.mask, &args)?;
        }
        (true, true, true, _) | (true, true, false, false) => {
            let mut mask_file_stems = HashSet::new();
            for entry in read_dir(&args.mask)? {
                let path = entry?.path();
                if path.extension().is_some_and(|ext| ext == "json") {
                    if let Some(stem) = path.file_stem() {
                        mask_file_stems.insert(stem.to_owned());
                    }
                }
            }

            let mut image_filepaths = Vec::new();
            for entry in read_dir(&args.input)? {
                let path = entry?.path();
                match path.file_stem() {
                    Some(stem) if mask_file_stems.contains(stem) => image_filepaths.push(path),
                    _ => bail!("Mask not found for image \"{}\"", path.display()),
                }
            }

            if !args.output.exists() {
                create_dir(&args.output)?;
            }

            for image_filepath in image_filepaths {
                let Some(image_stem) = image_filepath.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                let segment_filepath = args.output.join(format!("{}.png", image_stem));
                let mask_filepath = args.mask.join(format!("{}.json", image_stem));

                perform_segmentation(&image_filepath, &segment_filepath, &mask_filepath, &args)?;
            }
        }
        _ => bail!("Invalid combination of input, output, and mask paths."),
    }

    Ok(())
}
