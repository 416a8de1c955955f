use std::{
    fs::{create_dir, read_dir},
    path::PathBuf,
};

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use clap::Parser;
use futures::{stream, StreamExt, TryStreamExt};
use reqwest::Client;
use sam_rest::segment::{ErrorResponse, PointPrompt, SegmentRequest, SegmentResponse};
use serde_json::to_string;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncWriteExt, BufReader},
};

/// Sends images to a running server and stores each response as `<stem>.json`.
#[derive(Parser, Debug)]
struct Args {
    #[arg(short, long)]
    input: PathBuf,

    #[arg(short, long)]
    output: PathBuf,

    #[arg(short, long, default_value = "http://localhost:5001")]
    url: String,

    /// Prompt point as `x,y` or `x,y,label`; repeatable.
    #[arg(long = "point", value_parser = parse_point)]
    points: Vec<PointPrompt>,

    /// Prompt box as `x1,y1,x2,y2`.
    #[arg(long = "box", value_parser = parse_box)]
    bbox: Option<[f64; 4]>,

    /// Number of requests in flight when processing a directory.
    #[arg(short, long, default_value_t = 1)]
    jobs: usize,
}

fn parse_numbers(s: &str) -> Result<Vec<f64>, String> {
    s.split(',')
        .map(|v| v.trim().parse::<f64>().map_err(|e| format!("{v:?}: {e}")))
        .collect()
}

fn parse_point(s: &str) -> Result<PointPrompt, String> {
    match parse_numbers(s)?.as_slice() {
        [x, y] => Ok(PointPrompt {
            x: *x,
            y: *y,
            label: 1,
        }),
        [x, y, label] => Ok(PointPrompt {
            x: *x,
            y: *y,
            label: *label as i32,
        }),
        _ => Err("expected x,y or x,y,label".to_string()),
    }
}

fn parse_box(s: &str) -> Result<[f64; 4], String> {
    parse_numbers(s)?
        .try_into()
        .map_err(|_| "expected x1,y1,x2,y2".to_string())
}

async fn infer(
    client: &Client,
    endpoint: &str,
    prompt: &SegmentRequest,
    image_filepath: PathBuf,
    segments_filepath: PathBuf,
) -> Result<()> {
    let payload = {
        let file = File::open(&image_filepath)
            .await
            .with_context(|| format!("Failed to open {}", image_filepath.display()))?;
        let mut reader = BufReader::new(file);
        let mut buffer = Vec::new();
        reader.read_to_end(&mut buffer).await?;
        buffer
    };

    let request = SegmentRequest {
        image: Some(STANDARD.encode(payload)),
        ..prompt.clone()
    };
    let res = client.post(endpoint).json(&request).send().await?;

    if !res.status().is_success() {
        let status = res.status();
        let message = res
            .json::<ErrorResponse>()
            .await
            .map(|e| e.error)
            .unwrap_or_default();
        bail!(
            "{} failed with {status}: {message}",
            image_filepath.display()
        );
    }

    let response = res.json::<SegmentResponse>().await?;
    println!(
        "{}: {} segments",
        image_filepath.display(),
        response.segments.len()
    );

    let mut file = File::create(segments_filepath).await?;
    file.write_all(to_string(&response)?.as_bytes()).await?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let client = Client::new();
    let endpoint = format!("{}/segment", args.url.trim_end_matches('/'));
    let prompt = SegmentRequest {
        image: None,
        points: (!args.points.is_empty()).then(|| args.points.clone()),
        boxes: args.bbox.map(|b| vec![b]),
    };

    match (
        args.input.is_dir(),
        args.output.is_dir(),
        args.output.exists(),
    ) {
        (false, false, _) => {
            infer(&client, &endpoint, &prompt, args.input, args.output).await?;
        }
        (true, false, false) | (true, true, true) => {
            if !args.output.exists() {
                create_dir(&args.output)?;
            }

            let mut jobs = Vec::new();
            for entry in read_dir(&args.input)? {
                let image_filepath = entry?.path();
                let Some(image_stem) = image_filepath.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                let segments_filepath = args.output.join(format!("{}.json", image_stem));
                jobs.push((image_filepath, segments_filepath));
            }

            stream::iter(jobs)
                .map(|(image_filepath, segments_filepath)| {
                    infer(
                        &client,
                        &endpoint,
                        &prompt,
                        image_filepath,
                        segments_filepath,
                    )
                })
                .buffer_unordered(args.jobs.max(1))
                .try_collect::<Vec<()>>()
                .await?;
        }
        _ => bail!("Invalid combination of input and output paths."),
    }

    Ok(())
}
