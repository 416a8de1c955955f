//! Segment Anything exposed over HTTP.
//!
//! `POST /segment` takes an image with optional point or box prompts and
//! answers with base64 masks; `GET /health` reports whether the model is
//! loaded yet.

pub mod api;
pub mod config;
pub mod decode;
pub mod download;
pub mod mask;
pub mod model;
pub mod sam;
pub mod segment;
pub mod service;

pub use segment::{Segment, SegmentRequest, SegmentResponse};
