use std::{cmp::Reverse, sync::Arc};

use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use image::RgbImage;
use thiserror::Error;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error};

use crate::{
    decode::decode_image,
    model::{best_mask, LabeledPoint, Predictor, Prompt, ScoredMask, SegmentModel},
    segment::{ErrorResponse, HealthResponse, Segment, SegmentRequest, SegmentResponse},
    service::LazyModel,
};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Internal(err) => {
                error!("Error in segmentation: {err:?}");
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

pub struct AppState<M> {
    pub model: Arc<LazyModel<M>>,
    pub max_segments: usize,
}

impl<M> Clone for AppState<M> {
    fn clone(&self) -> Self {
        Self {
            model: self.model.clone(),
            max_segments: self.max_segments,
        }
    }
}

impl<M: SegmentModel> AppState<M> {
    pub fn new(model: LazyModel<M>, max_segments: usize) -> Self {
        Self {
            model: Arc::new(model),
            max_segments,
        }
    }
}

pub fn router<M: SegmentModel>(state: AppState<M>, body_limit: usize) -> Router {
    Router::new()
        .route("/health", get(health::<M>))
        .route("/segment", post(segment::<M>))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health<M: SegmentModel>(State(state): State<AppState<M>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        model_loaded: state.model.is_loaded(),
    })
}

async fn segment<M: SegmentModel>(
    State(state): State<AppState<M>>,
    payload: Result<Json<SegmentRequest>, JsonRejection>,
) -> Result<Json<SegmentResponse>, ApiError> {
    let model = state.model.get().await?;

    let Json(request) = payload.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    let image = match request.image.as_deref() {
        Some(image) => decode_image(image)?,
        None => return Err(ApiError::BadRequest("No image provided".to_string())),
    };
    let prompt = select_prompt(&request);
    debug!(
        width = image.width(),
        height = image.height(),
        ?prompt,
        "Segmenting image"
    );

    let max_segments = state.max_segments;
    let segments = tokio::task::spawn_blocking(move || {
        run_segmentation(model.as_ref(), &image, prompt.as_ref(), max_segments)
    })
    .await
    .context("Segmentation task failed")??;

    Ok(Json(SegmentResponse { segments }))
}

/// Points win over boxes; empty lists count as absent. Only the first box is used.
pub fn select_prompt(request: &SegmentRequest) -> Option<Prompt> {
    if let Some(points) = request.points.as_ref().filter(|p| !p.is_empty()) {
        return Some(Prompt::Points(points.iter().map(LabeledPoint::from).collect()));
    }
    request
        .boxes
        .as_ref()
        .and_then(|boxes| boxes.first())
        .map(|b| Prompt::Box(*b))
}

/// Runs one request against the model: prompted requests return the single
/// best mask, unprompted ones the largest automatic masks.
pub fn run_segmentation<M: SegmentModel>(
    model: &M,
    image: &RgbImage,
    prompt: Option<&Prompt>,
    max_segments: usize,
) -> anyhow::Result<Vec<Segment>> {
    let mut predictor = Predictor::new(model);
    predictor.set_image(image)?;

    match prompt {
        Some(prompt) => {
            let masks = predictor.predict(prompt, true)?;
            Ok(best_mask(masks)
                .and_then(|best| Segment::from_mask(&best.mask))
                .into_iter()
                .collect())
        }
        None => {
            let masks = predictor.generate_masks()?;
            Ok(largest_segments(masks, max_segments))
        }
    }
}

fn largest_segments(mut masks: Vec<ScoredMask>, limit: usize) -> Vec<Segment> {
    masks.sort_by_cached_key(|m| Reverse(m.mask.area()));
    masks
        .iter()
        .take(limit)
        .filter_map(|m| Segment::from_mask(&m.mask))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mask::Mask, segment::PointPrompt};

    fn request(points: Option<Vec<PointPrompt>>, boxes: Option<Vec<[f64; 4]>>) -> SegmentRequest {
        SegmentRequest {
            image: Some(String::new()),
            points,
            boxes,
        }
    }

    fn square(size: usize) -> ScoredMask {
        let mut mask = Mask::new(10, 10);
        for y in 0..size {
            for x in 0..size {
                mask.set(x, y, true);
            }
        }
        ScoredMask { mask, score: 1.0 }
    }

    #[test]
    fn points_take_precedence_over_boxes() {
        let point = PointPrompt {
            x: 1.0,
            y: 2.0,
            label: 0,
        };
        let prompt = select_prompt(&request(Some(vec![point]), Some(vec![[0.0; 4]])));
        assert_eq!(
            prompt,
            Some(Prompt::Points(vec![LabeledPoint {
                x: 1.0,
                y: 2.0,
                foreground: false
            }]))
        );
    }

    #[test]
    fn empty_points_fall_through_to_first_box() {
        let boxes = vec![[1.0, 2.0, 3.0, 4.0], [5.0, 6.0, 7.0, 8.0]];
        let prompt = select_prompt(&request(Some(Vec::new()), Some(boxes)));
        assert_eq!(prompt, Some(Prompt::Box([1.0, 2.0, 3.0, 4.0])));
    }

    #[test]
    fn no_prompts_means_automatic() {
        assert_eq!(select_prompt(&request(None, None)), None);
        assert_eq!(select_prompt(&request(Some(vec![]), Some(vec![]))), None);
    }

    #[test]
    fn largest_segments_sorts_by_area_and_limits() {
        let masks = vec![square(2), square(0), square(5), square(3)];
        let segments = largest_segments(masks, 3);
        let widths: Vec<u32> = segments.iter().map(|s| s.bounds.width).collect();
        assert_eq!(widths, vec![5, 3, 2]);

        let segments = largest_segments(vec![square(1), square(0)], 15);
        assert_eq!(segments.len(), 1);
    }
}
