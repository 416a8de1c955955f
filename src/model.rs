use anyhow::{bail, Result};
use image::RgbImage;

use crate::{mask::Mask, segment::PointPrompt};

/// A labelled prompt point in image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabeledPoint {
    pub x: f64,
    pub y: f64,
    pub foreground: bool,
}

impl From<&PointPrompt> for LabeledPoint {
    fn from(point: &PointPrompt) -> Self {
        Self {
            x: point.x,
            y: point.y,
            foreground: point.is_foreground(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Prompt {
    Points(Vec<LabeledPoint>),
    /// `[x1, y1, x2, y2]` in image pixel coordinates.
    Box([f64; 4]),
}

#[derive(Debug, Clone)]
pub struct ScoredMask {
    pub mask: Mask,
    pub score: f32,
}

/// A pretrained promptable segmentation model.
///
/// Masks returned by `decode` and `generate` have the dimensions of the image
/// passed to `embed`.
pub trait SegmentModel: Send + Sync + 'static {
    /// Per-image state computed once and reused by every prompt.
    type Embedding: Send;

    fn embed(&self, image: &RgbImage) -> Result<Self::Embedding>;

    fn decode(
        &self,
        embedding: &Self::Embedding,
        prompt: &Prompt,
        multimask_output: bool,
    ) -> Result<Vec<ScoredMask>>;

    fn generate(&self, embedding: &Self::Embedding) -> Result<Vec<ScoredMask>>;
}

/// Request-scoped predictor holding the "current image" for one model.
pub struct Predictor<'a, M: SegmentModel> {
    model: &'a M,
    embedding: Option<M::Embedding>,
}

impl<'a, M: SegmentModel> Predictor<'a, M> {
    pub fn new(model: &'a M) -> Self {
        Self {
            model,
            embedding: None,
        }
    }

    pub fn set_image(&mut self, image: &RgbImage) -> Result<()> {
        self.embedding = Some(self.model.embed(image)?);
        Ok(())
    }

    pub fn predict(&self, prompt: &Prompt, multimask_output: bool) -> Result<Vec<ScoredMask>> {
        self.model
            .decode(self.embedding()?, prompt, multimask_output)
    }

    pub fn predict_from_points(&self, points: &[PointPrompt]) -> Result<Vec<ScoredMask>> {
        let points = points.iter().map(LabeledPoint::from).collect();
        self.predict(&Prompt::Points(points), true)
    }

    /// Automatic segmentation of the whole current image.
    pub fn generate_masks(&self) -> Result<Vec<ScoredMask>> {
        self.model.generate(self.embedding()?)
    }

    fn embedding(&self) -> Result<&M::Embedding> {
        match &self.embedding {
            Some(embedding) => Ok(embedding),
            None => bail!("No image set. Call set_image() first."),
        }
    }
}

/// Picks the highest-scoring mask; the first one wins ties.
pub fn best_mask(masks: Vec<ScoredMask>) -> Option<ScoredMask> {
    masks.into_iter().fold(None, |best, candidate| match best {
        Some(best) if best.score >= candidate.score => Some(best),
        _ => Some(candidate),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Echo {
        embeds: AtomicUsize,
    }

    impl SegmentModel for Echo {
        type Embedding = (u32, u32);

        fn embed(&self, image: &RgbImage) -> Result<Self::Embedding> {
            self.embeds.fetch_add(1, Ordering::SeqCst);
            Ok(image.dimensions())
        }

        fn decode(
            &self,
            &(w, h): &Self::Embedding,
            prompt: &Prompt,
            _multimask_output: bool,
        ) -> Result<Vec<ScoredMask>> {
            let Prompt::Points(points) = prompt else {
                bail!("points only");
            };
            let mut mask = Mask::new(w as usize, h as usize);
            for p in points.iter().filter(|p| p.foreground) {
                mask.set(p.x as usize, p.y as usize, true);
            }
            Ok(vec![ScoredMask { mask, score: 1.0 }])
        }

        fn generate(&self, &(w, h): &Self::Embedding) -> Result<Vec<ScoredMask>> {
            Ok(vec![ScoredMask {
                mask: Mask::new(w as usize, h as usize),
                score: 0.5,
            }])
        }
    }

    fn scored(score: f32) -> ScoredMask {
        ScoredMask {
            mask: Mask::new(1, 1),
            score,
        }
    }

    #[test]
    fn generate_requires_an_image() {
        let model = Echo::default();
        let predictor = Predictor::new(&model);
        let err = predictor.generate_masks().unwrap_err();
        assert_eq!(err.to_string(), "No image set. Call set_image() first.");
        assert!(predictor.predict_from_points(&[]).is_err());
    }

    #[test]
    fn embedding_is_computed_once_per_image() {
        let model = Echo::default();
        let mut predictor = Predictor::new(&model);
        predictor.set_image(&RgbImage::new(4, 2)).unwrap();

        let points = [
            PointPrompt {
                x: 1.0,
                y: 1.0,
                label: 1,
            },
            PointPrompt {
                x: 3.0,
                y: 0.0,
                label: 0,
            },
        ];
        let masks = predictor.predict_from_points(&points).unwrap();
        assert_eq!(masks[0].mask.area(), 1);
        assert!(masks[0].mask.get(1, 1));

        let generated = predictor.generate_masks().unwrap();
        assert_eq!(generated[0].mask.width(), 4);
        assert_eq!(model.embeds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn best_mask_prefers_first_of_equal_scores() {
        assert!(best_mask(Vec::new()).is_none());

        let best = best_mask(vec![scored(0.2), scored(0.9), scored(0.4)]).unwrap();
        assert_eq!(best.score, 0.9);

        let mut first = scored(0.7);
        first.mask.set(0, 0, true);
        let best = best_mask(vec![first, scored(0.7)]).unwrap();
        assert!(best.mask.get(0, 0));
    }
}
