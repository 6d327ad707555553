//! 68-point facial landmark regression via ONNX Runtime.
//!
//! The model takes a 112×112 face crop and returns 136 values: the (x, y)
//! of each point normalized to the crop, in the iBUG 68-point order.

use crate::types::BoundingBox;
use image::imageops::FilterType;
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::ops::Range;
use std::path::Path;
use thiserror::Error;

pub const LANDMARK_COUNT: usize = 68;
const LANDMARK_INPUT_SIZE: u32 = 112;

/// Index ranges of the six-point eye contours in the 68-point layout.
pub const RIGHT_EYE: Range<usize> = 36..42;
pub const LEFT_EYE: Range<usize> = 42..48;

pub type Point = (f32, f32);

#[derive(Error, Debug)]
pub enum LandmarkError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face region lies outside the frame")]
    EmptyRegion,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// 68 ordered landmark points in frame coordinates.
#[derive(Debug, Clone)]
pub struct LandmarkSet {
    points: Vec<Point>,
}

impl LandmarkSet {
    pub fn new(points: Vec<Point>) -> Result<Self, LandmarkError> {
        if points.len() != LANDMARK_COUNT {
            return Err(LandmarkError::InferenceFailed(format!(
                "expected {LANDMARK_COUNT} landmarks, got {}",
                points.len()
            )));
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn left_eye(&self) -> [Point; 6] {
        eye(&self.points, LEFT_EYE)
    }

    pub fn right_eye(&self) -> [Point; 6] {
        eye(&self.points, RIGHT_EYE)
    }
}

fn eye(points: &[Point], range: Range<usize>) -> [Point; 6] {
    std::array::from_fn(|i| points[range.start + i])
}

/// Extracts landmarks for a located face.
pub trait LandmarkSource {
    fn landmarks(&mut self, frame: &GrayImage, face: &BoundingBox) -> Result<LandmarkSet, LandmarkError>;
}

/// ONNX 68-point landmark regressor.
pub struct LandmarkExtractor {
    session: Session,
}

impl LandmarkExtractor {
    pub fn load(model_path: &str) -> Result<Self, LandmarkError> {
        if !Path::new(model_path).exists() {
            return Err(LandmarkError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(model_path)?;

        tracing::info!(path = model_path, "loaded landmark model");
        Ok(Self { session })
    }

    fn preprocess(crop: &GrayImage) -> Array4<f32> {
        let size = LANDMARK_INPUT_SIZE as usize;
        let resized = image::imageops::resize(crop, LANDMARK_INPUT_SIZE, LANDMARK_INPUT_SIZE, FilterType::Triangle);
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in resized.enumerate_pixels() {
            let v = pixel.0[0] as f32 / 255.0;
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = v;
            }
        }
        tensor
    }
}

impl LandmarkSource for LandmarkExtractor {
    fn landmarks(&mut self, frame: &GrayImage, face: &BoundingBox) -> Result<LandmarkSet, LandmarkError> {
        let (x, y, w, h) = face
            .clamped(frame.width(), frame.height())
            .ok_or(LandmarkError::EmptyRegion)?;
        let crop = image::imageops::crop_imm(frame, x, y, w, h).to_image();
        let input = Self::preprocess(&crop);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| LandmarkError::InferenceFailed(format!("landmark extraction: {e}")))?;

        if raw.len() < LANDMARK_COUNT * 2 {
            return Err(LandmarkError::InferenceFailed(format!(
                "expected {} landmark values, got {}",
                LANDMARK_COUNT * 2,
                raw.len()
            )));
        }

        LandmarkSet::new(denormalize(&raw[..LANDMARK_COUNT * 2], (x, y, w, h)))
    }
}

/// Map crop-relative [0, 1] coordinates back into the frame.
fn denormalize(raw: &[f32], (x, y, w, h): (u32, u32, u32, u32)) -> Vec<Point> {
    raw.chunks_exact(2)
        .map(|p| (x as f32 + p[0] * w as f32, y as f32 + p[1] * h as f32))
        .collect()
}
