use image::GrayImage;
use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Integer rectangle `(x, y, w, h)` clamped to a `frame_w × frame_h` frame.
    ///
    /// Returns `None` when nothing of the box lies inside the frame.
    pub fn clamped(&self, frame_w: u32, frame_h: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.x.max(0.0).floor() as u32;
        let y0 = self.y.max(0.0).floor() as u32;
        let x1 = ((self.x + self.width).max(0.0).ceil() as u32).min(frame_w);
        let y1 = ((self.y + self.height).max(0.0).ceil() as u32).min(frame_h);
        if x0 >= x1 || y0 >= y1 {
            return None;
        }
        Some((x0, y0, x1 - x0, y1 - y0))
    }

    /// Copy the boxed region out of a grayscale frame.
    pub fn crop(&self, frame: &GrayImage) -> Option<GrayImage> {
        let (x, y, w, h) = self.clamped(frame.width(), frame.height())?;
        Some(image::imageops::crop_imm(frame, x, y, w, h).to_image())
    }
}

/// Pick the primary face: the one with the largest area.
pub fn largest_face(faces: &[BoundingBox]) -> Option<&BoundingBox> {
    faces.iter().max_by(|a, b| {
        a.area()
            .partial_cmp(&b.area())
            .unwrap_or(std::cmp::Ordering::Equal)
    })
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Cosine distance in [0, 2]. Lower = more similar.
    pub fn cosine_distance(&self, other: &Embedding) -> f32 {
        1.0 - self.similarity(other)
    }
}

/// An enrolled face model belonging to one employee.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceModel {
    pub id: String,
    /// Employee name; this is the identity reported on a match.
    pub employee: String,
    pub embedding: Embedding,
    pub created_at: String,
}

/// Best gallery candidate for a probe face.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchCandidate {
    pub identity: String,
    /// Distance to the closest enrolled model. Lower = more similar.
    pub dissimilarity: f32,
}

/// Outcome of applying the acceptance threshold to a matcher result.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchDecision {
    Accepted(MatchCandidate),
    /// No candidate, or the best candidate was not close enough.
    Rejected(Option<MatchCandidate>),
}

impl MatchDecision {
    /// Accept only when `dissimilarity < threshold`; a score equal to the
    /// threshold is rejected. No candidate counts as infinitely far.
    pub fn classify(candidate: Option<MatchCandidate>, threshold: f32) -> Self {
        match candidate {
            Some(c) if c.dissimilarity < threshold => MatchDecision::Accepted(c),
            other => MatchDecision::Rejected(other),
        }
    }
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
pub trait Matcher {
    fn closest(&self, probe: &Embedding, gallery: &[FaceModel]) -> Option<MatchCandidate>;
}

/// Cosine-distance matcher. Visits every gallery entry, no early exit.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn closest(&self, probe: &Embedding, gallery: &[FaceModel]) -> Option<MatchCandidate> {
        let mut best: Option<(usize, f32)> = None;

        for (i, model) in gallery.iter().enumerate() {
            let dist = probe.cosine_distance(&model.embedding);
            match best {
                Some((_, d)) if d <= dist => {}
                _ => best = Some((i, dist)),
            }
        }

        best.map(|(idx, dissimilarity)| MatchCandidate {
            identity: gallery[idx].employee.clone(),
            dissimilarity,
        })
    }
}
