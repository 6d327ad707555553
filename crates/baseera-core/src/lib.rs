//! baseera-core — Face analysis for the attendance kiosk.
//!
//! SCRFD locates faces, a 68-point regressor supplies eye landmarks for
//! blink liveness, and ArcFace embeddings are matched against the enrolled
//! gallery by cosine distance. All models run on ONNX Runtime.

pub mod detector;
pub mod gallery;
pub mod landmarks;
pub mod liveness;
pub mod recognizer;
pub mod types;

pub use detector::{DetectorError, FaceDetector, FaceLocator};
pub use gallery::{Gallery, GalleryMatcher, IdentityMatcher};
pub use landmarks::{LandmarkError, LandmarkExtractor, LandmarkSet, LandmarkSource};
pub use liveness::{BlinkTracker, LivenessPhase};
pub use recognizer::{Embedder, FaceRecognizer, RecognizerError};
pub use types::{largest_face, BoundingBox, Embedding, FaceModel, MatchCandidate, MatchDecision};

/// Default directory holding the ONNX models.
pub fn default_model_dir() -> std::path::PathBuf {
    std::path::PathBuf::from("/usr/share/baseera/models")
}
