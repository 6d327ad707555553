//! Employee enrollment and removal.
//!
//! Enrollment borrows the camera from the recognition worker through
//! [`Supervisor::with_exclusive_camera`], so the two never hold the device
//! at the same time.

use crate::engine::{CameraOpener, EngineError, FrameLoop, Supervisor};
use crate::pipeline::RecognitionPipeline;
use crate::store::{Store, StoreError};
use baseera_core::{
    largest_face, DetectorError, Embedder, FaceLocator, FaceModel, Gallery, GalleryMatcher, LandmarkSource,
    RecognizerError,
};
use baseera_hw::{CameraError, FrameSource};
use chrono::NaiveDateTime;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Reads allowed per requested frame before giving up on dark frames.
const ATTEMPTS_PER_FRAME: usize = 3;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("invalid employee name: {0:?}")]
    InvalidName(String),
    #[error("email address must not be empty")]
    MissingEmail,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("face detection failed: {0}")]
    Detector(#[from] DetectorError),
    #[error("face embedding failed: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("failed to save enrollment image: {0}")]
    Image(#[from] image::ImageError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("only {got} of {wanted} usable frames captured")]
    NotEnoughFrames { got: usize, wanted: usize },
    #[error("no face detected in any captured frame")]
    NoFaceDetected,
}

/// Models an enrollment needs from the pipeline while it is parked.
pub trait EnrollmentModels {
    type Locator: FaceLocator;
    type Embedder: Embedder;

    fn enrollment_models(&mut self) -> (&mut Self::Locator, &mut Self::Embedder);
}

impl<L, K, E> EnrollmentModels for RecognitionPipeline<L, K, GalleryMatcher<E>>
where
    L: FaceLocator,
    K: LandmarkSource,
    E: Embedder,
{
    type Locator = L;
    type Embedder = E;

    fn enrollment_models(&mut self) -> (&mut L, &mut E) {
        let (locator, matcher) = self.models_mut();
        (locator, matcher.embedder_mut())
    }
}

/// Names become directory and file names; keep them to a single path segment.
pub fn validate_name(name: &str) -> Result<(), EnrollError> {
    let trimmed = name.trim();
    let bad = trimmed.is_empty()
        || trimmed != name
        || name == "."
        || name.contains("..")
        || name.contains(['/', '\\'])
        || name.chars().any(char::is_control);
    if bad {
        return Err(EnrollError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Capture `frames` usable frames from `source`, save them under `dir` and
/// return one face model per frame in which a face was found.
pub fn capture_face_models<L, E>(
    locator: &mut L,
    embedder: &mut E,
    source: &mut dyn FrameSource,
    name: &str,
    frames: usize,
    dir: &Path,
    now: NaiveDateTime,
) -> Result<Vec<FaceModel>, EnrollError>
where
    L: FaceLocator + ?Sized,
    E: Embedder + ?Sized,
{
    std::fs::create_dir_all(dir)?;

    let mut captured = Vec::with_capacity(frames);
    for _ in 0..frames * ATTEMPTS_PER_FRAME {
        if captured.len() == frames {
            break;
        }
        let frame = source.read()?;
        if frame.is_dark {
            tracing::debug!(sequence = frame.sequence, "skipping dark enrollment frame");
            continue;
        }
        let path = dir.join(format!("{name}_{}.jpg", captured.len() + 1));
        frame.image.save(&path)?;
        tracing::info!(name, path = %path.display(), "enrollment image captured");
        captured.push(frame.image);
    }
    if captured.len() < frames {
        return Err(EnrollError::NotEnoughFrames {
            got: captured.len(),
            wanted: frames,
        });
    }

    let created_at = now.format("%Y-%m-%d %H:%M:%S").to_string();
    let mut models = Vec::new();
    for (i, image) in captured.iter().enumerate() {
        let faces = locator.locate(image)?;
        let Some(crop) = largest_face(&faces).and_then(|face| face.crop(image)) else {
            tracing::warn!(name, frame = i + 1, "no face in enrollment frame");
            continue;
        };
        let embedding = embedder.embed(&crop)?;
        models.push(FaceModel {
            id: uuid::Uuid::new_v4().to_string(),
            employee: name.to_string(),
            embedding,
            created_at: created_at.clone(),
        });
    }
    if models.is_empty() {
        return Err(EnrollError::NoFaceDetected);
    }
    Ok(models)
}

/// Adds and removes employees across the store, the gallery and the image
/// directory.
pub struct EmployeeRegistry {
    store: Arc<Store>,
    gallery: Gallery,
    known_faces_dir: PathBuf,
    frames: usize,
}

impl EmployeeRegistry {
    pub fn new(store: Arc<Store>, gallery: Gallery, known_faces_dir: PathBuf, frames: usize) -> Self {
        Self {
            store,
            gallery,
            known_faces_dir,
            frames: frames.max(1),
        }
    }

    fn employee_dir(&self, name: &str) -> PathBuf {
        self.known_faces_dir.join(name)
    }

    /// Register `name`, capture their face with the camera taken from the
    /// worker, and make them recognizable immediately. Returns the number of
    /// face models stored. Nothing is kept if any step fails.
    pub fn enroll<P, C>(
        &self,
        supervisor: &mut Supervisor<P, C>,
        name: &str,
        email: &str,
        now: NaiveDateTime,
    ) -> Result<usize, EnrollError>
    where
        P: FrameLoop + EnrollmentModels,
        C: CameraOpener,
    {
        validate_name(name)?;
        let email = email.trim();
        if email.is_empty() {
            return Err(EnrollError::MissingEmail);
        }
        self.store.add_employee(name, email)?;
        tracing::info!(name, "employee added; capturing face");

        let dir = self.employee_dir(name);
        let captured = supervisor
            .with_exclusive_camera(|pipeline, source| {
                let (locator, embedder) = pipeline.enrollment_models();
                capture_face_models(locator, embedder, source, name, self.frames, &dir, now)
            })
            .map_err(EnrollError::from)
            .and_then(|models| models)
            .and_then(|models| {
                self.store.add_face_models(&models)?;
                Ok(models)
            });

        match captured {
            Ok(models) => {
                let count = models.len();
                self.gallery.extend(models)?;
                tracing::info!(name, models = count, "employee enrolled");
                Ok(count)
            }
            Err(e) => {
                tracing::error!(name, error = %e, "enrollment failed; rolling back");
                if let Err(rollback) = self.store.remove_employee(name) {
                    tracing::error!(name, error = %rollback, "failed to remove half-enrolled employee");
                }
                remove_dir_if_present(&dir);
                Err(e)
            }
        }
    }

    /// Forget `name` everywhere. Returns whether the employee existed.
    pub fn remove(&self, name: &str) -> Result<bool, EnrollError> {
        validate_name(name)?;
        let existed = self.store.remove_employee(name)?;
        let dropped = self.gallery.remove_employee(name)?;
        remove_dir_if_present(&self.employee_dir(name));
        tracing::info!(name, existed, models = dropped, "employee removed");
        Ok(existed)
    }
}

fn remove_dir_if_present(dir: &Path) {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(dir = %dir.display(), error = %e, "failed to remove employee images"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::MockCamera;
    use crate::engine::WorkerState;
    use crate::pipeline::StepOutcome;
    use baseera_core::{BoundingBox, Embedding};
    use chrono::NaiveDate;
    use image::GrayImage;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    struct FixedLocator {
        faces: Vec<BoundingBox>,
    }

    impl FaceLocator for FixedLocator {
        fn locate(&mut self, _frame: &GrayImage) -> Result<Vec<BoundingBox>, DetectorError> {
            Ok(self.faces.clone())
        }
    }

    struct UnitEmbedder;

    impl Embedder for UnitEmbedder {
        fn embed(&mut self, crop: &GrayImage) -> Result<Embedding, RecognizerError> {
            if crop.width() == 0 {
                return Err(RecognizerError::EmptyCrop);
            }
            Ok(Embedding { values: vec![1.0, 0.0], model_version: None })
        }
    }

    struct MockKiosk {
        locator: FixedLocator,
        embedder: UnitEmbedder,
    }

    impl MockKiosk {
        fn with_faces(faces: Vec<BoundingBox>) -> Self {
            Self {
                locator: FixedLocator { faces },
                embedder: UnitEmbedder,
            }
        }
    }

    impl FrameLoop for MockKiosk {
        fn step(&mut self, source: &mut dyn FrameSource) -> StepOutcome {
            std::thread::sleep(Duration::from_millis(1));
            match source.read() {
                Ok(_) => StepOutcome::Analyzed,
                Err(_) => StepOutcome::NoFrame,
            }
        }

        fn reset_session(&mut self) {}
    }

    impl EnrollmentModels for MockKiosk {
        type Locator = FixedLocator;
        type Embedder = UnitEmbedder;

        fn enrollment_models(&mut self) -> (&mut FixedLocator, &mut UnitEmbedder) {
            (&mut self.locator, &mut self.embedder)
        }
    }

    fn face() -> BoundingBox {
        BoundingBox { x: 8.0, y: 8.0, width: 32.0, height: 32.0, confidence: 0.9 }
    }

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap().and_hms_opt(8, 30, 0).unwrap()
    }

    fn setup(kiosk: MockKiosk) -> (Supervisor<MockKiosk, MockCamera>, EmployeeRegistry, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let registry = EmployeeRegistry::new(store, Gallery::default(), dir.path().join("known_faces"), 3);
        let supervisor = Supervisor::new(kiosk, MockCamera::default(), Duration::from_secs(1), Duration::from_millis(5));
        (supervisor, registry, dir)
    }

    #[test]
    fn test_enroll_stores_models_and_images() {
        let (mut supervisor, registry, _dir) = setup(MockKiosk::with_faces(vec![face()]));
        supervisor.start().unwrap();

        let count = registry.enroll(&mut supervisor, "Alya", "alya@example.com", now()).unwrap();

        assert_eq!(count, 3);
        assert_eq!(registry.gallery.len(), 3);
        assert_eq!(registry.store.load_face_models().unwrap().len(), 3);
        let images = registry.employee_dir("Alya");
        for i in 1..=3 {
            assert!(images.join(format!("Alya_{i}.jpg")).exists());
        }
        assert_eq!(supervisor.state(), WorkerState::Running);
        supervisor.stop().unwrap();
    }

    #[test]
    fn test_enroll_never_shares_camera_with_worker() {
        let (mut supervisor, registry, _dir) = setup(MockKiosk::with_faces(vec![face()]));
        supervisor.start().unwrap();
        registry.enroll(&mut supervisor, "Omar", "omar@example.com", now()).unwrap();
        supervisor.stop().unwrap();

        // Worker, enrollment, restarted worker: three opens, never overlapping.
        let stats = &supervisor_stats(&supervisor);
        assert_eq!(stats.0, 3);
        assert_eq!(stats.1, 1);
    }

    fn supervisor_stats(supervisor: &Supervisor<MockKiosk, MockCamera>) -> (usize, usize) {
        let camera = supervisor.opener();
        (
            camera.stats.opens.load(Ordering::SeqCst),
            camera.stats.max_active.load(Ordering::SeqCst),
        )
    }

    #[test]
    fn test_enroll_without_face_rolls_back() {
        let (mut supervisor, registry, _dir) = setup(MockKiosk::with_faces(vec![]));
        supervisor.start().unwrap();

        let err = registry
            .enroll(&mut supervisor, "Huda", "huda@example.com", now())
            .unwrap_err();

        assert!(matches!(err, EnrollError::NoFaceDetected));
        assert!(registry.store.list_employees().unwrap().is_empty());
        assert!(registry.gallery.is_empty());
        assert!(!registry.employee_dir("Huda").exists());
        assert_eq!(supervisor.state(), WorkerState::Running);
        supervisor.stop().unwrap();
    }

    #[test]
    fn test_enroll_with_camera_gone_rolls_back_and_reports() {
        let (mut supervisor, registry, _dir) = setup(MockKiosk::with_faces(vec![face()]));
        supervisor.opener().unplugged.store(true, Ordering::SeqCst);

        let err = registry
            .enroll(&mut supervisor, "Huda", "huda@example.com", now())
            .unwrap_err();

        assert!(matches!(err, EnrollError::Engine(EngineError::Camera(_))));
        assert!(registry.store.list_employees().unwrap().is_empty());
        assert_eq!(supervisor.state(), WorkerState::Idle);
    }

    #[test]
    fn test_duplicate_name_rejected_before_capture() {
        let (mut supervisor, registry, _dir) = setup(MockKiosk::with_faces(vec![face()]));
        registry.store.add_employee("Alya", "alya@example.com").unwrap();

        let err = registry
            .enroll(&mut supervisor, "Alya", "other@example.com", now())
            .unwrap_err();

        assert!(matches!(err, EnrollError::Store(StoreError::DuplicateEmployee(_))));
        assert_eq!(supervisor.opener().stats.opens.load(Ordering::SeqCst), 0);
        // The existing employee survives the failed attempt.
        assert_eq!(registry.store.list_employees().unwrap().len(), 1);
    }

    #[test]
    fn test_remove_clears_gallery_and_images() {
        let (mut supervisor, registry, _dir) = setup(MockKiosk::with_faces(vec![face()]));
        registry.enroll(&mut supervisor, "Alya", "alya@example.com", now()).unwrap();
        supervisor.stop().unwrap();

        assert!(registry.remove("Alya").unwrap());
        assert!(registry.gallery.is_empty());
        assert!(registry.store.load_face_models().unwrap().is_empty());
        assert!(!registry.employee_dir("Alya").exists());
        assert!(!registry.remove("Alya").unwrap());
    }

    #[test]
    fn test_validate_name() {
        for ok in ["Alya", "Omar Haddad", "عليا"] {
            assert!(validate_name(ok).is_ok(), "{ok}");
        }
        for bad in ["", "  ", " Alya", "../etc", "a/b", "a\\b", ".", "tab\there"] {
            assert!(validate_name(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn test_missing_email_rejected() {
        let (mut supervisor, registry, _dir) = setup(MockKiosk::with_faces(vec![face()]));
        let err = registry.enroll(&mut supervisor, "Alya", "  ", now()).unwrap_err();
        assert!(matches!(err, EnrollError::MissingEmail));
        assert!(registry.store.list_employees().unwrap().is_empty());
    }
}
