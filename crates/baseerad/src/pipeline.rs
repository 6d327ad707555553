//! The per-frame recognition state machine.
//!
//! Each call to [`RecognitionPipeline::step`] runs one strictly ordered
//! iteration: acquire, maybe detect, maybe update liveness, maybe recognize,
//! annotate, present. Per-frame failures are logged and contained here.

use crate::clock::{interval_elapsed, Clock};
use crate::display::{DisplaySink, Status};
use crate::engine::FrameLoop;
use crate::overlay::{Annotation, AnnotationKind, Overlay};
use crate::settings::{RecognitionConfig, SharedSettings};
use crate::store::{AttendanceLedger, AttendanceRecord};
use crate::unknown::{UnknownDisposition, UnknownVisitorHandler};
use baseera_core::{
    largest_face, BlinkTracker, BoundingBox, FaceLocator, IdentityMatcher, LandmarkSource, MatchDecision,
};
use baseera_hw::FrameSource;
use chrono::NaiveDateTime;
use std::time::Instant;
use image::GrayImage;
use std::sync::Arc;

/// What a single iteration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// No frame could be read.
    NoFrame,
    /// Frame displayed without analysis (stride).
    Displayed,
    Analyzed,
}

/// Collaborators the pipeline writes to.
pub struct PipelineServices {
    pub ledger: Arc<dyn AttendanceLedger>,
    pub unknown: UnknownVisitorHandler,
    pub display: Box<dyn DisplaySink>,
    pub overlay: Overlay,
    pub settings: SharedSettings,
    pub clock: Box<dyn Clock>,
}

pub struct RecognitionPipeline<L, K, M> {
    locator: L,
    landmarks: K,
    matcher: M,
    services: PipelineServices,
    liveness: BlinkTracker,
    /// Shared by all identities; touched only by the worker.
    last_attempt: Option<Instant>,
    frame_count: u64,
    status: Status,
}

impl<L, K, M> RecognitionPipeline<L, K, M>
where
    L: FaceLocator,
    K: LandmarkSource,
    M: IdentityMatcher,
{
    pub fn new(locator: L, landmarks: K, matcher: M, services: PipelineServices) -> Self {
        Self {
            locator,
            landmarks,
            matcher,
            services,
            liveness: BlinkTracker::new(),
            last_attempt: None,
            frame_count: 0,
            status: Status::Searching,
        }
    }

    /// Detector and matcher, lent out while the worker is stopped.
    pub fn models_mut(&mut self) -> (&mut L, &mut M) {
        (&mut self.locator, &mut self.matcher)
    }

    /// Start a fresh camera session. The recognition cooldown and unknown
    /// throttle carry over.
    pub fn reset_session(&mut self) {
        self.liveness = BlinkTracker::new();
        self.frame_count = 0;
        self.status = Status::Searching;
    }

    pub fn step(&mut self, source: &mut dyn FrameSource) -> StepOutcome {
        let frame = match source.read() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "frame read failed");
                return StepOutcome::NoFrame;
            }
        };

        // Re-read every iteration so reloads apply without a restart.
        let config = self.services.settings.recognition();
        self.frame_count += 1;
        if self.frame_count % u64::from(config.frame_stride.max(1)) != 0 {
            self.present(&frame.image, None);
            return StepOutcome::Displayed;
        }

        let annotation = self.analyze(&frame.image, &config);
        self.present(&frame.image, annotation.as_ref());
        StepOutcome::Analyzed
    }

    fn analyze(&mut self, frame: &GrayImage, config: &RecognitionConfig) -> Option<Annotation> {
        let faces = match self.locator.locate(frame) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(error = %e, "face detection failed; frame skipped");
                return None;
            }
        };

        let Some(face) = largest_face(&faces).cloned() else {
            self.liveness.face_lost();
            self.status = Status::Searching;
            return None;
        };
        let Some(crop) = face.crop(frame) else {
            tracing::debug!("face region outside frame; frame skipped");
            return None;
        };
        self.liveness.face_seen();

        let mut kind = None;
        if !self.liveness.is_verified() {
            self.status = Status::AwaitingBlink;
            kind = Some(AnnotationKind::AwaitingBlink);
            self.update_liveness(frame, &face, config);
        }

        if self.liveness.is_verified() {
            let tick = self.services.clock.monotonic();
            if interval_elapsed(self.last_attempt, tick, config.recognition_cooldown_secs) {
                let now = self.services.clock.now();
                kind = self.attempt_recognition(&crop, now, tick, config).or(kind);
                // Success or failure, the attempt uses up this blink.
                self.liveness.consume_verification();
                self.last_attempt = Some(tick);
            } else {
                self.status = Status::LivenessVerified;
                kind = Some(AnnotationKind::Verified);
            }
        }

        kind.map(|kind| Annotation { region: face, kind })
    }

    fn update_liveness(&mut self, frame: &GrayImage, face: &BoundingBox, config: &RecognitionConfig) {
        let landmarks = match self.landmarks.landmarks(frame, face) {
            Ok(landmarks) => landmarks,
            Err(e) => {
                tracing::warn!(error = %e, "landmark extraction failed");
                return;
            }
        };
        let Some(ear) = landmarks.eye_aspect_ratio() else {
            tracing::debug!("degenerate eye landmarks");
            return;
        };
        tracing::trace!(ear, counter = self.liveness.blink_counter(), "eye aspect ratio");
        if self
            .liveness
            .observe(ear, config.ear_threshold, config.blink_confirm_frames)
        {
            tracing::info!("liveness verified");
            self.status = Status::LivenessVerified;
        }
    }

    fn attempt_recognition(
        &mut self,
        crop: &GrayImage,
        now: NaiveDateTime,
        tick: Instant,
        config: &RecognitionConfig,
    ) -> Option<AnnotationKind> {
        tracing::debug!("attempting recognition");
        let candidate = match self.matcher.identify(crop) {
            Ok(candidate) => candidate,
            Err(e) => {
                tracing::error!(error = %e, "recognition failed");
                return None;
            }
        };

        match MatchDecision::classify(candidate, config.match_threshold) {
            MatchDecision::Accepted(matched) => {
                tracing::info!(name = %matched.identity, dissimilarity = matched.dissimilarity, "face recognized");
                self.mark_attendance(&matched.identity, now);
                self.status = Status::Recognized {
                    name: matched.identity.clone(),
                };
                Some(AnnotationKind::Recognized(matched.identity))
            }
            MatchDecision::Rejected(best) => {
                tracing::info!(
                    closest = best.as_ref().map(|c| c.identity.as_str()),
                    dissimilarity = best.as_ref().map(|c| c.dissimilarity),
                    "unknown face"
                );
                let templates = self.services.settings.alerts();
                if let UnknownDisposition::Saved(path) =
                    self.services
                        .unknown
                        .handle(crop, now, tick, config.unknown_save_throttle_secs, &templates)
                {
                    tracing::info!(path = %path.display(), "unknown visitor recorded");
                }
                self.status = Status::Unknown;
                Some(AnnotationKind::Unknown)
            }
        }
    }

    /// First match of the day creates the record; later ones are no-ops.
    fn mark_attendance(&mut self, name: &str, now: NaiveDateTime) {
        let ledger = &self.services.ledger;
        match ledger.exists(name, now.date()) {
            Ok(true) => tracing::debug!(name, "attendance already recorded today"),
            Ok(false) => match ledger.record(name, now) {
                Ok(()) => {
                    tracing::info!(name, at = %now, "attendance recorded");
                    self.services.display.attendance_marked(&AttendanceRecord {
                        employee: name.to_string(),
                        recorded_at: now,
                    });
                }
                Err(e) => tracing::warn!(name, error = %e, "failed to record attendance"),
            },
            Err(e) => tracing::warn!(name, error = %e, "attendance lookup failed"),
        }
    }

    fn present(&self, frame: &GrayImage, annotation: Option<&Annotation>) {
        let rendered = self.services.overlay.render(frame, annotation);
        self.services.display.present(rendered, &self.status);
    }
}

impl<L, K, M> FrameLoop for RecognitionPipeline<L, K, M>
where
    L: FaceLocator + Send + 'static,
    K: LandmarkSource + Send + 'static,
    M: IdentityMatcher + Send + 'static,
{
    fn step(&mut self, source: &mut dyn FrameSource) -> StepOutcome {
        RecognitionPipeline::step(self, source)
    }

    fn reset_session(&mut self) {
        RecognitionPipeline::reset_session(self)
    }
}
