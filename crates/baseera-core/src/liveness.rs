//! Blink-based liveness.
//!
//! The eye-aspect ratio (EAR) drops while the eyes are closed. A blink is a
//! run of at least `confirm_frames` closed frames followed by an open frame;
//! observing one proves the face is not a static picture.

use crate::landmarks::{LandmarkSet, Point};

fn distance(a: Point, b: Point) -> f32 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

/// EAR of one six-point eye contour: `(|p2-p6| + |p3-p5|) / (2 |p1-p4|)`.
///
/// Returns `None` when the contour has no horizontal extent.
pub fn eye_aspect_ratio(eye: &[Point; 6]) -> Option<f32> {
    let a = distance(eye[1], eye[5]);
    let b = distance(eye[2], eye[4]);
    let c = distance(eye[0], eye[3]);
    if c <= f32::EPSILON {
        return None;
    }
    Some((a + b) / (2.0 * c))
}

impl LandmarkSet {
    /// Mean EAR of both eyes.
    pub fn eye_aspect_ratio(&self) -> Option<f32> {
        let left = eye_aspect_ratio(&self.left_eye())?;
        let right = eye_aspect_ratio(&self.right_eye())?;
        Some((left + right) / 2.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessPhase {
    NoFace,
    AwaitingBlink,
    Verified,
}

/// Per-session blink state: `{blink_counter, verified}` plus face presence.
#[derive(Debug, Default, Clone)]
pub struct BlinkTracker {
    blink_counter: u32,
    verified: bool,
    face_present: bool,
}

impl BlinkTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> LivenessPhase {
        if self.verified {
            LivenessPhase::Verified
        } else if self.face_present {
            LivenessPhase::AwaitingBlink
        } else {
            LivenessPhase::NoFace
        }
    }

    pub fn is_verified(&self) -> bool {
        self.verified
    }

    pub fn blink_counter(&self) -> u32 {
        self.blink_counter
    }

    /// A face is in view this frame, whether or not its eyes could be measured.
    pub fn face_seen(&mut self) {
        self.face_present = true;
    }

    /// Feed one processed frame's EAR. Returns true on the frame where the
    /// tracker becomes verified. Ignored while already verified.
    pub fn observe(&mut self, ear: f32, ear_threshold: f32, confirm_frames: u32) -> bool {
        self.face_present = true;
        if self.verified {
            return false;
        }

        if ear < ear_threshold {
            self.blink_counter += 1;
            return false;
        }

        let completed = self.blink_counter >= confirm_frames;
        self.blink_counter = 0;
        if completed {
            self.verified = true;
        }
        completed
    }

    /// No face in this frame: liveness never survives a disappearance.
    pub fn face_lost(&mut self) {
        self.blink_counter = 0;
        self.verified = false;
        self.face_present = false;
    }

    /// A recognition attempt used up the verification; the same face must
    /// blink again before the next attempt.
    pub fn consume_verification(&mut self) {
        self.verified = false;
        self.blink_counter = 0;
    }
}
