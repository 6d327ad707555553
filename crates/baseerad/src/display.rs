//! Hand-off of rendered frames and status to the foreground.
//!
//! The worker only ever overwrites the latest presentation; a slow reader
//! simply misses intermediate frames.

use crate::store::AttendanceRecord;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

const JPEG_QUALITY: u8 = 85;
const ATTENDANCE_BACKLOG: usize = 32;

/// Externally reported pipeline status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Status {
    /// No frame has been presented yet; the worker never reports this.
    Starting,
    Searching,
    AwaitingBlink,
    LivenessVerified,
    Recognized { name: String },
    Unknown,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Starting => write!(f, "Starting camera..."),
            Status::Searching => write!(f, "Searching for faces..."),
            Status::AwaitingBlink => write!(f, "Liveness check: please blink"),
            Status::LivenessVerified => write!(f, "Liveness verified"),
            Status::Recognized { name } => write!(f, "Welcome, {name}"),
            Status::Unknown => write!(f, "Unknown person"),
        }
    }
}

/// Receives every rendered frame and each newly recorded attendance.
pub trait DisplaySink: Send {
    fn present(&self, frame: RgbImage, status: &Status);
    fn attendance_marked(&self, record: &AttendanceRecord);
}

#[derive(Debug, Clone)]
pub struct Presentation {
    pub frame: Arc<RgbImage>,
    pub status: Status,
    /// Increments with every presented frame.
    pub sequence: u64,
}

/// Worker side of the display channel.
pub struct WatchDisplay {
    frames: watch::Sender<Option<Presentation>>,
    marks: broadcast::Sender<AttendanceRecord>,
    sequence: AtomicU64,
}

/// Foreground side: latest frame, status and attendance notifications.
#[derive(Clone)]
pub struct DisplayHandle {
    frames: watch::Receiver<Option<Presentation>>,
    marks: broadcast::Sender<AttendanceRecord>,
}

pub fn channel() -> (WatchDisplay, DisplayHandle) {
    let (frames_tx, frames_rx) = watch::channel(None);
    let (marks, _) = broadcast::channel(ATTENDANCE_BACKLOG);
    (
        WatchDisplay {
            frames: frames_tx,
            marks: marks.clone(),
            sequence: AtomicU64::new(0),
        },
        DisplayHandle {
            frames: frames_rx,
            marks,
        },
    )
}

impl DisplaySink for WatchDisplay {
    fn present(&self, frame: RgbImage, status: &Status) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        self.frames.send_replace(Some(Presentation {
            frame: Arc::new(frame),
            status: status.clone(),
            sequence,
        }));
    }

    fn attendance_marked(&self, record: &AttendanceRecord) {
        // No subscriber is fine.
        let _ = self.marks.send(record.clone());
    }
}

impl DisplayHandle {
    pub fn latest(&self) -> Option<Presentation> {
        self.frames.borrow().clone()
    }

    pub fn status(&self) -> Status {
        self.frames
            .borrow()
            .as_ref()
            .map(|p| p.status.clone())
            .unwrap_or(Status::Starting)
    }

    pub fn subscribe_attendance(&self) -> broadcast::Receiver<AttendanceRecord> {
        self.marks.subscribe()
    }
}

pub fn encode_jpeg(frame: &RgbImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY).encode_image(frame)?;
    Ok(buf)
}
