//! Rate-limited handling of faces that matched nobody.
//!
//! One shared timestamp throttles snapshots and alerts for all unknown faces,
//! so a lingering visitor does not flood the inbox. A burst of different
//! visitors within the window is suppressed the same way.

use crate::alert::{Alert, AlertChannel};
use crate::clock::interval_elapsed;
use crate::settings::AlertTemplates;
use chrono::NaiveDateTime;
use image::GrayImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub enum UnknownDisposition {
    /// A snapshot is being written to this path in the background.
    Saved(PathBuf),
    Throttled,
}

pub struct UnknownVisitorHandler {
    dir: PathBuf,
    last_saved: Option<Instant>,
    alerts: Arc<dyn AlertChannel>,
    runtime: tokio::runtime::Handle,
}

impl UnknownVisitorHandler {
    pub fn new(dir: PathBuf, alerts: Arc<dyn AlertChannel>, runtime: tokio::runtime::Handle) -> Self {
        Self {
            dir,
            last_saved: None,
            alerts,
            runtime,
        }
    }

    /// Record an unknown face seen at `now`, with `tick` read from the
    /// monotonic clock at the same moment. Outside the throttle window the
    /// crop is saved and, if a recipient is configured, an alert is sent;
    /// both happen on a background task.
    pub fn handle(
        &mut self,
        crop: &GrayImage,
        now: NaiveDateTime,
        tick: Instant,
        throttle_secs: f64,
        templates: &AlertTemplates,
    ) -> UnknownDisposition {
        if !interval_elapsed(self.last_saved, tick, throttle_secs) {
            tracing::debug!("unknown visitor within throttle window, not saved");
            return UnknownDisposition::Throttled;
        }
        self.last_saved = Some(tick);

        let path = self.dir.join(format!(
            "unknown_{}_{}.jpg",
            now.format("%Y%m%d_%H%M%S"),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        ));
        let alert = templates.recipient.as_ref().map(|recipient| Alert {
            recipient: recipient.clone(),
            subject: templates.subject.clone(),
            body: templates.body.clone(),
            image: Some(path.clone()),
        });

        let crop = crop.clone();
        let channel = Arc::clone(&self.alerts);
        let save_path = path.clone();
        self.runtime.spawn(async move {
            let written = tokio::task::spawn_blocking(move || save_snapshot(&crop, &save_path)).await;
            match written {
                Ok(Ok(path)) => tracing::info!(path = %path.display(), "unknown visitor snapshot saved"),
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "failed to save unknown visitor snapshot");
                    return;
                }
                Err(e) => {
                    tracing::error!(error = %e, "snapshot task failed");
                    return;
                }
            }
            match alert {
                Some(alert) => {
                    if let Err(e) = channel.send(&alert).await {
                        tracing::warn!(to = %alert.recipient, error = %e, "unknown visitor alert not delivered");
                    }
                }
                None => tracing::debug!("no alert recipient configured"),
            }
        });

        UnknownDisposition::Saved(path)
    }
}

fn save_snapshot(crop: &GrayImage, path: &Path) -> Result<PathBuf, image::ImageError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(image::ImageError::IoError)?;
    }
    crop.save(path)?;
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::tests::RecordingChannel;
    use chrono::NaiveDate;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn t(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap().and_hms_opt(h, m, s).unwrap()
    }

    fn tick(base: Instant, secs: u64) -> Instant {
        base + Duration::from_secs(secs)
    }

    fn templates(recipient: Option<&str>) -> AlertTemplates {
        AlertTemplates {
            recipient: recipient.map(str::to_string),
            ..AlertTemplates::default()
        }
    }

    fn handler(dir: &Path) -> (UnknownVisitorHandler, mpsc::UnboundedReceiver<Alert>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = UnknownVisitorHandler::new(
            dir.to_path_buf(),
            Arc::new(RecordingChannel { tx }),
            tokio::runtime::Handle::current(),
        );
        (handler, rx)
    }

    #[tokio::test]
    async fn test_second_unknown_within_throttle_is_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        let (mut handler, mut rx) = handler(dir.path());
        let crop = GrayImage::from_pixel(16, 16, image::Luma([90]));
        let templates = templates(Some("guard@example.com"));

        let base = Instant::now();
        let first = handler.handle(&crop, t(10, 0, 0), base, 15.0, &templates);
        let second = handler.handle(&crop, t(10, 0, 3), tick(base, 3), 15.0, &templates);

        let UnknownDisposition::Saved(path) = first else {
            panic!("first unknown should be saved");
        };
        assert_eq!(second, UnknownDisposition::Throttled);
        assert_eq!(handler.last_saved, Some(base));

        let alert = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alert.recipient, "guard@example.com");
        assert_eq!(alert.image.as_deref(), Some(path.as_path()));
        assert!(path.exists());
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("unknown_20260302_100000_"));

        // Only one alert was ever queued.
        assert!(tokio::time::timeout(Duration::from_millis(200), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_saves_again_after_window() {
        let dir = tempfile::tempdir().unwrap();
        let (mut handler, _rx) = handler(dir.path());
        let crop = GrayImage::from_pixel(8, 8, image::Luma([90]));
        let templates = templates(None);

        let base = Instant::now();
        assert!(matches!(handler.handle(&crop, t(10, 0, 0), base, 15.0, &templates), UnknownDisposition::Saved(_)));
        assert!(matches!(
            handler.handle(&crop, t(10, 0, 14), tick(base, 14), 15.0, &templates),
            UnknownDisposition::Throttled
        ));
        assert!(matches!(
            handler.handle(&crop, t(10, 0, 15), tick(base, 15), 15.0, &templates),
            UnknownDisposition::Saved(_)
        ));
    }

    #[tokio::test]
    async fn test_throttle_ignores_wall_clock_stepping_back() {
        let dir = tempfile::tempdir().unwrap();
        let (mut handler, _rx) = handler(dir.path());
        let crop = GrayImage::from_pixel(8, 8, image::Luma([90]));
        let templates = templates(None);

        let base = Instant::now();
        assert!(matches!(handler.handle(&crop, t(2, 59, 30), base, 15.0, &templates), UnknownDisposition::Saved(_)));
        // An hour earlier on the wall clock, but sixty seconds later in real time.
        assert!(matches!(
            handler.handle(&crop, t(2, 0, 30), tick(base, 60), 15.0, &templates),
            UnknownDisposition::Saved(_)
        ));
    }

    #[tokio::test]
    async fn test_no_recipient_saves_without_alert() {
        let dir = tempfile::tempdir().unwrap();
        let (mut handler, mut rx) = handler(dir.path());
        let crop = GrayImage::from_pixel(8, 8, image::Luma([90]));

        let UnknownDisposition::Saved(path) = handler.handle(&crop, t(10, 0, 0), Instant::now(), 15.0, &templates(None)) else {
            panic!("expected a snapshot");
        };
        for _ in 0..50 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(path.exists());
        assert!(tokio::time::timeout(Duration::from_millis(200), rx.recv()).await.is_err());
    }
}
