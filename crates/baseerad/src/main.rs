use anyhow::{Context, Result};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;
use zbus::object_server::SignalEmitter;

mod alert;
mod clock;
mod config;
mod dbus_interface;
mod display;
mod engine;
mod enroll;
mod overlay;
mod pipeline;
mod settings;
mod store;
mod unknown;

use alert::{AlertChannel, DisabledAlerts, SmtpAlertChannel, SmtpConfig};
use baseera_core::{FaceDetector, FaceRecognizer, Gallery, GalleryMatcher, LandmarkExtractor};
use dbus_interface::{KioskService, BUS_NAME, OBJECT_PATH};
use engine::{Supervisor, V4lCamera};
use enroll::EmployeeRegistry;
use overlay::Overlay;
use pipeline::{PipelineServices, RecognitionPipeline};
use settings::SharedSettings;
use store::{AttendanceRecord, Store};
use unknown::UnknownVisitorHandler;

pub type KioskPipeline = RecognitionPipeline<FaceDetector, LandmarkExtractor, GalleryMatcher<FaceRecognizer>>;
pub type KioskSupervisor = Supervisor<KioskPipeline, V4lCamera>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("baseerad starting");

    let config = config::Config::from_env();

    let store = Arc::new(Store::open(&config.db_path).context("failed to open attendance database")?);
    let settings = SharedSettings::load(&store).context("failed to load kiosk settings")?;
    let gallery = Gallery::new(store.load_face_models().context("failed to load face models")?);
    tracing::info!(models = gallery.len(), "gallery loaded");

    let alerts: Arc<dyn AlertChannel> = match SmtpConfig::from_env() {
        Some(smtp) => {
            tracing::info!(host = %smtp.host, port = smtp.port, "email alerts enabled");
            Arc::new(SmtpAlertChannel::new(smtp))
        }
        None => {
            tracing::warn!("BASEERA_SMTP_HOST not set; email alerts disabled");
            Arc::new(DisabledAlerts)
        }
    };

    let detector = FaceDetector::load(&config.scrfd_model_path()).context("failed to load face detector")?;
    let landmarks =
        LandmarkExtractor::load(&config.landmark_model_path()).context("failed to load landmark model")?;
    let recognizer =
        FaceRecognizer::load(&config.arcface_model_path()).context("failed to load recognition model")?;
    tracing::info!(model_dir = %config.model_dir.display(), "models loaded");

    let (display_sink, display) = display::channel();
    let marks = display.subscribe_attendance();

    let pipeline = RecognitionPipeline::new(
        detector,
        landmarks,
        GalleryMatcher::new(recognizer, gallery.clone()),
        PipelineServices {
            ledger: store.clone(),
            unknown: UnknownVisitorHandler::new(
                config.unknown_dir.clone(),
                Arc::clone(&alerts),
                tokio::runtime::Handle::current(),
            ),
            display: Box::new(display_sink),
            overlay: Overlay::load(config.overlay_font.as_deref()),
            settings: settings.clone(),
            clock: Box::new(clock::SystemClock),
        },
    );

    let camera = V4lCamera::new(config.camera_device.clone(), config.capture_width, config.capture_height);
    let mut supervisor = Supervisor::new(pipeline, camera, config.stop_timeout, config.read_backoff);
    supervisor.start().context("failed to start recognition worker")?;
    let supervisor = Arc::new(Mutex::new(supervisor));

    let registry = Arc::new(EmployeeRegistry::new(
        store.clone(),
        gallery.clone(),
        config.known_faces_dir.clone(),
        config.frames_per_enroll,
    ));

    let service = KioskService {
        supervisor: Arc::clone(&supervisor),
        registry,
        store,
        gallery,
        settings,
        display,
        alerts,
    };

    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tokio::spawn(forward_attendance_signals(conn.clone(), marks));

    tracing::info!(bus = BUS_NAME, system = config.system_bus, "baseerad ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("baseerad shutting down");

    let stopped = tokio::task::spawn_blocking(move || match supervisor.lock() {
        Ok(mut supervisor) => supervisor.stop().map_err(anyhow::Error::from),
        Err(_) => Err(anyhow::anyhow!("supervisor lock poisoned")),
    })
    .await?;
    if let Err(e) = stopped {
        tracing::warn!(error = %e, "recognition worker did not stop cleanly");
    }

    Ok(())
}

/// Re-emit each recorded attendance as an `AttendanceMarked` signal.
async fn forward_attendance_signals(
    conn: zbus::Connection,
    mut marks: tokio::sync::broadcast::Receiver<AttendanceRecord>,
) {
    let emitter = match SignalEmitter::new(&conn, OBJECT_PATH) {
        Ok(emitter) => emitter,
        Err(e) => {
            tracing::error!(error = %e, "cannot emit attendance signals");
            return;
        }
    };
    loop {
        match marks.recv().await {
            Ok(record) => {
                let time = record.recorded_at.format("%Y-%m-%d %H:%M:%S").to_string();
                if let Err(e) = KioskService::attendance_marked(&emitter, &record.employee, &time).await {
                    tracing::warn!(name = %record.employee, error = %e, "failed to emit AttendanceMarked");
                }
            }
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "attendance signal listener fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
