use crate::alert::{absentee_alerts, dispatch, AlertChannel};
use crate::clock::{Clock, SystemClock};
use crate::display::{encode_jpeg, DisplayHandle};
use crate::enroll::{EmployeeRegistry, EnrollError};
use crate::settings::{SettingsError, SharedSettings};
use crate::store::{Store, StoreError};
use crate::KioskSupervisor;
use baseera_core::Gallery;
use std::sync::{Arc, Mutex, TryLockError};
use zbus::fdo;
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.baseera.Kiosk1";
pub const OBJECT_PATH: &str = "/org/baseera/Kiosk1";

/// D-Bus interface for the attendance kiosk.
///
/// Bus name: org.baseera.Kiosk1
/// Object path: /org/baseera/Kiosk1
pub struct KioskService {
    pub supervisor: Arc<Mutex<KioskSupervisor>>,
    pub registry: Arc<EmployeeRegistry>,
    pub store: Arc<Store>,
    pub gallery: Gallery,
    pub settings: SharedSettings,
    pub display: DisplayHandle,
    pub alerts: Arc<dyn AlertChannel>,
}

fn failed(e: impl std::fmt::Display) -> fdo::Error {
    fdo::Error::Failed(e.to_string())
}

fn enroll_error(e: EnrollError) -> fdo::Error {
    match e {
        EnrollError::InvalidName(_) | EnrollError::MissingEmail | EnrollError::Store(StoreError::DuplicateEmployee(_)) => {
            fdo::Error::InvalidArgs(e.to_string())
        }
        other => failed(other),
    }
}

fn settings_error(e: SettingsError) -> fdo::Error {
    match e {
        SettingsError::UnknownKey(_) | SettingsError::Invalid { .. } => fdo::Error::InvalidArgs(e.to_string()),
        other => failed(other),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(failed)
}

#[interface(name = "org.baseera.Kiosk1")]
impl KioskService {
    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let worker = match self.supervisor.try_lock() {
            Ok(supervisor) => serde_json::json!(supervisor.state()),
            // Held for the duration of an enrollment.
            Err(TryLockError::WouldBlock) => serde_json::json!("busy"),
            Err(TryLockError::Poisoned(_)) => serde_json::json!("lost"),
        };
        let status = self.display.status();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "worker": worker,
            "status": status.to_string(),
            "state": status,
            "enrolled_models": self.gallery.len(),
            "frame": self.display.latest().map(|p| p.sequence),
        })
        .to_string())
    }

    /// Latest annotated frame as JPEG.
    async fn snapshot(&self) -> fdo::Result<Vec<u8>> {
        let latest = self
            .display
            .latest()
            .ok_or_else(|| fdo::Error::Failed("no frame rendered yet".into()))?;
        tokio::task::spawn_blocking(move || encode_jpeg(&latest.frame))
            .await
            .map_err(failed)?
            .map_err(failed)
    }

    async fn today_attendance(&self) -> fdo::Result<String> {
        let today = SystemClock.now().date();
        to_json(&self.store.attendance_on(today).map_err(failed)?)
    }

    async fn absentees(&self) -> fdo::Result<String> {
        let today = SystemClock.now().date();
        to_json(&self.store.absentees(today).map_err(failed)?)
    }

    async fn list_employees(&self) -> fdo::Result<String> {
        to_json(&self.store.list_employees().map_err(failed)?)
    }

    /// Register an employee and capture their face. Returns the number of
    /// face models stored. Recognition pauses while the camera is in use.
    async fn enroll(&self, name: String, email: String) -> fdo::Result<u32> {
        tracing::info!(name, "enroll requested");
        let supervisor = Arc::clone(&self.supervisor);
        let registry = Arc::clone(&self.registry);
        let now = SystemClock.now();
        let enrolled = tokio::task::spawn_blocking(move || {
            let mut supervisor = supervisor
                .lock()
                .map_err(|_| fdo::Error::Failed("supervisor lock poisoned".into()))?;
            registry
                .enroll(&mut *supervisor, &name, &email, now)
                .map_err(enroll_error)
        })
        .await
        .map_err(failed)??;
        Ok(u32::try_from(enrolled).unwrap_or(u32::MAX))
    }

    async fn remove_employee(&self, name: &str) -> fdo::Result<bool> {
        tracing::info!(name, "remove_employee requested");
        self.registry.remove(name).map_err(enroll_error)
    }

    async fn update_email(&self, name: &str, email: &str) -> fdo::Result<bool> {
        self.store.update_email(name, email.trim()).map_err(failed)
    }

    /// Email every absent employee that has an address. Returns how many
    /// messages were queued; delivery happens in the background.
    async fn notify_absentees(&self) -> fdo::Result<u32> {
        let today = SystemClock.now().date();
        let absent = self.store.absentees(today).map_err(failed)?;
        let alerts = absentee_alerts(&absent, &self.settings.alerts());
        let queued = alerts.len();
        let runtime = tokio::runtime::Handle::current();
        for alert in alerts {
            dispatch(&runtime, Arc::clone(&self.alerts), alert);
        }
        tracing::info!(absent = absent.len(), queued, "absentee reminders queued");
        Ok(u32::try_from(queued).unwrap_or(u32::MAX))
    }

    async fn get_settings(&self) -> fdo::Result<String> {
        to_json(&self.settings.snapshot().to_map())
    }

    async fn set_setting(&self, key: &str, value: &str) -> fdo::Result<()> {
        self.settings.set(&self.store, key, value).map_err(settings_error)?;
        tracing::info!(key, value, "setting updated");
        Ok(())
    }

    async fn reload_settings(&self) -> fdo::Result<()> {
        self.settings.reload(&self.store).map_err(settings_error)
    }

    /// Emitted once for every newly recorded attendance.
    #[zbus(signal)]
    pub async fn attendance_marked(emitter: &SignalEmitter<'_>, name: &str, time: &str) -> zbus::Result<()>;
}
