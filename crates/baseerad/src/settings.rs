//! Operator-tunable kiosk settings backed by the `settings` table.
//!
//! The recognition worker reads a [`RecognitionConfig`] copy at the start of
//! every iteration, so `SetSetting`/`ReloadSettings` take effect on the next
//! frame without restarting the loop.

use crate::store::{Store, StoreError};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use thiserror::Error;

pub const EAR_THRESHOLD: &str = "ear_threshold";
pub const BLINK_CONFIRM_FRAMES: &str = "blink_confirm_frames";
pub const MATCH_THRESHOLD: &str = "match_threshold";
pub const RECOGNITION_COOLDOWN_SECS: &str = "recognition_cooldown_secs";
pub const UNKNOWN_SAVE_THROTTLE_SECS: &str = "unknown_save_throttle_secs";
pub const PROCESS_FRAME_INTERVAL: &str = "process_frame_interval";
pub const ALERT_RECIPIENT: &str = "alert_recipient";
pub const ALERT_SUBJECT: &str = "alert_subject";
pub const ALERT_BODY: &str = "alert_body";
pub const ABSENTEE_SUBJECT: &str = "absentee_subject";
pub const ABSENTEE_BODY: &str = "absentee_body";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("unknown setting: {0}")]
    UnknownKey(String),
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: &'static str,
    },
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// Timing and threshold parameters of the recognition pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RecognitionConfig {
    pub ear_threshold: f32,
    pub blink_confirm_frames: u32,
    /// Accept a match only when its dissimilarity is strictly below this.
    pub match_threshold: f32,
    pub recognition_cooldown_secs: f64,
    pub unknown_save_throttle_secs: f64,
    /// Run analysis on every Nth frame.
    pub frame_stride: u32,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            ear_threshold: 0.25,
            blink_confirm_frames: 3,
            match_threshold: 0.40,
            recognition_cooldown_secs: 5.0,
            unknown_save_throttle_secs: 15.0,
            frame_stride: 1,
        }
    }
}

/// Recipients and message templates for outbound email.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertTemplates {
    /// Unknown-visitor alerts are only sent when this is set.
    pub recipient: Option<String>,
    pub subject: String,
    pub body: String,
    pub absentee_subject: String,
    /// May contain a `{name}` placeholder.
    pub absentee_body: String,
}

impl Default for AlertTemplates {
    fn default() -> Self {
        Self {
            recipient: None,
            subject: "Security Alert: Unknown Person Detected".to_string(),
            body: "An unknown person was detected by the attendance kiosk.".to_string(),
            absentee_subject: "Attendance Reminder".to_string(),
            absentee_body: "Dear {name},\n\nThis is a reminder that you have not checked in today. \
                            Please let us know if there are any issues.\n\nBest regards,\nManagement."
                .to_string(),
        }
    }
}

impl AlertTemplates {
    pub fn absentee_body_for(&self, name: &str) -> String {
        self.absentee_body.replace("{name}", name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KioskSettings {
    pub recognition: RecognitionConfig,
    pub alerts: AlertTemplates,
}

impl KioskSettings {
    /// Build from stored key/value pairs. Missing or invalid values fall back
    /// to their defaults with a warning.
    pub fn from_map(map: &HashMap<String, String>) -> Self {
        let defaults = Self::default();
        let r = defaults.recognition;
        let a = defaults.alerts;

        let recognition = RecognitionConfig {
            ear_threshold: parse_or(map, EAR_THRESHOLD, r.ear_threshold),
            blink_confirm_frames: parse_or(map, BLINK_CONFIRM_FRAMES, r.blink_confirm_frames),
            match_threshold: parse_or(map, MATCH_THRESHOLD, r.match_threshold),
            recognition_cooldown_secs: parse_or(map, RECOGNITION_COOLDOWN_SECS, r.recognition_cooldown_secs),
            unknown_save_throttle_secs: parse_or(map, UNKNOWN_SAVE_THROTTLE_SECS, r.unknown_save_throttle_secs),
            frame_stride: parse_or(map, PROCESS_FRAME_INTERVAL, r.frame_stride),
        };

        let text = |key: &str, default: String| map.get(key).cloned().unwrap_or(default);
        let alerts = AlertTemplates {
            recipient: map
                .get(ALERT_RECIPIENT)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            subject: text(ALERT_SUBJECT, a.subject),
            body: text(ALERT_BODY, a.body),
            absentee_subject: text(ABSENTEE_SUBJECT, a.absentee_subject),
            absentee_body: text(ABSENTEE_BODY, a.absentee_body),
        };

        Self { recognition, alerts }
    }

    /// Flatten into the stored key/value representation.
    pub fn to_map(&self) -> BTreeMap<&'static str, String> {
        let r = &self.recognition;
        let a = &self.alerts;
        BTreeMap::from([
            (EAR_THRESHOLD, r.ear_threshold.to_string()),
            (BLINK_CONFIRM_FRAMES, r.blink_confirm_frames.to_string()),
            (MATCH_THRESHOLD, r.match_threshold.to_string()),
            (RECOGNITION_COOLDOWN_SECS, r.recognition_cooldown_secs.to_string()),
            (UNKNOWN_SAVE_THROTTLE_SECS, r.unknown_save_throttle_secs.to_string()),
            (PROCESS_FRAME_INTERVAL, r.frame_stride.to_string()),
            (ALERT_RECIPIENT, a.recipient.clone().unwrap_or_default()),
            (ALERT_SUBJECT, a.subject.clone()),
            (ALERT_BODY, a.body.clone()),
            (ABSENTEE_SUBJECT, a.absentee_subject.clone()),
            (ABSENTEE_BODY, a.absentee_body.clone()),
        ])
    }
}

/// Check that `value` is acceptable for `key`.
pub fn validate(key: &str, value: &str) -> Result<(), SettingsError> {
    let invalid = |reason| SettingsError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason,
    };
    match key {
        EAR_THRESHOLD | MATCH_THRESHOLD => match value.trim().parse::<f32>() {
            Ok(v) if v.is_finite() && v > 0.0 => Ok(()),
            _ => Err(invalid("expected a positive number")),
        },
        RECOGNITION_COOLDOWN_SECS | UNKNOWN_SAVE_THROTTLE_SECS => match value.trim().parse::<f64>() {
            Ok(v) if v.is_finite() && v >= 0.0 => Ok(()),
            _ => Err(invalid("expected a non-negative number of seconds")),
        },
        BLINK_CONFIRM_FRAMES | PROCESS_FRAME_INTERVAL => match value.trim().parse::<u32>() {
            Ok(v) if v >= 1 => Ok(()),
            _ => Err(invalid("expected an integer of at least 1")),
        },
        ALERT_RECIPIENT | ALERT_SUBJECT | ALERT_BODY | ABSENTEE_SUBJECT | ABSENTEE_BODY => Ok(()),
        _ => Err(SettingsError::UnknownKey(key.to_string())),
    }
}

fn parse_or<T>(map: &HashMap<String, String>, key: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    let Some(raw) = map.get(key) else {
        return default;
    };
    if let Err(e) = validate(key, raw) {
        tracing::warn!(key, error = %e, "ignoring stored setting, using default");
        return default;
    }
    raw.trim().parse().unwrap_or(default)
}

/// Shared, reloadable settings.
#[derive(Clone, Default)]
pub struct SharedSettings {
    inner: Arc<RwLock<KioskSettings>>,
}

impl SharedSettings {
    pub fn new(settings: KioskSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    /// Seed missing defaults into the store, then load.
    pub fn load(store: &Store) -> Result<Self, SettingsError> {
        let defaults = KioskSettings::default().to_map();
        let pairs: Vec<(&str, &str)> = defaults.iter().map(|(k, v)| (*k, v.as_str())).collect();
        store.seed_settings(&pairs)?;
        let shared = Self::default();
        shared.reload(store)?;
        Ok(shared)
    }

    pub fn recognition(&self) -> RecognitionConfig {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).recognition
    }

    pub fn alerts(&self) -> AlertTemplates {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).alerts.clone()
    }

    pub fn snapshot(&self) -> KioskSettings {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn replace(&self, settings: KioskSettings) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = settings;
    }

    /// Re-read every value from the store.
    pub fn reload(&self, store: &Store) -> Result<(), SettingsError> {
        let settings = KioskSettings::from_map(&store.settings()?);
        tracing::info!(recognition = ?settings.recognition, "settings loaded");
        self.replace(settings);
        Ok(())
    }

    /// Validate, persist and apply one setting.
    pub fn set(&self, store: &Store, key: &str, value: &str) -> Result<(), SettingsError> {
        validate(key, value)?;
        store.set_setting(key, value.trim())?;
        tracing::info!(key, value, "setting updated");
        self.reload(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_seeded_and_loaded() {
        let store = Store::open_in_memory().unwrap();
        let shared = SharedSettings::load(&store).unwrap();
        assert_eq!(shared.recognition(), RecognitionConfig::default());
        assert!(shared.alerts().recipient.is_none());
        assert_eq!(store.settings().unwrap().len(), 11);
    }

    #[test]
    fn test_invalid_stored_value_falls_back() {
        let mut map = HashMap::new();
        map.insert(EAR_THRESHOLD.to_string(), "abc".to_string());
        map.insert(PROCESS_FRAME_INTERVAL.to_string(), "0".to_string());
        map.insert(MATCH_THRESHOLD.to_string(), "0.35".to_string());
        let settings = KioskSettings::from_map(&map);
        assert_eq!(settings.recognition.ear_threshold, 0.25);
        assert_eq!(settings.recognition.frame_stride, 1);
        assert_eq!(settings.recognition.match_threshold, 0.35);
    }

    #[test]
    fn test_blank_recipient_disables_alerts() {
        let mut map = HashMap::new();
        map.insert(ALERT_RECIPIENT.to_string(), "  ".to_string());
        assert!(KioskSettings::from_map(&map).alerts.recipient.is_none());
    }

    #[test]
    fn test_set_is_visible_to_other_handles() {
        let store = Store::open_in_memory().unwrap();
        let shared = SharedSettings::load(&store).unwrap();
        let worker_view = shared.clone();
        shared.set(&store, RECOGNITION_COOLDOWN_SECS, "2.5").unwrap();
        assert_eq!(worker_view.recognition().recognition_cooldown_secs, 2.5);
        shared.set(&store, ALERT_RECIPIENT, "guard@example.com").unwrap();
        assert_eq!(worker_view.alerts().recipient.as_deref(), Some("guard@example.com"));
    }

    #[test]
    fn test_set_rejects_bad_values() {
        let store = Store::open_in_memory().unwrap();
        let shared = SharedSettings::load(&store).unwrap();
        assert!(matches!(
            shared.set(&store, PROCESS_FRAME_INTERVAL, "0"),
            Err(SettingsError::Invalid { .. })
        ));
        assert!(matches!(
            shared.set(&store, "theme", "dark"),
            Err(SettingsError::UnknownKey(_))
        ));
        assert!(matches!(
            shared.set(&store, MATCH_THRESHOLD, "NaN"),
            Err(SettingsError::Invalid { .. })
        ));
        assert_eq!(shared.recognition().frame_stride, 1);
    }

    #[test]
    fn test_reload_picks_up_external_change() {
        let store = Store::open_in_memory().unwrap();
        let shared = SharedSettings::load(&store).unwrap();
        store.set_setting(BLINK_CONFIRM_FRAMES, "4").unwrap();
        assert_eq!(shared.recognition().blink_confirm_frames, 3);
        shared.reload(&store).unwrap();
        assert_eq!(shared.recognition().blink_confirm_frames, 4);
    }

    #[test]
    fn test_absentee_body_placeholder() {
        let templates = AlertTemplates {
            absentee_body: "Dear {name}, please check in.".into(),
            ..AlertTemplates::default()
        };
        assert_eq!(templates.absentee_body_for("Omar"), "Dear Omar, please check in.");
    }
}
