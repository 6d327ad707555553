//! SQLite persistence: employees, attendance ledger, enrolled face models,
//! and the kiosk settings table.

use baseera_core::{Embedding, FaceModel};
use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const DAY_FORMAT: &str = "%Y-%m-%d";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("embedding encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("malformed timestamp in attendance row: {0}")]
    BadTimestamp(String),
    #[error("employee already exists: {0}")]
    DuplicateEmployee(String),
    #[error("database lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Employee {
    pub name: String,
    pub email: String,
}

/// One recognition event of one employee on one day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRecord {
    pub employee: String,
    pub recorded_at: NaiveDateTime,
}

/// Dedup-aware attendance storage consulted by the recognition pipeline.
pub trait AttendanceLedger: Send + Sync {
    fn exists(&self, identity: &str, day: NaiveDate) -> Result<bool, StoreError>;
    fn record(&self, identity: &str, at: NaiveDateTime) -> Result<(), StoreError>;
}

/// Owns the SQLite connection.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        migrate(&conn)?;
        tracing::info!(path = %path.display(), "database opened");
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&mut conn)
    }

    // --- employees ---

    pub fn add_employee(&self, name: &str, email: &str) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            match conn.execute(
                "INSERT INTO employees (name, email) VALUES (?1, ?2)",
                params![name, email],
            ) {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::DuplicateEmployee(name.to_string()))
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Delete an employee together with their attendance and face models.
    pub fn remove_employee(&self, name: &str) -> Result<bool, StoreError> {
        self.with_connection(|conn| {
            let tx = conn.transaction()?;
            let removed = tx.execute("DELETE FROM employees WHERE name = ?1", params![name])?;
            tx.execute("DELETE FROM attendance WHERE name = ?1", params![name])?;
            tx.execute("DELETE FROM face_models WHERE employee = ?1", params![name])?;
            tx.commit()?;
            Ok(removed > 0)
        })
    }

    pub fn update_email(&self, name: &str, email: &str) -> Result<bool, StoreError> {
        self.with_connection(|conn| {
            let changed = conn.execute(
                "UPDATE employees SET email = ?1 WHERE name = ?2",
                params![email, name],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn list_employees(&self) -> Result<Vec<Employee>, StoreError> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare("SELECT name, email FROM employees ORDER BY name")?;
            let rows = stmt.query_map([], |row| {
                Ok(Employee {
                    name: row.get(0)?,
                    email: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    // --- attendance ---

    pub fn attendance_on(&self, day: NaiveDate) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name, timestamp FROM attendance WHERE date(timestamp) = ?1 ORDER BY timestamp",
            )?;
            let rows = stmt.query_map(params![day.format(DAY_FORMAT).to_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut records = Vec::new();
            for row in rows {
                let (employee, ts) = row?;
                let recorded_at = NaiveDateTime::parse_from_str(&ts, TIMESTAMP_FORMAT)
                    .map_err(|_| StoreError::BadTimestamp(ts.clone()))?;
                records.push(AttendanceRecord { employee, recorded_at });
            }
            Ok(records)
        })
    }

    /// Employees with no attendance row on `day`.
    pub fn absentees(&self, day: NaiveDate) -> Result<Vec<Employee>, StoreError> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name, email FROM employees
                 WHERE name NOT IN (SELECT name FROM attendance WHERE date(timestamp) = ?1)
                 ORDER BY name",
            )?;
            let rows = stmt.query_map(params![day.format(DAY_FORMAT).to_string()], |row| {
                Ok(Employee {
                    name: row.get(0)?,
                    email: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    // --- face models ---

    pub fn add_face_models(&self, models: &[FaceModel]) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            let tx = conn.transaction()?;
            for model in models {
                tx.execute(
                    "INSERT INTO face_models (id, employee, embedding, created_at) VALUES (?1, ?2, ?3, ?4)",
                    params![
                        model.id,
                        model.employee,
                        serde_json::to_string(&model.embedding)?,
                        model.created_at
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn load_face_models(&self) -> Result<Vec<FaceModel>, StoreError> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, employee, embedding, created_at FROM face_models ORDER BY created_at",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;
            let mut models = Vec::new();
            for row in rows {
                let (id, employee, embedding, created_at) = row?;
                let embedding: Embedding = serde_json::from_str(&embedding)?;
                models.push(FaceModel { id, employee, embedding, created_at });
            }
            Ok(models)
        })
    }

    // --- settings ---

    /// Insert any missing defaults; existing values are kept.
    pub fn seed_settings(&self, defaults: &[(&str, &str)]) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            let tx = conn.transaction()?;
            for (key, value) in defaults {
                tx.execute(
                    "INSERT OR IGNORE INTO settings (key, value) VALUES (?1, ?2)",
                    params![key, value],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn settings(&self) -> Result<HashMap<String, String>, StoreError> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            Ok(rows.collect::<Result<HashMap<_, _>, _>>()?)
        })
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
    }
}

impl AttendanceLedger for Store {
    fn exists(&self, identity: &str, day: NaiveDate) -> Result<bool, StoreError> {
        self.with_connection(|conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM attendance WHERE name = ?1 AND date(timestamp) = ?2 LIMIT 1",
                    params![identity, day.format(DAY_FORMAT).to_string()],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    fn record(&self, identity: &str, at: NaiveDateTime) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO attendance (name, timestamp) VALUES (?1, ?2)",
                params![identity, at.format(TIMESTAMP_FORMAT).to_string()],
            )?;
            Ok(())
        })
    }
}

fn migrate(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS employees (
             id INTEGER PRIMARY KEY,
             name TEXT NOT NULL UNIQUE,
             email TEXT
         );
         CREATE TABLE IF NOT EXISTS attendance (
             id INTEGER PRIMARY KEY,
             name TEXT NOT NULL,
             timestamp TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_attendance_name_day ON attendance (name, date(timestamp));
         CREATE TABLE IF NOT EXISTS face_models (
             id TEXT PRIMARY KEY,
             employee TEXT NOT NULL,
             embedding TEXT NOT NULL,
             created_at TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS settings (
             key TEXT PRIMARY KEY,
             value TEXT
         );",
    )?;
    Ok(())
}
