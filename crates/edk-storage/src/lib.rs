use chrono::{DateTime, Utc};
use edk_core::{Device, DeviceStatus};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

pub const REGISTRY_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveUser {
    pub user_id: String,
    pub display_name: Option<String>,
    pub logged_in_at: DateTime<Utc>,
}

/// Durable device registry plus the logged-in user record. Every mutation is
/// written through immediately; reads go straight to the database, so the
/// store itself is the single source of truth.
pub struct DeviceStore {
    conn: Connection,
}

impl DeviceStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > REGISTRY_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: REGISTRY_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_registry.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    pub fn table_exists(&self, name: &str) -> Result<bool, StorageError> {
        let found: Option<String> = self
            .conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Dedup-checked upsert keyed on (user, device id). An existing entry is
    /// left untouched, so pairing the same unit twice is an idempotent
    /// success rather than a duplicate.
    pub fn upsert_device(
        &self,
        user_id: &str,
        device: &Device,
    ) -> Result<UpsertOutcome, StorageError> {
        let changes = self.conn.execute(
            "
            INSERT INTO devices (
                user_id,
                device_id,
                display_name,
                kind,
                connection_status,
                last_seen_at,
                network_address,
                signal_quality,
                inserted_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(user_id, device_id) DO NOTHING
            ",
            params![
                user_id,
                device.id,
                device.display_name,
                device.kind,
                device.connection_status.as_str(),
                device.last_seen_at.to_rfc3339(),
                device.network_address,
                i64::from(device.signal_quality),
                Utc::now().to_rfc3339(),
            ],
        )?;

        if changes > 0 {
            Ok(UpsertOutcome::Inserted)
        } else {
            Ok(UpsertOutcome::Unchanged)
        }
    }

    /// Devices in insertion order, for a stable UI listing.
    pub fn list_devices(&self, user_id: &str) -> Result<Vec<Device>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT device_id, display_name, kind, connection_status,
                   last_seen_at, network_address, signal_quality
            FROM devices
            WHERE user_id = ?1
            ORDER BY rowid
            ",
        )?;
        let rows = stmt.query_map([user_id], |row| {
            let status: String = row.get(3)?;
            let last_seen: String = row.get(4)?;
            let signal: i64 = row.get(6)?;
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                status,
                last_seen,
                row.get::<_, Option<String>>(5)?,
                signal,
            ))
        })?;

        let mut devices = Vec::new();
        for row in rows {
            let (id, display_name, kind, status, last_seen, network_address, signal) = row?;
            devices.push(Device {
                id,
                display_name,
                kind,
                connection_status: DeviceStatus::from_str(&status)
                    .unwrap_or(DeviceStatus::Unknown),
                last_seen_at: parse_rfc3339(&last_seen)?,
                network_address,
                signal_quality: signal.clamp(0, 100) as u8,
            });
        }
        Ok(devices)
    }

    pub fn remove_device(&self, user_id: &str, device_id: &str) -> Result<bool, StorageError> {
        let changes = self.conn.execute(
            "DELETE FROM devices WHERE user_id = ?1 AND device_id = ?2",
            params![user_id, device_id],
        )?;
        Ok(changes > 0)
    }

    /// Updates liveness of a known device. Returns false for an unknown id;
    /// a status update never creates a device implicitly.
    pub fn update_status(
        &self,
        user_id: &str,
        device_id: &str,
        status: DeviceStatus,
        seen_at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let changes = self.conn.execute(
            "
            UPDATE devices
            SET connection_status = ?3, last_seen_at = ?4
            WHERE user_id = ?1 AND device_id = ?2
            ",
            params![user_id, device_id, status.as_str(), seen_at.to_rfc3339()],
        )?;
        Ok(changes > 0)
    }

    pub fn set_active_user(
        &self,
        user_id: &str,
        display_name: Option<&str>,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO active_user (slot, user_id, display_name, logged_in_at)
            VALUES (0, ?1, ?2, ?3)
            ON CONFLICT(slot) DO UPDATE SET
                user_id=excluded.user_id,
                display_name=excluded.display_name,
                logged_in_at=excluded.logged_in_at
            ",
            params![user_id, display_name, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn active_user(&self) -> Result<Option<ActiveUser>, StorageError> {
        let row = self
            .conn
            .query_row(
                "SELECT user_id, display_name, logged_in_at FROM active_user WHERE slot = 0",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((user_id, display_name, logged_in_at)) => Ok(Some(ActiveUser {
                user_id,
                display_name,
                logged_in_at: parse_rfc3339(&logged_in_at)?,
            })),
            None => Ok(None),
        }
    }

    pub fn clear_active_user(&self) -> Result<bool, StorageError> {
        let changes = self.conn.execute("DELETE FROM active_user WHERE slot = 0", [])?;
        Ok(changes > 0)
    }
}

fn parse_rfc3339(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(format!("{raw}: {err}")))
}
