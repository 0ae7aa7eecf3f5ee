//! Process-local key → array store backing the side-channel completion signal.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use synthflow_core::signal::{CompletionSignal, COMPLETED_DISTRIBUTIONS_KEY};
use thiserror::Error;

pub const SIDE_CHANNEL_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("store connection lock poisoned")]
    Poisoned,
}

pub struct SideChannelStore {
    conn: Mutex<Connection>,
}

impl SideChannelStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        let conn = self.conn()?;
        Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > SIDE_CHANNEL_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: SIDE_CHANNEL_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let conn = self.conn()?;
            let sql = include_str!("../migrations/0001_side_channel.sql");
            conn.execute_batch(sql)?;
            conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
        }

        Ok(())
    }

    /// Reads the array stored under `key`. Missing keys and values that are not
    /// JSON arrays read as empty; numeric members are kept as their text form.
    pub fn read_array(&self, key: &str) -> Result<Vec<String>, StorageError> {
        let conn = self.conn()?;
        read_array_with(&conn, key)
    }

    /// Appends `value` unless already present. Returns true when inserted.
    pub fn append_to_array(&self, key: &str, value: &str) -> Result<bool, StorageError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut values = read_array_with(&tx, key)?;
        if values.iter().any(|existing| existing == value) {
            return Ok(false);
        }
        values.push(value.to_string());
        write_array_with(&tx, key, &values)?;
        tx.commit()?;
        Ok(true)
    }

    /// Removes every occurrence of `value`. Returns true when anything changed.
    pub fn remove_from_array(&self, key: &str, value: &str) -> Result<bool, StorageError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut values = read_array_with(&tx, key)?;
        let before = values.len();
        values.retain(|existing| existing != value);
        if values.len() == before {
            return Ok(false);
        }
        write_array_with(&tx, key, &values)?;
        tx.commit()?;
        Ok(true)
    }

    pub fn keys(&self) -> Result<Vec<String>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT key FROM side_channel ORDER BY key ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }

    pub fn mark_distribution_completed(&self, workflow_id: &str) -> Result<bool, StorageError> {
        self.append_to_array(COMPLETED_DISTRIBUTIONS_KEY, workflow_id)
    }

    pub fn clear_distribution_completed(&self, workflow_id: &str) -> Result<bool, StorageError> {
        self.remove_from_array(COMPLETED_DISTRIBUTIONS_KEY, workflow_id)
    }

    pub fn completed_distributions(&self) -> Result<Vec<String>, StorageError> {
        self.read_array(COMPLETED_DISTRIBUTIONS_KEY)
    }

    pub fn is_distribution_completed(&self, workflow_id: &str) -> Result<bool, StorageError> {
        Ok(self
            .completed_distributions()?
            .iter()
            .any(|existing| existing == workflow_id))
    }
}

impl CompletionSignal for SideChannelStore {
    /// Unreadable stores count as "no signal".
    fn has_external_completion_signal(&self, workflow_id: &str) -> bool {
        self.is_distribution_completed(workflow_id).unwrap_or(false)
    }
}

fn read_array_with(conn: &Connection, key: &str) -> Result<Vec<String>, StorageError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM side_channel WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;

    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    let values = match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(text) => Some(text),
                Value::Number(number) => Some(number.to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };
    Ok(values)
}

fn write_array_with(conn: &Connection, key: &str, values: &[String]) -> Result<(), StorageError> {
    let value_json =
        serde_json::to_string(values).map_err(|err| StorageError::Serialization(err.to_string()))?;
    conn.execute(
        "
        INSERT INTO side_channel (key, value_json, updated_at)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(key) DO UPDATE SET
            value_json = excluded.value_json,
            updated_at = excluded.updated_at
        ",
        params![key, value_json, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}
