//! `SQLite` persistence layer.

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Result as SqliteResult};
use std::path::Path;

/// Settings persisted per bridge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BridgeSettings {
    /// Start the bridge when the agent boots
    pub autostart: bool,
    /// Modbus poll interval in seconds
    pub poll_interval: f64,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            autostart: false,
            poll_interval: 1.0,
        }
    }
}

/// A stored mapping row. The body is the mapping's JSON form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingRow {
    /// Mapping id
    pub id: String,
    /// Mapping JSON
    pub body: String,
}

/// `SQLite`-backed persistence store, shared by every bridge.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a `SQLite` database.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened or initialized.
    pub fn open(path: &Path) -> SqliteResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory database.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be created.
    pub fn in_memory() -> SqliteResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> SqliteResult<()> {
        self.conn.lock().execute_batch(
            r"
            -- Mapping definitions, in insertion order per bridge
            CREATE TABLE IF NOT EXISTS mappings (
                bridge TEXT NOT NULL,
                id TEXT NOT NULL,
                position INTEGER NOT NULL,
                body TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (bridge, id)
            );

            CREATE INDEX IF NOT EXISTS idx_mappings_position ON mappings(bridge, position);

            -- Per-bridge settings
            CREATE TABLE IF NOT EXISTS bridge_settings (
                bridge TEXT PRIMARY KEY,
                autostart INTEGER NOT NULL,
                poll_interval REAL NOT NULL,
                updated_at INTEGER NOT NULL
            );
            ",
        )?;

        Ok(())
    }

    /// Load all mappings of a bridge in insertion order.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub fn load_mappings(&self, bridge: &str) -> SqliteResult<Vec<MappingRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r"
            SELECT id, body FROM mappings
            WHERE bridge = ?1
            ORDER BY position ASC
            ",
        )?;

        let rows = stmt
            .query_map([bridge], |row| {
                Ok(MappingRow {
                    id: row.get(0)?,
                    body: row.get(1)?,
                })
            })?
            .collect::<SqliteResult<Vec<MappingRow>>>()?;

        Ok(rows)
    }

    /// Append a mapping after the existing ones.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails, including when the id already exists.
    pub fn insert_mapping(&self, bridge: &str, id: &str, body: &str) -> SqliteResult<()> {
        self.conn.lock().execute(
            r"
            INSERT INTO mappings (bridge, id, position, body, updated_at)
            VALUES (
                ?1, ?2,
                (SELECT COALESCE(MAX(position), 0) + 1 FROM mappings WHERE bridge = ?1),
                ?3, ?4
            )
            ",
            (bridge, id, body, now()),
        )?;

        Ok(())
    }

    /// Replace a mapping body, keeping its position.
    ///
    /// Returns `false` if no such mapping exists.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub fn update_mapping(&self, bridge: &str, id: &str, body: &str) -> SqliteResult<bool> {
        let changed = self.conn.lock().execute(
            "UPDATE mappings SET body = ?3, updated_at = ?4 WHERE bridge = ?1 AND id = ?2",
            (bridge, id, body, now()),
        )?;
        Ok(changed > 0)
    }

    /// Delete a mapping.
    ///
    /// Returns `false` if no such mapping exists.
    ///
    /// # Errors
    ///
    /// Returns error if delete fails.
    pub fn delete_mapping(&self, bridge: &str, id: &str) -> SqliteResult<bool> {
        let changed = self.conn.lock().execute(
            "DELETE FROM mappings WHERE bridge = ?1 AND id = ?2",
            (bridge, id),
        )?;
        Ok(changed > 0)
    }

    /// Load the settings of a bridge, if ever saved.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub fn load_settings(&self, bridge: &str) -> SqliteResult<Option<BridgeSettings>> {
        self.conn
            .lock()
            .query_row(
                "SELECT autostart, poll_interval FROM bridge_settings WHERE bridge = ?1",
                [bridge],
                |row| {
                    Ok(BridgeSettings {
                        autostart: row.get(0)?,
                        poll_interval: row.get(1)?,
                    })
                },
            )
            .optional()
    }

    /// Save the settings of a bridge.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub fn save_settings(&self, bridge: &str, settings: &BridgeSettings) -> SqliteResult<()> {
        self.conn.lock().execute(
            r"
            INSERT OR REPLACE INTO bridge_settings (bridge, autostart, poll_interval, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ",
            (bridge, settings.autostart, settings.poll_interval, now()),
        )?;

        Ok(())
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
