//! Local SQLite persistence for synchronized state.
//!
//! Uses rusqlite with WAL mode, matching the configuration the terminals
//! have always run. One row per logical state key holds the raw JSON
//! serialization of the current value; writes that change a slot are
//! broadcast on the local bus so sibling contexts converge.

use crate::bus::{LocalBus, SlotChange};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Durable key/value store shared by every synchronized container in the
/// process. Cloning returns a handle to the same store.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    bus: LocalBus,
}

impl StateStore {
    /// Open (or create) the store at `{data_dir}/tillsync.db`.
    ///
    /// Creates the directory if needed, opens the connection, sets pragmas,
    /// and runs any pending migrations. On corruption or open failure,
    /// deletes the file and retries once.
    pub fn open(data_dir: &Path) -> Result<StateStore, String> {
        fs::create_dir_all(data_dir).map_err(|e| format!("Failed to create data dir: {e}"))?;

        let db_path = data_dir.join("tillsync.db");
        info!("Opening state store at {}", db_path.display());

        let conn = match open_and_configure(&db_path) {
            Ok(c) => c,
            Err(first_err) => {
                warn!(
                    "State store open failed ({}), deleting and retrying once",
                    first_err
                );
                if db_path.exists() {
                    let _ = fs::remove_file(&db_path);
                    // Also remove WAL/SHM files if present
                    let wal = db_path.with_extension("db-wal");
                    let shm = db_path.with_extension("db-shm");
                    let _ = fs::remove_file(&wal);
                    let _ = fs::remove_file(&shm);
                }
                open_and_configure(&db_path)
                    .map_err(|e| format!("State store open failed after retry: {e}"))?
            }
        };

        run_migrations(&conn)?;

        info!("State store initialized (schema v{CURRENT_SCHEMA_VERSION})");

        Ok(StateStore {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(conn),
                db_path,
                bus: LocalBus::new(),
            }),
        })
    }

    /// In-memory store, used by tests and ephemeral kiosk sessions that do
    /// not want durability across restarts.
    pub fn open_in_memory() -> Result<StateStore, String> {
        let conn = Connection::open_in_memory().map_err(|e| format!("sqlite open: {e}"))?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| format!("pragma setup: {e}"))?;
        run_migrations(&conn)?;

        Ok(StateStore {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(conn),
                db_path: PathBuf::from(":memory:"),
                bus: LocalBus::new(),
            }),
        })
    }

    /// The change bus this store broadcasts on.
    pub fn bus(&self) -> &LocalBus {
        &self.inner.bus
    }

    pub fn db_path(&self) -> &Path {
        &self.inner.db_path
    }

    /// Read the raw serialized value for a key. Read errors are logged and
    /// reported as absent.
    pub fn get(&self, key: &str) -> Option<String> {
        let conn = match self.inner.conn.lock() {
            Ok(c) => c,
            Err(e) => {
                warn!(key, error = %e, "store: connection lock poisoned");
                return None;
            }
        };
        match conn
            .query_row(
                "SELECT slot_value FROM state_slots WHERE slot_key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()
        {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "store: read failed");
                None
            }
        }
    }

    /// Write the raw serialized value for a key.
    ///
    /// Broadcasts a [`SlotChange`] on the bus only when the stored
    /// serialization actually changed; an identical write is a no-op. That
    /// gate is what keeps adopt-and-republish cascades between sibling
    /// contexts finite.
    pub fn put(&self, key: &str, raw: &str, origin: &str) -> Result<(), String> {
        {
            let conn = self.inner.conn.lock().map_err(|e| e.to_string())?;
            let current: Option<String> = conn
                .query_row(
                    "SELECT slot_value FROM state_slots WHERE slot_key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| format!("store read: {e}"))?;

            if current.as_deref() == Some(raw) {
                return Ok(());
            }

            conn.execute(
                "INSERT INTO state_slots (slot_key, slot_value, updated_at)
                 VALUES (?1, ?2, datetime('now'))
                 ON CONFLICT(slot_key) DO UPDATE SET
                    slot_value = excluded.slot_value, updated_at = excluded.updated_at",
                params![key, raw],
            )
            .map_err(|e| format!("store write: {e}"))?;
        }

        self.inner.bus.publish(&SlotChange {
            key: key.to_string(),
            raw: raw.to_string(),
            origin: origin.to_string(),
        });
        Ok(())
    }

    /// All keys currently holding a slot, for diagnostics surfaces.
    pub fn keys(&self) -> Vec<String> {
        let conn = match self.inner.conn.lock() {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "store: connection lock poisoned");
                return Vec::new();
            }
        };
        let mut stmt = match conn.prepare("SELECT slot_key FROM state_slots ORDER BY slot_key") {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "store: key listing failed");
                return Vec::new();
            }
        };
        let result = match stmt.query_map([], |row| row.get::<_, String>(0)) {
            Ok(rows) => rows.flatten().collect(),
            Err(e) => {
                warn!(error = %e, "store: key listing failed");
                Vec::new()
            }
        };
        result
    }
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), String> {
    // Ensure schema_version table exists first
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    info!("Migrating state store from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }

    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "BEGIN;
         CREATE TABLE IF NOT EXISTS state_slots (
             slot_key   TEXT PRIMARY KEY,
             slot_value TEXT NOT NULL,
             updated_at TEXT DEFAULT (datetime('now'))
         );
         INSERT INTO schema_version (version) VALUES (1);
         COMMIT;",
    )
    .map_err(|e| format!("migration v1: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_then_get_round_trip() {
        let store = StateStore::open_in_memory().unwrap();
        store.put("activeOrders", "[]", "ctx-1").unwrap();
        assert_eq!(store.get("activeOrders").as_deref(), Some("[]"));
        assert_eq!(store.get("missing"), None);
    }

    #[test]
    fn test_put_overwrites_previous_value() {
        let store = StateStore::open_in_memory().unwrap();
        store.put("tables", "[1]", "ctx-1").unwrap();
        store.put("tables", "[1,2]", "ctx-1").unwrap();
        assert_eq!(store.get("tables").as_deref(), Some("[1,2]"));
    }

    #[test]
    fn test_changed_write_broadcasts_on_bus() {
        let store = StateStore::open_in_memory().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_inner = seen.clone();
        let _sub = store.bus().subscribe(move |change| {
            seen_inner.lock().unwrap().push((
                change.key.clone(),
                change.raw.clone(),
                change.origin.clone(),
            ));
        });

        store.put("menuItems", "[\"pita\"]", "ctx-9").unwrap();

        let got = seen.lock().unwrap().clone();
        assert_eq!(
            got,
            vec![(
                "menuItems".to_string(),
                "[\"pita\"]".to_string(),
                "ctx-9".to_string()
            )]
        );
    }

    #[test]
    fn test_identical_write_is_silent() {
        let store = StateStore::open_in_memory().unwrap();
        store.put("stockItems", "[]", "seed").unwrap();

        let seen = Arc::new(Mutex::new(0usize));
        let seen_inner = seen.clone();
        let _sub = store
            .bus()
            .subscribe(move |_| *seen_inner.lock().unwrap() += 1);

        store.put("stockItems", "[]", "ctx-1").unwrap();
        assert_eq!(*seen.lock().unwrap(), 0);

        store.put("stockItems", "[7]", "ctx-1").unwrap();
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn test_keys_lists_all_slots() {
        let store = StateStore::open_in_memory().unwrap();
        store.put("tables", "[]", "s").unwrap();
        store.put("activeOrders", "[]", "s").unwrap();
        assert_eq!(store.keys(), vec!["activeOrders", "tables"]);
    }
}
