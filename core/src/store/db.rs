//! SQLite connection setup and schema migrations (spec §4.C).
//!
//! WAL mode, foreign keys on, integer-numbered migrations tracked in a
//! `meta` table. The process refuses to start if the database carries a
//! schema version newer than this binary knows about.

use std::path::Path;

use rusqlite::Connection;

use crate::error::{BridgeError, BridgeResult};

const SCHEMA_VERSION_KEY: &str = "schema_version";

type Migration = fn(&Connection) -> rusqlite::Result<()>;

/// Ordered, append-only list of migrations. Each entry's version must be
/// exactly one greater than the previous.
const MIGRATIONS: &[(i64, Migration)] = &[(1, migration_initial_schema)];

fn migration_initial_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS devices (
            id TEXT PRIMARY KEY,
            protocol TEXT NOT NULL DEFAULT 'govee',
            ip TEXT,
            name TEXT,
            description TEXT,
            model TEXT,
            device_type TEXT,
            capabilities_json TEXT NOT NULL DEFAULT '{}',
            manual INTEGER NOT NULL DEFAULT 0,
            discovered INTEGER NOT NULL DEFAULT 0,
            configured INTEGER NOT NULL DEFAULT 0,
            enabled INTEGER NOT NULL DEFAULT 1,
            stale INTEGER NOT NULL DEFAULT 0,
            offline INTEGER NOT NULL DEFAULT 0,
            failure_count INTEGER NOT NULL DEFAULT 0,
            last_payload_hash TEXT,
            last_payload_at INTEGER,
            last_failure_at INTEGER,
            poll_failure_count INTEGER NOT NULL DEFAULT 0,
            poll_last_success_at INTEGER,
            poll_last_failure_at INTEGER,
            poll_state_json TEXT,
            poll_state_updated_at INTEGER,
            first_seen INTEGER NOT NULL,
            last_seen INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS mappings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id TEXT NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
            universe INTEGER NOT NULL,
            channel INTEGER NOT NULL,
            length INTEGER NOT NULL DEFAULT 1,
            mapping_type TEXT NOT NULL,
            field TEXT,
            fields_json TEXT,
            allow_overlap INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_mappings_universe_channel
            ON mappings (universe, channel);

        CREATE INDEX IF NOT EXISTS idx_mappings_device
            ON mappings (device_id);

        CREATE TABLE IF NOT EXISTS state (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id TEXT NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
            payload BLOB NOT NULL,
            context_id TEXT,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_state_device
            ON state (device_id, id);

        CREATE TABLE IF NOT EXISTS dead_letters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            state_id INTEGER,
            device_id TEXT,
            payload BLOB,
            payload_hash TEXT,
            context_id TEXT,
            reason TEXT NOT NULL,
            details TEXT,
            state_created_at INTEGER,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_dead_letters_device
            ON dead_letters (device_id);
        "#,
    )
}

fn get_schema_version(conn: &Connection) -> rusqlite::Result<i64> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        [],
    )?;
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = ?1",
            [SCHEMA_VERSION_KEY],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(raw.and_then(|v| v.parse().ok()).unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i64) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        rusqlite::params![SCHEMA_VERSION_KEY, version.to_string()],
    )?;
    Ok(())
}

use rusqlite::OptionalExtension;

/// Opens (creating if necessary) the database at `path`, enables WAL mode
/// and foreign keys, and applies any pending migrations. Refuses to start
/// if the on-disk schema version is newer than the highest migration this
/// binary knows about.
pub fn open_and_migrate(path: &Path) -> BridgeResult<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BridgeError::Persistence(format!("create db dir {parent:?}: {e}")))?;
        }
    }

    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    let current = get_schema_version(&conn)?;
    let highest_known = MIGRATIONS.iter().map(|(v, _)| *v).max().unwrap_or(0);
    if current > highest_known {
        return Err(BridgeError::Persistence(format!(
            "database schema version {current} is newer than the highest version this binary knows ({highest_known}); refusing to start"
        )));
    }

    for (version, migration) in MIGRATIONS.iter().filter(|(v, _)| *v > current) {
        log::info!("applying migration version={version}");
        migration(&conn)?;
        set_schema_version(&conn, *version)?;
    }

    Ok(conn)
}
