use std::path::Path;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use rusqlite::Connection;

use super::{KeeperSnapshot, Store, StoredEvent, SCHEMA_VERSION};

/// Durable backend on rusqlite. Events and snapshot are stored as JSON
/// columns so the schema survives model evolution; WAL keeps appends cheap.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).context("creating db directory")?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening sqlite at {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        migrate(&conn)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS events (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at  INTEGER DEFAULT (unixepoch()),
            body        TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS snapshot (
            id              INTEGER PRIMARY KEY CHECK (id = 1),
            schema_version  INTEGER NOT NULL,
            saved_at        INTEGER NOT NULL,
            body            TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

impl Store for SqliteStore {
    fn append(&self, event: &StoredEvent) -> Result<()> {
        let body = serde_json::to_string(event).context("serializing event")?;
        let conn = self.conn.lock().unwrap();
        conn.execute("INSERT INTO events (body) VALUES (?1)", [&body])
            .context("inserting event")?;
        Ok(())
    }

    fn save_snapshot(&self, snapshot: &KeeperSnapshot) -> Result<()> {
        let body = serde_json::to_string(snapshot).context("serializing snapshot")?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO snapshot (id, schema_version, saved_at, body)
             VALUES (1, ?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                 schema_version = excluded.schema_version,
                 saved_at = excluded.saved_at,
                 body = excluded.body",
            rusqlite::params![snapshot.schema_version, snapshot.saved_at, body],
        )
        .context("upserting snapshot")?;
        Ok(())
    }

    fn load_snapshot(&self) -> Result<Option<KeeperSnapshot>> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(u32, String)> = conn
            .query_row(
                "SELECT schema_version, body FROM snapshot WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .ok();
        let Some((version, body)) = row else {
            return Ok(None);
        };
        if version > SCHEMA_VERSION {
            bail!("snapshot schema v{version} is newer than supported v{SCHEMA_VERSION}");
        }
        Ok(Some(
            serde_json::from_str(&body).context("parsing snapshot body")?,
        ))
    }

    fn load_events(&self) -> Result<Vec<StoredEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT body FROM events ORDER BY id ASC")
            .context("preparing event query")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("querying events")?;
        let mut events = Vec::new();
        for body in rows {
            let body = body.context("reading event row")?;
            events.push(serde_json::from_str(&body).context("parsing event body")?);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_round_trips_events_and_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("keeper.db")).unwrap();

        store
            .append(&StoredEvent::MetricsReset { timestamp: 7 })
            .unwrap();
        let events = store.load_events().unwrap();
        assert_eq!(events.len(), 1);

        let snapshot = KeeperSnapshot {
            schema_version: SCHEMA_VERSION,
            realized_pnl: -3.0,
            saved_at: 42,
            ..Default::default()
        };
        store.save_snapshot(&snapshot).unwrap();
        // Second save overwrites, not duplicates
        store.save_snapshot(&snapshot).unwrap();
        let loaded = store.load_snapshot().unwrap().unwrap();
        assert_eq!(loaded.realized_pnl, -3.0);
    }
}
