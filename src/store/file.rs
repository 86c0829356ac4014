use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};

use super::{KeeperSnapshot, Store, StoredEvent, SCHEMA_VERSION};

/// JSON-lines event log plus a JSON snapshot file, written atomically via
/// a temp file and rename.
pub struct FileStore {
    events_path: PathBuf,
    snapshot_path: PathBuf,
    writer: Mutex<File>,
}

impl FileStore {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating store dir {}", dir.display()))?;
        let events_path = dir.join("events.jsonl");
        let snapshot_path = dir.join("snapshot.json");
        let writer = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&events_path)
            .with_context(|| format!("opening {}", events_path.display()))?;
        Ok(FileStore {
            events_path,
            snapshot_path,
            writer: Mutex::new(writer),
        })
    }
}

impl Store for FileStore {
    fn append(&self, event: &StoredEvent) -> Result<()> {
        let line = serde_json::to_string(event).context("serializing event")?;
        let mut writer = self.writer.lock().unwrap();
        writeln!(writer, "{line}").context("appending event")?;
        writer.flush().context("flushing event log")?;
        Ok(())
    }

    fn save_snapshot(&self, snapshot: &KeeperSnapshot) -> Result<()> {
        let tmp = self.snapshot_path.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(snapshot).context("serializing snapshot")?;
        std::fs::write(&tmp, body).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.snapshot_path)
            .with_context(|| format!("renaming into {}", self.snapshot_path.display()))?;
        Ok(())
    }

    fn load_snapshot(&self) -> Result<Option<KeeperSnapshot>> {
        if !self.snapshot_path.exists() {
            return Ok(None);
        }
        let body = std::fs::read_to_string(&self.snapshot_path)
            .with_context(|| format!("reading {}", self.snapshot_path.display()))?;
        let snapshot: KeeperSnapshot =
            serde_json::from_str(&body).context("parsing snapshot")?;
        if snapshot.schema_version > SCHEMA_VERSION {
            bail!(
                "snapshot schema v{} is newer than supported v{}",
                snapshot.schema_version,
                SCHEMA_VERSION
            );
        }
        Ok(Some(snapshot))
    }

    fn load_events(&self) -> Result<Vec<StoredEvent>> {
        if !self.events_path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.events_path)
            .with_context(|| format!("opening {}", self.events_path.display()))?;
        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.context("reading event line")?;
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(&line).context("parsing event line")?);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(store.load_snapshot().unwrap().is_none());

        let snapshot = KeeperSnapshot {
            schema_version: SCHEMA_VERSION,
            realized_funding: 12.5,
            saved_at: 1000,
            ..Default::default()
        };
        store.save_snapshot(&snapshot).unwrap();
        let loaded = store.load_snapshot().unwrap().unwrap();
        assert_eq!(loaded.realized_funding, 12.5);
        assert_eq!(loaded.saved_at, 1000);
    }

    #[test]
    fn events_append_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store
            .append(&StoredEvent::MetricsReset { timestamp: 1 })
            .unwrap();
        store
            .append(&StoredEvent::MetricsReset { timestamp: 2 })
            .unwrap();
        let events = store.load_events().unwrap();
        assert_eq!(events.len(), 2);
    }
}
