use std::sync::Mutex;

use anyhow::Result;

use super::{KeeperSnapshot, Store, StoredEvent};

/// Volatile backend for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStore {
    events: Mutex<Vec<StoredEvent>>,
    snapshot: Mutex<Option<KeeperSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

impl Store for MemoryStore {
    fn append(&self, event: &StoredEvent) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }

    fn save_snapshot(&self, snapshot: &KeeperSnapshot) -> Result<()> {
        *self.snapshot.lock().unwrap() = Some(snapshot.clone());
        Ok(())
    }

    fn load_snapshot(&self) -> Result<Option<KeeperSnapshot>> {
        Ok(self.snapshot.lock().unwrap().clone())
    }

    fn load_events(&self) -> Result<Vec<StoredEvent>> {
        Ok(self.events.lock().unwrap().clone())
    }
}
