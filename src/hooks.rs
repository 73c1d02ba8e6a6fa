use std::sync::Mutex;
use hashbrown::HashMap;
use serde::Serialize;

use crate::client::ClientId;

/// Callbacks fired by the engine at client state transitions.
///
/// All of them run synchronously on the engine task: implementations
/// must not block and must not send into engine channels, or the event
/// loop deadlocks on itself.
pub trait SourceHandler: Send + Sync {
    /// A new client connected and was admitted to its mount
    fn on_connect(&self, _mount: &str, _id: &ClientId) {}

    /// A client was removed. Its socket is already closed at this
    /// point, which avoids a class of surprises in implementations
    fn on_disconnect(&self, _mount: &str, _id: &ClientId) {}

    /// The client's audio now reaches the upstream. Data of clients
    /// outside live mode is discarded
    fn on_live(&self, _mount: &str, _id: &ClientId) {}

    /// The client left live mode
    fn on_unlive(&self, _mount: &str, _id: &ClientId) {}

    /// Accepted metadata arrived for a connected client
    fn on_metadata(&self, _mount: &str, _id: &ClientId, _metadata: &str) {}
}

/// Handler that ignores every transition
pub struct NullHandler;

impl SourceHandler for NullHandler {}

#[derive(Clone, Serialize)]
pub struct RosterEntry {
    pub name: String,
    pub addr: String,
    pub agent: Option<String>,
    pub metadata: String,
    pub live: bool
}

/// Read-only admin view over connected sources.
///
/// Keeps one ordered list per mount with the live source at index 0,
/// fed purely by engine callbacks. Entries are keyed by the client
/// address since the port makes it unique per connection.
#[derive(Default)]
pub struct MountRoster {
    mounts: Mutex<HashMap<String, Vec<RosterEntry>>>
}

impl MountRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one mount, None when the mount is unknown
    pub fn snapshot(&self, mount: &str) -> Option<Vec<RosterEntry>> {
        self.mounts.lock().unwrap().get(mount).cloned()
    }

    pub fn mounts(&self) -> Vec<String> {
        self.mounts.lock().unwrap().keys().cloned().collect()
    }
}

impl SourceHandler for MountRoster {
    fn on_connect(&self, mount: &str, id: &ClientId) {
        let mut lock = self.mounts.lock().unwrap();
        lock.entry_ref(mount).or_default().push(RosterEntry {
            name: id.name.clone(),
            addr: id.addr.clone(),
            agent: id.agent.clone(),
            metadata: String::new(),
            live: false
        });
    }

    fn on_disconnect(&self, mount: &str, id: &ClientId) {
        let mut lock = self.mounts.lock().unwrap();
        if let Some(entries) = lock.get_mut(mount) {
            entries.retain(|entry| entry.addr != id.addr);
            if entries.is_empty() {
                lock.remove(mount);
            }
        }
    }

    fn on_live(&self, mount: &str, id: &ClientId) {
        let mut lock = self.mounts.lock().unwrap();
        if let Some(entries) = lock.get_mut(mount) {
            if let Some(pos) = entries.iter().position(|entry| entry.addr == id.addr) {
                let mut entry = entries.remove(pos);
                entry.live    = true;
                entries.insert(0, entry);
            }
        }
    }

    fn on_unlive(&self, mount: &str, id: &ClientId) {
        let mut lock = self.mounts.lock().unwrap();
        if let Some(entries) = lock.get_mut(mount) {
            if let Some(entry) = entries.iter_mut().find(|entry| entry.addr == id.addr) {
                entry.live = false;
            }
        }
    }

    fn on_metadata(&self, mount: &str, id: &ClientId, metadata: &str) {
        let mut lock = self.mounts.lock().unwrap();
        if let Some(entries) = lock.get_mut(mount) {
            if let Some(entry) = entries.iter_mut().find(|entry| entry.addr == id.addr) {
                entry.metadata = metadata.to_owned();
            }
        }
    }
}
