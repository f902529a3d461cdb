//! Pending-mutation guards shared between client instances ("tabs").
//!
//! A guard store has no compare-and-swap: two tabs can both read "absent"
//! and both dispatch. The completion TTL narrows that window; the server's
//! claim ledger is what actually prevents a double grant.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use loot_schemas::Identity;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardState {
    InFlight,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMutationGuard {
    pub fingerprint: String,
    pub identity: Identity,
    /// When the guard entered its current state.
    pub at: DateTime<Utc>,
    pub state: GuardState,
}

impl PendingMutationGuard {
    fn key(&self) -> String {
        guard_key(&self.identity, &self.fingerprint)
    }
}

fn guard_key(identity: &Identity, fingerprint: &str) -> String {
    format!("{}|{}", identity.as_str(), fingerprint)
}

/// Durable guard storage visible to every client instance of one player.
///
/// Calls are synchronous, mirroring browser local storage.
pub trait GuardStore: Send + Sync {
    fn get(&self, identity: &Identity, fingerprint: &str) -> Result<Option<PendingMutationGuard>>;

    fn put(&self, guard: &PendingMutationGuard) -> Result<()>;

    /// Drop guards last touched before `before`. Returns how many went.
    fn prune(&self, before: DateTime<Utc>) -> Result<usize>;
}

#[derive(Debug, Default)]
pub struct MemGuardStore {
    entries: Mutex<HashMap<String, PendingMutationGuard>>,
}

impl MemGuardStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingMutationGuard>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl GuardStore for MemGuardStore {
    fn get(&self, identity: &Identity, fingerprint: &str) -> Result<Option<PendingMutationGuard>> {
        Ok(self.lock().get(&guard_key(identity, fingerprint)).cloned())
    }

    fn put(&self, guard: &PendingMutationGuard) -> Result<()> {
        self.lock().insert(guard.key(), guard.clone());
        Ok(())
    }

    fn prune(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut map = self.lock();
        let n = map.len();
        map.retain(|_, g| g.at >= before);
        Ok(n - map.len())
    }
}

/// One JSON file holding every guard.
///
/// Each write loads the file, edits one entry, and replaces the file via a
/// sibling temp file plus rename. Concurrent writers are last-writer-wins.
#[derive(Debug, Clone)]
pub struct FileGuardStore {
    path: PathBuf,
}

impl FileGuardStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<HashMap<String, PendingMutationGuard>> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("read guard file {}", self.path.display()))
            }
        };
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(HashMap::new());
        }
        serde_json::from_slice(&raw)
            .with_context(|| format!("parse guard file {}", self.path.display()))
    }

    fn save(&self, map: &HashMap<String, PendingMutationGuard>) -> Result<()> {
        let encoded = serde_json::to_vec(map).context("encode guards")?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, encoded)
            .with_context(|| format!("write guard file {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replace guard file {}", self.path.display()))
    }
}

impl GuardStore for FileGuardStore {
    fn get(&self, identity: &Identity, fingerprint: &str) -> Result<Option<PendingMutationGuard>> {
        Ok(self.load()?.remove(&guard_key(identity, fingerprint)))
    }

    fn put(&self, guard: &PendingMutationGuard) -> Result<()> {
        let mut map = self.load()?;
        map.insert(guard.key(), guard.clone());
        self.save(&map)
    }

    fn prune(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut map = self.load()?;
        let n = map.len();
        map.retain(|_, g| g.at >= before);
        let removed = n - map.len();
        if removed > 0 {
            self.save(&map)?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn guard(fp: &str, at: DateTime<Utc>) -> PendingMutationGuard {
        PendingMutationGuard {
            fingerprint: fp.into(),
            identity: Identity::new("p1").unwrap(),
            at,
            state: GuardState::InFlight,
        }
    }

    #[test]
    fn file_store_round_trips_and_prunes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileGuardStore::new(dir.path().join("guards.json"));
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let who = Identity::new("p1").unwrap();

        assert_eq!(store.get(&who, "a").unwrap(), None);
        store.put(&guard("a", t0)).unwrap();
        store.put(&guard("b", t0 + Duration::seconds(10))).unwrap();

        // a second handle on the same file sees the same guards
        let other_tab = FileGuardStore::new(store.path());
        assert_eq!(other_tab.get(&who, "a").unwrap(), Some(guard("a", t0)));

        assert_eq!(store.prune(t0 + Duration::seconds(5)).unwrap(), 1);
        assert_eq!(other_tab.get(&who, "a").unwrap(), None);
        assert!(other_tab.get(&who, "b").unwrap().is_some());
    }

    #[test]
    fn corrupt_file_is_an_error_not_a_silent_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guards.json");
        std::fs::write(&path, b"{not json").unwrap();
        let store = FileGuardStore::new(&path);
        assert!(store.get(&Identity::new("p1").unwrap(), "a").is_err());
    }
}
