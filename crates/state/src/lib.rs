//! The small JSON record that survives restarts.
//!
//! ```json
//! { "lastAchievementDate": "2024-04-01" }
//! ```
//!
//! Writes are read-merge-write under an in-process mutex plus an exclusive
//! `fs2` lock on `<file>.lock`, so the scheduler and direct queries (or two
//! processes) never lose each other's updates.  Keys this crate does not
//! know are carried through untouched.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

pub const LAST_ACHIEVEMENT_DATE: &str = "lastAchievementDate";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(rename = "lastAchievementDate", default)]
    pub last_achievement_date: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

pub struct StateStore {
    path: PathBuf,
    lock_path: PathBuf,
    guard: Mutex<()>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");
        Self {
            path,
            lock_path: PathBuf::from(lock_path),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current record; a missing or corrupt file is reset to defaults.
    /// Never fails: an unreadable store reads as the defaults.
    pub fn get(&self) -> PersistedState {
        match self.try_get() {
            Ok(state) => state,
            Err(err) => {
                warn!(path = %self.path.display(), "state read failed, using defaults: {err:#}");
                PersistedState::default()
            }
        }
    }

    pub fn try_get(&self) -> Result<PersistedState> {
        self.locked(|| {
            let (record, healthy) = self.read_record();
            if !healthy {
                self.write_record(&record)?;
            }
            to_state(record)
        })
    }

    /// Shallow-merge `partial` over the stored record.  Failures are logged
    /// and swallowed; callers carry on with their run.
    pub fn set(&self, partial: Map<String, Value>) {
        if let Err(err) = self.try_set(partial) {
            warn!(path = %self.path.display(), "state write failed: {err:#}");
        }
    }

    pub fn try_set(&self, partial: Map<String, Value>) -> Result<PersistedState> {
        self.locked(|| {
            let (mut record, _) = self.read_record();
            record.extend(partial);
            self.write_record(&record)?;
            to_state(record)
        })
    }

    /// Store `date` as the latest achievement.  Returns `true` only when the
    /// stored value changed; an unchanged date is not rewritten and a failed
    /// write is logged.
    pub fn record_achievement(&self, date: &str) -> bool {
        if self.get().last_achievement_date.as_deref() == Some(date) {
            debug!(date, "achievement date unchanged");
            return false;
        }
        let mut partial = Map::new();
        partial.insert(LAST_ACHIEVEMENT_DATE.to_string(), Value::from(date));
        match self.try_set(partial) {
            Ok(_) => true,
            Err(err) => {
                warn!(path = %self.path.display(), date, "achievement date not stored: {err:#}");
                false
            }
        }
    }

    fn locked<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let _in_process = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
            .with_context(|| format!("opening {}", self.lock_path.display()))?;
        lock.lock_exclusive()?;
        let result = f();
        lock.unlock()?;
        result
    }

    /// The stored object, and whether it was read cleanly.
    fn read_record(&self) -> (Map<String, Value>, bool) {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => return (default_record(), false),
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => (map, true),
            Ok(_) | Err(_) => {
                warn!(path = %self.path.display(), "state file corrupt; resetting to defaults");
                (default_record(), false)
            }
        }
    }

    fn write_record(&self, record: &Map<String, Value>) -> Result<()> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        let rendered = serde_json::to_string_pretty(record)?;
        fs::write(&tmp, rendered).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}

fn default_record() -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(LAST_ACHIEVEMENT_DATE.to_string(), Value::Null);
    map
}

fn to_state(record: Map<String, Value>) -> Result<PersistedState> {
    serde_json::from_value(Value::Object(record)).context("state record has an unexpected shape")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        (dir, store)
    }

    fn partial(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn missing_file_is_initialised() {
        let (_dir, store) = store();
        assert_eq!(store.get(), PersistedState::default());
        let raw = fs::read_to_string(store.path()).unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(&raw).unwrap(),
            json!({ "lastAchievementDate": null })
        );
    }

    #[test]
    fn corrupt_file_is_reset() {
        let (_dir, store) = store();
        fs::write(store.path(), "{ not json").unwrap();
        assert_eq!(store.get().last_achievement_date, None);
        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(serde_json::from_str::<Value>(&raw).is_ok());
    }

    #[test]
    fn merge_preserves_unrelated_fields() {
        let (_dir, store) = store();
        fs::write(
            store.path(),
            r#"{"lastAchievementDate":null,"notes":{"owner":"ops"}}"#,
        )
        .unwrap();

        store.set(partial(json!({ "lastAchievementDate": "2024-04-01" })));
        let state = store.get();

        assert_eq!(state.last_achievement_date.as_deref(), Some("2024-04-01"));
        assert_eq!(state.extra.get("notes"), Some(&json!({ "owner": "ops" })));
    }

    #[test]
    fn record_achievement_is_idempotent() {
        let (_dir, store) = store();
        assert!(store.record_achievement("2024-04-01"));
        let modified = fs::metadata(store.path()).unwrap().modified().unwrap();
        assert!(!store.record_achievement("2024-04-01"));
        assert_eq!(fs::metadata(store.path()).unwrap().modified().unwrap(), modified);
        assert!(store.record_achievement("2024-05-01"));
        assert_eq!(store.get().last_achievement_date.as_deref(), Some("2024-05-01"));
    }

    #[test]
    fn write_failure_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "file, not a directory").unwrap();
        let store = StateStore::new(blocker.join("state.json"));

        store.set(partial(json!({ "lastAchievementDate": "2024-04-01" })));
        assert!(store.try_set(Map::new()).is_err());
        assert_eq!(store.get(), PersistedState::default());
    }

    #[test]
    fn failed_achievement_write_reports_no_change() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "file, not a directory").unwrap();
        let store = StateStore::new(blocker.join("state.json"));

        assert!(!store.record_achievement("2024-04-01"));
        assert_eq!(store.get().last_achievement_date, None);
    }

    #[test]
    fn concurrent_writers_do_not_lose_updates() {
        let (_dir, store) = store();
        let store = Arc::new(store);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let mut map = Map::new();
                    map.insert(format!("writer{i}"), json!(i));
                    store.try_set(map).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let state = store.get();
        assert_eq!(state.extra.len(), 8);
    }
}
