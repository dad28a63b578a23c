//! Document store for session records and account memberships
//!
//! The orchestrator only needs a handful of document operations: put/get/
//! delete of session records and add/pull of session ids on account
//! documents. `FileStore` keeps everything in memory and, when given a path,
//! rewrites a JSON file after every change (temp file + rename).

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use jam_utils::{JamError, Result};

use crate::workers::WorkerHandle;

/// Persisted description of one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub title: String,
    pub description: String,
    pub owner_account_id: Option<String>,
    #[serde(default)]
    pub member_account_ids: Vec<String>,
    pub worker: WorkerHandle,
    pub start_time: DateTime<Utc>,
    pub length_secs: u64,
}

/// Persisted account document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRecord {
    pub account_id: String,
    #[serde(default)]
    pub sessions: Vec<String>,
}

/// Document operations the orchestrator relies on
pub trait DocumentStore: Send + Sync {
    fn put_session(&self, record: SessionRecord) -> Result<()>;
    fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>>;
    fn delete_session(&self, session_id: &str) -> Result<Option<SessionRecord>>;
    fn list_sessions(&self) -> Result<Vec<SessionRecord>>;

    /// Create the account document if it does not exist yet
    fn ensure_account(&self, account_id: &str) -> Result<AccountRecord>;
    fn get_account(&self, account_id: &str) -> Result<Option<AccountRecord>>;

    /// Add `account_id` to the session's members and the session to the account
    fn add_member(&self, session_id: &str, account_id: &str) -> Result<()>;
    /// Pull `session_id` from every listed account's session list
    fn pull_session(&self, session_id: &str, account_ids: &[String]) -> Result<()>;

    /// Drop every session record and every account membership
    fn clear_sessions(&self) -> Result<usize>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Documents {
    #[serde(default)]
    sessions: BTreeMap<String, SessionRecord>,
    #[serde(default)]
    accounts: BTreeMap<String, AccountRecord>,
}

/// JSON-file backed store (memory only when no path is set)
#[derive(Debug)]
pub struct FileStore {
    docs: Mutex<Documents>,
    path: Option<PathBuf>,
}

impl FileStore {
    pub fn in_memory() -> Self {
        Self {
            docs: Mutex::new(Documents::default()),
            path: None,
        }
    }

    /// Open (or create) a store file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let docs = if path.exists() {
            let content = fs::read_to_string(&path).map_err(|e| JamError::FileRead {
                path: path.clone(),
                source: e,
            })?;
            serde_json::from_str(&content).map_err(|e| {
                JamError::persistence(format!("Corrupt store {}: {}", path.display(), e))
            })?
        } else {
            Documents::default()
        };
        info!(
            "Opened store {} ({} sessions, {} accounts)",
            path.display(),
            docs.sessions.len(),
            docs.accounts.len()
        );
        Ok(Self {
            docs: Mutex::new(docs),
            path: Some(path),
        })
    }

    /// Apply a change and write it out
    ///
    /// The change only becomes visible once the file write succeeded.
    fn update<T>(&self, f: impl FnOnce(&mut Documents) -> T) -> Result<T> {
        let mut docs = self.docs.lock();
        let Some(path) = &self.path else {
            return Ok(f(&mut docs));
        };
        let mut next = docs.clone();
        let out = f(&mut next);
        write_documents(path, &next)?;
        *docs = next;
        Ok(out)
    }
}

fn write_documents(path: &Path, docs: &Documents) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| JamError::FileWrite {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    // Write to a temporary file first, then rename for atomicity
    let temp_path = path.with_extension("tmp");
    let write_err = |e: std::io::Error| JamError::FileWrite {
        path: temp_path.clone(),
        source: e,
    };

    let file = File::create(&temp_path).map_err(write_err)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, docs)
        .map_err(|e| JamError::persistence(format!("Failed to serialize store: {}", e)))?;
    writer.flush().map_err(write_err)?;
    writer
        .into_inner()
        .map_err(|e| write_err(e.into_error()))?
        .sync_all()
        .map_err(write_err)?;

    fs::rename(&temp_path, path).map_err(|e| JamError::FileWrite {
        path: path.to_path_buf(),
        source: e,
    })?;

    debug!("Wrote store to {}", path.display());
    Ok(())
}

impl DocumentStore for FileStore {
    fn put_session(&self, record: SessionRecord) -> Result<()> {
        self.update(|docs| {
            docs.sessions.insert(record.session_id.clone(), record);
        })
    }

    fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        Ok(self.docs.lock().sessions.get(session_id).cloned())
    }

    fn delete_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        self.update(|docs| docs.sessions.remove(session_id))
    }

    fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        Ok(self.docs.lock().sessions.values().cloned().collect())
    }

    fn ensure_account(&self, account_id: &str) -> Result<AccountRecord> {
        if let Some(existing) = self.get_account(account_id)? {
            return Ok(existing);
        }
        self.update(|docs| {
            docs.accounts
                .entry(account_id.to_string())
                .or_insert_with(|| AccountRecord {
                    account_id: account_id.to_string(),
                    sessions: Vec::new(),
                })
                .clone()
        })
    }

    fn get_account(&self, account_id: &str) -> Result<Option<AccountRecord>> {
        Ok(self.docs.lock().accounts.get(account_id).cloned())
    }

    fn add_member(&self, session_id: &str, account_id: &str) -> Result<()> {
        self.update(|docs| {
            let record = docs
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| JamError::SessionNotFound(session_id.to_string()))?;
            if !record.member_account_ids.iter().any(|a| a == account_id) {
                record.member_account_ids.push(account_id.to_string());
            }

            let account = docs
                .accounts
                .entry(account_id.to_string())
                .or_insert_with(|| AccountRecord {
                    account_id: account_id.to_string(),
                    sessions: Vec::new(),
                });
            if !account.sessions.iter().any(|s| s == session_id) {
                account.sessions.push(session_id.to_string());
            }
            Ok(())
        })?
    }

    fn pull_session(&self, session_id: &str, account_ids: &[String]) -> Result<()> {
        self.update(|docs| {
            for account_id in account_ids {
                if let Some(account) = docs.accounts.get_mut(account_id) {
                    account.sessions.retain(|s| s != session_id);
                }
            }
        })
    }

    fn clear_sessions(&self) -> Result<usize> {
        self.update(|docs| {
            let removed = docs.sessions.len();
            docs.sessions.clear();
            for account in docs.accounts.values_mut() {
                account.sessions.clear();
            }
            removed
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(id: &str) -> SessionRecord {
        SessionRecord {
            session_id: id.into(),
            title: "Jam".into(),
            description: String::new(),
            owner_account_id: Some("alice".into()),
            member_account_ids: Vec::new(),
            worker: WorkerHandle::default(),
            start_time: Utc::now(),
            length_secs: 600,
        }
    }

    #[test]
    fn test_put_get_delete() {
        let store = FileStore::in_memory();
        store.put_session(record("a1b2c3d4")).unwrap();
        assert_eq!(store.get_session("a1b2c3d4").unwrap().unwrap().title, "Jam");
        assert_eq!(store.list_sessions().unwrap().len(), 1);

        assert!(store.delete_session("a1b2c3d4").unwrap().is_some());
        assert!(store.get_session("a1b2c3d4").unwrap().is_none());
        assert!(store.delete_session("a1b2c3d4").unwrap().is_none());
    }

    #[test]
    fn test_membership_add_and_pull() {
        let store = FileStore::in_memory();
        store.put_session(record("s1")).unwrap();
        store.add_member("s1", "alice").unwrap();
        store.add_member("s1", "bob").unwrap();
        store.add_member("s1", "bob").unwrap();

        let rec = store.get_session("s1").unwrap().unwrap();
        assert_eq!(rec.member_account_ids, vec!["alice", "bob"]);
        assert_eq!(store.get_account("bob").unwrap().unwrap().sessions, vec!["s1"]);

        store
            .pull_session("s1", &["alice".to_string(), "ghost".to_string()])
            .unwrap();
        assert!(store.get_account("alice").unwrap().unwrap().sessions.is_empty());
        assert_eq!(store.get_account("bob").unwrap().unwrap().sessions, vec!["s1"]);
    }

    #[test]
    fn test_add_member_unknown_session() {
        let store = FileStore::in_memory();
        assert!(matches!(
            store.add_member("nope", "alice"),
            Err(JamError::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_ensure_account_is_idempotent() {
        let store = FileStore::in_memory();
        store.ensure_account("alice").unwrap();
        store.put_session(record("s1")).unwrap();
        store.add_member("s1", "alice").unwrap();
        let account = store.ensure_account("alice").unwrap();
        assert_eq!(account.sessions, vec!["s1"]);
    }

    #[test]
    fn test_clear_sessions() {
        let store = FileStore::in_memory();
        store.put_session(record("s1")).unwrap();
        store.put_session(record("s2")).unwrap();
        store.add_member("s1", "alice").unwrap();

        assert_eq!(store.clear_sessions().unwrap(), 2);
        assert!(store.list_sessions().unwrap().is_empty());
        assert!(store.get_account("alice").unwrap().unwrap().sessions.is_empty());
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("store.json");
        {
            let store = FileStore::open(&path).unwrap();
            store.put_session(record("s1")).unwrap();
            store.add_member("s1", "alice").unwrap();
        }
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());

        let store = FileStore::open(&path).unwrap();
        let rec = store.get_session("s1").unwrap().unwrap();
        assert_eq!(rec.member_account_ids, vec!["alice"]);
        assert_eq!(store.get_account("alice").unwrap().unwrap().sessions, vec!["s1"]);
    }

    #[test]
    fn test_failed_write_leaves_memory_unchanged() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        let store = FileStore::open(blocker.join("store.json")).unwrap();
        // The store's parent is a plain file, so every write fails
        fs::write(&blocker, b"").unwrap();

        assert!(store.put_session(record("s1")).is_err());
        assert!(store.get_session("s1").unwrap().is_none());
        assert!(store.ensure_account("alice").is_err());
        assert!(store.get_account("alice").unwrap().is_none());
    }

    #[test]
    fn test_corrupt_store_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            FileStore::open(&path),
            Err(JamError::Persistence(_))
        ));
    }
}
