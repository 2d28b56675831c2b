use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::info;

use crate::error::StoreError;
use crate::raft::{Entry, NodeAddr};

const STATE_FILE: &str = "state.json";
const LOG_FILE: &str = "log.json";
const DB_FILE: &str = "db.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    current_term: u64,
    voted_for: Option<NodeAddr>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LogFile {
    log: Vec<Entry>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DbFile {
    db: HashMap<String, String>,
}

/// Durable home of everything a node must not lose across a crash: the
/// current term and vote, the replicated log, and the applied key/value map.
///
/// Each of the three files is rewritten in full on change, through a temp
/// file in the same directory followed by an atomic rename, so a crash mid
/// write leaves the previous version intact. Every mutating method returns
/// only after its file has been written and renamed.
pub struct Store {
    dir: PathBuf,
    current_term: u64,
    voted_for: Option<NodeAddr>,
    log: Vec<Entry>,
    db: HashMap<String, String>,
}

impl Store {
    /// Loads all persisted state from `dir`, initializing any missing file
    /// to its empty default.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|source| StoreError::Write {
            path: dir.clone(),
            source,
        })?;
        let state: StateFile = read_json(&dir.join(STATE_FILE))?;
        let log: LogFile = read_json(&dir.join(LOG_FILE))?;
        let db: DbFile = read_json(&dir.join(DB_FILE))?;

        info!(
            current_term = state.current_term,
            log_len = log.log.len(),
            keys = db.db.len(),
            "loaded persistent state from {}",
            dir.display()
        );

        Ok(Store {
            dir,
            current_term: state.current_term,
            voted_for: state.voted_for,
            log: log.log,
            db: db.db,
        })
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<&NodeAddr> {
        self.voted_for.as_ref()
    }

    /// Index of the last entry in the log; 0 when the log is empty.
    pub fn last_index(&self) -> u64 {
        self.log.len() as u64
    }

    /// Term of the last entry in the log; 0 when the log is empty.
    pub fn last_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    /// Entry at 1-based index `i`. Index 0 yields the sentinel so previous
    /// entry lookups are total; indices past the end yield `None`.
    pub fn entry(&self, i: u64) -> Option<Entry> {
        if i == 0 {
            Some(Entry::sentinel())
        } else {
            self.log.get(i as usize - 1).cloned()
        }
    }

    /// All entries from 1-based index `from` through the end of the log.
    pub fn entries_from(&self, from: u64) -> Vec<Entry> {
        if from == 0 || from > self.last_index() {
            return Vec::new();
        }
        self.log[from as usize - 1..].to_vec()
    }

    /// Raises the current term, clearing the vote in the same durable write.
    /// Requests that do not increase the term are ignored; the effective
    /// term is returned either way.
    pub fn set_current_term(&mut self, term: u64) -> Result<u64, StoreError> {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.persist_state()?;
        }
        Ok(self.current_term)
    }

    pub fn set_voted_for(&mut self, voted_for: Option<NodeAddr>) -> Result<(), StoreError> {
        self.voted_for = voted_for;
        self.persist_state()
    }

    /// Appends `entry` when it directly extends the log. When it lands on an
    /// occupied index with a conflicting term, the suffix from that index on
    /// is truncated and the entry appended in its place. A duplicate of an
    /// existing entry, or an index past the end of the log, is a no-op.
    pub fn append_or_replace(&mut self, entry: Entry) -> Result<(), StoreError> {
        let pos = entry.index as usize;
        if entry.index == self.last_index() + 1 {
            self.log.push(entry);
            self.persist_log()
        } else if entry.index >= 1 && pos <= self.log.len() {
            if self.log[pos - 1].term != entry.term {
                self.log.truncate(pos - 1);
                self.log.push(entry);
                self.persist_log()
            } else {
                Ok(())
            }
        } else {
            Ok(())
        }
    }

    /// Writes one applied key/value pair into the state machine.
    pub fn apply_kv(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.db.insert(key.to_string(), value.to_string());
        self.persist_db()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.db.get(key).map(String::as_str)
    }

    fn persist_state(&self) -> Result<(), StoreError> {
        write_json(
            &self.dir.join(STATE_FILE),
            &StateFile {
                current_term: self.current_term,
                voted_for: self.voted_for.clone(),
            },
        )
    }

    fn persist_log(&self) -> Result<(), StoreError> {
        write_json(&self.dir.join(LOG_FILE), &LogFile { log: self.log.clone() })
    }

    fn persist_db(&self) -> Result<(), StoreError> {
        write_json(&self.dir.join(DB_FILE), &DbFile { db: self.db.clone() })
    }
}

fn read_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StoreError> {
    match fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).map_err(|source| StoreError::Decode {
            path: path.to_path_buf(),
            source,
        }),
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(source) => Err(StoreError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let contents = serde_json::to_vec(value).map_err(|source| StoreError::Encode {
        path: path.to_path_buf(),
        source,
    })?;

    let tmp = path.with_extension("json.tmp");
    let write = |tmp: &Path| -> std::io::Result<()> {
        let mut file = File::create(tmp)?;
        file.write_all(&contents)?;
        file.sync_all()?;
        Ok(())
    };
    write(&tmp).map_err(|source| StoreError::Write {
        path: tmp.clone(),
        source,
    })?;

    fs::rename(&tmp, path).map_err(|source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn addr(port: u16) -> NodeAddr {
        NodeAddr::new("127.0.0.1", port)
    }

    #[test]
    fn test_open_empty_directory() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        assert_eq!(store.current_term(), 0);
        assert_eq!(store.voted_for(), None);
        assert_eq!(store.last_index(), 0);
        assert_eq!(store.last_term(), 0);
        assert_eq!(store.get("x"), None);
    }

    #[test]
    fn test_term_is_monotonic_and_clears_vote() {
        let dir = TempDir::new().unwrap();
        let mut store = Store::open(dir.path()).unwrap();

        assert_eq!(store.set_current_term(3).unwrap(), 3);
        store.set_voted_for(Some(addr(5002))).unwrap();

        // stale or equal terms are rejected, vote untouched
        assert_eq!(store.set_current_term(2).unwrap(), 3);
        assert_eq!(store.set_current_term(3).unwrap(), 3);
        assert_eq!(store.voted_for(), Some(&addr(5002)));

        // advancing the term clears the vote in the same write
        assert_eq!(store.set_current_term(5).unwrap(), 5);
        assert_eq!(store.voted_for(), None);

        let reloaded = Store::open(dir.path()).unwrap();
        assert_eq!(reloaded.current_term(), 5);
        assert_eq!(reloaded.voted_for(), None);
    }

    #[test]
    fn test_append_extends_log() {
        let dir = TempDir::new().unwrap();
        let mut store = Store::open(dir.path()).unwrap();

        store.append_or_replace(Entry::new(1, 1, "x", "1")).unwrap();
        store.append_or_replace(Entry::new(2, 1, "y", "2")).unwrap();
        assert_eq!(store.last_index(), 2);
        assert_eq!(store.entry(2).unwrap().key, "y");

        // a gap past the end is ignored
        store.append_or_replace(Entry::new(5, 1, "z", "3")).unwrap();
        assert_eq!(store.last_index(), 2);
    }

    #[test]
    fn test_conflicting_term_truncates_suffix() {
        let dir = TempDir::new().unwrap();
        let mut store = Store::open(dir.path()).unwrap();

        store.append_or_replace(Entry::new(1, 1, "x", "1")).unwrap();
        store.append_or_replace(Entry::new(2, 1, "y", "2")).unwrap();
        store.append_or_replace(Entry::new(3, 1, "z", "3")).unwrap();

        // a different term at index 2 wipes everything from there on
        store.append_or_replace(Entry::new(2, 2, "y", "new")).unwrap();
        assert_eq!(store.last_index(), 2);
        assert_eq!(store.entry(2).unwrap(), Entry::new(2, 2, "y", "new"));
        assert_eq!(store.entry(3), None);
    }

    #[test]
    fn test_append_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut store = Store::open(dir.path()).unwrap();

        let entry = Entry::new(1, 1, "x", "1");
        store.append_or_replace(entry.clone()).unwrap();
        store.append_or_replace(entry.clone()).unwrap();
        assert_eq!(store.last_index(), 1);
        assert_eq!(store.entry(1).unwrap(), entry);
    }

    #[test]
    fn test_entry_lookup_bounds() {
        let dir = TempDir::new().unwrap();
        let mut store = Store::open(dir.path()).unwrap();
        store.append_or_replace(Entry::new(1, 1, "x", "1")).unwrap();

        assert_eq!(store.entry(0).unwrap(), Entry::sentinel());
        assert!(store.entry(1).is_some());
        assert_eq!(store.entry(2), None);
    }

    #[test]
    fn test_entries_from() {
        let dir = TempDir::new().unwrap();
        let mut store = Store::open(dir.path()).unwrap();
        for i in 1..=4 {
            store
                .append_or_replace(Entry::new(i, 1, format!("k{}", i), "v"))
                .unwrap();
        }

        assert_eq!(store.entries_from(3).len(), 2);
        assert_eq!(store.entries_from(1).len(), 4);
        assert!(store.entries_from(5).is_empty());
        assert!(store.entries_from(0).is_empty());
    }

    #[test]
    fn test_reload_round_trip() {
        let dir = TempDir::new().unwrap();

        {
            let mut store = Store::open(dir.path()).unwrap();
            store.set_current_term(2).unwrap();
            store.set_voted_for(Some(addr(5001))).unwrap();
            store.append_or_replace(Entry::new(1, 1, "x", "1")).unwrap();
            store.append_or_replace(Entry::new(2, 2, "y", "2")).unwrap();
            store.apply_kv("x", "1").unwrap();
        }

        let store = Store::open(dir.path()).unwrap();
        assert_eq!(store.current_term(), 2);
        assert_eq!(store.voted_for(), Some(&addr(5001)));
        assert_eq!(store.last_index(), 2);
        assert_eq!(store.entry(1).unwrap(), Entry::new(1, 1, "x", "1"));
        assert_eq!(store.entry(2).unwrap(), Entry::new(2, 2, "y", "2"));
        assert_eq!(store.get("x"), Some("1"));
    }

    #[test]
    fn test_no_stray_temp_files() {
        let dir = TempDir::new().unwrap();
        let mut store = Store::open(dir.path()).unwrap();
        store.set_current_term(1).unwrap();
        store.apply_kv("x", "1").unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|name| name.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind: {:?}", leftovers);
    }
}
