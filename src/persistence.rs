use std::{
    collections::HashMap,
    fs,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use rusqlite::params;

use crate::{
    error::PersistenceError,
    model::{AccessEvent, Mapping, Snapshot},
};

/// Where the mapping store keeps its state between restarts.
///
/// `load` is called once when the store opens and `save` after every
/// successful mutation. Both are blocking and run off the async runtime.
pub trait SnapshotStore: Send + Sync + std::fmt::Debug {
    fn load(&self) -> Result<Snapshot, PersistenceError>;
    fn save(&self, snapshot: &Snapshot) -> Result<(), PersistenceError>;

    /// Called after a failed `load`, before anything is saved over the
    /// unreadable state. Returns where a copy was put, or `None` when there
    /// is nothing durable to keep. An error means saving would destroy data.
    fn backup(&self) -> Result<Option<String>, PersistenceError> {
        Ok(None)
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".corrupt-{}", chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f")));
    PathBuf::from(name)
}

/// Keeps the last saved snapshot in memory. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshot: Mutex<Snapshot>,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
            saves: AtomicUsize::new(0),
        }
    }

    /// Number of completed saves.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl SnapshotStore for MemoryStore {
    fn load(&self) -> Result<Snapshot, PersistenceError> {
        Ok(self.snapshot())
    }

    fn save(&self, snapshot: &Snapshot) -> Result<(), PersistenceError> {
        *self.snapshot.lock().unwrap_or_else(|e| e.into_inner()) = snapshot.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Writes the snapshot as a JSON array, replacing the file atomically.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotStore for JsonFileStore {
    fn load(&self) -> Result<Snapshot, PersistenceError> {
        if !self.path.exists() {
            tracing::debug!("no snapshot at {}, starting empty", self.path.display());
            return Ok(Snapshot::default());
        }
        let contents = fs::read_to_string(&self.path)?;
        if contents.trim().is_empty() {
            return Ok(Snapshot::default());
        }
        Ok(serde_json::from_str(&contents)?)
    }

    fn save(&self, snapshot: &Snapshot) -> Result<(), PersistenceError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let tmp_path = self.path.with_extension("json.tmp");
        let file = fs::File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, snapshot)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn backup(&self) -> Result<Option<String>, PersistenceError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if !self.path.exists() {
            return Ok(None);
        }
        let backup = backup_path(&self.path);
        fs::rename(&self.path, &backup)?;
        Ok(Some(backup.display().to_string()))
    }
}

/// Stores mappings and their access events in two SQLite tables.
#[derive(Debug)]
pub struct SqliteStore {
    connection: Mutex<rusqlite::Connection>,
    path: Option<PathBuf>, // None for in-memory databases
}

fn create_mapping_table(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute(
        r#"create table if not exists mapping(
    code         TEXT    PRIMARY KEY,
    target       TEXT    NOT NULL,
    created      TEXT    NOT NULL,
    expires      TEXT    NOT NULL,
    access_count INTEGER NOT NULL DEFAULT 0
)"#,
        (),
    )?;

    Ok(())
}

fn create_access_event_table(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute(
        r#"create table if not exists access_event(
    code      TEXT    NOT NULL REFERENCES mapping(code),
    seq       INTEGER NOT NULL, -- position in the retained log
    timestamp TEXT    NOT NULL,
    source    TEXT    NOT NULL DEFAULT '',
    origin    TEXT    NOT NULL DEFAULT '',
    PRIMARY KEY (code, seq)
)"#,
        (),
    )?;

    Ok(())
}

impl SqliteStore {
    pub fn new(connection: rusqlite::Connection) -> Result<Self, PersistenceError> {
        create_mapping_table(&connection)?;
        create_access_event_table(&connection)?;
        Ok(Self {
            connection: Mutex::new(connection),
            path: None,
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let mut store = Self::new(rusqlite::Connection::open(path.as_ref())?)?;
        store.path = Some(path.as_ref().to_path_buf());
        Ok(store)
    }

    pub fn in_memory() -> Result<Self, PersistenceError> {
        Self::new(rusqlite::Connection::open_in_memory()?)
    }
}

impl SnapshotStore for SqliteStore {
    fn load(&self) -> Result<Snapshot, PersistenceError> {
        let conn = self.connection.lock().unwrap_or_else(|e| e.into_inner());

        let mut stmt = conn.prepare(
            r#"SELECT code, target, created, expires, access_count FROM mapping ORDER BY created, code"#,
        )?;
        let mut mappings = stmt
            .query_map([], |row| {
                let access_count: i64 = row.get(4)?;
                Ok(Mapping {
                    code: row.get(0)?,
                    target: row.get(1)?,
                    created_at: row.get(2)?,
                    expires_at: row.get(3)?,
                    access_count: access_count.max(0) as u64,
                    access_log: Default::default(),
                })
            })?
            .collect::<Result<Vec<Mapping>, rusqlite::Error>>()?;

        let index: HashMap<String, usize> = mappings
            .iter()
            .enumerate()
            .map(|(i, mapping)| (mapping.code.clone(), i))
            .collect();

        let mut stmt =
            conn.prepare(r#"SELECT code, timestamp, source, origin FROM access_event ORDER BY code, seq"#)?;
        let events = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    AccessEvent {
                        timestamp: row.get(1)?,
                        source: row.get(2)?,
                        origin: row.get(3)?,
                    },
                ))
            })?
            .collect::<Result<Vec<(String, AccessEvent)>, rusqlite::Error>>()?;

        for (code, event) in events {
            match index.get(&code) {
                Some(&i) => mappings[i].access_log.push_back(event),
                None => tracing::warn!(component = "persistence", %code, "access event for unknown mapping"),
            }
        }

        Ok(Snapshot::new(mappings))
    }

    fn save(&self, snapshot: &Snapshot) -> Result<(), PersistenceError> {
        let mut conn = self.connection.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction()?;

        tx.execute(r#"DELETE FROM access_event"#, ())?;
        tx.execute(r#"DELETE FROM mapping"#, ())?;
        {
            let mut insert_mapping = tx.prepare(
                r#"INSERT INTO mapping (code, target, created, expires, access_count) values (?1, ?2, ?3, ?4, ?5)"#,
            )?;
            let mut insert_event = tx.prepare(
                r#"INSERT INTO access_event (code, seq, timestamp, source, origin) values (?1, ?2, ?3, ?4, ?5)"#,
            )?;
            for mapping in &snapshot.mappings {
                insert_mapping.execute(params![
                    mapping.code,
                    mapping.target,
                    mapping.created_at,
                    mapping.expires_at,
                    mapping.access_count as i64
                ])?;
                for (seq, event) in mapping.access_log.iter().enumerate() {
                    insert_event.execute(params![
                        mapping.code,
                        seq as i64,
                        event.timestamp,
                        event.source,
                        event.origin
                    ])?;
                }
            }
        }
        tx.commit()?;

        Ok(())
    }

    fn backup(&self) -> Result<Option<String>, PersistenceError> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        // held so no save lands mid-copy
        let _conn = self.connection.lock().unwrap_or_else(|e| e.into_inner());
        let backup = backup_path(path);
        fs::copy(path, &backup)?;
        Ok(Some(backup.display().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use super::*;

    fn sample() -> Snapshot {
        let created = "2025-03-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let mut first = Mapping::new("abc".to_string(), "https://example.com/a".to_string(), created, 30);
        first.record(
            AccessEvent {
                timestamp: created + chrono::Duration::minutes(1),
                source: "direct".to_string(),
                origin: "localhost".to_string(),
            },
            10,
        );
        first.record(
            AccessEvent {
                timestamp: created + chrono::Duration::minutes(2),
                source: "news.example.org".to_string(),
                origin: "10.0.0.1".to_string(),
            },
            10,
        );
        let second = Mapping::new(
            "Zz9".to_string(),
            "https://example.com/b".to_string(),
            created + chrono::Duration::seconds(5),
            1,
        );
        Snapshot::new(vec![second, first])
    }

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        assert!(store.load().unwrap().is_empty());
        store.save(&sample()).unwrap();
        assert_eq!(store.load().unwrap(), sample());
        assert_eq!(store.save_count(), 1);
    }

    #[test]
    fn test_json_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("shortcode.json"));
        assert!(store.load().unwrap().is_empty());

        store.save(&sample()).unwrap();
        let reopened = JsonFileStore::new(dir.path().join("shortcode.json"));
        assert_eq!(reopened.load().unwrap(), sample());
        assert!(!dir.path().join("shortcode.json.tmp").exists());
    }

    #[test]
    fn test_json_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shortcode.json");
        fs::write(&path, "{not json").unwrap();
        let store = JsonFileStore::new(&path);
        assert!(matches!(store.load(), Err(PersistenceError::Json(_))));
    }

    #[test]
    fn test_json_backup_moves_unreadable_file_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shortcode.json");
        fs::write(&path, "[] trailing garbage").unwrap();
        let store = JsonFileStore::new(&path);
        assert!(store.load().is_err());

        let backup = store.backup().unwrap().unwrap();
        assert!(!path.exists());
        assert_eq!(fs::read_to_string(&backup).unwrap(), "[] trailing garbage");
        assert!(backup.contains("shortcode.json.corrupt-"));

        // nothing left to preserve
        assert_eq!(store.backup().unwrap(), None);
    }

    #[test]
    fn test_sqlite_backup_copies_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shortcode.db");
        let store = SqliteStore::open(&path).unwrap();
        store.save(&sample()).unwrap();

        let backup = store.backup().unwrap().unwrap();
        let copy = SqliteStore::open(&backup).unwrap();
        assert_eq!(copy.load().unwrap(), sample());
        assert_eq!(SqliteStore::in_memory().unwrap().backup().unwrap(), None);
        assert_eq!(MemoryStore::new().backup().unwrap(), None);
    }

    #[test]
    fn test_sqlite_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shortcode.db");
        let store = SqliteStore::open(&path).unwrap();
        assert!(store.load().unwrap().is_empty());

        store.save(&sample()).unwrap();
        drop(store);

        let reopened = SqliteStore::open(&path).unwrap();
        let loaded = reopened.load().unwrap();
        assert_eq!(loaded, sample());
        assert_eq!(loaded.mappings[0].access_log.len(), 2);
        assert_eq!(loaded.mappings[0].access_log[1].origin, "10.0.0.1");
    }

    #[test]
    fn test_sqlite_save_replaces_previous_state() {
        let store = SqliteStore::in_memory().unwrap();
        store.save(&sample()).unwrap();

        let mut smaller = sample();
        smaller.mappings.truncate(1);
        store.save(&smaller).unwrap();
        assert_eq!(store.load().unwrap(), smaller);
    }
}
