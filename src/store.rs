use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use crate::{
    clock::{Clock, SystemClock},
    code::{self, CodeGenerator, RandomCodes},
    error::{PersistenceError, StoreError},
    model::{AccessContext, AccessEvent, Mapping, Snapshot},
    persistence::SnapshotStore,
};

const COMPONENT: &str = "store";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StoreConfig {
    /// Access events retained per mapping; older events are evicted first.
    pub access_log_cap: usize,
    /// Generated candidates tried before `create` gives up with `Exhausted`.
    pub max_attempts: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            access_log_cap: 1000,
            max_attempts: 20,
        }
    }
}

/// Persistence health.
///
/// A failed load is sticky: `load_error` stays set and the store stays
/// degraded for the rest of the process, even after later saves succeed.
/// A failed save degrades the store until the next successful save.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub degraded: bool,
    pub load_error: Option<String>,
    /// Where the unreadable snapshot was copied before being replaced.
    pub backup: Option<String>,
    /// Saves are suspended because the unreadable snapshot could not be backed up.
    pub saves_held: bool,
    /// Snapshot entries dropped at load for breaking mapping invariants.
    pub skipped_entries: u64,
    pub persistence_failures: u64,
    pub last_error: Option<String>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Table {
    mappings: HashMap<String, Arc<Mapping>>,
    generation: u64, // bumped on every mutation
}

impl Table {
    /// Shared handles to every entry; the deep copy happens off the lock.
    fn entries(&self) -> Vec<Arc<Mapping>> {
        self.mappings.values().cloned().collect()
    }
}

/// Checks a loaded entry against the invariants `create` guarantees.
fn admit(mapping: &Mapping) -> Result<(), String> {
    code::validate_code(&mapping.code).map_err(|e| e.to_string())?;
    code::validate_target(&mapping.target).map_err(|e| e.to_string())?;
    if mapping.expires_at <= mapping.created_at {
        return Err("expiry is not after creation".to_string());
    }
    if mapping.access_count < mapping.access_log.len() as u64 {
        return Err("access count below retained log length".to_string());
    }
    Ok(())
}

/// Owns every mapping. Cloning yields another handle to the same store.
#[derive(Clone, Debug)]
pub struct MappingStore {
    table: Arc<RwLock<Table>>,
    saved_generation: Arc<Mutex<u64>>,
    health: Arc<std::sync::Mutex<Health>>,
    persistence: Arc<dyn SnapshotStore>,
    clock: Arc<dyn Clock>,
    codes: Arc<dyn CodeGenerator>,
    config: StoreConfig,
}

impl MappingStore {
    /// Opens a store with the system clock and random codes.
    pub async fn open(persistence: Arc<dyn SnapshotStore>, config: StoreConfig) -> Self {
        Self::with_parts(persistence, Arc::new(SystemClock), Arc::new(RandomCodes), config).await
    }

    /// Opens a store and loads the persisted snapshot once.
    ///
    /// A failed load leaves the store empty and degraded, and the unreadable
    /// state is backed up before the first save replaces it. If the backup
    /// fails, saves are held for the life of the store.
    pub async fn with_parts(
        persistence: Arc<dyn SnapshotStore>,
        clock: Arc<dyn Clock>,
        codes: Arc<dyn CodeGenerator>,
        config: StoreConfig,
    ) -> Self {
        let store = Self {
            table: Arc::new(RwLock::new(Table::default())),
            saved_generation: Arc::new(Mutex::new(0)),
            health: Arc::new(std::sync::Mutex::new(Health::default())),
            persistence,
            clock,
            codes,
            config,
        };

        let persistence = Arc::clone(&store.persistence);
        let loaded = match tokio::task::spawn_blocking(move || persistence.load()).await {
            Ok(result) => result,
            Err(e) => Err(PersistenceError::Task(e.to_string())),
        };
        match loaded {
            Ok(snapshot) => store.restore(snapshot).await,
            Err(e) => store.quarantine(e).await,
        }

        store
    }

    async fn restore(&self, snapshot: Snapshot) {
        let mut skipped = 0u64;
        let mut table = self.table.write().await;
        for mut mapping in snapshot.mappings {
            if table.mappings.contains_key(&mapping.code) {
                tracing::warn!(component = "persistence", code = %mapping.code, "duplicate code in snapshot, keeping first");
                skipped += 1;
                continue;
            }
            if let Err(reason) = admit(&mapping) {
                tracing::warn!(component = "persistence", code = %mapping.code, "skipping snapshot entry: {reason}");
                skipped += 1;
                continue;
            }
            while mapping.access_log.len() > self.config.access_log_cap {
                mapping.access_log.pop_front();
            }
            table.mappings.insert(mapping.code.clone(), Arc::new(mapping));
        }
        tracing::info!(component = "persistence", count = table.mappings.len(), skipped, "snapshot loaded");
        self.health.lock().unwrap_or_else(|e| e.into_inner()).skipped_entries = skipped;
    }

    async fn quarantine(&self, error: PersistenceError) {
        self.record_failure("load", &error);

        let persistence = Arc::clone(&self.persistence);
        let backup = match tokio::task::spawn_blocking(move || persistence.backup()).await {
            Ok(result) => result,
            Err(e) => Err(PersistenceError::Task(e.to_string())),
        };

        let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        health.load_error = Some(error.to_string());
        match backup {
            Ok(Some(path)) => {
                tracing::warn!(component = "persistence", backup = %path, "unreadable snapshot backed up");
                health.backup = Some(path);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(component = "persistence", "unreadable snapshot could not be backed up, holding saves: {e}");
                health.saves_held = true;
                health.last_error = Some(format!("backup: {e}"));
            }
        }
    }

    pub fn config(&self) -> StoreConfig {
        self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Creates a mapping valid for `validity_minutes` (1..=10080).
    ///
    /// A requested code must be 3-10 alphanumeric characters and must never
    /// have been used before, expired or not. Without one, up to
    /// `max_attempts` random 6-character codes are tried.
    pub async fn create(
        &self,
        target: &str,
        validity_minutes: i64,
        requested_code: Option<&str>,
    ) -> Result<Mapping, StoreError> {
        let validated = code::validate_target(target)
            .and_then(|_| code::validate_validity(validity_minutes))
            .and_then(|_| requested_code.map_or(Ok(()), code::validate_code));
        if let Err(e) = validated {
            tracing::warn!(component = COMPONENT, "create rejected: {e}");
            return Err(e.into());
        }

        let (mapping, generation, entries) = {
            let mut table = self.table.write().await;

            let code = match requested_code {
                Some(requested) => {
                    if table.mappings.contains_key(requested) {
                        tracing::warn!(component = COMPONENT, code = requested, "short code collision");
                        return Err(StoreError::Collision(requested.to_string()));
                    }
                    requested.to_string()
                }
                None => match self.free_code(&table) {
                    Some(code) => code,
                    None => {
                        tracing::error!(
                            component = COMPONENT,
                            attempts = self.config.max_attempts,
                            "no free short code"
                        );
                        return Err(StoreError::Exhausted {
                            attempts: self.config.max_attempts,
                        });
                    }
                },
            };

            let mapping = Mapping::new(code, target.to_string(), self.clock.now(), validity_minutes);
            table.mappings.insert(mapping.code.clone(), Arc::new(mapping.clone()));
            table.generation += 1;
            (mapping, table.generation, table.entries())
        };

        tracing::info!(component = COMPONENT, code = %mapping.code, expires = %mapping.expires_at, "mapping created");
        self.save_after(generation, entries).await;
        Ok(mapping)
    }

    fn free_code(&self, table: &Table) -> Option<String> {
        (0..self.config.max_attempts)
            .map(|_| self.codes.generate())
            .find(|candidate| !table.mappings.contains_key(candidate))
    }

    /// Resolves a code to its target, recording a "direct" access.
    pub async fn resolve(&self, code: &str) -> Result<String, StoreError> {
        self.resolve_with(code, AccessContext::default()).await
    }

    /// Resolves a code to its target and records one access event.
    ///
    /// Unknown and expired codes both yield `NotFound` and leave the store
    /// untouched. Expired mappings stay listed.
    pub async fn resolve_with(&self, code: &str, context: AccessContext) -> Result<String, StoreError> {
        let (target, generation, entries) = {
            let mut table = self.table.write().await;
            let now = self.clock.now();

            let Some(entry) = table.mappings.get_mut(code) else {
                tracing::warn!(component = COMPONENT, code, "short code not found");
                return Err(StoreError::NotFound);
            };
            if entry.is_expired(now) {
                tracing::warn!(component = COMPONENT, code, expired = %entry.expires_at, "expired short code accessed");
                return Err(StoreError::NotFound);
            }

            // copies the mapping only while an unsaved snapshot still shares it
            let mapping = Arc::make_mut(entry);
            mapping.record(
                AccessEvent {
                    timestamp: now,
                    source: context.source,
                    origin: context.origin,
                },
                self.config.access_log_cap,
            );
            let target = mapping.target.clone();
            table.generation += 1;
            (target, table.generation, table.entries())
        };

        tracing::info!(component = COMPONENT, code, "short code resolved");
        self.save_after(generation, entries).await;
        Ok(target)
    }

    /// All mappings, live and expired, newest first.
    pub async fn list(&self) -> Vec<Mapping> {
        let table = self.table.read().await;
        let mut mappings: Vec<Mapping> = table.mappings.values().map(|m| Mapping::clone(m)).collect();
        drop(table);
        mappings.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.code.cmp(&b.code)));
        tracing::debug!(component = COMPONENT, count = mappings.len(), "mappings listed");
        mappings
    }

    /// Looks a code up without applying expiry or counting a visit.
    pub async fn lookup(&self, code: &str) -> Option<Mapping> {
        let mapping = self.table.read().await.mappings.get(code).map(|m| Mapping::clone(m));
        tracing::debug!(component = COMPONENT, code, found = mapping.is_some(), "mapping looked up");
        mapping
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.mappings.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.table.read().await.mappings.is_empty()
    }

    pub fn health(&self) -> Health {
        self.health.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Runs the save on its own task so it completes even when the caller's
    /// future is dropped mid-await.
    async fn save_after(&self, generation: u64, entries: Vec<Arc<Mapping>>) {
        let store = self.clone();
        let handle = tokio::spawn(async move { store.persist(generation, entries).await });
        if let Err(e) = handle.await {
            self.record_failure("save", &PersistenceError::Task(e.to_string()));
        }
    }

    /// Saves the entries unless a newer generation has already been written.
    async fn persist(&self, generation: u64, entries: Vec<Arc<Mapping>>) {
        let mut saved = self.saved_generation.lock().await;
        if *saved >= generation {
            tracing::trace!(component = "persistence", generation, "snapshot superseded, skipping save");
            return;
        }
        if self.health().saves_held {
            tracing::warn!(component = "persistence", generation, "save held, unreadable snapshot was not backed up");
            return;
        }

        let persistence = Arc::clone(&self.persistence);
        let result = match tokio::task::spawn_blocking(move || {
            let snapshot = Snapshot::new(entries.iter().map(|m| Mapping::clone(m)).collect());
            persistence.save(&snapshot)
        })
        .await
        {
            Ok(result) => result,
            Err(e) => Err(PersistenceError::Task(e.to_string())),
        };
        match result {
            Ok(()) => {
                *saved = generation;
                let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
                health.degraded = health.load_error.is_some();
            }
            Err(e) => self.record_failure("save", &e),
        }
    }

    fn record_failure(&self, operation: &str, error: &PersistenceError) {
        tracing::warn!(component = "persistence", operation, "snapshot {operation} failed: {error}");
        let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        health.degraded = true;
        health.persistence_failures += 1;
        health.last_error = Some(format!("{operation}: {error}"));
        health.last_failure_at = Some(self.clock.now());
    }
}
