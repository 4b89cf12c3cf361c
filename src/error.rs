use thiserror::Error;

/// Input constraint violated by a create request.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ValidationError {
    #[error("invalid target url: {0}")]
    Target(String),
    #[error("validity must be between 1 and 10080 minutes, got {0}")]
    Validity(i64),
    #[error("invalid short code {0:?}: use 3-10 alphanumeric characters")]
    Code(String),
}

/// Errors surfaced to callers of the mapping store.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("short code {0:?} already exists")]
    Collision(String),
    #[error("short code not found")]
    NotFound,
    #[error("no free short code after {attempts} attempts")]
    Exhausted { attempts: u32 },
}

/// Snapshot load/save failures. Never returned from create/resolve; see `Health`.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("persistence task: {0}")]
    Task(String),
}
