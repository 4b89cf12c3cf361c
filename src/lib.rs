use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod clock;
pub mod code;
pub mod error;
pub mod model;
pub mod persistence;
pub mod render;
pub mod routes;
pub mod store;

pub use error::{PersistenceError, StoreError, ValidationError};
pub use model::{AccessContext, AccessEvent, Mapping, Snapshot};
pub use store::{Health, MappingStore, StoreConfig};

/// Validity used when a create request does not carry one.
pub const DEFAULT_VALIDITY_MINUTES: i64 = 30;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CreateRequest {
    pub url: String,
    pub validity: Option<i64>, // minutes
    pub shortcode: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateResponse {
    pub code: String,
    pub short_link: String,
    pub target: String,
    pub created_at: DateTime<Utc>,
    pub expiry: DateTime<Utc>,
}

impl CreateResponse {
    pub fn new(mapping: model::Mapping, base_url: &str) -> Self {
        Self {
            short_link: mapping.short_link(base_url),
            code: mapping.code,
            target: mapping.target,
            created_at: mapping.created_at,
            expiry: mapping.expires_at,
        }
    }
}

/// A mapping as seen by the listing and detail views.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingDetails {
    pub short_link: String,
    pub expired: bool,
    #[serde(flatten)]
    pub mapping: model::Mapping,
}

impl MappingDetails {
    pub fn new(mapping: model::Mapping, base_url: &str, now: DateTime<Utc>) -> Self {
        Self {
            short_link: mapping.short_link(base_url),
            expired: mapping.is_expired(now),
            mapping,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ListResponse {
    pub total: usize,
    pub active: usize,
    pub expired: usize,
    pub clicks: u64,
    pub mappings: Vec<MappingDetails>,
}

impl ListResponse {
    pub fn new(mappings: Vec<MappingDetails>) -> Self {
        let expired = mappings.iter().filter(|m| m.expired).count();
        Self {
            total: mappings.len(),
            active: mappings.len() - expired,
            expired,
            clicks: mappings.iter().map(|m| m.mapping.access_count).sum(),
            mappings,
        }
    }
}
