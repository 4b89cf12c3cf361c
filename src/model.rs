use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Mapping is the structure stored for each short code.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    pub code: String,   // the "abc123" part of "http://host/abc123"
    pub target: String, // absolute URL to redirect to
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub access_count: u64, // every successful resolution, including evicted log entries
    #[serde(default)]
    pub access_log: VecDeque<AccessEvent>,
}

impl Mapping {
    pub(crate) fn new(code: String, target: String, created_at: DateTime<Utc>, validity_minutes: i64) -> Self {
        Self {
            code,
            target,
            created_at,
            expires_at: created_at + chrono::Duration::minutes(validity_minutes),
            access_count: 0,
            access_log: VecDeque::new(),
        }
    }

    /// A mapping stops resolving strictly after its expiry instant.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn short_link(&self, base_url: &str) -> String {
        format!("{}/{}", base_url.trim_end_matches('/'), self.code)
    }

    /// Appends an access event, keeping at most `cap` of the newest events.
    pub(crate) fn record(&mut self, event: AccessEvent, cap: usize) {
        self.access_count += 1;
        self.access_log.push_back(event);
        while self.access_log.len() > cap {
            self.access_log.pop_front();
        }
    }
}

impl std::fmt::Display for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.code, self.target)?;
        write!(f, " [created: {}, expires: {}]", self.created_at, self.expires_at)?;
        write!(f, " ({} clicks)", self.access_count)?;
        Ok(())
    }
}

/// One successful resolution of a mapping.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct AccessEvent {
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub origin: String,
}

/// Caller-supplied tags recorded with an access event.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AccessContext {
    pub source: String,
    pub origin: String,
}

impl Default for AccessContext {
    fn default() -> Self {
        Self {
            source: "direct".to_string(),
            origin: "localhost".to_string(),
        }
    }
}

/// Full serialized state of the store, oldest mapping first.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Snapshot {
    pub mappings: Vec<Mapping>,
}

impl Snapshot {
    pub fn new(mut mappings: Vec<Mapping>) -> Self {
        mappings.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.code.cmp(&b.code)));
        Self { mappings }
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(validity: i64) -> Mapping {
        let created = "2025-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        Mapping::new("abc".to_string(), "https://example.com".to_string(), created, validity)
    }

    fn event(source: &str) -> AccessEvent {
        AccessEvent {
            timestamp: Utc::now(),
            source: source.to_string(),
            origin: "localhost".to_string(),
        }
    }

    #[test]
    fn test_expiry_is_created_plus_validity() {
        let m = mapping(30);
        assert_eq!(m.expires_at - m.created_at, chrono::Duration::minutes(30));
    }

    #[test]
    fn test_expired_only_after_expiry_instant() {
        let m = mapping(1);
        assert!(!m.is_expired(m.expires_at));
        assert!(m.is_expired(m.expires_at + chrono::Duration::seconds(1)));
        assert!(!m.is_expired(m.created_at));
    }

    #[test]
    fn test_record_counts_and_caps() {
        let mut m = mapping(10);
        m.record(event("a"), 2);
        m.record(event("b"), 2);
        assert_eq!(m.access_count, 2);
        assert_eq!(m.access_log.len(), 2);

        m.record(event("c"), 2);
        assert_eq!(m.access_count, 3);
        assert_eq!(m.access_log.len(), 2);
        assert_eq!(m.access_log.front().unwrap().source, "b");
        assert_eq!(m.access_log.back().unwrap().source, "c");
    }

    #[test]
    fn test_short_link() {
        let m = mapping(10);
        assert_eq!(m.short_link("http://localhost:3000/"), "http://localhost:3000/abc");
        assert_eq!(m.short_link("http://localhost:3000"), "http://localhost:3000/abc");
    }

    #[test]
    fn test_snapshot_wire_format() {
        let mut m = mapping(10);
        m.record(event("direct"), 10);
        let json = serde_json::to_value(Snapshot::new(vec![m])).unwrap();
        let entry = &json[0];
        assert_eq!(entry["code"], "abc");
        assert_eq!(entry["createdAt"], "2025-01-01T00:00:00Z");
        assert_eq!(entry["expiresAt"], "2025-01-01T00:10:00Z");
        assert_eq!(entry["accessCount"], 1);
        assert_eq!(entry["accessLog"][0]["source"], "direct");
    }

    #[test]
    fn test_snapshot_sorted_oldest_first() {
        let older = mapping(10);
        let mut newer = mapping(10);
        newer.code = "xyz".to_string();
        newer.created_at += chrono::Duration::minutes(1);
        let snapshot = Snapshot::new(vec![newer, older]);
        assert_eq!(snapshot.mappings[0].code, "abc");
        assert_eq!(snapshot.mappings[1].code, "xyz");
    }
}
