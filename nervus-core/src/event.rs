//! Event model: the immutable record that flows through Bus, Store, Filter
//! Engine and Distributor.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

/// Backoff shape for redelivery of an event's consumer-side retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackoffPolicy {
    None,
    Linear,
    Exponential,
    Fixed,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::Exponential,
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

/// Urgency derived from event `type`. Unrecognised types map to `Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

fn priority_for_type(event_type: &str) -> Priority {
    if event_type.starts_with("system.")
        || event_type.starts_with("security.")
        || event_type.starts_with("error.")
    {
        Priority::Critical
    } else if event_type == "auth.failed" || event_type == "access.denied" {
        Priority::High
    } else if event_type.starts_with("memory.")
        || event_type.starts_with("task.")
        || event_type.starts_with("connection.")
    {
        Priority::Normal
    } else {
        Priority::Low
    }
}

fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Immutable domain event. Construction is value-returning (§4.A): builder
/// methods consume `self` and return a new record rather than mutating in
/// place, since an already-published event must never be observed to change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub action: String,
    pub version: String,
    /// Nanoseconds since epoch; monotonic ID sort key.
    pub timestamp: u64,
    pub source: String,
    pub payload: Value,

    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub tags: HashSet<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub causation_id: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub sequence_number: Option<u64>,

    /// Nanoseconds; `None` means no expiry.
    #[serde(default)]
    pub ttl: Option<u64>,
    #[serde(default)]
    pub expires_at: Option<u64>,
    #[serde(default)]
    pub processed_at: Option<u64>,
    #[serde(default)]
    pub delivered_at: Option<u64>,
    #[serde(default)]
    pub acknowledged_at: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,

    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl Event {
    pub fn new(
        id: impl Into<String>,
        event_type: impl Into<String>,
        action: impl Into<String>,
        source: impl Into<String>,
        payload: Value,
    ) -> Result<Self> {
        let id = id.into();
        let event_type = event_type.into();
        let action = action.into();
        let source = source.into();
        if id.is_empty() {
            return Err(Error::Validation("event id must not be empty".into()));
        }
        if event_type.is_empty() {
            return Err(Error::Validation("event type must not be empty".into()));
        }
        if action.is_empty() {
            return Err(Error::Validation("event action must not be empty".into()));
        }
        if source.is_empty() {
            return Err(Error::Validation("event source must not be empty".into()));
        }
        Ok(Self {
            id,
            event_type,
            action,
            version: "1".to_string(),
            timestamp: now_ts(),
            source,
            payload,
            repository: None,
            session_id: None,
            user_id: None,
            client_id: None,
            tags: HashSet::new(),
            correlation_id: None,
            causation_id: None,
            parent_id: None,
            sequence_number: None,
            ttl: None,
            expires_at: None,
            processed_at: None,
            delivered_at: None,
            acknowledged_at: None,
            retry: None,
            metadata: HashMap::new(),
        })
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_causation(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.tags.extend(tags);
        self
    }

    pub fn with_ttl(mut self, ttl_nanos: u64) -> Self {
        self.ttl = Some(ttl_nanos);
        self.expires_at = Some(self.timestamp.saturating_add(ttl_nanos));
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Estimated wire size, summing the string-valued fields the bus uses
    /// for its size cap (§4.C step 2).
    pub fn estimated_size(&self) -> usize {
        let mut size = self.id.len()
            + self.event_type.len()
            + self.action.len()
            + self.source.len();
        size += self.tags.iter().map(|t| t.len()).sum::<usize>();
        size += self
            .metadata
            .iter()
            .map(|(k, v)| k.len() + v.to_string().len())
            .sum::<usize>();
        size += self.payload.to_string().len();
        size
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => now_ts() > expires_at,
            None => false,
        }
    }

    pub fn priority(&self) -> Priority {
        priority_for_type(&self.event_type)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::DecodeError {
                field: "<event>".to_string(),
                reason: e.to_string(),
            })
    }

    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| Error::DecodeError {
            field: "<event>".to_string(),
            reason: e.to_string(),
        })
    }

    pub fn matches(&self, filter: &Filter) -> bool {
        filter.matches(self)
    }
}

/// Declarative predicate over event fields (§3 Filter). Multi-valued fields
/// are OR-within-field; the filter as a whole is AND-between-fields. Empty
/// fields do not constrain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub repositories: Vec<String>,
    #[serde(default)]
    pub session_ids: Vec<String>,
    #[serde(default)]
    pub user_ids: Vec<String>,
    #[serde(default)]
    pub client_ids: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub after: Option<u64>,
    #[serde(default)]
    pub before: Option<u64>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

fn or_within(values: &[String], candidate: &str) -> bool {
    values.is_empty() || values.iter().any(|v| v == candidate)
}

fn or_within_opt(values: &[String], candidate: &Option<String>) -> bool {
    if values.is_empty() {
        return true;
    }
    match candidate {
        Some(c) => values.iter().any(|v| v == c),
        None => false,
    }
}

impl Filter {
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
            && self.actions.is_empty()
            && self.sources.is_empty()
            && self.repositories.is_empty()
            && self.session_ids.is_empty()
            && self.user_ids.is_empty()
            && self.client_ids.is_empty()
            && self.tags.is_empty()
            && self.after.is_none()
            && self.before.is_none()
            && self.metadata.is_empty()
    }

    pub fn matches(&self, event: &Event) -> bool {
        if !or_within(&self.types, &event.event_type) {
            return false;
        }
        if !or_within(&self.actions, &event.action) {
            return false;
        }
        if !or_within(&self.sources, &event.source) {
            return false;
        }
        if !or_within_opt(&self.repositories, &event.repository) {
            return false;
        }
        if !or_within_opt(&self.session_ids, &event.session_id) {
            return false;
        }
        if !or_within_opt(&self.user_ids, &event.user_id) {
            return false;
        }
        if !or_within_opt(&self.client_ids, &event.client_id) {
            return false;
        }
        if !self.tags.is_empty() && !self.tags.iter().any(|t| event.tags.contains(t)) {
            return false;
        }
        if let Some(after) = self.after {
            if event.timestamp < after {
                return false;
            }
        }
        if let Some(before) = self.before {
            if event.timestamp > before {
                return false;
            }
        }
        for (key, expected) in &self.metadata {
            match event.metadata.get(key) {
                Some(actual) if actual == expected => {}
                _ => return false,
            }
        }
        true
    }

    /// AND-merges two filters by concatenating multi-valued fields and
    /// taking the most restrictive time bounds (§4.B `combine_filters`).
    pub fn combine(&self, other: &Filter) -> Filter {
        let merge_vec = |a: &[String], b: &[String]| -> Vec<String> {
            let mut out = a.to_vec();
            out.extend(b.iter().cloned());
            out.sort();
            out.dedup();
            out
        };
        let mut metadata = self.metadata.clone();
        metadata.extend(other.metadata.clone());
        Filter {
            types: merge_vec(&self.types, &other.types),
            actions: merge_vec(&self.actions, &other.actions),
            sources: merge_vec(&self.sources, &other.sources),
            repositories: merge_vec(&self.repositories, &other.repositories),
            session_ids: merge_vec(&self.session_ids, &other.session_ids),
            user_ids: merge_vec(&self.user_ids, &other.user_ids),
            client_ids: merge_vec(&self.client_ids, &other.client_ids),
            tags: merge_vec(&self.tags, &other.tags),
            after: match (self.after, other.after) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, None) => a,
                (None, b) => b,
            },
            before: match (self.before, other.before) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, None) => a,
                (None, b) => b,
            },
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk(id: &str, t: &str) -> Event {
        Event::new(id, t, "create", "test-suite", Value::Null).unwrap()
    }

    #[test]
    fn matches_is_total_and_deterministic() {
        let e = mk("evt_1", "memory.update").with_tags(["x".to_string()]);
        let f = Filter {
            types: vec!["memory.update".to_string()],
            tags: vec!["x".to_string()],
            ..Default::default()
        };
        assert!(e.matches(&f));
        assert!(e.matches(&f));
    }

    #[test]
    fn empty_filter_matches_everything() {
        let e = mk("evt_1", "anything");
        assert!(e.matches(&Filter::default()));
    }

    #[test]
    fn clone_is_deep() {
        let e = mk("evt_1", "memory.update").with_tags(["a".to_string()]);
        let mut c = e.clone();
        c.tags.insert("b".to_string());
        c.metadata.insert("k".to_string(), Value::Bool(true));
        assert_eq!(e.tags.len(), 1);
        assert!(e.metadata.is_empty());
    }

    #[test]
    fn json_round_trips() {
        let e = mk("evt_1", "memory.update")
            .with_correlation("corr-1")
            .with_tags(["a".to_string(), "b".to_string()])
            .with_metadata("k", Value::String("v".to_string()));
        let json = e.to_json().unwrap();
        let back = Event::from_json(&json).unwrap();
        assert_eq!(e.id, back.id);
        assert_eq!(e.tags, back.tags);
        assert_eq!(e.metadata, back.metadata);
        assert_eq!(e.correlation_id, back.correlation_id);
    }

    #[test]
    fn priority_mapping() {
        assert_eq!(mk("e", "system.alert").priority(), Priority::Critical);
        assert_eq!(mk("e", "auth.failed").priority(), Priority::High);
        assert_eq!(mk("e", "memory.update").priority(), Priority::Normal);
        assert_eq!(mk("e", "whatever").priority(), Priority::Low);
    }

    #[test]
    fn ttl_expiry() {
        let e = mk("e", "memory.update");
        assert!(!e.is_expired());
        let expired = Event {
            expires_at: Some(1),
            ..mk("e", "memory.update")
        };
        assert!(expired.is_expired());
    }

    #[test]
    fn construction_rejects_empty_required_fields() {
        assert!(Event::new("", "t", "a", "s", Value::Null).is_err());
        assert!(Event::new("id", "", "a", "s", Value::Null).is_err());
    }
}
