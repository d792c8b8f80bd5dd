//! Domain presence cache.
//!
//! One entry per watched domain resource, holding the last observed object
//! and the last event kind recorded for it. Entries are created on first
//! observation and removed when the resource's deletion is observed.
//!
//! All writes go through a single map-shard lock for the duration of a
//! closure, so fibers for the same resource cannot interleave a stale read
//! with a write. Callers that read, suspend, and then write should use
//! [`PresenceCache::compare_and_set`] with the version they read.

use std::fmt;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::PresenceError;
use crate::events::EventItem;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The custom resource as last observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainResource {
    pub namespace: String,
    pub name: String,
    /// Platform-assigned object uid.
    pub uid: String,
    /// `spec.domainUID` of the resource; events are named after it.
    pub domain_uid: String,
    #[serde(default)]
    pub generation: i64,
    #[serde(default)]
    pub spec: Value,
}

impl DomainResource {
    /// A resource whose domain UID equals its name.
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        uid: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            namespace: namespace.into(),
            domain_uid: name.clone(),
            name,
            uid: uid.into(),
            generation: 1,
            spec: Value::Null,
        }
    }

    #[must_use]
    pub fn with_domain_uid(mut self, domain_uid: impl Into<String>) -> Self {
        self.domain_uid = domain_uid.into();
        self
    }

    #[must_use]
    pub fn with_spec(mut self, spec: Value) -> Self {
        self.spec = spec;
        self
    }

    #[must_use]
    pub const fn with_generation(mut self, generation: i64) -> Self {
        self.generation = generation;
        self
    }

    #[must_use]
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.namespace, &self.name)
    }
}

/// A consistent copy of one cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceSnapshot {
    pub key: ResourceKey,
    pub domain: Option<DomainResource>,
    pub last_event: Option<EventItem>,
    /// Bumped on every write to the entry.
    pub version: u64,
}

impl PresenceSnapshot {
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.key.namespace
    }

    #[must_use]
    pub fn domain_uid(&self) -> Option<&str> {
        self.domain.as_ref().map(|domain| domain.domain_uid.as_str())
    }

    #[must_use]
    pub fn uid(&self) -> Option<&str> {
        self.domain.as_ref().map(|domain| domain.uid.as_str())
    }
}

/// Mutable view handed to update closures.
#[derive(Debug)]
pub struct PresenceEntry<'a> {
    pub domain: &'a mut Option<DomainResource>,
    pub last_event: &'a mut Option<EventItem>,
}

#[derive(Debug, Default)]
pub struct PresenceCache {
    entries: DashMap<ResourceKey, PresenceSnapshot>,
}

impl PresenceCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the latest observed resource, creating the entry if needed.
    pub fn observe(&self, domain: DomainResource) -> PresenceSnapshot {
        let key = domain.key();
        let mut entry = self.entries.entry(key.clone()).or_insert_with(|| PresenceSnapshot {
            key,
            domain: None,
            last_event: None,
            version: 0,
        });
        entry.domain = Some(domain);
        entry.version = entry.version.saturating_add(1);
        debug!(resource = %entry.key, version = entry.version, "observed domain");
        entry.clone()
    }

    #[must_use]
    pub fn get(&self, key: &ResourceKey) -> Option<PresenceSnapshot> {
        self.entries.get(key).map(|entry| entry.clone())
    }

    #[must_use]
    pub fn last_event(&self, key: &ResourceKey) -> Option<EventItem> {
        self.entries.get(key).and_then(|entry| entry.last_event)
    }

    /// Notes that `item` was just recorded. Returns `false` when the
    /// resource is no longer cached.
    pub fn record_event(&self, key: &ResourceKey, item: EventItem) -> bool {
        self.update(key, |entry| *entry.last_event = Some(item)).is_some()
    }

    /// Applies `f` atomically to the entry for `key`.
    pub fn update<F>(&self, key: &ResourceKey, f: F) -> Option<PresenceSnapshot>
    where
        F: FnOnce(PresenceEntry<'_>),
    {
        let mut entry = self.entries.get_mut(key)?;
        let snapshot = entry.value_mut();
        f(PresenceEntry {
            domain: &mut snapshot.domain,
            last_event: &mut snapshot.last_event,
        });
        snapshot.version = snapshot.version.saturating_add(1);
        Some(snapshot.clone())
    }

    /// Applies `f` only if the entry is still at `expected` version.
    pub fn compare_and_set<F>(
        &self,
        key: &ResourceKey,
        expected: u64,
        f: F,
    ) -> Result<PresenceSnapshot, PresenceError>
    where
        F: FnOnce(PresenceEntry<'_>),
    {
        let mut entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| PresenceError::Missing(key.clone()))?;
        let snapshot = entry.value_mut();
        if snapshot.version != expected {
            return Err(PresenceError::Stale {
                key: key.clone(),
                expected,
                found: snapshot.version,
            });
        }
        f(PresenceEntry {
            domain: &mut snapshot.domain,
            last_event: &mut snapshot.last_event,
        });
        snapshot.version = snapshot.version.saturating_add(1);
        Ok(snapshot.clone())
    }

    pub fn remove(&self, key: &ResourceKey) -> Option<PresenceSnapshot> {
        let removed = self.entries.remove(key).map(|(_, snapshot)| snapshot);
        if removed.is_some() {
            debug!(resource = %key, "dropped presence entry");
        }
        removed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
