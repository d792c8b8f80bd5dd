//! Testing utilities for keelson.
//!
//! [`InMemoryApi`] stands in for the platform API: objects live in a map,
//! every write bumps a `resourceVersion`, and a replace carrying a stale
//! version is refused with a conflict. Faults can be scripted per verb,
//! including lost acknowledgements where the write is applied but the
//! caller sees an error.
//!
//! ```ignore
//! let api = InMemoryApi::shared();
//! api.lose_ack_next(ApiVerb::Create, ApiError::server_error("ack lost"));
//!
//! let engine = EngineBuilder::new(api.clone()).build();
//! // ... run a plan ...
//!
//! assert_eq!(api.events()?.len(), 1);
//! assert_eq!(api.call_count(ApiVerb::Create), 1);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use keelson::{ApiClient, ApiError, ApiVerb, EventRecord, ObjectKind};
use serde_json::Value;
use tracing::debug;

type ObjectId = (ObjectKind, String, String);

/// One call as the fake received it.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub verb: ApiVerb,
    pub kind: ObjectKind,
    pub namespace: String,
    pub name: Option<String>,
    pub body: Option<Value>,
}

#[derive(Debug, Clone)]
enum FaultEffect {
    /// Refuse the call without touching state.
    Fail(ApiError),
    /// Apply the write, then report `ApiError` anyway.
    LoseAck(ApiError),
    Panic,
}

#[derive(Debug, Clone)]
struct Fault {
    verb: ApiVerb,
    effect: FaultEffect,
    /// `None` fires forever.
    remaining: Option<u32>,
}

#[derive(Debug, Default)]
pub struct InMemoryApi {
    objects: DashMap<ObjectId, Value>,
    versions: AtomicU64,
    journal: Mutex<Vec<RecordedCall>>,
    faults: Mutex<Vec<Fault>>,
    latency: Mutex<Option<Duration>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn object_name(body: &Value) -> Option<&str> {
    body.pointer("/metadata/name").and_then(Value::as_str)
}

fn resource_version(body: &Value) -> Option<&str> {
    body.pointer("/metadata/resourceVersion").and_then(Value::as_str)
}

impl InMemoryApi {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Delays every call by `latency` before it is handled.
    pub fn set_latency(&self, latency: Duration) {
        *locked(&self.latency) = Some(latency);
    }

    pub fn fail_next(&self, verb: ApiVerb, error: ApiError) {
        self.fail_times(verb, 1, error);
    }

    pub fn fail_times(&self, verb: ApiVerb, times: u32, error: ApiError) {
        self.push_fault(verb, FaultEffect::Fail(error), Some(times));
    }

    pub fn fail_always(&self, verb: ApiVerb, error: ApiError) {
        self.push_fault(verb, FaultEffect::Fail(error), None);
    }

    /// The next `verb` write is applied but answered with `error`.
    pub fn lose_ack_next(&self, verb: ApiVerb, error: ApiError) {
        self.push_fault(verb, FaultEffect::LoseAck(error), Some(1));
    }

    /// The next `verb` call panics inside the client.
    pub fn panic_next(&self, verb: ApiVerb) {
        self.push_fault(verb, FaultEffect::Panic, Some(1));
    }

    pub fn clear_faults(&self) {
        locked(&self.faults).clear();
    }

    fn push_fault(&self, verb: ApiVerb, effect: FaultEffect, remaining: Option<u32>) {
        locked(&self.faults).push(Fault {
            verb,
            effect,
            remaining,
        });
    }

    fn take_fault(&self, verb: ApiVerb) -> Option<FaultEffect> {
        let mut faults = locked(&self.faults);
        let index = faults.iter().position(|fault| fault.verb == verb)?;
        let fault = &mut faults[index];
        let effect = fault.effect.clone();
        let exhausted = match fault.remaining.as_mut() {
            Some(remaining) => {
                *remaining = remaining.saturating_sub(1);
                *remaining == 0
            }
            None => false,
        };
        if exhausted {
            faults.remove(index);
        }
        Some(effect)
    }

    /// Stores `body` directly, as if another writer had created it.
    pub fn insert_object(
        &self,
        kind: ObjectKind,
        namespace: &str,
        body: Value,
    ) -> anyhow::Result<Value> {
        let name = object_name(&body)
            .context("object body has no metadata.name")?
            .to_string();
        Ok(self.store((kind, namespace.to_string(), name), body))
    }

    /// Removes an object behind the engine's back.
    pub fn delete_object(&self, kind: ObjectKind, namespace: &str, name: &str) -> bool {
        self.objects
            .remove(&(kind, namespace.to_string(), name.to_string()))
            .is_some()
    }

    #[must_use]
    pub fn object(&self, kind: ObjectKind, namespace: &str, name: &str) -> Option<Value> {
        self.objects
            .get(&(kind, namespace.to_string(), name.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// All stored events, ordered by name.
    pub fn events(&self) -> anyhow::Result<Vec<EventRecord>> {
        let mut events = self
            .objects
            .iter()
            .filter(|entry| entry.key().0 == ObjectKind::Event)
            .map(|entry| {
                EventRecord::from_value(entry.value().clone())
                    .with_context(|| format!("stored event {} did not decode", entry.key().2))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        events.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(events)
    }

    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        locked(&self.journal).clone()
    }

    #[must_use]
    pub fn calls_of(&self, verb: ApiVerb) -> Vec<RecordedCall> {
        locked(&self.journal)
            .iter()
            .filter(|call| call.verb == verb)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn call_count(&self, verb: ApiVerb) -> usize {
        locked(&self.journal).iter().filter(|call| call.verb == verb).count()
    }

    fn store(&self, id: ObjectId, body: Value) -> Value {
        let body = self.versioned(body);
        self.objects.insert(id, body.clone());
        body
    }

    fn versioned(&self, mut body: Value) -> Value {
        let version = self.versions.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(metadata) = body.get_mut("metadata").and_then(Value::as_object_mut) {
            metadata.insert("resourceVersion".to_string(), Value::String(version.to_string()));
        }
        body
    }

    async fn enter(&self, call: RecordedCall) -> Option<FaultEffect> {
        let latency = *locked(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        debug!(
            verb = %call.verb.as_str(),
            kind = %call.kind,
            namespace = %call.namespace,
            name = ?call.name,
            "fake api call"
        );
        let verb = call.verb;
        locked(&self.journal).push(call);
        let fault = self.take_fault(verb);
        if matches!(fault, Some(FaultEffect::Panic)) {
            panic!("scripted client panic on {}", verb.as_str());
        }
        fault
    }

    fn apply_create(&self, id: ObjectId, body: Value) -> Result<Value, ApiError> {
        match self.objects.entry(id) {
            Entry::Occupied(entry) => {
                let (kind, _, name) = entry.key();
                Err(ApiError::already_exists(format!("{kind} {name} already exists")))
            }
            Entry::Vacant(entry) => {
                let body = self.versioned(body);
                entry.insert(body.clone());
                Ok(body)
            }
        }
    }

    fn apply_replace(&self, id: ObjectId, body: Value) -> Result<Value, ApiError> {
        let (kind, _, name) = &id;
        let Some(mut current) = self.objects.get_mut(&id) else {
            return Err(ApiError::not_found(format!("{kind} {name} not found")));
        };
        if let Some(expected) = resource_version(&body) {
            if resource_version(current.value()) != Some(expected) {
                return Err(ApiError::conflict(format!(
                    "{kind} {name} was modified; resourceVersion {expected} is stale"
                )));
            }
        }
        let body = self.versioned(body);
        *current.value_mut() = body.clone();
        Ok(body)
    }

    fn settle(
        fault: Option<FaultEffect>,
        apply: impl FnOnce() -> Result<Value, ApiError>,
    ) -> Result<Value, ApiError> {
        match fault {
            Some(FaultEffect::Fail(error)) => Err(error),
            Some(FaultEffect::LoseAck(error)) => {
                let _ = apply();
                Err(error)
            }
            Some(FaultEffect::Panic) | None => apply(),
        }
    }
}

#[async_trait]
impl ApiClient for InMemoryApi {
    async fn get_object(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
    ) -> Result<Value, ApiError> {
        let fault = self
            .enter(RecordedCall {
                verb: ApiVerb::Get,
                kind,
                namespace: namespace.to_string(),
                name: Some(name.to_string()),
                body: None,
            })
            .await;
        Self::settle(fault, || {
            self.object(kind, namespace, name)
                .ok_or_else(|| ApiError::not_found(format!("{kind} {name} not found")))
        })
    }

    async fn create_object(
        &self,
        kind: ObjectKind,
        namespace: &str,
        body: Value,
    ) -> Result<Value, ApiError> {
        let name = object_name(&body).map(str::to_string);
        let fault = self
            .enter(RecordedCall {
                verb: ApiVerb::Create,
                kind,
                namespace: namespace.to_string(),
                name: name.clone(),
                body: Some(body.clone()),
            })
            .await;
        let Some(name) = name else {
            return Err(ApiError::bad_request("metadata.name is required"));
        };
        Self::settle(fault, || {
            self.apply_create((kind, namespace.to_string(), name), body)
        })
    }

    async fn replace_object(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
        body: Value,
    ) -> Result<Value, ApiError> {
        let fault = self
            .enter(RecordedCall {
                verb: ApiVerb::Replace,
                kind,
                namespace: namespace.to_string(),
                name: Some(name.to_string()),
                body: Some(body.clone()),
            })
            .await;
        Self::settle(fault, || {
            self.apply_replace((kind, namespace.to_string(), name.to_string()), body)
        })
    }
}
