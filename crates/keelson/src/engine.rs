//! Engine: shared services, fiber spawning and trigger routing.
//!
//! The engine owns everything fibers share: the API client, the presence
//! cache, the event ledger and the configuration. It holds no per-run
//! state apart from the table of in-flight fibers per resource, which is
//! how a newer trigger supersedes an older run.
//!
//! Once the fiber for a deletion finishes and the resource has not come
//! back, the ledger forgets every event identity attributed to the domain.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::api::ApiClient;
use crate::config::EngineConfig;
use crate::error::FiberError;
use crate::events::{EventLedger, DOMAIN_KIND};
use crate::fiber::{CancelFlag, Fiber, FiberId, FiberOutcome};
use crate::packet::{keys, Packet};
use crate::presence::{PresenceCache, PresenceSnapshot, ResourceKey};
use crate::retry::RetryPolicy;
use crate::step::Plan;
use crate::trigger::{Trigger, TriggerReason};

/// Everything a running fiber may consult.
pub(crate) struct Services {
    pub(crate) api: Arc<dyn ApiClient>,
    pub(crate) presence: Arc<PresenceCache>,
    pub(crate) ledger: EventLedger,
    pub(crate) config: EngineConfig,
}

impl Services {
    pub(crate) const fn retry(&self) -> &RetryPolicy {
        &self.config.retry
    }
}

/// A domain whose ledger identities are dropped after its deletion fiber.
struct Retired {
    key: ResourceKey,
    domain_uid: String,
}

impl Retired {
    fn forget(&self, services: &Services) {
        if services.presence.get(&self.key).is_some() {
            debug!(resource = %self.key, "domain came back; keeping its events");
            return;
        }
        let removed = services.ledger.forget_involving(|involved| {
            involved.kind == DOMAIN_KIND
                && involved.namespace == self.key.namespace
                && involved.name == self.domain_uid
        });
        debug!(resource = %self.key, removed, "forgot events of deleted domain");
    }
}

/// Chooses the plan for a trigger; `None` skips it.
pub type Planner = Arc<dyn Fn(&Trigger) -> Option<Plan> + Send + Sync>;

pub struct EngineBuilder {
    api: Arc<dyn ApiClient>,
    config: EngineConfig,
    presence: Option<Arc<PresenceCache>>,
    ledger: Option<EventLedger>,
    planner: Option<Planner>,
}

impl EngineBuilder {
    pub fn new(api: Arc<dyn ApiClient>) -> Self {
        Self {
            api,
            config: EngineConfig::default(),
            presence: None,
            ledger: None,
            planner: None,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Shares an existing cache, e.g. one a watch already populated.
    #[must_use]
    pub fn with_presence(mut self, presence: Arc<PresenceCache>) -> Self {
        self.presence = Some(presence);
        self
    }

    #[must_use]
    pub fn with_ledger(mut self, ledger: EventLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    #[must_use]
    pub fn with_planner<F>(mut self, planner: F) -> Self
    where
        F: Fn(&Trigger) -> Option<Plan> + Send + Sync + 'static,
    {
        self.planner = Some(Arc::new(planner));
        self
    }

    #[must_use]
    pub fn build(self) -> Engine {
        Engine {
            services: Arc::new(Services {
                api: self.api,
                presence: self.presence.unwrap_or_default(),
                ledger: self.ledger.unwrap_or_default(),
                config: self.config,
            }),
            planner: self.planner,
            inflight: Arc::new(DashMap::new()),
        }
    }
}

#[derive(Clone)]
pub struct Engine {
    services: Arc<Services>,
    planner: Option<Planner>,
    inflight: Arc<DashMap<ResourceKey, (FiberId, CancelFlag)>>,
}

impl Engine {
    pub fn builder(api: Arc<dyn ApiClient>) -> EngineBuilder {
        EngineBuilder::new(api)
    }

    #[must_use]
    pub fn presence(&self) -> &Arc<PresenceCache> {
        &self.services.presence
    }

    #[must_use]
    pub fn ledger(&self) -> &EventLedger {
        &self.services.ledger
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    /// A fresh packet for `key`, seeded from the presence cache.
    #[must_use]
    pub fn packet_for(&self, key: &ResourceKey) -> Packet {
        seeded(key, self.services.presence.get(key))
    }

    /// Spawns a fiber running `plan` from its entry step.
    pub fn start(&self, plan: &Plan, packet: Packet) -> FiberHandle {
        self.spawn(plan, packet, FiberId::new(), CancelFlag::new(), None, None)
    }

    /// Runs a fiber to completion on the current task.
    pub async fn run(&self, plan: &Plan, packet: Packet) -> FiberOutcome {
        let id = FiberId::new();
        let span = fiber_span(id, &packet);
        let outcome = Fiber::new(
            id,
            Arc::clone(plan.graph()),
            Arc::clone(&self.services),
            CancelFlag::new(),
            packet,
        )
        .run(plan.entry())
        .instrument(span.clone())
        .await;
        span.in_scope(|| log_outcome(id, &outcome));
        outcome
    }

    /// Applies a watch or timer notification.
    ///
    /// The presence cache is updated first, then a fiber is started for the
    /// planned steps. A fiber still running for the same resource is
    /// cancelled: the newer trigger supersedes it.
    pub fn trigger(&self, trigger: Trigger) -> Option<FiberHandle> {
        let plan = self.planner.as_ref().and_then(|planner| planner(&trigger));
        let kind = trigger.kind();
        let key = trigger.resource;
        let presence = &self.services.presence;
        let deleted = matches!(trigger.reason, TriggerReason::Deleted);
        let snapshot = match trigger.reason {
            TriggerReason::Added(domain) | TriggerReason::Modified(domain) => {
                Some(presence.observe(domain))
            }
            TriggerReason::Deleted => presence.remove(&key),
            TriggerReason::Resync => presence.get(&key),
        };
        let retired = snapshot
            .as_ref()
            .and_then(PresenceSnapshot::domain_uid)
            .filter(|_| deleted)
            .map(|domain_uid| Retired {
                key: key.clone(),
                domain_uid: domain_uid.to_string(),
            });

        let Some(plan) = plan else {
            debug!(resource = %key, trigger = %kind, "no plan for trigger");
            if let Some(retired) = retired {
                retired.forget(&self.services);
            }
            return None;
        };

        let packet = seeded(&key, snapshot).with(keys::TRIGGER, kind);
        let id = FiberId::new();
        let cancel = CancelFlag::new();
        if let Some((previous, flag)) = self.inflight.insert(key.clone(), (id, cancel.clone())) {
            warn!(
                resource = %key,
                superseded = %previous,
                fiber = %id,
                "superseding in-flight fiber"
            );
            flag.cancel();
        }
        info!(resource = %key, trigger = %kind, fiber = %id, "starting fiber");
        Some(self.spawn(&plan, packet, id, cancel, Some(key), retired))
    }

    /// Cancels the in-flight fiber for `key`, if any.
    pub fn cancel(&self, key: &ResourceKey) -> bool {
        match self.inflight.remove(key) {
            Some((_, (id, flag))) => {
                debug!(resource = %key, fiber = %id, "cancelling fiber");
                flag.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of resources with a trigger-started fiber still running.
    #[must_use]
    pub fn inflight(&self) -> usize {
        self.inflight.len()
    }

    fn spawn(
        &self,
        plan: &Plan,
        packet: Packet,
        id: FiberId,
        cancel: CancelFlag,
        tracked: Option<ResourceKey>,
        retired: Option<Retired>,
    ) -> FiberHandle {
        let span = fiber_span(id, &packet);
        let fiber = Fiber::new(
            id,
            Arc::clone(plan.graph()),
            Arc::clone(&self.services),
            cancel.clone(),
            packet,
        );
        let entry = plan.entry();
        let inflight = Arc::clone(&self.inflight);
        let services = Arc::clone(&self.services);
        let join = tokio::spawn(
            async move {
                let outcome = fiber.run(entry).await;
                if let Some(key) = tracked {
                    inflight.remove_if(&key, |_, (holder, _)| *holder == id);
                }
                if let Some(retired) = retired {
                    retired.forget(&services);
                }
                log_outcome(id, &outcome);
                outcome
            }
            .instrument(span),
        );
        FiberHandle { id, cancel, join }
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("presence", &self.services.presence.len())
            .field("ledger", &self.services.ledger)
            .field("inflight", &self.inflight.len())
            .finish_non_exhaustive()
    }
}

fn seeded(key: &ResourceKey, snapshot: Option<PresenceSnapshot>) -> Packet {
    let mut packet = Packet::new().with(keys::RESOURCE, key.clone());
    if let Some(snapshot) = snapshot {
        if let Some(last) = snapshot.last_event {
            packet.insert(keys::EVENT_TYPE, last);
        }
        packet.insert(keys::PRESENCE, snapshot);
    }
    packet
}

fn fiber_span(id: FiberId, packet: &Packet) -> tracing::Span {
    let resource = packet
        .get(keys::RESOURCE)
        .map(ToString::to_string)
        .unwrap_or_default();
    info_span!("fiber", id = %id, resource = %resource)
}

fn log_outcome(id: FiberId, outcome: &FiberOutcome) {
    match outcome {
        FiberOutcome::Completed(_) => info!(fiber = %id, "fiber completed"),
        FiberOutcome::Cancelled => warn!(fiber = %id, "fiber cancelled"),
        FiberOutcome::Failed(err) => {
            error!(fiber = %id, class = ?err.class(), error = %err, "fiber failed");
        }
    }
}

/// Handle to a spawned fiber.
#[derive(Debug)]
pub struct FiberHandle {
    id: FiberId,
    cancel: CancelFlag,
    join: JoinHandle<FiberOutcome>,
}

impl FiberHandle {
    #[must_use]
    pub const fn id(&self) -> FiberId {
        self.id
    }

    /// Raises the fiber's cancellation flag. Takes effect at its next
    /// suspension boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn outcome(self) -> FiberOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(err) => FiberOutcome::Failed(FiberError::logic(format!(
                "fiber task ended abnormally: {err}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::NextAction;
    use crate::api::ObjectKind;
    use crate::context::StepContext;
    use crate::error::ApiError;
    use crate::events::{EventItem, EventRecord, ObjectMeta, ObjectReference, Severity};
    use crate::presence::DomainResource;
    use crate::step::{PlanBuilder, Step};
    use async_trait::async_trait;
    use serde_json::Value;

    /// Refuses every call; these tests never reach the API.
    struct NoApi;

    #[async_trait]
    impl ApiClient for NoApi {
        async fn get_object(&self, _: ObjectKind, _: &str, _: &str) -> Result<Value, ApiError> {
            Err(ApiError::bad_request("unused"))
        }

        async fn create_object(&self, _: ObjectKind, _: &str, _: Value) -> Result<Value, ApiError> {
            Err(ApiError::bad_request("unused"))
        }

        async fn replace_object(
            &self,
            _: ObjectKind,
            _: &str,
            _: &str,
            _: Value,
        ) -> Result<Value, ApiError> {
            Err(ApiError::bad_request("unused"))
        }
    }

    struct Noop;

    impl Step for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        fn apply(&self, cx: &mut StepContext<'_>) -> NextAction {
            cx.do_next()
        }
    }

    fn noop_plan() -> Plan {
        let mut builder = PlanBuilder::new();
        let entry = builder.add(Noop, None);
        builder.finish(entry)
    }

    #[test]
    fn test_packet_seeded_from_presence() {
        let engine = EngineBuilder::new(Arc::new(NoApi)).build();
        let key = engine.presence().observe(DomainResource::new("ns1", "d1", "uid")).key;
        engine.presence().record_event(&key, EventItem::DomainProcessingStarting);

        let packet = engine.packet_for(&key);
        assert_eq!(packet.get(keys::RESOURCE), Some(&key));
        assert_eq!(packet.get(keys::EVENT_TYPE), Some(&EventItem::DomainProcessingStarting));
        assert!(packet.contains(keys::PRESENCE));

        let unknown = engine.packet_for(&ResourceKey::new("ns1", "other"));
        assert!(!unknown.contains(keys::PRESENCE));
        assert!(!unknown.contains(keys::EVENT_TYPE));
    }

    #[tokio::test]
    async fn test_trigger_without_plan_still_updates_cache() {
        let engine = EngineBuilder::new(Arc::new(NoApi)).build();
        let domain = DomainResource::new("ns1", "d1", "uid");
        assert!(engine.trigger(Trigger::added(domain.clone())).is_none());
        assert_eq!(engine.presence().len(), 1);
        assert!(engine.trigger(Trigger::deleted(domain.key())).is_none());
        assert!(engine.presence().is_empty());
    }

    #[tokio::test]
    async fn test_trigger_runs_plan_and_clears_inflight() {
        let plan = noop_plan();
        let engine = EngineBuilder::new(Arc::new(NoApi))
            .with_planner(move |_| Some(plan.clone()))
            .build();
        let handle = engine
            .trigger(Trigger::added(DomainResource::new("ns1", "d1", "uid")))
            .unwrap();
        let outcome = handle.outcome().await;
        assert!(outcome.is_completed());
        assert_eq!(
            outcome.packet().and_then(|p| p.get(keys::TRIGGER)).copied(),
            Some(crate::trigger::TriggerKind::Added)
        );
        assert_eq!(engine.inflight(), 0);
    }

    #[tokio::test]
    async fn test_deletion_forgets_domain_events() {
        let plan = noop_plan();
        let engine = EngineBuilder::new(Arc::new(NoApi))
            .with_planner(move |_| Some(plan.clone()))
            .build();
        let domain = DomainResource::new("ns1", "d1", "uid").with_domain_uid("sample");
        let added = engine.trigger(Trigger::added(domain.clone())).unwrap().outcome().await;
        assert!(added.is_completed());

        let stored = |namespace: &str, name: &str| {
            let at = chrono::Utc::now();
            EventRecord {
                metadata: ObjectMeta {
                    name: format!("{name}.DomainChanged.1"),
                    namespace: namespace.into(),
                    ..ObjectMeta::default()
                },
                reason: "DomainChanged".into(),
                message: String::new(),
                severity: Severity::Normal,
                involved_object: ObjectReference {
                    name: name.into(),
                    namespace: namespace.into(),
                    kind: DOMAIN_KIND.into(),
                    api_version: None,
                    uid: None,
                },
                first_timestamp: at,
                last_timestamp: at,
                count: 1,
                reporting_component: "c".into(),
                reporting_instance: "i".into(),
            }
        };
        engine.ledger().observe(stored("ns1", "sample"));
        engine.ledger().observe(stored("ns2", "sample"));
        assert_eq!(engine.ledger().len(), 2);

        let outcome = engine.trigger(Trigger::deleted(domain.key())).unwrap().outcome().await;
        assert!(outcome.is_completed());
        assert_eq!(engine.ledger().len(), 1);
        assert!(engine.ledger().stored(&stored("ns2", "sample").identity()).is_some());
    }

    #[tokio::test]
    async fn test_run_completes_inline() {
        let engine = EngineBuilder::new(Arc::new(NoApi)).build();
        let outcome = engine.run(&noop_plan(), Packet::new()).await;
        assert!(outcome.is_completed());
    }
}
