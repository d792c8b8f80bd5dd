//! Fiber execution: retries, cancellation, suspension and failure surfacing.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use keelson::{
    async_trait, ApiCall, ApiClient, ApiError, ApiVerb, Backoff, DomainResource, EngineBuilder,
    EngineConfig, ErrorClass, FiberError, FiberOutcome, NextAction, ObjectKind, Packet, Pending,
    Plan, PlanBuilder, Resumer, RetryPolicy, Step, StepContext, StoreResponse, Trigger,
};
use keelson_testing::InMemoryApi;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;

keelson::packet_key! {
    POD: Value = "pod";
    REPLICAS: u32 = "replicas";
    BRANCH: &'static str = "branch";
    VISITS: u32 = "visits";
}

struct FetchPod;

impl Step for FetchPod {
    fn name(&self) -> &str {
        "fetch-pod"
    }

    fn apply(&self, cx: &mut StepContext<'_>) -> NextAction {
        cx.invoke(ApiCall::get(ObjectKind::Pod, "ns1", "pod-0"), StoreResponse::new(POD))
    }
}

struct ReplacePod;

impl Step for ReplacePod {
    fn name(&self) -> &str {
        "replace-pod"
    }

    fn apply(&self, cx: &mut StepContext<'_>) -> NextAction {
        let body = json!({
            "metadata": {"name": "pod-0", "namespace": "ns1", "resourceVersion": "7"},
            "status": {"phase": "Pending"},
        });
        cx.invoke(
            ApiCall::replace(ObjectKind::Pod, "ns1", "pod-0", body),
            StoreResponse::new(POD),
        )
    }
}

struct Mark(&'static str);

impl Step for Mark {
    fn name(&self) -> &str {
        self.0
    }

    fn apply(&self, cx: &mut StepContext<'_>) -> NextAction {
        cx.packet_mut().insert(BRANCH, self.0);
        cx.do_next()
    }
}

struct Visit;

impl Step for Visit {
    fn name(&self) -> &str {
        "visit"
    }

    fn apply(&self, cx: &mut StepContext<'_>) -> NextAction {
        cx.packet_mut().upsert(VISITS, || 0, |visits| *visits += 1);
        cx.do_next()
    }
}

struct Explode;

impl Step for Explode {
    fn name(&self) -> &str {
        "explode"
    }

    fn apply(&self, _cx: &mut StepContext<'_>) -> NextAction {
        panic!("boom");
    }
}

struct Park {
    resumers: mpsc::UnboundedSender<Resumer>,
}

impl Step for Park {
    fn name(&self) -> &str {
        "park"
    }

    fn apply(&self, _cx: &mut StepContext<'_>) -> NextAction {
        let (pending, resumer) = Pending::channel();
        let _ = self.resumers.send(resumer);
        NextAction::Suspend(pending)
    }
}

/// Answers every call with 503 and records when it was asked.
#[derive(Default)]
struct Unavailable {
    seen: Mutex<Vec<Instant>>,
}

impl Unavailable {
    fn answer(&self) -> Result<Value, ApiError> {
        self.seen.lock().unwrap().push(Instant::now());
        Err(ApiError::status(503, "ServiceUnavailable", "try again later"))
    }
}

#[async_trait]
impl ApiClient for Unavailable {
    async fn get_object(&self, _: ObjectKind, _: &str, _: &str) -> Result<Value, ApiError> {
        self.answer()
    }

    async fn create_object(&self, _: ObjectKind, _: &str, _: Value) -> Result<Value, ApiError> {
        self.answer()
    }

    async fn replace_object(
        &self,
        _: ObjectKind,
        _: &str,
        _: &str,
        _: Value,
    ) -> Result<Value, ApiError> {
        self.answer()
    }
}

fn single(step: impl Step) -> Plan {
    let mut builder = PlanBuilder::new();
    let entry = builder.add(step, None);
    builder.finish(entry)
}

fn api_with_pod() -> Arc<InMemoryApi> {
    let api = InMemoryApi::shared();
    api.insert_object(
        ObjectKind::Pod,
        "ns1",
        json!({"metadata": {"name": "pod-0", "namespace": "ns1"}, "status": {"phase": "Running"}}),
    )
    .unwrap();
    api
}

fn config(max_retries: u32, backoff: Backoff) -> EngineConfig {
    EngineConfig::default().with_retry(RetryPolicy::new(max_retries, backoff))
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_exhaust_the_budget() {
    let api = Arc::new(Unavailable::default());
    let backoff = Backoff::Exponential {
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
        multiplier: 2.0,
    };
    let engine = EngineBuilder::new(api.clone()).with_config(config(4, backoff)).build();

    let outcome = engine.run(&single(FetchPod), Packet::new()).await;

    let error = match outcome {
        FiberOutcome::Failed(error) => error,
        other => panic!("expected failure, got {other:?}"),
    };
    assert!(matches!(error, FiberError::RetriesExhausted { attempts: 5, .. }), "{error}");
    assert_eq!(error.class(), ErrorClass::PermanentlyRejected);

    let seen = api.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 5);
    let gaps: Vec<Duration> = seen.windows(2).map(|pair| pair[1] - pair[0]).collect();
    assert!(gaps[0] >= Duration::from_millis(100), "{gaps:?}");
    assert!(gaps.windows(2).all(|pair| pair[0] <= pair[1]), "{gaps:?}");
}

#[tokio::test(start_paused = true)]
async fn test_rejected_call_is_not_retried() {
    let api = api_with_pod();
    api.fail_always(ApiVerb::Get, ApiError::status(403, "Forbidden", "no access"));
    let engine = EngineBuilder::new(api.clone()).build();

    let outcome = engine.run(&single(FetchPod), Packet::new()).await;

    assert!(matches!(outcome.error(), Some(FiberError::Rejected { .. })), "{outcome:?}");
    assert_eq!(api.call_count(ApiVerb::Get), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_then_success_completes() {
    let api = api_with_pod();
    api.fail_times(ApiVerb::Get, 2, ApiError::server_error("etcd leader change"));
    let engine = EngineBuilder::new(api.clone()).build();

    let outcome = engine.run(&single(FetchPod), Packet::new()).await;

    let packet = outcome.packet().expect("completed");
    assert_eq!(packet.get(POD).unwrap()["status"]["phase"], "Running");
    assert_eq!(api.call_count(ApiVerb::Get), 3);
}

#[tokio::test(start_paused = true)]
async fn test_replace_of_missing_object_creates_it() {
    let api = InMemoryApi::shared();
    let engine = EngineBuilder::new(api.clone()).build();

    let outcome = engine.run(&single(ReplacePod), Packet::new()).await;

    let packet = outcome.packet().expect("completed");
    assert_eq!(packet.get(POD).unwrap()["status"]["phase"], "Pending");
    assert_eq!(api.call_count(ApiVerb::Replace), 1);
    assert_eq!(api.call_count(ApiVerb::Create), 1);
    let created = api.calls_of(ApiVerb::Create).remove(0);
    assert!(created.body.unwrap()["metadata"].get("resourceVersion").is_none());
    assert!(api.object(ObjectKind::Pod, "ns1", "pod-0").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_call_timeout_is_transient() {
    let api = api_with_pod();
    api.set_latency(Duration::from_secs(30));
    let backoff = Backoff::Fixed {
        delay: Duration::from_secs(1),
    };
    let engine = EngineBuilder::new(api.clone())
        .with_config(config(0, backoff).with_call_timeout(Duration::from_secs(1)))
        .build();

    let outcome = engine.run(&single(FetchPod), Packet::new()).await;

    match outcome.error() {
        Some(FiberError::RetriesExhausted { attempts, last, .. }) => {
            assert_eq!(*attempts, 1);
            assert_eq!(*last, ApiError::Timeout(Duration::from_secs(1)));
        }
        other => panic!("expected exhausted retries, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_retry_sleep() {
    let api = api_with_pod();
    api.fail_always(ApiVerb::Get, ApiError::server_error("unavailable"));
    let engine = EngineBuilder::new(api.clone())
        .with_config(config(5, Backoff::Fixed { delay: Duration::from_secs(10) }))
        .build();

    let handle = engine.start(&single(FetchPod), Packet::new());
    tokio::time::sleep(Duration::from_secs(1)).await;
    handle.cancel();

    assert!(handle.outcome().await.is_cancelled());
    assert_eq!(api.call_count(ApiVerb::Get), 1);
}

#[tokio::test(start_paused = true)]
async fn test_newer_trigger_supersedes_running_fiber() {
    let api = api_with_pod();
    api.set_latency(Duration::from_secs(5));
    let plan = single(FetchPod);
    let engine = EngineBuilder::new(api.clone())
        .with_planner(move |_| Some(plan.clone()))
        .build();
    let domain = DomainResource::new("ns1", "sample", "uid-1");

    let first = engine.trigger(Trigger::added(domain.clone())).unwrap();
    let second = engine.trigger(Trigger::modified(domain.with_generation(2))).unwrap();
    assert_ne!(first.id(), second.id());

    assert!(first.outcome().await.is_cancelled());
    assert!(second.outcome().await.is_completed());
    assert_eq!(engine.inflight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_engine_cancel_by_resource() {
    let api = api_with_pod();
    api.set_latency(Duration::from_secs(5));
    let plan = single(FetchPod);
    let engine = EngineBuilder::new(api.clone())
        .with_planner(move |_| Some(plan.clone()))
        .build();
    let domain = DomainResource::new("ns1", "sample", "uid-1");

    let handle = engine.trigger(Trigger::added(domain.clone())).unwrap();
    assert!(engine.cancel(&domain.key()));
    assert!(!engine.cancel(&domain.key()));
    assert!(handle.outcome().await.is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn test_step_panic_fails_fiber_with_logic_error() {
    let engine = EngineBuilder::new(InMemoryApi::shared()).build();

    let outcome = engine.run(&single(Explode), Packet::new()).await;

    let error = outcome.error().expect("failed");
    assert_eq!(error.class(), ErrorClass::Logic);
    assert!(error.to_string().contains("boom"), "{error}");
}

#[tokio::test(start_paused = true)]
async fn test_client_panic_is_a_transient_failure() {
    let api = api_with_pod();
    api.panic_next(ApiVerb::Get);
    let engine = EngineBuilder::new(api.clone()).build();

    let outcome = engine.run(&single(FetchPod), Packet::new()).await;

    assert!(outcome.is_completed(), "{outcome:?}");
    assert_eq!(api.call_count(ApiVerb::Get), 2);
}

#[tokio::test(start_paused = true)]
async fn test_suspended_fiber_resumes_with_delivered_action() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut builder = PlanBuilder::new();
    let after = builder.add(Mark("after-park"), None);
    let entry = builder.add(Park { resumers: tx }, Some(after));
    let plan = builder.finish(entry);
    let engine = EngineBuilder::new(InMemoryApi::shared()).build();

    let handle = engine.start(&plan, Packet::new());
    let resumer = rx.recv().await.unwrap();
    assert!(!handle.is_finished());
    assert!(resumer.resume(NextAction::Continue(after)));

    let outcome = handle.outcome().await;
    assert_eq!(outcome.packet().and_then(|p| p.get(BRANCH)).copied(), Some("after-park"));
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_suspension_is_a_logic_error() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let engine = EngineBuilder::new(InMemoryApi::shared()).build();

    let handle = engine.start(&single(Park { resumers: tx }), Packet::new());
    drop(rx.recv().await.unwrap());

    let outcome = handle.outcome().await;
    assert_eq!(outcome.error().map(FiberError::class), Some(ErrorClass::Logic));
}

#[tokio::test(start_paused = true)]
async fn test_branch_follows_packet_predicate() {
    let mut builder = PlanBuilder::new();
    let scale_up = builder.add(Mark("scale-up"), None);
    let idle = builder.add(Mark("idle"), None);
    let entry = builder.branch(
        "needs-replicas",
        |packet| packet.get(REPLICAS).is_some_and(|replicas| *replicas > 0),
        scale_up,
        Some(idle),
    );
    let plan = builder.finish(entry);
    let engine = EngineBuilder::new(InMemoryApi::shared()).build();

    let up = engine.run(&plan, Packet::new().with(REPLICAS, 3)).await;
    let none = engine.run(&plan, Packet::new()).await;

    assert_eq!(up.packet().and_then(|p| p.get(BRANCH)).copied(), Some("scale-up"));
    assert_eq!(none.packet().and_then(|p| p.get(BRANCH)).copied(), Some("idle"));
}

#[tokio::test(start_paused = true)]
async fn test_long_continue_chain_runs_iteratively() {
    const LENGTH: usize = 50_000;

    let mut builder = PlanBuilder::new();
    let visit: Arc<dyn Step> = Arc::new(Visit);
    let head = builder
        .chain(std::iter::repeat(visit).take(LENGTH).collect::<Vec<_>>(), None)
        .unwrap();
    let plan = builder.finish(head);
    let engine = EngineBuilder::new(InMemoryApi::shared()).build();

    let outcome = engine.run(&plan, Packet::new()).await;

    assert_eq!(
        outcome.packet().and_then(|p| p.get(VISITS)).copied(),
        Some(u32::try_from(LENGTH).unwrap())
    );
}
