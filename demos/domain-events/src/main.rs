//! Drives a domain through its lifecycle against the in-memory API and
//! prints the status events the engine recorded.
//!
//! Run with `RUST_LOG=keelson=debug` to watch fibers and calls.

use std::sync::Arc;

use anyhow::Context;
use keelson::{
    CreateEventStep, DomainResource, Engine, EngineBuilder, EngineConfig, EventItem, Packet, Plan,
    PlanBuilder, Step, Trigger, TriggerReason,
};
use keelson_testing::InMemoryApi;
use tracing_subscriber::EnvFilter;

const CONFIG: &str = r#"
reporting_component = "weblogic-operator"
reporting_instance = "demo-operator-0"
call_timeout = "2s"
event_window = "30m"

[retry]
max_retries = 3

[retry.backoff]
type = "exponential"
initial_delay = "50ms"
max_delay = "1s"
"#;

fn events_plan(items: &[EventItem]) -> Option<Plan> {
    let mut builder = PlanBuilder::new();
    let steps: Vec<Arc<dyn Step>> = items
        .iter()
        .map(|item| Arc::new(CreateEventStep::new(*item)) as Arc<dyn Step>)
        .collect();
    let head = builder.chain(steps, None)?;
    Some(builder.finish(head))
}

fn plan_for(trigger: &Trigger) -> Option<Plan> {
    let announce = match &trigger.reason {
        TriggerReason::Added(_) => EventItem::DomainCreated,
        TriggerReason::Modified(_) => EventItem::DomainChanged,
        TriggerReason::Deleted => return events_plan(&[EventItem::DomainDeleted]),
        TriggerReason::Resync => return None,
    };
    events_plan(&[
        announce,
        EventItem::DomainProcessingStarting,
        EventItem::DomainProcessingCompleted,
    ])
}

async fn apply(engine: &Engine, trigger: Trigger) -> anyhow::Result<()> {
    let Some(handle) = engine.trigger(trigger) else {
        return Ok(());
    };
    let outcome = handle.outcome().await;
    if let Some(error) = outcome.error() {
        anyhow::bail!("fiber failed: {error}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = EngineConfig::from_toml_str(CONFIG).context("demo config is invalid")?;
    let api = InMemoryApi::shared();
    let engine = EngineBuilder::new(api.clone())
        .with_config(config)
        .with_planner(plan_for)
        .build();

    let mut builder = PlanBuilder::new();
    let watching = builder.add(
        CreateEventStep::new(EventItem::NamespaceWatchingStarted).with_namespace("sample-ns"),
        None,
    );
    let outcome = engine.run(&builder.finish(watching), Packet::new()).await;
    tracing::info!(outcome = outcome.label(), "namespace watch announced");

    let domain = DomainResource::new("sample-ns", "sample-domain", "7c1e2f")
        .with_spec(serde_json::json!({ "replicas": 2 }));
    apply(&engine, Trigger::added(domain.clone())).await?;
    apply(&engine, Trigger::modified(domain.clone().with_generation(2))).await?;
    apply(&engine, Trigger::modified(domain.clone().with_generation(3))).await?;
    apply(&engine, Trigger::deleted(domain.key())).await?;

    for event in api.events()? {
        println!(
            "{:<10} {:<28} x{:<3} {}",
            event.metadata.namespace, event.reason, event.count, event.message
        );
    }
    Ok(())
}
