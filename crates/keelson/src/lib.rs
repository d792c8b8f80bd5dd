//! # Keelson
//!
//! A reconciliation engine that drives multi-step workflows against an
//! asynchronous, fallible platform API, and the deduplicated status events
//! built on top of it.
//!
//! ## Core Concepts
//!
//! - [`Step`] = one unit of work. Steps live in a shared [`StepGraph`] and
//!   hold no per-run state.
//! - [`Packet`] = the typed scratch space of one run.
//! - [`NextAction`] = what a step asks for next: continue, suspend, retry,
//!   invoke an API call, finish or fail.
//! - [`ResponseStep`] = the continuation bound to one API call.
//! - Fiber = one run of a plan, parked at every call and resumed by a
//!   completion message on whichever worker delivers it.
//!
//! ## Architecture
//!
//! ```text
//! Watch / timer
//!     │
//!     ▼ trigger()
//! Engine ──► PresenceCache.observe / remove
//!     │
//!     ├─► cancel superseded fiber
//!     │
//!     ▼ spawn
//! Fiber.run() loop
//!     │
//!     ├─► Step.apply() ─► Continue ─────────┐ (same task, no recursion)
//!     │                                     │
//!     ├─► Invoke(call, response) ─► ApiClient on its own task
//!     │                                     │
//!     │            Completion message ◄─────┘
//!     │                 │
//!     │                 ├─► on_success ─► next action
//!     │                 └─► on_failure ─► RetryPolicy ─► Retry / Fail
//!     │
//!     └─► Done / Fail / Cancelled ─► FiberOutcome
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Steps never block** - waiting is expressed as a [`NextAction`]
//! 2. **Continue is iterative** - long chains use no stack
//! 3. **Failures are classified** - transient ones retry within a budget,
//!    everything else ends the fiber with a [`FiberError`]
//! 4. **Retries re-read** - a retried write re-runs its issuing step, which
//!    reads current state before writing again
//! 5. **One record per event identity** - concurrent emitters serialize on
//!    the [`EventLedger`] and fold repeats into the occurrence count
//! 6. **Cancellation is cooperative** - checked at every suspension boundary
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use keelson::{CreateEventStep, EngineBuilder, EventItem, PlanBuilder, Trigger};
//!
//! let mut plan = PlanBuilder::new();
//! let done = plan.add(CreateEventStep::new(EventItem::DomainProcessingCompleted), None);
//! let starting = plan.add(CreateEventStep::new(EventItem::DomainProcessingStarting), Some(done));
//! let plan = plan.finish(starting);
//!
//! let engine = EngineBuilder::new(Arc::new(my_client))
//!     .with_planner(move |_| Some(plan.clone()))
//!     .build();
//!
//! let handle = engine.trigger(Trigger::added(domain)).expect("plan");
//! let outcome = handle.outcome().await;
//! ```

// Core modules
mod action;
mod api;
mod config;
mod context;
mod engine;
mod error;
mod fiber;
mod key_macro;
mod packet;
mod presence;
mod response;
mod retry;
mod step;
mod trigger;

// Event catalog, ledger and coordinator
pub mod events;

// Re-export execution model
pub use action::{Invocation, NextAction, Pending, Resumer};
pub use context::StepContext;
pub use fiber::{CancelFlag, FiberId, FiberOutcome};
pub use packet::{keys, Key, Packet};
pub use response::{CallFailure, ResponseStep, StoreResponse};
pub use step::{Plan, PlanBuilder, Step, StepGraph, StepId, Switch};

// Re-export API collaborator types
pub use api::{ApiCall, ApiClient, ApiVerb, ObjectKind};

// Re-export error types
pub use error::{ApiError, ConfigError, ErrorClass, FailureClass, FiberError, PresenceError};

// Re-export retry and configuration
pub use config::{EngineConfig, DEFAULT_REPORTING_COMPONENT, POD_NAME_ENV};
pub use retry::{Backoff, RetryDecision, RetryPolicy};

// Re-export engine types (primary entry point)
pub use engine::{Engine, EngineBuilder, FiberHandle, Planner};
pub use presence::{DomainResource, PresenceCache, PresenceEntry, PresenceSnapshot, ResourceKey};
pub use trigger::{Trigger, TriggerKind, TriggerReason};

// Re-export commonly used event types
pub use events::{CreateEventStep, EventData, EventItem, EventLedger, EventRecord, Severity};

// Re-export commonly used external types
pub use async_trait::async_trait;
