//! Fibers: one logical reconciliation run over a plan.
//!
//! ```text
//!        ┌──────────── Continue ────────────┐
//!        ▼                                  │
//!   step.apply(cx) ──► NextAction ──────────┤
//!                          │                │
//!          Invoke ─────────┤                │
//!            │             │ Retry ── sleep ┤
//!            ▼             │ Suspend ─ wait ┤
//!     spawn(call) ──► Completion ──► response.on_success / on_failure
//!                          │
//!                 Done / Fail ──► FiberOutcome
//! ```
//!
//! `Continue` chains run in a loop, never recursively. A fiber parks only at
//! `Invoke`, `Retry` and `Suspend`; each of those boundaries checks the
//! cancellation flag. An API call runs on its own task and reports back with
//! a [`Completion`] message, so the fiber resumes on whatever worker thread
//! polls it next.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::action::{Invocation, NextAction};
use crate::api::{self, ApiCall};
use crate::context::StepContext;
use crate::engine::Services;
use crate::error::{ApiError, FiberError};
use crate::packet::Packet;
use crate::response::{CallFailure, ResponseStep};
use crate::step::{StepGraph, StepId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(Uuid);

impl FiberId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FiberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let simple = self.0.simple().to_string();
        f.write_str(simple.get(..8).unwrap_or(&simple))
    }
}

/// Cooperative cancellation flag shared between a fiber and its owner.
#[derive(Debug, Clone)]
pub struct CancelFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the flag is raised.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives in `self`, so the channel cannot close here
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// How a fiber ended.
#[derive(Debug)]
pub enum FiberOutcome {
    /// Reached `Done`; carries the terminal packet.
    Completed(Packet),
    /// Stopped at a suspension boundary because its flag was raised.
    Cancelled,
    Failed(FiberError),
}

impl FiberOutcome {
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    #[must_use]
    pub const fn packet(&self) -> Option<&Packet> {
        match self {
            Self::Completed(packet) => Some(packet),
            Self::Cancelled | Self::Failed(_) => None,
        }
    }

    #[must_use]
    pub const fn error(&self) -> Option<&FiberError> {
        match self {
            Self::Failed(error) => Some(error),
            Self::Completed(_) | Self::Cancelled => None,
        }
    }

    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Completed(_) => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed(_) => "failed",
        }
    }
}

/// Message sent from a call task back to its fiber.
struct Completion {
    call: ApiCall,
    response: Box<dyn ResponseStep>,
    result: Result<Value, ApiError>,
}

pub(crate) struct Fiber {
    id: FiberId,
    graph: Arc<StepGraph>,
    services: Arc<Services>,
    cancel: CancelFlag,
    packet: Packet,
}

impl Fiber {
    pub(crate) fn new(
        id: FiberId,
        graph: Arc<StepGraph>,
        services: Arc<Services>,
        cancel: CancelFlag,
        packet: Packet,
    ) -> Self {
        Self {
            id,
            graph,
            services,
            cancel,
            packet,
        }
    }

    pub(crate) async fn run(mut self, entry: StepId) -> FiberOutcome {
        let mut current = entry;
        let mut action = NextAction::Continue(entry);
        loop {
            action = match action {
                NextAction::Continue(step) => {
                    current = step;
                    self.apply(step)
                }
                NextAction::Done => return FiberOutcome::Completed(self.packet),
                NextAction::Fail(error) => return FiberOutcome::Failed(error),
                NextAction::Retry { delay, resume } => {
                    if self.cancel.is_cancelled() {
                        return FiberOutcome::Cancelled;
                    }
                    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                    debug!(fiber = %self.id, resume = %resume, delay_ms, "retry scheduled");
                    tokio::select! {
                        () = tokio::time::sleep(delay) => NextAction::Continue(resume),
                        () = self.cancel.cancelled() => return FiberOutcome::Cancelled,
                    }
                }
                NextAction::Suspend(pending) => {
                    if self.cancel.is_cancelled() {
                        return FiberOutcome::Cancelled;
                    }
                    trace!(fiber = %self.id, step = %current, "suspended");
                    tokio::select! {
                        resumed = pending.wait() => resumed,
                        () = self.cancel.cancelled() => return FiberOutcome::Cancelled,
                    }
                }
                NextAction::Invoke(invocation) => {
                    if self.cancel.is_cancelled() {
                        return FiberOutcome::Cancelled;
                    }
                    match self.invoke(current, invocation).await {
                        Some(next) => next,
                        None => return FiberOutcome::Cancelled,
                    }
                }
            };
        }
    }

    fn apply(&mut self, id: StepId) -> NextAction {
        let Some((step, next)) = self.graph.step(id) else {
            return NextAction::Fail(FiberError::logic(format!("{id} is not part of this plan")));
        };
        trace!(fiber = %self.id, step = %id, name = step.name(), "applying step");
        let mut cx = StepContext::new(&mut self.packet, &self.services, self.id, id, next);
        std::panic::catch_unwind(AssertUnwindSafe(|| step.apply(&mut cx)))
            .unwrap_or_else(|panic| panicked(step.name(), &*panic))
    }

    /// Issues the call on its own task and parks until the completion
    /// message arrives. `None` means the fiber was cancelled meanwhile.
    async fn invoke(&mut self, issuer: StepId, invocation: Invocation) -> Option<NextAction> {
        let Invocation { call, response } = invocation;
        let (tx, rx) = oneshot::channel::<Completion>();
        let client = Arc::clone(&self.services.api);
        let timeout = self.services.config.call_timeout;

        debug!(fiber = %self.id, step = %issuer, call = %call, "dispatching call");
        let task = tokio::spawn(async move {
            let dispatched = tokio::time::timeout(timeout, api::dispatch(client.as_ref(), &call));
            let outcome = AssertUnwindSafe(dispatched).catch_unwind().await;
            let result = match outcome {
                Ok(Ok(result)) => result,
                Ok(Err(_elapsed)) => Err(ApiError::Timeout(timeout)),
                Err(panic) => Err(ApiError::Transport(format!(
                    "api client panicked: {}",
                    panic_message(&*panic)
                ))),
            };
            let _ = tx.send(Completion { call, response, result });
        });

        let received = tokio::select! {
            received = rx => received,
            () = self.cancel.cancelled() => {
                task.abort();
                return None;
            }
        };
        if self.cancel.is_cancelled() {
            return None;
        }
        Some(match received {
            Ok(completion) => self.resume(issuer, completion),
            Err(_) => NextAction::Fail(FiberError::logic("call task ended without reporting")),
        })
    }

    fn resume(&mut self, issuer: StepId, completion: Completion) -> NextAction {
        let Completion { call, response, result } = completion;
        let name = response.name().to_string();
        let next = self.graph.next_of(issuer);
        let mut cx = StepContext::new(&mut self.packet, &self.services, self.id, issuer, next);
        match result {
            Ok(value) => {
                trace!(fiber = %self.id, call = %call, "call succeeded");
                let handled = AssertUnwindSafe(|| response.on_success(&mut cx, value));
                let action = std::panic::catch_unwind(handled)
                    .unwrap_or_else(|panic| panicked(&name, &*panic));
                if !matches!(action, NextAction::Invoke(_)) {
                    cx.clear_retries();
                }
                action
            }
            Err(error) => {
                debug!(fiber = %self.id, call = %call, error = %error, "call failed");
                let failure = CallFailure::new(call, error);
                if response.recreates_missing() {
                    if let Some(create) = failure.create_fallback() {
                        warn!(
                            fiber = %self.id,
                            call = %failure.call(),
                            "replace target missing, creating it"
                        );
                        return NextAction::Invoke(Invocation {
                            call: create,
                            response,
                        });
                    }
                }
                std::panic::catch_unwind(AssertUnwindSafe(|| response.on_failure(&mut cx, failure)))
                    .unwrap_or_else(|panic| panicked(&name, &*panic))
            }
        }
    }
}

fn panicked(step: &str, payload: &(dyn Any + Send)) -> NextAction {
    NextAction::Fail(FiberError::logic(format!(
        "{step} panicked: {}",
        panic_message(payload)
    )))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
