//! The view a step gets of its fiber.

use std::time::Duration;

use tracing::{error, warn};

use crate::action::NextAction;
use crate::api::ApiCall;
use crate::config::EngineConfig;
use crate::engine::Services;
use crate::error::{FailureClass, FiberError};
use crate::events::EventLedger;
use crate::fiber::FiberId;
use crate::packet::{keys, Packet};
use crate::presence::PresenceCache;
use crate::response::{CallFailure, ResponseStep};
use crate::retry::{RetryDecision, RetryLedger};
use crate::step::StepId;

/// Packet access plus the engine services a step may consult.
///
/// Inside a response step, [`current`](Self::current) is the step that
/// issued the call and [`next`](Self::next) is that step's successor.
pub struct StepContext<'a> {
    packet: &'a mut Packet,
    services: &'a Services,
    fiber: FiberId,
    current: StepId,
    next: Option<StepId>,
}

impl<'a> StepContext<'a> {
    pub(crate) fn new(
        packet: &'a mut Packet,
        services: &'a Services,
        fiber: FiberId,
        current: StepId,
        next: Option<StepId>,
    ) -> Self {
        Self {
            packet,
            services,
            fiber,
            current,
            next,
        }
    }

    #[must_use]
    pub fn packet(&self) -> &Packet {
        &*self.packet
    }

    pub fn packet_mut(&mut self) -> &mut Packet {
        &mut *self.packet
    }

    #[must_use]
    pub fn presence(&self) -> &PresenceCache {
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

    #[must_use]
    pub const fn fiber_id(&self) -> FiberId {
        self.fiber
    }

    #[must_use]
    pub const fn current(&self) -> StepId {
        self.current
    }

    #[must_use]
    pub const fn next(&self) -> Option<StepId> {
        self.next
    }

    /// Continue to the successor, or finish when there is none.
    #[must_use]
    pub fn do_next(&self) -> NextAction {
        self.next.map_or(NextAction::Done, NextAction::Continue)
    }

    pub fn invoke(&self, call: ApiCall, response: impl ResponseStep) -> NextAction {
        NextAction::invoke(call, response)
    }

    /// Run the current step again after `delay`.
    #[must_use]
    pub const fn retry_after(&self, delay: Duration) -> NextAction {
        NextAction::Retry {
            delay,
            resume: self.current,
        }
    }

    /// Default handling of a failed call.
    ///
    /// Transient failures re-run the issuing step after the policy's delay,
    /// so the retry re-reads state instead of replaying a stale write. Once
    /// the budget is spent the failure becomes
    /// [`FiberError::RetriesExhausted`]. Not-found and rejected failures end
    /// the fiber immediately.
    pub fn handle_failure(&mut self, failure: &CallFailure) -> NextAction {
        match failure.class() {
            FailureClass::Transient => {
                let issuer = self.current;
                let failures = self.packet.upsert(
                    keys::RETRY_LEDGER,
                    RetryLedger::default,
                    |ledger| ledger.record_failure(issuer),
                );
                match self.services.retry().decide(failures) {
                    RetryDecision::RetryAfter(delay) => {
                        warn!(
                            fiber = %self.fiber,
                            step = %issuer,
                            call = %failure.call(),
                            attempt = failures,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            error = %failure.error(),
                            "transient call failure, retrying"
                        );
                        self.retry_after(delay)
                    }
                    RetryDecision::GiveUp => {
                        error!(
                            fiber = %self.fiber,
                            call = %failure.call(),
                            attempts = failures,
                            error = %failure.error(),
                            "retry budget exhausted"
                        );
                        NextAction::Fail(FiberError::RetriesExhausted {
                            call: failure.call().to_string(),
                            attempts: failures,
                            last: failure.error().clone(),
                        })
                    }
                }
            }
            FailureClass::NotFound | FailureClass::Rejected => {
                error!(
                    fiber = %self.fiber,
                    call = %failure.call(),
                    error = %failure.error(),
                    "call rejected"
                );
                NextAction::Fail(FiberError::Rejected {
                    call: failure.call().to_string(),
                    source: failure.error().clone(),
                })
            }
        }
    }

    pub(crate) fn clear_retries(&mut self) {
        if let Some(ledger) = self.packet.get_mut(keys::RETRY_LEDGER) {
            ledger.clear(self.current);
        }
    }
}
