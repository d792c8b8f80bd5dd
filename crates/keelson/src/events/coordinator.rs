//! Create-or-replace emission of one status event.
//!
//! ```text
//! apply ─► suppressed? ──yes──► next
//!            │ no
//!            ▼
//!        claim identity ──busy──► suspend, re-apply when released
//!            │ granted
//!            ├─ unsettled write ─► get ─► ours: settle
//!            │                        ├─► theirs: replace(count + 1)
//!            │                        └─► 404: create
//!            ├─ nothing stored ──► create(count = 1)
//!            └─ stored ──────────► replace(count + 1) ──404──► create
//! ```
//!
//! One logical occurrence keeps the same occurrence id across retries and
//! suspensions (it lives in the packet until the write settles), so a read-back
//! after a lost acknowledgement recognises its own write. A read-back that finds
//! another writer's occurrence notes it in the ledger; that writer then
//! settles on its next claim instead of counting itself twice.
//!
//! A stored record last seen longer ago than the configured event window is
//! left alone and a new record is created.

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::action::NextAction;
use crate::api::{ApiCall, ObjectKind};
use crate::context::StepContext;
use crate::error::{FailureClass, FiberError};
use crate::packet::keys;
use crate::response::{CallFailure, ResponseStep};
use crate::step::{Step, StepId};

use super::ledger::{Claim, ClaimToken};
use super::record::{EventRecord, ObjectMeta};
use super::{EventData, EventItem};

/// Emits `item` for the resource in the packet, folding repeats into the
/// stored record's occurrence count.
#[derive(Debug, Clone)]
pub struct CreateEventStep {
    item: EventItem,
    message: String,
    namespace: Option<String>,
}

impl CreateEventStep {
    #[must_use]
    pub const fn new(item: EventItem) -> Self {
        Self {
            item,
            message: String::new(),
            namespace: None,
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Namespace for packets without presence info, e.g. namespace events.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    #[must_use]
    pub const fn item(&self) -> EventItem {
        self.item
    }

    fn suppressed(&self, last: Option<EventItem>) -> bool {
        match self.item {
            EventItem::DomainProcessingCompleted => {
                last != Some(EventItem::DomainProcessingStarting)
            }
            EventItem::DomainProcessingStarting => {
                last == Some(EventItem::DomainProcessingStarting)
            }
            _ => false,
        }
    }

    /// The emission in progress for this step, or a fresh one.
    fn emission(&self, cx: &mut StepContext<'_>) -> PendingEmission {
        let current = cx.current();
        if let Some(pending) = cx
            .packet()
            .get(keys::PENDING_EMISSION)
            .filter(|pending| pending.step == current)
        {
            return pending.clone();
        }
        let (resource, model) = self.model(cx);
        let emission = PendingEmission {
            step: current,
            occurrence: Uuid::new_v4().to_string(),
            resource,
            model,
        };
        cx.packet_mut().insert(keys::PENDING_EMISSION, emission.clone());
        emission
    }

    /// The record a first creation would write, and the resource it names.
    fn model(&self, cx: &StepContext<'_>) -> (String, EventRecord) {
        let mut data = EventData::new(self.item).with_message(self.message.clone());
        if let Some(presence) = cx.packet().get(keys::PRESENCE) {
            data = data.with_presence(presence.clone());
        }
        let namespace = self
            .namespace
            .clone()
            .or_else(|| cx.packet().get(keys::RESOURCE).map(|key| key.namespace.clone()));
        if let Some(namespace) = namespace {
            data = data.with_namespace(namespace);
        }

        let resource = data.resource_name();
        let now = Utc::now();
        let model = EventRecord {
            metadata: ObjectMeta {
                name: String::new(),
                namespace: data.resolved_namespace().to_string(),
                labels: self.item.labels(&resource),
                ..ObjectMeta::default()
            },
            reason: self.item.reason().to_string(),
            message: self.item.message(&resource, data.message()),
            severity: self.item.severity(),
            involved_object: self.item.involved_object(&data, &resource),
            first_timestamp: now,
            last_timestamp: now,
            count: 1,
            reporting_component: cx.config().reporting_component.clone(),
            reporting_instance: cx.config().reporting_instance.clone(),
        };
        (resource, model)
    }
}

impl Step for CreateEventStep {
    fn name(&self) -> &str {
        self.item.reason()
    }

    fn apply(&self, cx: &mut StepContext<'_>) -> NextAction {
        let last = cx.packet().get(keys::EVENT_TYPE).copied();
        if self.suppressed(last) {
            debug!(
                fiber = %cx.fiber_id(),
                reason = self.item.reason(),
                last = ?last,
                "event suppressed"
            );
            return cx.do_next();
        }

        let emission = self.emission(cx);
        let identity = emission.model.identity();
        match cx.ledger().claim(&identity, cx.fiber_id(), cx.current()) {
            Claim::Busy(pending) => {
                debug!(
                    fiber = %cx.fiber_id(),
                    reason = self.item.reason(),
                    "waiting for in-flight event write"
                );
                NextAction::Suspend(pending)
            }
            Claim::Granted(token, known) => {
                let mut emit = Emit {
                    item: self.item,
                    emission,
                    token,
                };
                if emit.token.take_landed(&emit.emission.occurrence) {
                    if let Some(stored) = known.stored {
                        debug!(
                            fiber = %cx.fiber_id(),
                            name = stored.name(),
                            "another writer saw this occurrence land"
                        );
                        return emit.recorded(cx, stored, "confirmed");
                    }
                }
                let window = cx.config().event_window;
                match (known.unsettled, known.stored) {
                    (Some(unsettled), _) => emit.read_back(unsettled),
                    (None, Some(stored)) if !stored.seen_within(Utc::now(), window) => {
                        debug!(
                            fiber = %cx.fiber_id(),
                            name = stored.name(),
                            "stored event is outside the window"
                        );
                        emit.create()
                    }
                    (None, Some(stored)) => emit.replace(&stored),
                    (None, None) => emit.create(),
                }
            }
        }
    }
}

/// An emission carried across retries of its step.
#[derive(Debug, Clone)]
pub(crate) struct PendingEmission {
    step: StepId,
    occurrence: String,
    /// Resource name the event is named after.
    resource: String,
    model: EventRecord,
}

/// A claimed emission on its way to the API.
struct Emit {
    item: EventItem,
    emission: PendingEmission,
    token: ClaimToken,
}

impl Emit {
    fn create(mut self) -> NextAction {
        let now = Utc::now();
        let mut record = self.emission.model.clone();
        record.metadata.name = format!(
            "{}.{}.{}",
            self.emission.resource,
            record.reason,
            now.timestamp_millis()
        );
        record.first_timestamp = now;
        record.last_timestamp = now;
        record.count = 1;
        record.stamp_occurrence(&self.emission.occurrence);
        self.token.attempt(record.name());
        let namespace = record.namespace().to_string();
        self.write(record, WriteMode::Create, |body| {
            ApiCall::create(ObjectKind::Event, namespace, body)
        })
    }

    fn replace(mut self, existing: &EventRecord) -> NextAction {
        let record = existing.bumped(Utc::now(), &self.emission.occurrence);
        self.token.attempt(record.name());
        let namespace = record.namespace().to_string();
        let name = record.name().to_string();
        self.write(record, WriteMode::Replace, |body| {
            ApiCall::replace(ObjectKind::Event, namespace, name, body)
        })
    }

    fn write(
        self,
        record: EventRecord,
        mode: WriteMode,
        call: impl FnOnce(Value) -> ApiCall,
    ) -> NextAction {
        match record.to_value() {
            Ok(body) => NextAction::invoke(call(body), WriteResponse { emit: self, mode }),
            Err(err) => {
                NextAction::Fail(FiberError::logic(format!("event body did not encode: {err}")))
            }
        }
    }

    fn read_back(self, name: String) -> NextAction {
        let namespace = self.emission.model.namespace().to_string();
        NextAction::invoke(
            ApiCall::get(ObjectKind::Event, namespace, name),
            ReadBackResponse { emit: self },
        )
    }

    fn recorded(
        self,
        cx: &mut StepContext<'_>,
        record: EventRecord,
        verb: &'static str,
    ) -> NextAction {
        info!(
            fiber = %cx.fiber_id(),
            reason = %record.reason,
            namespace = record.namespace(),
            name = record.name(),
            count = record.count,
            verb,
            "event recorded"
        );
        let Self { item, token, .. } = self;
        token.settle(record);
        let packet = cx.packet_mut();
        packet.insert(keys::EVENT_TYPE, item);
        packet.remove(keys::PENDING_EMISSION);
        if let Some(resource) = cx.packet().get(keys::RESOURCE).cloned() {
            cx.presence().record_event(&resource, item);
        }
        cx.do_next()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Create,
    Replace,
}

struct WriteResponse {
    emit: Emit,
    mode: WriteMode,
}

impl ResponseStep for WriteResponse {
    fn name(&self) -> &str {
        match self.mode {
            WriteMode::Create => "create-event",
            WriteMode::Replace => "replace-event",
        }
    }

    // a vanished event is recreated under a fresh name with count 1
    fn recreates_missing(&self) -> bool {
        false
    }

    fn on_success(self: Box<Self>, cx: &mut StepContext<'_>, response: Value) -> NextAction {
        let verb = match self.mode {
            WriteMode::Create => "created",
            WriteMode::Replace => "replaced",
        };
        match EventRecord::from_value(response) {
            Ok(record) => self.emit.recorded(cx, record, verb),
            Err(err) => {
                NextAction::Fail(FiberError::logic(format!("stored event did not decode: {err}")))
            }
        }
    }

    fn on_failure(self: Box<Self>, cx: &mut StepContext<'_>, failure: CallFailure) -> NextAction {
        let Self { mut emit, mode } = *self;
        if mode == WriteMode::Replace && failure.is_not_found_on_write() {
            warn!(
                fiber = %cx.fiber_id(),
                reason = emit.item.reason(),
                call = %failure.call(),
                "event vanished before replace, creating it"
            );
            emit.token.vanished();
            return emit.create();
        }
        // release the claim before a retry sleeps
        drop(emit);
        cx.handle_failure(&failure)
    }
}

/// Reads back the target of a write whose outcome was never confirmed.
struct ReadBackResponse {
    emit: Emit,
}

impl ResponseStep for ReadBackResponse {
    fn name(&self) -> &str {
        "read-back-event"
    }

    fn on_success(self: Box<Self>, cx: &mut StepContext<'_>, response: Value) -> NextAction {
        let record = match EventRecord::from_value(response) {
            Ok(record) => record,
            Err(err) => {
                let message = format!("event read back did not decode: {err}");
                return NextAction::Fail(FiberError::logic(message));
            }
        };
        let emit = self.emit;
        match record.occurrence() {
            Some(occurrence) if occurrence == emit.emission.occurrence => {
                debug!(fiber = %cx.fiber_id(), name = record.name(), "earlier write had landed");
                emit.recorded(cx, record, "confirmed")
            }
            Some(occurrence) => {
                emit.token.note_landed(occurrence);
                emit.replace(&record)
            }
            None => emit.replace(&record),
        }
    }

    fn on_failure(self: Box<Self>, cx: &mut StepContext<'_>, failure: CallFailure) -> NextAction {
        let mut emit = self.emit;
        if failure.class() == FailureClass::NotFound {
            debug!(
                fiber = %cx.fiber_id(),
                call = %failure.call(),
                "unsettled event absent, creating it"
            );
            emit.token.vanished();
            return emit.create();
        }
        drop(emit);
        cx.handle_failure(&failure)
    }
}
