//! Status events: the catalog, the stored record shape, the dedup ledger,
//! and the step that emits them.
//!
//! Every [`EventItem`] variant maps to one entry of a static dispatch table
//! fixing its reason, severity, message template and target rule. Rules are
//! plain functions, so adding a variant without a table entry fails to
//! compile.

mod coordinator;
mod data;
mod ledger;
mod record;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use coordinator::CreateEventStep;
pub(crate) use coordinator::PendingEmission;
pub use data::EventData;
pub use ledger::{Claim, ClaimToken, EventLedger, Known};
pub use record::{EventIdentity, EventRecord, ObjectMeta, ObjectReference, OCCURRENCE_ANNOTATION};

pub const DOMAIN_UID_LABEL: &str = "weblogic.domainUID";
pub const CREATED_BY_OPERATOR_LABEL: &str = "weblogic.createdByOperator";
pub const DOMAIN_KIND: &str = "Domain";
pub const DOMAIN_API_VERSION: &str = "weblogic.oracle/v8";
pub const NAMESPACE_KIND: &str = "Namespace";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    Normal,
    Warning,
}

impl Severity {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Warning => "Warning",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed catalog of status transitions the engine reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventItem {
    DomainCreated,
    DomainChanged,
    DomainDeleted,
    DomainProcessingStarting,
    DomainProcessingCompleted,
    DomainProcessingFailed,
    DomainProcessingRetrying,
    DomainProcessingAborted,
    DomainValidationError,
    NamespaceWatchingStarted,
    NamespaceWatchingStopped,
}

/// How an item resolves the object it is attributed to.
struct TargetRule {
    resource_name: fn(&EventData) -> String,
    involved: fn(&EventData, &str, &str) -> ObjectReference,
    labels: fn(&str) -> BTreeMap<String, String>,
}

struct EventSpec {
    reason: &'static str,
    severity: Severity,
    target: &'static TargetRule,
    render: fn(&str, &str) -> String,
}

static DOMAIN_TARGET: TargetRule = TargetRule {
    resource_name: |data| {
        let domain_uid = data.presence().and_then(|p| p.domain_uid());
        domain_uid.unwrap_or_default().to_string()
    },
    involved: |data, name, namespace| ObjectReference {
        name: name.to_string(),
        namespace: namespace.to_string(),
        kind: DOMAIN_KIND.to_string(),
        api_version: Some(DOMAIN_API_VERSION.to_string()),
        uid: data.presence().and_then(|p| p.uid()).map(str::to_string),
    },
    labels: |resource| {
        BTreeMap::from([
            (DOMAIN_UID_LABEL.to_string(), resource.to_string()),
            (CREATED_BY_OPERATOR_LABEL.to_string(), "true".to_string()),
        ])
    },
};

static NAMESPACE_TARGET: TargetRule = TargetRule {
    resource_name: |data| data.resolved_namespace().to_string(),
    involved: |_, name, namespace| ObjectReference {
        name: name.to_string(),
        namespace: namespace.to_string(),
        kind: NAMESPACE_KIND.to_string(),
        api_version: None,
        uid: None,
    },
    labels: |_| BTreeMap::from([(CREATED_BY_OPERATOR_LABEL.to_string(), "true".to_string())]),
};

static DOMAIN_CREATED: EventSpec = EventSpec {
    reason: "DomainCreated",
    severity: Severity::Normal,
    target: &DOMAIN_TARGET,
    render: |r, _| format!("Domain resource {r} was created"),
};

static DOMAIN_CHANGED: EventSpec = EventSpec {
    reason: "DomainChanged",
    severity: Severity::Normal,
    target: &DOMAIN_TARGET,
    render: |r, _| format!("Domain resource {r} was changed"),
};

static DOMAIN_DELETED: EventSpec = EventSpec {
    reason: "DomainDeleted",
    severity: Severity::Normal,
    target: &DOMAIN_TARGET,
    render: |r, _| format!("Domain resource {r} was deleted"),
};

static DOMAIN_PROCESSING_STARTING: EventSpec = EventSpec {
    reason: "DomainProcessingStarting",
    severity: Severity::Normal,
    target: &DOMAIN_TARGET,
    render: |r, _| {
        format!("Creating or updating Kubernetes presence for WebLogic Domain with UID {r}")
    },
};

static DOMAIN_PROCESSING_COMPLETED: EventSpec = EventSpec {
    reason: "DomainProcessingCompleted",
    severity: Severity::Normal,
    target: &DOMAIN_TARGET,
    render: |r, _| format!("Successfully completed processing domain resource {r}"),
};

static DOMAIN_PROCESSING_FAILED: EventSpec = EventSpec {
    reason: "DomainProcessingFailed",
    severity: Severity::Warning,
    target: &DOMAIN_TARGET,
    render: |r, detail| {
        format!(
            "Failed to complete processing domain resource {r} due to: {detail}, \
             the processing will be retried if needed"
        )
    },
};

static DOMAIN_PROCESSING_RETRYING: EventSpec = EventSpec {
    reason: "DomainProcessingRetrying",
    severity: Severity::Normal,
    target: &DOMAIN_TARGET,
    render: |r, _| {
        format!("Retrying the processing of domain resource {r} after one or more failed attempts")
    },
};

static DOMAIN_PROCESSING_ABORTED: EventSpec = EventSpec {
    reason: "DomainProcessingAborted",
    severity: Severity::Warning,
    target: &DOMAIN_TARGET,
    render: |r, detail| {
        format!("Aborting the processing of domain resource {r} permanently due to: {detail}")
    },
};

static DOMAIN_VALIDATION_ERROR: EventSpec = EventSpec {
    reason: "DomainValidationError",
    severity: Severity::Warning,
    target: &DOMAIN_TARGET,
    render: |r, detail| format!("Validation error in domain resource {r}: {detail}"),
};

static NAMESPACE_WATCHING_STARTED: EventSpec = EventSpec {
    reason: "NamespaceWatchingStarted",
    severity: Severity::Normal,
    target: &NAMESPACE_TARGET,
    render: |r, _| format!("Started watching namespace {r}"),
};

static NAMESPACE_WATCHING_STOPPED: EventSpec = EventSpec {
    reason: "NamespaceWatchingStopped",
    severity: Severity::Normal,
    target: &NAMESPACE_TARGET,
    render: |r, _| format!("Stopped watching namespace {r}"),
};

impl EventItem {
    pub const ALL: [Self; 11] = [
        Self::DomainCreated,
        Self::DomainChanged,
        Self::DomainDeleted,
        Self::DomainProcessingStarting,
        Self::DomainProcessingCompleted,
        Self::DomainProcessingFailed,
        Self::DomainProcessingRetrying,
        Self::DomainProcessingAborted,
        Self::DomainValidationError,
        Self::NamespaceWatchingStarted,
        Self::NamespaceWatchingStopped,
    ];

    fn spec(self) -> &'static EventSpec {
        match self {
            Self::DomainCreated => &DOMAIN_CREATED,
            Self::DomainChanged => &DOMAIN_CHANGED,
            Self::DomainDeleted => &DOMAIN_DELETED,
            Self::DomainProcessingStarting => &DOMAIN_PROCESSING_STARTING,
            Self::DomainProcessingCompleted => &DOMAIN_PROCESSING_COMPLETED,
            Self::DomainProcessingFailed => &DOMAIN_PROCESSING_FAILED,
            Self::DomainProcessingRetrying => &DOMAIN_PROCESSING_RETRYING,
            Self::DomainProcessingAborted => &DOMAIN_PROCESSING_ABORTED,
            Self::DomainValidationError => &DOMAIN_VALIDATION_ERROR,
            Self::NamespaceWatchingStarted => &NAMESPACE_WATCHING_STARTED,
            Self::NamespaceWatchingStopped => &NAMESPACE_WATCHING_STOPPED,
        }
    }

    #[must_use]
    pub fn reason(self) -> &'static str {
        self.spec().reason
    }

    #[must_use]
    pub fn severity(self) -> Severity {
        self.spec().severity
    }

    /// True for items attributed to a namespace rather than a domain.
    #[must_use]
    pub const fn is_namespace_scoped(self) -> bool {
        matches!(self, Self::NamespaceWatchingStarted | Self::NamespaceWatchingStopped)
    }

    /// Renders the message for `resource`; `detail` fills the free-text slot
    /// of items that have one and is ignored by the rest.
    #[must_use]
    pub fn message(self, resource: &str, detail: &str) -> String {
        (self.spec().render)(resource, detail)
    }

    #[must_use]
    pub fn resource_name(self, data: &EventData) -> String {
        (self.spec().target.resource_name)(data)
    }

    #[must_use]
    pub fn involved_object(self, data: &EventData, resource: &str) -> ObjectReference {
        (self.spec().target.involved)(data, resource, data.resolved_namespace())
    }

    #[must_use]
    pub fn labels(self, resource: &str) -> BTreeMap<String, String> {
        (self.spec().target.labels)(resource)
    }
}

impl fmt::Display for EventItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}
