use crate::presence::PresenceSnapshot;

use super::EventItem;

/// One request to emit an event, built right before emission.
#[derive(Debug, Clone, PartialEq)]
pub struct EventData {
    item: EventItem,
    message: String,
    namespace: Option<String>,
    presence: Option<PresenceSnapshot>,
}

impl EventData {
    #[must_use]
    pub const fn new(item: EventItem) -> Self {
        Self {
            item,
            message: String::new(),
            namespace: None,
            presence: None,
        }
    }

    /// Free-text detail for items whose template has a slot for it.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Namespace used when no presence info is attached.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    #[must_use]
    pub fn with_presence(mut self, presence: PresenceSnapshot) -> Self {
        self.presence = Some(presence);
        self
    }

    #[must_use]
    pub const fn item(&self) -> EventItem {
        self.item
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub const fn presence(&self) -> Option<&PresenceSnapshot> {
        self.presence.as_ref()
    }

    /// Presence info wins over the requested namespace.
    #[must_use]
    pub fn resolved_namespace(&self) -> &str {
        self.presence
            .as_ref()
            .map(PresenceSnapshot::namespace)
            .or(self.namespace.as_deref())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn resource_name(&self) -> String {
        self.item.resource_name(self)
    }

    #[must_use]
    pub fn is_processing_aborted(&self) -> bool {
        self.item == EventItem::DomainProcessingAborted
    }
}
