//! What starts a fiber: a watch notification or a timer.

use std::fmt;

use crate::presence::{DomainResource, ResourceKey};

#[derive(Debug, Clone, PartialEq)]
pub enum TriggerReason {
    Added(DomainResource),
    Modified(DomainResource),
    Deleted,
    /// Periodic re-check with no new object.
    Resync,
}

/// The reason without its payload; stored in the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerKind {
    Added,
    Modified,
    Deleted,
    Resync,
}

impl TriggerKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
            Self::Resync => "resync",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub resource: ResourceKey,
    pub reason: TriggerReason,
}

impl Trigger {
    #[must_use]
    pub fn added(domain: DomainResource) -> Self {
        Self {
            resource: domain.key(),
            reason: TriggerReason::Added(domain),
        }
    }

    #[must_use]
    pub fn modified(domain: DomainResource) -> Self {
        Self {
            resource: domain.key(),
            reason: TriggerReason::Modified(domain),
        }
    }

    #[must_use]
    pub const fn deleted(resource: ResourceKey) -> Self {
        Self {
            resource,
            reason: TriggerReason::Deleted,
        }
    }

    #[must_use]
    pub const fn resync(resource: ResourceKey) -> Self {
        Self {
            resource,
            reason: TriggerReason::Resync,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> TriggerKind {
        match self.reason {
            TriggerReason::Added(_) => TriggerKind::Added,
            TriggerReason::Modified(_) => TriggerKind::Modified,
            TriggerReason::Deleted => TriggerKind::Deleted,
            TriggerReason::Resync => TriggerKind::Resync,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_key_by_resource() {
        let domain = DomainResource::new("ns1", "d1", "uid-1");
        let added = Trigger::added(domain.clone());
        assert_eq!(added.resource, ResourceKey::new("ns1", "d1"));
        assert_eq!(added.kind(), TriggerKind::Added);
        assert_eq!(Trigger::modified(domain).kind().to_string(), "modified");
        assert_eq!(Trigger::deleted(ResourceKey::new("ns1", "d1")).kind(), TriggerKind::Deleted);
    }
}
