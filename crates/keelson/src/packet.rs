//! Per-fiber scratch space.
//!
//! A [`Packet`] maps typed [`Key`]s to values. It is created for one fiber
//! run, handed from step to step, and dropped when the fiber terminates.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

/// Typed name of a packet slot.
pub struct Key<T> {
    name: &'static str,
    _value: PhantomData<fn() -> T>,
}

impl<T> Key<T> {
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _value: PhantomData,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for Key<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Key<T> {}

impl<T> fmt::Debug for Key<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Key").field(&self.name).finish()
    }
}

/// Mutable key/value context carried through one fiber run.
#[derive(Default)]
pub struct Packet {
    entries: HashMap<&'static str, Box<dyn Any + Send>>,
}

impl Packet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with<T: Any + Send>(mut self, key: Key<T>, value: T) -> Self {
        self.insert(key, value);
        self
    }

    /// Stores `value`, returning the previous value if it had the same type.
    pub fn insert<T: Any + Send>(&mut self, key: Key<T>, value: T) -> Option<T> {
        self.entries
            .insert(key.name, Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    #[must_use]
    pub fn get<T: Any + Send>(&self, key: Key<T>) -> Option<&T> {
        self.entries.get(key.name).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn get_mut<T: Any + Send>(&mut self, key: Key<T>) -> Option<&mut T> {
        self.entries.get_mut(key.name).and_then(|v| v.downcast_mut::<T>())
    }

    /// Applies `update` to the value under `key`, starting from `init()` when
    /// the slot is empty or holds another type.
    pub fn upsert<T: Any + Send, R>(
        &mut self,
        key: Key<T>,
        init: impl FnOnce() -> T,
        update: impl FnOnce(&mut T) -> R,
    ) -> R {
        let mut value = self.remove(key).unwrap_or_else(init);
        let result = update(&mut value);
        self.insert(key, value);
        result
    }

    pub fn remove<T: Any + Send>(&mut self, key: Key<T>) -> Option<T> {
        let boxed = self.entries.remove(key.name)?;
        match boxed.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(other) => {
                self.entries.insert(key.name, other);
                None
            }
        }
    }

    #[must_use]
    pub fn contains<T: Any + Send>(&self, key: Key<T>) -> bool {
        self.get(key).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.entries.keys().copied().collect();
        names.sort_unstable();
        f.debug_struct("Packet").field("keys", &names).finish()
    }
}

/// Well-known keys the engine itself reads and writes.
pub mod keys {
    use crate::events::{EventItem, PendingEmission};
    use crate::presence::{PresenceSnapshot, ResourceKey};
    use crate::retry::RetryLedger;
    use crate::trigger::TriggerKind;

    crate::packet_key! {
        /// Identity of the resource this fiber reconciles.
        pub RESOURCE: ResourceKey = "resource";

        /// Presence info captured when the fiber started.
        pub PRESENCE: PresenceSnapshot = "domainPresenceInfo";

        /// The event kind most recently recorded for the resource.
        pub EVENT_TYPE: EventItem = "eventType";

        /// What started the fiber.
        pub TRIGGER: TriggerKind = "trigger";

        pub(crate) RETRY_LEDGER: RetryLedger = "retryLedger";

        pub(crate) PENDING_EMISSION: PendingEmission = "pendingEmission";
    }
}
