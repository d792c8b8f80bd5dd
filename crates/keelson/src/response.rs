//! Response steps receive the outcome of exactly one API call.

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::action::NextAction;
use crate::api::ApiCall;
use crate::context::StepContext;
use crate::error::{ApiError, ErrorClass, FailureClass, FiberError};
use crate::packet::Key;

/// A failed call together with the description it was issued from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFailure {
    call: ApiCall,
    error: ApiError,
}

impl CallFailure {
    pub(crate) const fn new(call: ApiCall, error: ApiError) -> Self {
        Self { call, error }
    }

    #[must_use]
    pub const fn call(&self) -> &ApiCall {
        &self.call
    }

    #[must_use]
    pub const fn error(&self) -> &ApiError {
        &self.error
    }

    #[must_use]
    pub fn class(&self) -> FailureClass {
        self.error.class()
    }

    /// Not-found answers to writes are repairable by recreating the object.
    #[must_use]
    pub fn is_not_found_on_write(&self) -> bool {
        self.class() == FailureClass::NotFound && self.call.is_write()
    }

    /// The create to issue when a replace found its target gone.
    #[must_use]
    pub fn create_fallback(&self) -> Option<ApiCall> {
        if self.is_not_found_on_write() {
            self.call.as_create()
        } else {
            None
        }
    }

    #[must_use]
    pub fn error_class(&self) -> ErrorClass {
        match self.class() {
            FailureClass::Transient => ErrorClass::Transient,
            FailureClass::NotFound if self.call.is_write() => ErrorClass::NotFoundOnWrite,
            FailureClass::NotFound | FailureClass::Rejected => ErrorClass::PermanentlyRejected,
        }
    }
}

/// Continuation bound to one API call.
///
/// A response step is built per invocation, so it may own data for that
/// call. It is consumed by whichever callback fires; if the fiber is
/// cancelled first it is simply dropped.
pub trait ResponseStep: Send + 'static {
    fn name(&self) -> &str;

    /// When true, a replace answered with not-found is reissued as a create
    /// of the same object, bound to this response step, before
    /// [`on_failure`](Self::on_failure) sees it. Steps that repair missing
    /// targets themselves return false.
    fn recreates_missing(&self) -> bool {
        true
    }

    fn on_success(self: Box<Self>, cx: &mut StepContext<'_>, response: Value) -> NextAction;

    /// Defaults to [`StepContext::handle_failure`].
    fn on_failure(self: Box<Self>, cx: &mut StepContext<'_>, failure: CallFailure) -> NextAction {
        cx.handle_failure(&failure)
    }
}

/// Decodes the response into a packet slot and continues.
pub struct StoreResponse<T> {
    key: Key<T>,
}

impl<T> StoreResponse<T> {
    #[must_use]
    pub const fn new(key: Key<T>) -> Self {
        Self { key }
    }
}

impl<T> ResponseStep for StoreResponse<T>
where
    T: DeserializeOwned + Send + 'static,
{
    fn name(&self) -> &str {
        self.key.name()
    }

    fn on_success(self: Box<Self>, cx: &mut StepContext<'_>, response: Value) -> NextAction {
        match serde_json::from_value::<T>(response) {
            Ok(value) => {
                debug!(key = self.key.name(), "stored call response");
                cx.packet_mut().insert(self.key, value);
                cx.do_next()
            }
            Err(err) => NextAction::Fail(FiberError::logic(format!(
                "response for {} did not decode: {err}",
                self.key.name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ObjectKind;

    #[test]
    fn test_failures_compare_by_call_and_error() {
        fn failure(name: &str) -> CallFailure {
            CallFailure::new(ApiCall::get(ObjectKind::Pod, "ns", name), ApiError::not_found("gone"))
        }
        assert_eq!(failure("p1"), failure("p1"));
        assert_ne!(failure("p1"), failure("p2"));
    }

    #[test]
    fn test_not_found_on_write_is_repairable() {
        let replace = CallFailure::new(
            ApiCall::replace(ObjectKind::Event, "ns", "e1", Value::Null),
            ApiError::not_found("gone"),
        );
        assert!(replace.is_not_found_on_write());
        assert_eq!(replace.error_class(), ErrorClass::NotFoundOnWrite);

        let get = CallFailure::new(
            ApiCall::get(ObjectKind::Event, "ns", "e1"),
            ApiError::not_found("gone"),
        );
        assert!(!get.is_not_found_on_write());
        assert_eq!(get.error_class(), ErrorClass::PermanentlyRejected);
        assert!(get.create_fallback().is_none());

        let fallback = replace.create_fallback().unwrap();
        assert_eq!(fallback.verb(), crate::api::ApiVerb::Create);
    }

    #[test]
    fn test_transient_failure_class() {
        let failure = CallFailure::new(
            ApiCall::get(ObjectKind::Pod, "ns", "p"),
            ApiError::Transport("reset by peer".into()),
        );
        assert_eq!(failure.error_class(), ErrorClass::Transient);
    }
}
