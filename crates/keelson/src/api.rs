//! The seam to the orchestration platform's API.
//!
//! The engine never talks to the platform directly. Every externally visible
//! effect is described as an [`ApiCall`] and executed through an
//! [`ApiClient`] implementation supplied at construction. Calls are plain
//! futures: dropping one cancels it.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApiError;

/// Kinds of platform objects the engine reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectKind {
    Domain,
    Event,
    Namespace,
    Pod,
    Secret,
    Service,
}

impl ObjectKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Domain => "Domain",
            Self::Event => "Event",
            Self::Namespace => "Namespace",
            Self::Pod => "Pod",
            Self::Secret => "Secret",
            Self::Service => "Service",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiVerb {
    Get,
    Create,
    Replace,
}

impl ApiVerb {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Create => "create",
            Self::Replace => "replace",
        }
    }
}

/// Description of one external call. Carries everything needed to issue it
/// again on retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    Get {
        kind: ObjectKind,
        namespace: String,
        name: String,
    },
    Create {
        kind: ObjectKind,
        namespace: String,
        body: Value,
    },
    Replace {
        kind: ObjectKind,
        namespace: String,
        name: String,
        body: Value,
    },
}

impl ApiCall {
    pub fn get(kind: ObjectKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Get {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn create(kind: ObjectKind, namespace: impl Into<String>, body: Value) -> Self {
        Self::Create {
            kind,
            namespace: namespace.into(),
            body,
        }
    }

    pub fn replace(
        kind: ObjectKind,
        namespace: impl Into<String>,
        name: impl Into<String>,
        body: Value,
    ) -> Self {
        Self::Replace {
            kind,
            namespace: namespace.into(),
            name: name.into(),
            body,
        }
    }

    #[must_use]
    pub const fn verb(&self) -> ApiVerb {
        match self {
            Self::Get { .. } => ApiVerb::Get,
            Self::Create { .. } => ApiVerb::Create,
            Self::Replace { .. } => ApiVerb::Replace,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ObjectKind {
        match self {
            Self::Get { kind, .. } | Self::Create { kind, .. } | Self::Replace { kind, .. } => {
                *kind
            }
        }
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        match self {
            Self::Get { namespace, .. }
            | Self::Create { namespace, .. }
            | Self::Replace { namespace, .. } => namespace,
        }
    }

    /// Target object name. For creates this is read from the body's metadata.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Get { name, .. } | Self::Replace { name, .. } => Some(name),
            Self::Create { body, .. } => body.pointer("/metadata/name").and_then(Value::as_str),
        }
    }

    /// The create that recreates a replace target which no longer exists.
    /// The stale `resourceVersion` is dropped from the body.
    #[must_use]
    pub fn as_create(&self) -> Option<Self> {
        let Self::Replace {
            kind,
            namespace,
            body,
            ..
        } = self
        else {
            return None;
        };
        let mut body = body.clone();
        if let Some(metadata) = body.get_mut("metadata").and_then(Value::as_object_mut) {
            metadata.remove("resourceVersion");
        }
        Some(Self::create(*kind, namespace.clone(), body))
    }

    /// Write calls are the ones that need idempotent replay handling.
    #[must_use]
    pub const fn is_write(&self) -> bool {
        !matches!(self, Self::Get { .. })
    }
}

impl fmt::Display for ApiCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.verb().as_str(), self.kind(), self.namespace())?;
        if let Some(name) = self.name() {
            write!(f, "/{name}")?;
        }
        Ok(())
    }
}

/// Asynchronous client for the platform API.
///
/// Implementations enforce nothing about retries; the engine owns retry
/// policy and call timeouts. Error responses must carry the platform's
/// status code so the failure can be classified.
#[async_trait]
pub trait ApiClient: Send + Sync + 'static {
    async fn get_object(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
    ) -> Result<Value, ApiError>;

    async fn create_object(
        &self,
        kind: ObjectKind,
        namespace: &str,
        body: Value,
    ) -> Result<Value, ApiError>;

    async fn replace_object(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
        body: Value,
    ) -> Result<Value, ApiError>;
}

/// Routes a call description to the matching client method.
pub(crate) async fn dispatch(client: &dyn ApiClient, call: &ApiCall) -> Result<Value, ApiError> {
    match call {
        ApiCall::Get { kind, namespace, name } => client.get_object(*kind, namespace, name).await,
        ApiCall::Create { kind, namespace, body } => {
            client.create_object(*kind, namespace, body.clone()).await
        }
        ApiCall::Replace {
            kind,
            namespace,
            name,
            body,
        } => client.replace_object(*kind, namespace, name, body.clone()).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_name_comes_from_body() {
        let call = ApiCall::create(
            ObjectKind::Event,
            "ns1",
            json!({ "metadata": { "name": "d1.DomainCreated.17" } }),
        );
        assert_eq!(call.name(), Some("d1.DomainCreated.17"));
        assert_eq!(call.to_string(), "create Event ns1/d1.DomainCreated.17");
        assert!(call.is_write());
    }

    #[test]
    fn test_replace_converts_to_create_without_version() {
        let replace = ApiCall::replace(
            ObjectKind::Service,
            "ns1",
            "svc-0",
            json!({
                "metadata": { "name": "svc-0", "resourceVersion": "41" },
                "spec": { "port": 7001 },
            }),
        );
        let create = replace.as_create().unwrap();
        assert_eq!(create.verb(), ApiVerb::Create);
        assert_eq!(create.to_string(), "create Service ns1/svc-0");
        let ApiCall::Create { body, .. } = &create else {
            panic!("expected a create");
        };
        assert!(body.pointer("/metadata/resourceVersion").is_none());
        assert_eq!(body["spec"]["port"], 7001);

        assert!(ApiCall::get(ObjectKind::Service, "ns1", "svc-0").as_create().is_none());
    }

    #[test]
    fn test_get_is_not_a_write() {
        let call = ApiCall::get(ObjectKind::Domain, "ns1", "d1");
        assert_eq!(call.verb(), ApiVerb::Get);
        assert!(!call.is_write());
        assert_eq!(call.to_string(), "get Domain ns1/d1");
    }
}
