//! Transport seam between the API client and the wire.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;

use crate::api::credential::Credential;
use crate::api::error::{ApiError, RemoteError};
use crate::model::{Cursor, Operation, Page, ResourceItem, ResourceKind, ResourceRef, Scope};

/// A single logical request against the management API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiOp {
    List {
        kind: ResourceKind,
        scope: Scope,
        filter: Option<String>,
        cursor: Option<Cursor>,
        page_size: usize,
    },
    Get {
        target: ResourceRef,
    },
    Create {
        kind: ResourceKind,
        scope: Scope,
        name: String,
        fields: BTreeMap<String, String>,
        idempotency_key: String,
    },
    Update {
        target: ResourceRef,
        patch: BTreeMap<String, String>,
    },
    Delete {
        target: ResourceRef,
    },
}

/// Requests sharing an endpoint class share a rate-limit window.
pub type EndpointClass = ResourceKind;

impl ApiOp {
    /// Request carrying out `operation` on `target`. For creates only the
    /// kind and scope of `target` are used.
    pub fn for_operation(target: &ResourceRef, operation: &Operation, idempotency_key: String) -> Self {
        match operation {
            Operation::Create { name, fields } => Self::Create {
                kind: target.kind,
                scope: target.scope.clone(),
                name: name.clone(),
                fields: fields.clone(),
                idempotency_key,
            },
            Operation::Update { patch } => Self::Update {
                target: target.clone(),
                patch: patch.clone(),
            },
            Operation::Delete => Self::Delete {
                target: target.clone(),
            },
        }
    }

    pub const fn kind(&self) -> ResourceKind {
        match self {
            Self::List { kind, .. } | Self::Create { kind, .. } => *kind,
            Self::Get { target } | Self::Update { target, .. } | Self::Delete { target } => {
                target.kind
            }
        }
    }

    pub const fn endpoint_class(&self) -> EndpointClass {
        self.kind()
    }

    pub const fn is_idempotent(&self) -> bool {
        !matches!(self, Self::Create { .. })
    }
}

impl fmt::Display for ApiOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::List {
                kind,
                scope,
                cursor,
                ..
            } => match cursor {
                Some(cursor) => write!(f, "list {kind}@{scope} from {cursor}"),
                None => write!(f, "list {kind}@{scope}"),
            },
            Self::Get { target } => write!(f, "get {target}"),
            Self::Create { kind, scope, name, .. } => write!(f, "create {kind}@{scope} '{name}'"),
            Self::Update { target, .. } => write!(f, "update {target}"),
            Self::Delete { target } => write!(f, "delete {target}"),
        }
    }
}

/// Successful response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Page(Page),
    Item(ResourceItem),
    Deleted,
}

impl Payload {
    /// # Errors
    /// Fails with [`ApiError::Fatal`] if the server answered with something
    /// other than a page.
    pub fn into_page(self) -> Result<Page, ApiError> {
        match self {
            Self::Page(page) => Ok(page),
            other => Err(ApiError::Fatal(format!("expected a page, got {other:?}"))),
        }
    }

    /// # Errors
    /// Fails with [`ApiError::Fatal`] if the server answered with something
    /// other than a single resource.
    pub fn into_item(self) -> Result<ResourceItem, ApiError> {
        match self {
            Self::Item(item) => Ok(item),
            other => Err(ApiError::Fatal(format!("expected a resource, got {other:?}"))),
        }
    }
}

/// Performs one attempt of a request. Retries, credential refresh and rate
/// limiting are the client's business, not the transport's.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, op: &ApiOp, credential: &Credential) -> Result<Payload, RemoteError>;
}
