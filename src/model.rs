//! Domain types shared by the API client, the resource cache and the screens.
//!
//! The remote API is abstracted: a resource is an id, a display name, an
//! optional status and a bag of display fields. Screens pick the fields they
//! show through [`ResourceKind::columns`].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Every resource type the dashboard can list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Subscription,
    Account,
    Project,
    Agent,
    Deployment,
    Connection,
    Dataset,
    Evaluation,
}

/// A column shown for a resource kind: header plus the field it reads.
#[derive(Debug, Clone, Copy)]
pub struct FieldColumn {
    pub header: &'static str,
    pub field: &'static str,
}

const fn col(header: &'static str, field: &'static str) -> FieldColumn {
    FieldColumn { header, field }
}

impl ResourceKind {
    /// Resource kinds that live inside a project, in sidebar order.
    pub const PROJECT_KINDS: [Self; 5] = [
        Self::Agent,
        Self::Deployment,
        Self::Connection,
        Self::Dataset,
        Self::Evaluation,
    ];

    pub const fn display_name(self) -> &'static str {
        match self {
            Self::Subscription => "Subscriptions",
            Self::Account => "Foundry Accounts",
            Self::Project => "Projects",
            Self::Agent => "Agents",
            Self::Deployment => "Deployments",
            Self::Connection => "Connections",
            Self::Dataset => "Datasets",
            Self::Evaluation => "Evaluations",
        }
    }

    pub const fn singular(self) -> &'static str {
        match self {
            Self::Subscription => "subscription",
            Self::Account => "Foundry account",
            Self::Project => "project",
            Self::Agent => "agent",
            Self::Deployment => "deployment",
            Self::Connection => "connection",
            Self::Dataset => "dataset",
            Self::Evaluation => "evaluation",
        }
    }

    /// Path segment used when building request URLs and scopes.
    pub const fn path_segment(self) -> &'static str {
        match self {
            Self::Subscription => "subscriptions",
            Self::Account => "accounts",
            Self::Project => "projects",
            Self::Agent => "agents",
            Self::Deployment => "deployments",
            Self::Connection => "connections",
            Self::Dataset => "datasets",
            Self::Evaluation => "evaluations",
        }
    }

    pub fn from_segment(segment: &str) -> Option<Self> {
        [
            Self::Subscription,
            Self::Account,
            Self::Project,
            Self::Agent,
            Self::Deployment,
            Self::Connection,
            Self::Dataset,
            Self::Evaluation,
        ]
        .into_iter()
        .find(|kind| kind.path_segment() == segment)
    }

    /// The kind selected after this one in the selection flow.
    pub const fn child(self) -> Option<Self> {
        match self {
            Self::Subscription => Some(Self::Account),
            Self::Account => Some(Self::Project),
            _ => None,
        }
    }

    /// Whether the dashboard offers create/rename/delete for this kind.
    pub const fn is_mutable(self) -> bool {
        matches!(
            self,
            Self::Agent | Self::Deployment | Self::Dataset | Self::Evaluation
        )
    }

    pub const fn columns(self) -> &'static [FieldColumn] {
        match self {
            Self::Subscription => SUBSCRIPTION_COLUMNS,
            Self::Account => ACCOUNT_COLUMNS,
            Self::Project => PROJECT_COLUMNS,
            Self::Agent => AGENT_COLUMNS,
            Self::Deployment => DEPLOYMENT_COLUMNS,
            Self::Connection => CONNECTION_COLUMNS,
            Self::Dataset => DATASET_COLUMNS,
            Self::Evaluation => EVALUATION_COLUMNS,
        }
    }
}

const SUBSCRIPTION_COLUMNS: &[FieldColumn] = &[col("Name", "name"), col("Id", "id"), col("State", "status")];
const ACCOUNT_COLUMNS: &[FieldColumn] = &[
    col("Name", "name"),
    col("Location", "location"),
    col("Resource Group", "resource_group"),
];
const PROJECT_COLUMNS: &[FieldColumn] = &[col("Name", "name"), col("Endpoint", "endpoint")];
const AGENT_COLUMNS: &[FieldColumn] = &[
    col("Name", "name"),
    col("Model", "model"),
    col("Status", "status"),
    col("Created", "created_at"),
];
const DEPLOYMENT_COLUMNS: &[FieldColumn] = &[
    col("Name", "name"),
    col("Model", "model"),
    col("Version", "version"),
    col("Status", "status"),
];
const CONNECTION_COLUMNS: &[FieldColumn] = &[col("Name", "name"), col("Type", "type"), col("Target", "target")];
const DATASET_COLUMNS: &[FieldColumn] = &[col("Name", "name"), col("Version", "version"), col("Status", "status")];
const EVALUATION_COLUMNS: &[FieldColumn] = &[col("Name", "name"), col("Status", "status"), col("Created", "created_at")];

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path_segment())
    }
}

/// Hierarchical location of a collection, e.g.
/// `subscriptions/sub-1/accounts/acct/projects/proj1`. The empty scope is the
/// root where subscriptions live.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Scope(String);

impl Scope {
    pub const fn root() -> Self {
        Self(String::new())
    }

    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into().trim_matches('/').to_string())
    }

    /// Scope of the children of resource `id` of `kind` inside this scope.
    #[must_use]
    pub fn child(&self, kind: ResourceKind, id: &str) -> Self {
        let segment = format!("{}/{id}", kind.path_segment());
        if self.0.is_empty() {
            Self(segment)
        } else {
            Self(format!("{}/{segment}", self.0))
        }
    }

    pub const fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `(kind, id)` pairs of the path, outermost first.
    pub fn segments(&self) -> Vec<(ResourceKind, &str)> {
        let parts: Vec<&str> = self.0.split('/').filter(|p| !p.is_empty()).collect();
        parts
            .chunks(2)
            .filter_map(|pair| match pair {
                [kind, id] => ResourceKind::from_segment(kind).map(|k| (k, *id)),
                _ => None,
            })
            .collect()
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("/")
        } else {
            f.write_str(&self.0)
        }
    }
}

/// Identity of one paginated listing in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionKey {
    pub kind: ResourceKind,
    pub scope: Scope,
    pub filter: Option<String>,
}

impl CollectionKey {
    pub const fn new(kind: ResourceKind, scope: Scope) -> Self {
        Self {
            kind,
            scope,
            filter: None,
        }
    }

    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

impl fmt::Display for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.kind, self.scope)?;
        if let Some(filter) = &self.filter {
            write!(f, "?{filter}")?;
        }
        Ok(())
    }
}

/// Opaque continuation token handed out by the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor(pub String);

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a pending mutating action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionId(pub u64);

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of one screen instance on the navigation stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScreenId(pub u64);

/// Local synchronisation state of a cached item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ItemState {
    /// Mirrors the server.
    #[default]
    Confirmed,
    /// Shows the effect of an action that has not been confirmed yet.
    Optimistic { action: ActionId },
    /// An optimistic change was rolled back.
    Reverted,
}

/// A single server-side object mirrored locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceItem {
    pub id: String,
    pub name: String,
    pub status: Option<String>,
    pub fields: BTreeMap<String, String>,
    pub state: ItemState,
}

impl ResourceItem {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: None,
            fields: BTreeMap::new(),
            state: ItemState::Confirmed,
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Reads a display field; `id`, `name` and `status` are always available.
    pub fn field(&self, key: &str) -> Option<&str> {
        match key {
            "id" => Some(&self.id),
            "name" => Some(&self.name),
            "status" => self.status.as_deref(),
            other => self.fields.get(other).map(String::as_str),
        }
    }

    pub const fn is_pending(&self) -> bool {
        matches!(self.state, ItemState::Optimistic { .. })
    }

    /// Builds an item from a JSON object. Scalars other than `id`, `name` and
    /// `status` become display fields; nested values are ignored.
    ///
    /// # Errors
    /// Returns a description of the problem if the value is not an object or
    /// has no string `id`.
    pub fn from_json(value: &Value) -> Result<Self, String> {
        let object = value
            .as_object()
            .ok_or_else(|| format!("expected a resource object, got {value}"))?;
        let id = object
            .get("id")
            .and_then(Value::as_str)
            .ok_or("resource has no string `id`")?
            .to_string();
        let name = object
            .get("name")
            .and_then(Value::as_str)
            .map_or_else(|| id.clone(), str::to_string);
        let status = object
            .get("status")
            .and_then(Value::as_str)
            .map(str::to_string);

        let fields = object
            .iter()
            .filter(|(key, _)| !matches!(key.as_str(), "id" | "name" | "status"))
            .filter_map(|(key, value)| scalar_to_string(value).map(|v| (key.clone(), v)))
            .collect();

        Ok(Self {
            id,
            name,
            status,
            fields,
            state: ItemState::Confirmed,
        })
    }

    pub fn to_json(&self) -> Value {
        let mut object = serde_json::Map::new();
        object.insert("id".into(), Value::String(self.id.clone()));
        object.insert("name".into(), Value::String(self.name.clone()));
        if let Some(status) = &self.status {
            object.insert("status".into(), Value::String(status.clone()));
        }
        for (key, value) in &self.fields {
            object.insert(key.clone(), Value::String(value.clone()));
        }
        Value::Object(object)
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Fully qualified reference to one resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub scope: Scope,
    pub id: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, scope: Scope, id: impl Into<String>) -> Self {
        Self {
            kind,
            scope,
            id: id.into(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.kind, self.scope, self.id)
    }
}

/// A mutating operation on a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Create {
        name: String,
        fields: BTreeMap<String, String>,
    },
    /// Field patch; the `name` and `status` keys patch those attributes.
    Update { patch: BTreeMap<String, String> },
    Delete,
}

impl Operation {
    pub const fn verb(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Update { .. } => "update",
            Self::Delete => "delete",
        }
    }

    /// Creates are the only operation that is unsafe to replay blindly.
    pub const fn is_idempotent(&self) -> bool {
        !matches!(self, Self::Create { .. })
    }

    /// Presentation of `base` with this operation applied.
    ///
    /// `placeholder_id` names the item a create produces before the server
    /// assigns the real id. Returns `None` when the operation leaves nothing
    /// to show.
    pub fn apply(&self, base: Option<ResourceItem>, placeholder_id: &str) -> Option<ResourceItem> {
        match self {
            Self::Create { name, fields } => {
                let mut item = ResourceItem::new(placeholder_id, name.clone()).with_status("Creating");
                item.fields = fields.clone();
                Some(item)
            }
            Self::Update { patch } => base.map(|mut item| {
                for (key, value) in patch {
                    match key.as_str() {
                        "name" => item.name = value.clone(),
                        "status" => item.status = Some(value.clone()),
                        _ => {
                            item.fields.insert(key.clone(), value.clone());
                        }
                    }
                }
                item
            }),
            Self::Delete => base.map(|item| item.with_status("Deleting")),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Create { name, fields } => {
                let mut object = serde_json::Map::new();
                object.insert("name".into(), Value::String(name.clone()));
                for (key, value) in fields {
                    object.insert(key.clone(), Value::String(value.clone()));
                }
                Value::Object(object)
            }
            Self::Update { patch } => Value::Object(
                patch
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect(),
            ),
            Self::Delete => Value::Null,
        }
    }
}

/// One page of a listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    pub items: Vec<ResourceItem>,
    pub next_cursor: Option<Cursor>,
}
