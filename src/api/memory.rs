//! In-process transport backed by a map of collections.
//!
//! Serves demo mode (`--demo`) and the tests. Failures can be scripted per
//! call and every request is recorded.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::api::credential::Credential;
use crate::api::error::{ErrorClass, RemoteError};
use crate::api::transport::{ApiOp, Payload, Transport};
use crate::model::{Cursor, Operation, Page, ResourceItem, ResourceKind, ResourceRef, Scope};

#[derive(Default)]
struct MemoryState {
    collections: HashMap<(ResourceKind, Scope), Vec<ResourceItem>>,
    failures: VecDeque<RemoteError>,
    calls: Vec<ApiOp>,
    accepted_token: Option<String>,
    page_size: Option<usize>,
    created: HashMap<String, ResourceItem>,
    next_id: u64,
}

#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
    latency: Duration,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport seeded with a small Foundry tenant for demo mode.
    pub fn demo() -> Self {
        let transport = Self::new().with_latency(Duration::from_millis(300));
        seed_demo(&transport);
        transport
    }

    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Overrides the page size requested by the client.
    #[must_use]
    pub fn with_page_size(self, page_size: usize) -> Self {
        self.lock().page_size = Some(page_size.max(1));
        self
    }

    /// Only requests carrying this bearer token are accepted.
    #[must_use]
    pub fn accepting_token(self, token: impl Into<String>) -> Self {
        self.lock().accepted_token = Some(token.into());
        self
    }

    pub fn insert(&self, kind: ResourceKind, scope: &Scope, items: impl IntoIterator<Item = ResourceItem>) {
        self.lock()
            .collections
            .entry((kind, scope.clone()))
            .or_default()
            .extend(items);
    }

    /// The next call fails with `error` instead of being served.
    pub fn fail_next(&self, error: RemoteError) {
        self.lock().failures.push_back(error);
    }

    pub fn items(&self, kind: ResourceKind, scope: &Scope) -> Vec<ResourceItem> {
        self.lock()
            .collections
            .get(&(kind, scope.clone()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<ApiOp> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn call(&self, op: &ApiOp, credential: &Credential) -> Result<Payload, RemoteError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut state = self.lock();
        state.calls.push(op.clone());

        if let Some(token) = &state.accepted_token
            && token != credential.bearer()
        {
            return Err(RemoteError::new(ErrorClass::Unauthorized, "token rejected"));
        }
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }

        state.serve(op)
    }
}

impl MemoryState {
    fn serve(&mut self, op: &ApiOp) -> Result<Payload, RemoteError> {
        match op {
            ApiOp::List {
                kind,
                scope,
                filter,
                cursor,
                page_size,
            } => {
                let page_size = self.page_size.unwrap_or(*page_size).max(1);
                let items: Vec<&ResourceItem> = self
                    .collections
                    .get(&(*kind, scope.clone()))
                    .map(|items| {
                        items
                            .iter()
                            .filter(|item| matches_filter(item, filter.as_deref()))
                            .collect()
                    })
                    .unwrap_or_default();

                let offset = match cursor {
                    Some(Cursor(raw)) => raw.parse::<usize>().map_err(|_| {
                        RemoteError::new(ErrorClass::Fatal, format!("invalid cursor '{raw}'"))
                    })?,
                    None => 0,
                };
                let end = (offset + page_size).min(items.len());
                let page_items = items
                    .get(offset.min(end)..end)
                    .unwrap_or_default()
                    .iter()
                    .map(|item| (*item).clone())
                    .collect();
                let next_cursor = (end < items.len()).then(|| Cursor(end.to_string()));

                Ok(Payload::Page(Page {
                    items: page_items,
                    next_cursor,
                }))
            }
            ApiOp::Get { target } => self.find(target).cloned().map(Payload::Item),
            ApiOp::Create {
                kind,
                scope,
                name,
                fields,
                idempotency_key,
            } => {
                if let Some(existing) = self.created.get(idempotency_key) {
                    return Ok(Payload::Item(existing.clone()));
                }
                self.next_id += 1;
                let mut item = ResourceItem::new(format!("{}-{}", slug(name), self.next_id), name.clone())
                    .with_status("Ready");
                item.fields.clone_from(fields);

                self.collections
                    .entry((*kind, scope.clone()))
                    .or_default()
                    .push(item.clone());
                self.created.insert(idempotency_key.clone(), item.clone());
                Ok(Payload::Item(item))
            }
            ApiOp::Update { target, patch } => {
                let item = self.find_mut(target)?;
                let operation = Operation::Update {
                    patch: patch.clone(),
                };
                if let Some(updated) = operation.apply(Some(item.clone()), &target.id) {
                    *item = updated;
                }
                Ok(Payload::Item(item.clone()))
            }
            ApiOp::Delete { target } => {
                let items = self
                    .collections
                    .get_mut(&(target.kind, target.scope.clone()))
                    .ok_or_else(|| not_found(target))?;
                let index = items
                    .iter()
                    .position(|item| item.id == target.id)
                    .ok_or_else(|| not_found(target))?;
                items.remove(index);
                Ok(Payload::Deleted)
            }
        }
    }

    fn find(&self, target: &ResourceRef) -> Result<&ResourceItem, RemoteError> {
        self.collections
            .get(&(target.kind, target.scope.clone()))
            .and_then(|items| items.iter().find(|item| item.id == target.id))
            .ok_or_else(|| not_found(target))
    }

    fn find_mut(&mut self, target: &ResourceRef) -> Result<&mut ResourceItem, RemoteError> {
        self.collections
            .get_mut(&(target.kind, target.scope.clone()))
            .and_then(|items| items.iter_mut().find(|item| item.id == target.id))
            .ok_or_else(|| not_found(target))
    }
}

fn not_found(target: &ResourceRef) -> RemoteError {
    RemoteError::new(ErrorClass::NotFound, format!("{target} does not exist"))
}

fn matches_filter(item: &ResourceItem, filter: Option<&str>) -> bool {
    filter.is_none_or(|filter| item.name.to_lowercase().contains(&filter.to_lowercase()))
}

fn slug(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect()
}

fn seed_demo(transport: &MemoryTransport) {
    let root = Scope::root();
    transport.insert(
        ResourceKind::Subscription,
        &root,
        [
            ResourceItem::new("0b1f6471-1bf0-4dda-aec3-111122223333", "Contoso Production")
                .with_status("Enabled"),
            ResourceItem::new("7c2e9a10-55d4-4e8b-9f1a-444455556666", "Contoso Sandbox")
                .with_status("Enabled"),
        ],
    );

    for (sub_id, accounts) in [
        ("0b1f6471-1bf0-4dda-aec3-111122223333", ["contoso-foundry", "contoso-research"]),
        ("7c2e9a10-55d4-4e8b-9f1a-444455556666", ["sandbox-foundry", "playground"]),
    ] {
        let sub_scope = root.child(ResourceKind::Subscription, sub_id);
        transport.insert(
            ResourceKind::Account,
            &sub_scope,
            accounts.iter().map(|name| {
                ResourceItem::new(*name, *name)
                    .with_field("location", "eastus2")
                    .with_field("resource_group", format!("rg-{name}"))
            }),
        );

        for account in accounts {
            let account_scope = sub_scope.child(ResourceKind::Account, account);
            let projects = ["default-project", "chat-assistant"];
            transport.insert(
                ResourceKind::Project,
                &account_scope,
                projects.iter().map(|project| {
                    ResourceItem::new(*project, *project).with_field(
                        "endpoint",
                        format!("https://{account}.services.ai.azure.com/api/projects/{project}"),
                    )
                }),
            );
            for project in projects {
                seed_project(transport, &account_scope.child(ResourceKind::Project, project));
            }
        }
    }
}

fn seed_project(transport: &MemoryTransport, scope: &Scope) {
    let agents = [
        ("irma", "2025-12-18 16:58"),
        ("irma-v3", "2025-12-18 15:09"),
        ("testar", "2025-12-18 15:09"),
        ("agent-smith", "2025-12-18 12:39"),
        ("agent-doc", "2025-12-17 11:24"),
        ("mr-bond", "2025-12-17 12:23"),
    ];
    transport.insert(
        ResourceKind::Agent,
        scope,
        agents.iter().enumerate().map(|(i, (name, created))| {
            ResourceItem::new(format!("asst_{name}_{i}"), *name)
                .with_status("Active")
                .with_field("type", "prompt")
                .with_field("model", "gpt-4o")
                .with_field("created_at", *created)
        }),
    );

    let deployments = [
        ("gpt-4o", "2024-08-06"),
        ("gpt-4o-mini", "2024-07-18"),
        ("text-embedding-3-large", "1"),
    ];
    transport.insert(
        ResourceKind::Deployment,
        scope,
        deployments.iter().map(|(name, version)| {
            ResourceItem::new(*name, *name)
                .with_status("Ready")
                .with_field("model", *name)
                .with_field("version", *version)
        }),
    );

    transport.insert(
        ResourceKind::Connection,
        scope,
        [
            ResourceItem::new("aoai-main", "aoai-main")
                .with_field("type", "AzureOpenAI")
                .with_field("target", "https://contoso.openai.azure.com"),
            ResourceItem::new("search-docs", "search-docs")
                .with_field("type", "CognitiveSearch")
                .with_field("target", "https://contoso-search.search.windows.net"),
        ],
    );

    transport.insert(
        ResourceKind::Dataset,
        scope,
        [
            ResourceItem::new("support-tickets", "support-tickets")
                .with_status("Ready")
                .with_field("version", "3"),
            ResourceItem::new("eval-golden", "eval-golden")
                .with_status("Ready")
                .with_field("version", "1"),
        ],
    );

    transport.insert(
        ResourceKind::Evaluation,
        scope,
        [ResourceItem::new("eval-irma-groundedness", "irma groundedness")
            .with_status("Completed")
            .with_field("created_at", "2025-12-18 17:20")],
    );
}
