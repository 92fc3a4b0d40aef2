use std::sync::Arc;

use async_trait::async_trait;
use color_eyre::Result;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::api::ApiClient;
use crate::app::AppMessage;
use crate::cache::FetchRequest;
use crate::commands::Command;
use crate::model::{ResourceRef, ScreenId};

/// Walks the pages of one listing and streams them to the cache.
///
/// Stops after `max_pages` pages, at the last page, or at the first error.
/// Every page goes out as soon as it arrives so screens can render partial
/// listings.
pub struct FetchCollectionCmd {
    client: Arc<ApiClient>,
    request: FetchRequest,
}

impl FetchCollectionCmd {
    pub const fn new(client: Arc<ApiClient>, request: FetchRequest) -> Self {
        Self { client, request }
    }
}

#[async_trait]
impl Command for FetchCollectionCmd {
    fn name(&self) -> String {
        format!("Loading {}", self.request.key)
    }

    async fn execute(self: Box<Self>, action_tx: UnboundedSender<AppMessage>) -> Result<()> {
        let FetchRequest {
            key,
            generation,
            cursor,
            max_pages,
        } = self.request;
        let mut pager = self.client.pager(key.clone(), cursor);
        let mut fetched = 0;

        while let Some(result) = pager.next_page().await {
            match result {
                Ok(page) => {
                    fetched += 1;
                    let done = pager.is_done() || fetched >= max_pages;
                    debug!(%key, generation, items = page.items.len(), done, "Page loaded");
                    action_tx.send(AppMessage::PageLoaded {
                        key: key.clone(),
                        generation,
                        page,
                        done,
                    })?;
                    if done {
                        break;
                    }
                }
                Err(error) => {
                    action_tx.send(AppMessage::FetchFailed {
                        key: key.clone(),
                        generation,
                        error,
                    })?;
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Reloads a single resource for the screen that asked.
pub struct FetchItemCmd {
    client: Arc<ApiClient>,
    origin: ScreenId,
    target: ResourceRef,
}

impl FetchItemCmd {
    pub const fn new(client: Arc<ApiClient>, origin: ScreenId, target: ResourceRef) -> Self {
        Self { client, origin, target }
    }
}

#[async_trait]
impl Command for FetchItemCmd {
    fn name(&self) -> String {
        format!("Loading {}", self.target)
    }

    async fn execute(self: Box<Self>, action_tx: UnboundedSender<AppMessage>) -> Result<()> {
        let result = self.client.get_resource(&self.target).await;
        action_tx.send(AppMessage::ItemLoaded {
            origin: self.origin,
            target: self.target,
            result,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::api::MemoryTransport;
    use crate::api::credential::StaticCredentialProvider;
    use crate::model::{CollectionKey, ResourceItem, ResourceKind, Scope};

    fn client(transport: MemoryTransport) -> Arc<ApiClient> {
        Arc::new(
            ApiClient::new(Arc::new(transport), Arc::new(StaticCredentialProvider::new(["token"])))
                .with_page_size(2),
        )
    }

    fn project() -> Scope {
        Scope::new("subscriptions/s/accounts/a/projects/p")
    }

    #[tokio::test]
    async fn test_streams_pages_until_page_limit() {
        let transport = MemoryTransport::new().accepting_token("token");
        transport.insert(
            ResourceKind::Agent,
            &project(),
            (0..5).map(|i| ResourceItem::new(format!("agent-{i}"), format!("Agent {i}"))),
        );
        let key = CollectionKey::new(ResourceKind::Agent, project());
        let request = FetchRequest {
            key: key.clone(),
            generation: 4,
            cursor: None,
            max_pages: 2,
        };
        let (tx, mut rx) = mpsc::unbounded_channel();

        Box::new(FetchCollectionCmd::new(client(transport), request))
            .execute(tx)
            .await
            .unwrap();

        let mut dones = Vec::new();
        while let Ok(message) = rx.try_recv() {
            match message {
                AppMessage::PageLoaded {
                    generation, page, done, ..
                } => {
                    assert_eq!(generation, 4);
                    assert_eq!(page.items.len(), 2);
                    dones.push(done);
                }
                other => panic!("unexpected message {other:?}"),
            }
        }
        assert_eq!(dones, [false, true]);
    }

    #[tokio::test]
    async fn test_missing_item_is_reported_to_origin() {
        let transport = MemoryTransport::new().accepting_token("token");
        let target = ResourceRef::new(ResourceKind::Agent, project(), "ghost");
        let (tx, mut rx) = mpsc::unbounded_channel();

        Box::new(FetchItemCmd::new(client(transport), ScreenId(3), target.clone()))
            .execute(tx)
            .await
            .unwrap();

        match rx.try_recv() {
            Ok(AppMessage::ItemLoaded { origin, target: t, result }) => {
                assert_eq!(origin, ScreenId(3));
                assert_eq!(t, target);
                assert!(matches!(result, Err(crate::api::ApiError::NotFound(_))));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
}
