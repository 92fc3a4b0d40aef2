use futures::Stream;
use futures::stream;

use crate::api::client::ApiClient;
use crate::api::error::ApiError;
use crate::model::{CollectionKey, Cursor, Page};

#[derive(Debug, Clone, PartialEq, Eq)]
enum PagerState {
    Start,
    At(Cursor),
    Done,
}

/// Walks the pages of one listing in server order.
///
/// A page is requested only when `next_page` is called. The pager ends after
/// the page without a continuation cursor, or after the first error; it
/// cannot be restarted, create a new one for a fresh listing.
pub struct Pager<'a> {
    client: &'a ApiClient,
    key: CollectionKey,
    state: PagerState,
}

impl<'a> Pager<'a> {
    pub fn new(client: &'a ApiClient, key: CollectionKey, cursor: Option<Cursor>) -> Self {
        Self {
            client,
            key,
            state: cursor.map_or(PagerState::Start, PagerState::At),
        }
    }

    pub const fn key(&self) -> &CollectionKey {
        &self.key
    }

    pub fn is_done(&self) -> bool {
        self.state == PagerState::Done
    }

    pub async fn next_page(&mut self) -> Option<Result<Page, ApiError>> {
        let cursor = match std::mem::replace(&mut self.state, PagerState::Done) {
            PagerState::Start => None,
            PagerState::At(cursor) => Some(cursor),
            PagerState::Done => return None,
        };

        let page = match self.client.list_page(&self.key, cursor.clone()).await {
            Ok(page) => page,
            Err(err) => return Some(Err(err)),
        };

        match &page.next_cursor {
            Some(next) if cursor.as_ref() == Some(next) => {
                return Some(Err(ApiError::Fatal(format!(
                    "server repeated cursor '{next}' while listing {}",
                    self.key
                ))));
            }
            Some(next) => self.state = PagerState::At(next.clone()),
            None => {}
        }
        Some(Ok(page))
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Page, ApiError>> + 'a {
        stream::unfold(self, |mut pager| async move {
            pager.next_page().await.map(|page| (page, pager))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::StreamExt;
    use proptest::prelude::*;

    use super::*;
    use crate::api::credential::StaticCredentialProvider;
    use crate::api::error::RemoteError;
    use crate::api::memory::MemoryTransport;
    use crate::api::retry::RetryPolicy;
    use crate::model::{ResourceItem, ResourceKind, Scope};

    fn setup(count: usize, page_size: usize) -> (ApiClient, Arc<MemoryTransport>, CollectionKey) {
        let scope = Scope::new("p");
        let transport = Arc::new(MemoryTransport::new().with_page_size(page_size));
        transport.insert(
            ResourceKind::Dataset,
            &scope,
            (0..count).map(|i| ResourceItem::new(format!("d{i}"), format!("dataset {i}"))),
        );
        let provider = Arc::new(StaticCredentialProvider::new(["t"]));
        let client = ApiClient::new(transport.clone(), provider)
            .with_retry_policy(RetryPolicy::default().without_jitter());
        (client, transport, CollectionKey::new(ResourceKind::Dataset, scope))
    }

    #[tokio::test]
    async fn test_pages_are_fetched_lazily() {
        let (client, transport, key) = setup(5, 2);
        let mut pager = client.pager(key, None);

        assert_eq!(transport.call_count(), 0);
        let first = pager.next_page().await.unwrap().unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!(transport.call_count(), 1);

        pager.next_page().await.unwrap().unwrap();
        let last = pager.next_page().await.unwrap().unwrap();
        assert_eq!(last.items.len(), 1);
        assert!(pager.is_done());
        assert!(pager.next_page().await.is_none());
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test]
    async fn test_error_ends_listing() {
        let (client, transport, key) = setup(4, 2);
        let mut pager = client.pager(key, None);

        pager.next_page().await.unwrap().unwrap();
        transport.fail_next(RemoteError::new(crate::api::error::ErrorClass::Fatal, "bad request"));

        assert!(matches!(pager.next_page().await, Some(Err(ApiError::Fatal(_)))));
        assert!(pager.next_page().await.is_none());
    }

    #[tokio::test]
    async fn test_resume_from_cursor() {
        let (client, _, key) = setup(5, 2);
        let pages: Vec<_> = client
            .pager(key, Some(Cursor("4".into())))
            .into_stream()
            .collect()
            .await;

        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].as_ref().unwrap().items[0].id, "d4");
    }

    proptest! {
        #[test]
        fn test_listing_terminates_with_every_item(count in 0usize..40, page_size in 1usize..8) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            let (client, transport, key) = setup(count, page_size);

            let pages: Vec<_> = runtime.block_on(client.pager(key, None).into_stream().collect());
            let ids: Vec<String> = pages
                .into_iter()
                .flat_map(|page| page.unwrap().items)
                .map(|item| item.id)
                .collect();

            let expected: Vec<String> = (0..count).map(|i| format!("d{i}")).collect();
            prop_assert_eq!(ids, expected);
            prop_assert_eq!(transport.call_count(), count.div_ceil(page_size).max(1));
        }
    }
}
