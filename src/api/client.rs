//! Request loop shared by every screen: credentials, retries, rate limits.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::api::credential::{Credential, CredentialProvider};
use crate::api::error::{ApiError, ErrorClass, RemoteError};
use crate::api::pager::Pager;
use crate::api::rate_limit::RateLimiter;
use crate::api::retry::RetryPolicy;
use crate::api::transport::{ApiOp, Payload, Transport};
use crate::config::ApiConfig;
use crate::model::{CollectionKey, Cursor, Operation, Page, ResourceItem, ResourceRef};

/// Result of a request together with how many retries it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome<T> {
    pub result: Result<T, ApiError>,
    pub retries: u32,
}

impl<T> Outcome<T> {
    fn map<U>(self, f: impl FnOnce(T) -> Result<U, ApiError>) -> Outcome<U> {
        Outcome {
            result: self.result.and_then(f),
            retries: self.retries,
        }
    }
}

pub struct ApiClient {
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialProvider>,
    credential: Mutex<Option<Credential>>,
    retry: RetryPolicy,
    limiter: RateLimiter,
    timeout: Duration,
    page_size: usize,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn Transport>, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            transport,
            credentials,
            credential: Mutex::new(None),
            retry: RetryPolicy::default(),
            limiter: RateLimiter::new(),
            timeout: Duration::from_secs(30),
            page_size: 50,
        }
    }

    pub fn from_config(
        config: &ApiConfig,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self::new(transport, credentials)
            .with_retry_policy(RetryPolicy::from_config(config))
            .with_timeout(Duration::from_millis(config.timeout_ms))
            .with_page_size(config.page_size)
    }

    #[must_use]
    pub const fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    pub const fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Lazily walks the pages of `key`, starting at `cursor` when given.
    pub fn pager(&self, key: CollectionKey, cursor: Option<Cursor>) -> Pager<'_> {
        Pager::new(self, key, cursor)
    }

    /// Fetches a single page of a listing.
    pub async fn list_page(&self, key: &CollectionKey, cursor: Option<Cursor>) -> Result<Page, ApiError> {
        let op = ApiOp::List {
            kind: key.kind,
            scope: key.scope.clone(),
            filter: key.filter.clone(),
            cursor,
            page_size: self.page_size,
        };
        self.request(&op).await?.into_page()
    }

    pub async fn get_resource(&self, target: &ResourceRef) -> Result<ResourceItem, ApiError> {
        let op = ApiOp::Get {
            target: target.clone(),
        };
        self.request(&op).await?.into_item()
    }

    /// Carries out a mutation. Yields the server's copy of the resource, or
    /// `None` for a delete.
    pub async fn execute(
        &self,
        target: &ResourceRef,
        operation: &Operation,
        idempotency_key: String,
    ) -> Outcome<Option<ResourceItem>> {
        let op = ApiOp::for_operation(target, operation, idempotency_key);
        self.send(&op).await.map(|payload| match payload {
            Payload::Item(item) => Ok(Some(item)),
            Payload::Deleted => Ok(None),
            Payload::Page(_) => Err(ApiError::Fatal(format!("unexpected page in reply to {op}"))),
        })
    }

    /// # Errors
    /// The classified error once retries are exhausted or the failure is not
    /// retryable.
    pub async fn request(&self, op: &ApiOp) -> Result<Payload, ApiError> {
        self.send(op).await.result
    }

    /// Runs `op` until it succeeds or the failure is final.
    ///
    /// * Transient and rate-limited failures are retried up to the policy's
    ///   budget. Non-idempotent requests only when the server guarantees the
    ///   attempt had no effect.
    /// * A rejected credential is refreshed once without spending the budget.
    /// * Not-found, conflict and fatal errors return immediately.
    pub async fn send(&self, op: &ApiOp) -> Outcome<Payload> {
        let class = op.endpoint_class();
        let mut retries = 0;
        let mut refreshed = false;

        loop {
            self.limiter.wait(class).await;

            let credential = match self.current_credential().await {
                Ok(credential) => credential,
                Err(err) => {
                    return Outcome {
                        result: Err(ApiError::Unauthorized(err.to_string())),
                        retries,
                    };
                }
            };

            let error = match self.attempt(op, &credential).await {
                Ok(payload) => {
                    debug!(%op, retries, "Request succeeded");
                    return Outcome {
                        result: Ok(payload),
                        retries,
                    };
                }
                Err(error) => error,
            };

            match error.class {
                ErrorClass::Unauthorized if !refreshed => {
                    refreshed = true;
                    debug!(%op, "Credential rejected, refreshing");
                    if let Err(err) = self.refresh_credential().await {
                        return Outcome {
                            result: Err(ApiError::Unauthorized(err.to_string())),
                            retries,
                        };
                    }
                }
                ErrorClass::Transient | ErrorClass::RateLimited
                    if retries < self.retry.max_retries
                        && (op.is_idempotent() || error.not_applied) =>
                {
                    retries += 1;
                    let delay = error
                        .retry_after
                        .unwrap_or_else(|| self.retry.delay(retries));
                    warn!(%op, retries, ?delay, error = %error.message, "Retrying request");

                    if error.class == ErrorClass::RateLimited {
                        self.limiter.defer(class, delay);
                    } else {
                        tokio::time::sleep(delay).await;
                    }
                }
                _ => {
                    warn!(%op, retries, error = %error.message, "Request failed");
                    return Outcome {
                        result: Err(error.into()),
                        retries,
                    };
                }
            }
        }
    }

    async fn attempt(&self, op: &ApiOp, credential: &Credential) -> Result<Payload, RemoteError> {
        tokio::time::timeout(self.timeout, self.transport.call(op, credential))
            .await
            .unwrap_or_else(|_| {
                Err(RemoteError::transient(format!(
                    "no response within {}ms",
                    self.timeout.as_millis()
                )))
            })
    }

    async fn current_credential(&self) -> Result<Credential, crate::api::credential::AuthError> {
        let cached = self
            .credential
            .lock()
            .ok()
            .and_then(|cached| cached.clone())
            .filter(|credential| !credential.is_expired(Utc::now()));
        if let Some(credential) = cached {
            return Ok(credential);
        }

        let credential = self.credentials.get_credential().await?;
        self.store_credential(&credential);
        Ok(credential)
    }

    async fn refresh_credential(&self) -> Result<Credential, crate::api::credential::AuthError> {
        let credential = self.credentials.refresh().await?;
        self.store_credential(&credential);
        Ok(credential)
    }

    fn store_credential(&self, credential: &Credential) {
        if let Ok(mut cached) = self.credential.lock() {
            *cached = Some(credential.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tokio::time::Instant;

    use super::*;
    use crate::api::credential::StaticCredentialProvider;
    use crate::api::memory::MemoryTransport;
    use crate::model::{ResourceKind, Scope};

    fn scope() -> Scope {
        Scope::new("subscriptions/s/accounts/a/projects/p")
    }

    fn seeded() -> Arc<MemoryTransport> {
        let transport = MemoryTransport::new();
        transport.insert(
            ResourceKind::Agent,
            &scope(),
            ["a", "b", "c"].map(|id| ResourceItem::new(id, id)),
        );
        Arc::new(transport)
    }

    fn client(transport: Arc<MemoryTransport>, tokens: &[&str]) -> (ApiClient, Arc<StaticCredentialProvider>) {
        let provider = Arc::new(StaticCredentialProvider::new(tokens.iter().copied()));
        let client = ApiClient::new(transport, provider.clone())
            .with_retry_policy(RetryPolicy::default().without_jitter());
        (client, provider)
    }

    fn get(id: &str) -> ApiOp {
        ApiOp::Get {
            target: ResourceRef::new(ResourceKind::Agent, scope(), id),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let transport = seeded();
        transport.fail_next(RemoteError::transient("reset"));
        transport.fail_next(RemoteError::transient("reset"));
        let (client, _) = client(transport.clone(), &["t"]);

        let start = Instant::now();
        let outcome = client.send(&get("a")).await;

        assert!(outcome.result.is_ok());
        assert_eq!(outcome.retries, 2);
        assert_eq!(transport.call_count(), 3);
        // 250ms + 500ms of backoff.
        assert!(start.elapsed() >= Duration::from_millis(750));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_bounded() {
        let transport = seeded();
        for _ in 0..10 {
            transport.fail_next(RemoteError::transient("down"));
        }
        let (client, _) = client(transport.clone(), &["t"]);

        let outcome = client.send(&get("a")).await;

        assert!(matches!(outcome.result, Err(ApiError::NetworkTransient(_))));
        assert_eq!(outcome.retries, 3);
        assert_eq!(transport.call_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_refreshes_once() {
        let transport = Arc::new(seeded_with_token("second"));
        let (client, provider) = client(transport.clone(), &["first", "second"]);

        let outcome = client.send(&get("a")).await;

        assert!(outcome.result.is_ok());
        assert_eq!(outcome.retries, 0);
        assert_eq!(provider.refresh_count(), 1);
        assert_eq!(transport.call_count(), 2);

        // The refreshed credential is reused.
        client.send(&get("b")).await.result.unwrap();
        assert_eq!(provider.refresh_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_unauthorized_is_final() {
        let transport = Arc::new(seeded_with_token("never"));
        let (client, provider) = client(transport.clone(), &["first", "second", "third"]);

        let outcome = client.send(&get("a")).await;

        assert!(matches!(outcome.result, Err(ApiError::Unauthorized(_))));
        assert_eq!(provider.refresh_count(), 1);
        assert_eq!(transport.call_count(), 2);
    }

    fn seeded_with_token(token: &str) -> MemoryTransport {
        let transport = MemoryTransport::new().accepting_token(token);
        transport.insert(ResourceKind::Agent, &scope(), [ResourceItem::new("a", "a"), ResourceItem::new("b", "b")]);
        transport
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_honours_retry_after() {
        let transport = seeded();
        transport.fail_next(RemoteError::rate_limited(Some(Duration::from_secs(5))));
        let (client, _) = client(transport.clone(), &["t"]);

        let start = Instant::now();
        let outcome = client.send(&get("a")).await;

        assert!(outcome.result.is_ok());
        assert_eq!(outcome.retries, 1);
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_is_not_retried() {
        let transport = seeded();
        let (client, _) = client(transport.clone(), &["t"]);

        let outcome = client.send(&get("missing")).await;

        assert!(matches!(outcome.result, Err(ApiError::NotFound(_))));
        assert_eq!(outcome.retries, 0);
        assert_eq!(transport.call_count(), 1);
    }

    fn create_op() -> ApiOp {
        ApiOp::Create {
            kind: ResourceKind::Agent,
            scope: scope(),
            name: "fresh".into(),
            fields: BTreeMap::new(),
            idempotency_key: "key-1".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_only_retried_when_not_applied() {
        let transport = seeded();
        transport.fail_next(RemoteError::transient("gateway timeout"));
        let (client, _) = client(transport.clone(), &["t"]);

        let outcome = client.send(&create_op()).await;
        assert!(matches!(outcome.result, Err(ApiError::NetworkTransient(_))));
        assert_eq!(transport.call_count(), 1);

        transport.fail_next(RemoteError::transient("connection refused").not_applied());
        let outcome = client.send(&create_op()).await;
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_transient() {
        let transport = Arc::new(MemoryTransport::new().with_latency(Duration::from_secs(60)));
        let provider = Arc::new(StaticCredentialProvider::new(["t"]));
        let client = ApiClient::new(transport.clone(), provider)
            .with_timeout(Duration::from_secs(1))
            .with_retry_policy(RetryPolicy {
                max_retries: 1,
                ..RetryPolicy::default().without_jitter()
            });

        let outcome = client.send(&get("a")).await;

        assert!(matches!(outcome.result, Err(ApiError::NetworkTransient(_))));
        assert_eq!(outcome.retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_delete_returns_none() {
        let transport = seeded();
        let (client, _) = client(transport.clone(), &["t"]);
        let target = ResourceRef::new(ResourceKind::Agent, scope(), "b");

        let outcome = client.execute(&target, &Operation::Delete, String::new()).await;

        assert_eq!(outcome.result, Ok(None));
        assert_eq!(transport.items(ResourceKind::Agent, &scope()).len(), 2);
    }
}
