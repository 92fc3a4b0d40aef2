//! REST transport over reqwest.
//!
//! Collections live at `{base}/{scope}/{kind}` and single resources at
//! `{base}/{scope}/{kind}/{id}`. Listings answer with
//! `{"items": [...], "next_cursor": "..."}`.

use std::error::Error as _;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde_json::Value;
use tracing::debug;

use crate::api::credential::Credential;
use crate::api::error::{ErrorClass, RemoteError};
use crate::api::transport::{ApiOp, Payload, Transport};
use crate::model::{Cursor, Page, ResourceItem, ResourceKind, Scope};
use crate::tls::{TlsError, TlsVerify, is_tls_error};

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";
const MAX_ERROR_BODY: usize = 300;

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    /// # Errors
    /// Fails if the TLS settings cannot be applied or the client cannot be
    /// built.
    pub fn new(base_url: &str, verify: &TlsVerify, connect_timeout: Duration) -> Result<Self, TlsError> {
        let builder = reqwest::Client::builder()
            .user_agent(concat!("anvil/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(connect_timeout);
        let client = verify
            .configure(builder)?
            .build()
            .map_err(TlsError::Client)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn collection_url(&self, kind: ResourceKind, scope: &Scope) -> String {
        if scope.is_root() {
            format!("{}/{}", self.base_url, kind.path_segment())
        } else {
            format!("{}/{}/{}", self.base_url, scope.as_str(), kind.path_segment())
        }
    }

    fn request(&self, op: &ApiOp) -> RequestBuilder {
        match op {
            ApiOp::List {
                kind,
                scope,
                filter,
                cursor,
                page_size,
            } => {
                let mut query = vec![("page_size", page_size.to_string())];
                if let Some(Cursor(cursor)) = cursor {
                    query.push(("cursor", cursor.clone()));
                }
                if let Some(filter) = filter {
                    query.push(("filter", filter.clone()));
                }
                self.client
                    .request(Method::GET, self.collection_url(*kind, scope))
                    .query(&query)
            }
            ApiOp::Get { target } => self.client.request(
                Method::GET,
                format!("{}/{}", self.collection_url(target.kind, &target.scope), target.id),
            ),
            ApiOp::Create {
                kind,
                scope,
                name,
                fields,
                idempotency_key,
            } => {
                let mut body = serde_json::Map::new();
                body.insert("name".into(), Value::String(name.clone()));
                for (key, value) in fields {
                    body.insert(key.clone(), Value::String(value.clone()));
                }
                self.client
                    .request(Method::POST, self.collection_url(*kind, scope))
                    .header(IDEMPOTENCY_HEADER, idempotency_key)
                    .json(&body)
            }
            ApiOp::Update { target, patch } => self
                .client
                .request(
                    Method::PATCH,
                    format!("{}/{}", self.collection_url(target.kind, &target.scope), target.id),
                )
                .json(patch),
            ApiOp::Delete { target } => self.client.request(
                Method::DELETE,
                format!("{}/{}", self.collection_url(target.kind, &target.scope), target.id),
            ),
        }
    }

    /// Sends a bare request to the base URL. Any HTTP answer counts as a
    /// working connection.
    ///
    /// # Errors
    /// The full error chain of the failed request.
    pub async fn check_connection(&self) -> Result<(), String> {
        self.client
            .get(&self.base_url)
            .send()
            .await
            .map(|_| ())
            .map_err(|err| error_chain(&err))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn call(&self, op: &ApiOp, credential: &Credential) -> Result<Payload, RemoteError> {
        debug!(%op, "Sending request");
        let response = self
            .request(op)
            .bearer_auth(credential.bearer())
            .send()
            .await
            .map_err(|err| classify_send_error(&err))?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &headers, &body));
        }

        if matches!(op, ApiOp::Delete { .. }) {
            return Ok(Payload::Deleted);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|err| RemoteError::new(ErrorClass::Fatal, format!("invalid response body: {err}")))?;

        match op {
            ApiOp::List { .. } => parse_page(&body).map(Payload::Page),
            _ => ResourceItem::from_json(&body)
                .map(Payload::Item)
                .map_err(|message| RemoteError::new(ErrorClass::Fatal, message)),
        }
    }
}

fn status_error(status: StatusCode, headers: &HeaderMap, body: &str) -> RemoteError {
    let class = ErrorClass::from_status(status.as_u16());
    let retry_after = headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let detail: String = body.chars().take(MAX_ERROR_BODY).collect();
    let message = if detail.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {detail}")
    };

    let mut error = RemoteError::new(class, message);
    error.retry_after = retry_after;
    // A server that echoes the key has recorded it and deduplicates replays.
    error.not_applied = headers.contains_key(IDEMPOTENCY_HEADER) || status == StatusCode::TOO_MANY_REQUESTS;
    error
}

fn classify_send_error(err: &reqwest::Error) -> RemoteError {
    let message = error_chain(err);
    if err.is_connect() {
        if is_tls_error(&message) {
            return RemoteError::new(
                ErrorClass::Fatal,
                format!("{message} (run `anvil --diagnose-tls` for help)"),
            );
        }
        return RemoteError::transient(message).not_applied();
    }
    RemoteError::transient(message)
}

fn error_chain(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Accepts `items`/`value` for the list and `next_cursor`/`nextLink` for the
/// continuation token.
fn parse_page(body: &Value) -> Result<Page, RemoteError> {
    let fatal = |message: String| RemoteError::new(ErrorClass::Fatal, message);

    let items = body
        .get("items")
        .or_else(|| body.get("value"))
        .and_then(Value::as_array)
        .ok_or_else(|| fatal("listing has no `items` array".into()))?
        .iter()
        .map(ResourceItem::from_json)
        .collect::<Result<Vec<_>, _>>()
        .map_err(fatal)?;

    let next_cursor = body
        .get("next_cursor")
        .or_else(|| body.get("nextLink"))
        .and_then(Value::as_str)
        .filter(|cursor| !cursor.is_empty())
        .map(|cursor| Cursor(cursor.to_string()));

    Ok(Page { items, next_cursor })
}
