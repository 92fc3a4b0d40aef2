use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::api::transport::EndpointClass;

/// Tracks, per endpoint class, the earliest time the next request may go out.
///
/// Requests are delayed until the window opens; they are never dropped.
#[derive(Debug, Default)]
pub struct RateLimiter {
    next_allowed: Mutex<HashMap<EndpointClass, Instant>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block further requests of `class` for `delay` from now. An existing
    /// later deadline is kept.
    pub fn defer(&self, class: EndpointClass, delay: Duration) {
        let until = Instant::now() + delay;
        if let Ok(mut next_allowed) = self.next_allowed.lock() {
            let entry = next_allowed.entry(class).or_insert(until);
            if *entry < until {
                *entry = until;
            }
        }
        debug!(%class, ?delay, "Rate limit window set");
    }

    pub fn next_allowed(&self, class: EndpointClass) -> Option<Instant> {
        self.next_allowed
            .lock()
            .ok()
            .and_then(|next| next.get(&class).copied())
            .filter(|until| *until > Instant::now())
    }

    /// Waits until requests of `class` are allowed again. Re-checks after
    /// waking since another request may have extended the window.
    pub async fn wait(&self, class: EndpointClass) {
        while let Some(until) = self.next_allowed(class) {
            tokio::time::sleep_until(until).await;
        }
    }
}
