//! In-memory store of resource listings shared by every screen.
//!
//! The cache is owned by the event loop and never touches the network itself.
//! Methods that need data fetched hand back a [`FetchRequest`]; the app runs it
//! and feeds the pages back through [`ResourceCache::apply_page`]. Every
//! visible change is announced through a [`ChangeSignal`] addressed to the
//! screens subscribed to the affected key.
//!
//! Optimistic mutations are kept as overlays: the confirmed server copy of an
//! item plus the ordered list of operations still waiting for an answer. What
//! screens see is the base folded with those operations.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::api::ApiError;
use crate::config::{ApiConfig, CacheConfig};
use crate::model::{
    ActionId, CollectionKey, Cursor, ItemState, Operation, Page, ResourceItem, ResourceKind,
    ResourceRef, Scope, ScreenId,
};

/// Tuning knobs of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub stale_after: Duration,
    pub max_items_per_kind: usize,
    pub max_pages_per_fetch: usize,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(30),
            max_items_per_kind: 2000,
            max_pages_per_fetch: 20,
        }
    }
}

impl CachePolicy {
    pub fn from_config(cache: &CacheConfig, api: &ApiConfig) -> Self {
        Self {
            stale_after: Duration::from_secs(cache.stale_after_secs),
            max_items_per_kind: cache.max_items_per_kind,
            max_pages_per_fetch: api.max_pages_per_fetch.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Never fully loaded.
    Missing,
    /// Older than the staleness threshold or invalidated.
    Stale,
    Fresh,
}

/// Read-only snapshot of one listing.
#[derive(Debug, Clone)]
pub struct CollectionView {
    pub items: Arc<Vec<ResourceItem>>,
    pub freshness: Freshness,
    pub loading: bool,
    /// The server has more pages past the stored cursor.
    pub has_more: bool,
    pub fetched_at: Option<Instant>,
    pub error: Option<ApiError>,
}

impl CollectionView {
    fn empty() -> Self {
        Self {
            items: Arc::default(),
            freshness: Freshness::Missing,
            loading: false,
            has_more: false,
            fetched_at: None,
            error: None,
        }
    }
}

/// Work the app must carry out on behalf of the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub key: CollectionKey,
    pub generation: u64,
    /// Where to start; `None` is the first page.
    pub cursor: Option<Cursor>,
    pub max_pages: usize,
}

/// A listing changed; `subscribers` should re-read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSignal {
    pub key: CollectionKey,
    pub subscribers: Vec<ScreenId>,
}

/// Server outcome of an optimistic mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconcile {
    /// The server's copy of the resource, `None` once it is deleted.
    Confirmed(Option<ResourceItem>),
    Reverted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchMode {
    /// Fresh listing from the first page.
    Replace,
    /// Continue from the stored cursor.
    Append,
}

#[derive(Debug)]
struct InFlight {
    generation: u64,
    mode: FetchMode,
    /// Pages of a revalidation, swapped in once the sequence ends.
    buffer: Option<Vec<ResourceItem>>,
    cursor: Option<Cursor>,
}

#[derive(Debug)]
struct Entry {
    base: Vec<ResourceItem>,
    presented: Arc<Vec<ResourceItem>>,
    cursor: Option<Cursor>,
    fetched_at: Option<Instant>,
    invalidated: bool,
    in_flight: Option<InFlight>,
    error: Option<ApiError>,
    /// When `error` was recorded; automatic retries wait `stale_after` from it.
    failed_at: Option<Instant>,
    last_access: Instant,
}

impl Entry {
    fn new(now: Instant) -> Self {
        Self {
            base: Vec::new(),
            presented: Arc::default(),
            cursor: None,
            fetched_at: None,
            invalidated: false,
            in_flight: None,
            error: None,
            failed_at: None,
            last_access: now,
        }
    }

    fn freshness(&self, now: Instant, stale_after: Duration) -> Freshness {
        match self.fetched_at {
            None => Freshness::Missing,
            Some(_) if self.invalidated => Freshness::Stale,
            Some(at) if now.saturating_duration_since(at) >= stale_after => Freshness::Stale,
            Some(_) => Freshness::Fresh,
        }
    }

    /// An errored listing is retried once it has rested for `stale_after`.
    fn retry_due(&self, now: Instant, stale_after: Duration) -> bool {
        match (&self.error, self.failed_at) {
            (None, _) | (Some(_), None) => true,
            (Some(_), Some(at)) => now.saturating_duration_since(at) >= stale_after,
        }
    }

    fn view(&self, now: Instant, stale_after: Duration) -> CollectionView {
        CollectionView {
            items: Arc::clone(&self.presented),
            freshness: self.freshness(now, stale_after),
            loading: self.in_flight.is_some(),
            has_more: self.cursor.is_some(),
            fetched_at: self.fetched_at,
            error: self.error.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct ItemOverlay {
    pending: Vec<(ActionId, Operation)>,
    /// Last optimistic change was rolled back; shown until the next refresh.
    reverted: bool,
}

type ScopeKey = (ResourceKind, Scope);

/// A single item fetched on its own, outside any listing.
#[derive(Debug)]
struct Detail {
    item: ResourceItem,
    /// Insertion order; the oldest copy is evicted first.
    stored: u64,
}

pub struct ResourceCache {
    policy: CachePolicy,
    entries: HashMap<CollectionKey, Entry>,
    overlays: HashMap<ScopeKey, HashMap<String, ItemOverlay>>,
    actions: HashMap<ActionId, ResourceRef>,
    details: HashMap<ResourceRef, Detail>,
    detail_seq: u64,
    subscribers: HashMap<CollectionKey, Vec<ScreenId>>,
    changes: Vec<ChangeSignal>,
    next_generation: u64,
}

impl ResourceCache {
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            policy,
            entries: HashMap::new(),
            overlays: HashMap::new(),
            actions: HashMap::new(),
            details: HashMap::new(),
            detail_seq: 0,
            subscribers: HashMap::new(),
            changes: Vec::new(),
            next_generation: 0,
        }
    }

    pub const fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// Returns the listing immediately, possibly empty or stale, and the
    /// fetch to run if it needs (re)loading. While a fetch is in flight no
    /// further one is requested, and a failed listing waits `stale_after`
    /// before it is tried again.
    pub fn get(&mut self, key: &CollectionKey, now: Instant) -> (CollectionView, Option<FetchRequest>) {
        let stale_after = self.policy.stale_after;
        let entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| Entry::new(now));
        entry.last_access = now;

        let needs_fetch = entry.in_flight.is_none()
            && entry.retry_due(now, stale_after)
            && entry.freshness(now, stale_after) != Freshness::Fresh;

        let fetch = needs_fetch.then(|| self.start_fetch(key, FetchMode::Replace, None));
        (self.peek(key, now), fetch)
    }

    /// Snapshot without side effects.
    pub fn peek(&self, key: &CollectionKey, now: Instant) -> CollectionView {
        self.entries
            .get(key)
            .map_or_else(CollectionView::empty, |entry| entry.view(now, self.policy.stale_after))
    }

    /// Forces a fresh listing, dropping any fetch in flight. Clears a
    /// recorded error.
    pub fn refresh(&mut self, key: &CollectionKey, now: Instant) -> FetchRequest {
        let entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| Entry::new(now));
        entry.last_access = now;
        entry.error = None;
        entry.invalidated = true;
        self.start_fetch(key, FetchMode::Replace, None)
    }

    /// Continues a listing from its stored cursor.
    pub fn load_more(&mut self, key: &CollectionKey, now: Instant) -> Option<FetchRequest> {
        let entry = self.entries.get_mut(key)?;
        entry.last_access = now;
        if entry.in_flight.is_some() || entry.fetched_at.is_none() {
            return None;
        }
        let cursor = entry.cursor.clone()?;
        entry.error = None;
        Some(self.start_fetch(key, FetchMode::Append, Some(cursor)))
    }

    fn start_fetch(&mut self, key: &CollectionKey, mode: FetchMode, cursor: Option<Cursor>) -> FetchRequest {
        self.next_generation += 1;
        let generation = self.next_generation;
        if let Some(entry) = self.entries.get_mut(key) {
            let revalidating = mode == FetchMode::Replace && entry.fetched_at.is_some();
            if mode == FetchMode::Replace && !revalidating {
                entry.base.clear();
                entry.cursor = None;
            }
            entry.in_flight = Some(InFlight {
                generation,
                mode,
                buffer: revalidating.then(Vec::new),
                cursor: None,
            });
        }
        debug!(%key, generation, ?mode, "Starting fetch");
        FetchRequest {
            key: key.clone(),
            generation,
            cursor,
            max_pages: self.policy.max_pages_per_fetch,
        }
    }

    /// Feeds one page of a fetch. `done` marks the last page of the
    /// sequence. Pages of superseded fetches are ignored; returns whether the
    /// page was accepted.
    pub fn apply_page(&mut self, key: &CollectionKey, generation: u64, page: Page, done: bool, now: Instant) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        let Some(flight) = entry
            .in_flight
            .as_mut()
            .filter(|flight| flight.generation == generation)
        else {
            debug!(%key, generation, "Ignoring page of superseded fetch");
            return false;
        };

        let revalidating = flight.buffer.is_some();
        match &mut flight.buffer {
            Some(buffer) => {
                append_unique(buffer, page.items);
                flight.cursor = page.next_cursor;
            }
            None => {
                append_unique(&mut entry.base, page.items);
                entry.cursor = page.next_cursor;
            }
        }

        if done {
            if let Some(flight) = entry.in_flight.take() {
                if let Some(buffer) = flight.buffer {
                    entry.base = buffer;
                    entry.cursor = flight.cursor;
                }
                if flight.mode == FetchMode::Replace || entry.fetched_at.is_none() {
                    entry.fetched_at = Some(now);
                    entry.invalidated = false;
                }
            }
            entry.error = None;
            self.clear_reverted(key.kind, &key.scope);
        } else if revalidating {
            // Nothing visible changes until the swap.
            return true;
        }

        self.represent(key);
        if done {
            self.evict(key.kind, key);
        }
        true
    }

    /// Records a failed fetch. Items already present stay as they are.
    pub fn fetch_failed(&mut self, key: &CollectionKey, generation: u64, error: ApiError, now: Instant) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        if entry
            .in_flight
            .as_ref()
            .is_none_or(|flight| flight.generation != generation)
        {
            return false;
        }
        debug!(%key, generation, %error, "Fetch failed");
        entry.in_flight = None;
        entry.error = Some(error);
        entry.failed_at = Some(now);
        self.signal(key);
        true
    }

    /// Marks a listing stale and forgets any fetch in flight; the next `get`
    /// reloads it.
    pub fn invalidate(&mut self, key: &CollectionKey) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.invalidated = true;
            entry.in_flight = None;
            entry.error = None;
            self.signal(key);
        }
    }

    /// Invalidates every listing of `kind` inside `scope`.
    pub fn invalidate_scope(&mut self, kind: ResourceKind, scope: &Scope) {
        for key in self.keys_in(kind, scope) {
            self.invalidate(&key);
        }
    }

    pub fn subscribe(&mut self, key: &CollectionKey, screen: ScreenId) {
        let subscribers = self.subscribers.entry(key.clone()).or_default();
        if !subscribers.contains(&screen) {
            subscribers.push(screen);
        }
    }

    pub fn unsubscribe_all(&mut self, screen: ScreenId) {
        self.subscribers.retain(|_, subscribers| {
            subscribers.retain(|id| *id != screen);
            !subscribers.is_empty()
        });
    }

    /// Change signals in the order the changes happened.
    pub fn drain_changes(&mut self) -> Vec<ChangeSignal> {
        std::mem::take(&mut self.changes)
    }

    /// Applies `operation` to the presentation of `target` right away.
    ///
    /// Creates ignore `target.id` and show a placeholder item instead; the
    /// returned reference names the item actually affected.
    pub fn apply_optimistic(&mut self, target: &ResourceRef, action: ActionId, operation: Operation) -> ResourceRef {
        let affected = if matches!(operation, Operation::Create { .. }) {
            ResourceRef::new(target.kind, target.scope.clone(), format!("pending-{}", action.0))
        } else {
            target.clone()
        };

        let overlay = self
            .overlays
            .entry((affected.kind, affected.scope.clone()))
            .or_default()
            .entry(affected.id.clone())
            .or_default();
        overlay.pending.push((action, operation));
        overlay.reverted = false;
        self.actions.insert(action, affected.clone());

        debug!(%affected, %action, "Applied optimistic update");
        self.represent_scope(affected.kind, &affected.scope);
        affected
    }

    /// Settles the optimistic operation of `action`. Returns `false` if the
    /// action is unknown or already settled, in which case nothing changes.
    pub fn reconcile(&mut self, action: ActionId, outcome: Reconcile) -> bool {
        let Some(affected) = self.actions.remove(&action) else {
            return false;
        };
        let scope_key = (affected.kind, affected.scope.clone());
        let confirmed = matches!(outcome, Reconcile::Confirmed(_));

        let mut was_create = false;
        if let Some(overlays) = self.overlays.get_mut(&scope_key)
            && let Some(overlay) = overlays.get_mut(&affected.id)
        {
            if let Some(index) = overlay.pending.iter().position(|(id, _)| *id == action) {
                let (_, operation) = overlay.pending.remove(index);
                was_create = matches!(operation, Operation::Create { .. });
            }
            if outcome == Reconcile::Reverted {
                overlay.reverted = true;
            }
            if overlay.pending.is_empty() && !overlay.reverted {
                overlays.remove(&affected.id);
            }
            if overlays.is_empty() {
                self.overlays.remove(&scope_key);
            }
        }

        match outcome {
            Reconcile::Confirmed(Some(item)) => {
                if was_create {
                    self.insert_created(&affected, item);
                } else {
                    self.replace_base(&affected, item);
                }
            }
            Reconcile::Confirmed(None) => self.remove_base(&affected),
            Reconcile::Reverted => {}
        }
        if confirmed {
            self.supersede_fetches(affected.kind, &affected.scope);
        }

        debug!(%affected, %action, "Reconciled optimistic update");
        self.represent_scope(affected.kind, &affected.scope);
        true
    }

    /// Whether an optimistic operation is still waiting on `target`.
    pub fn has_pending(&self, target: &ResourceRef) -> bool {
        self.overlays
            .get(&(target.kind, target.scope.clone()))
            .and_then(|overlays| overlays.get(&target.id))
            .is_some_and(|overlay| !overlay.pending.is_empty())
    }

    /// Presented copy of one item, from a listing or a single-item fetch.
    pub fn find_item(&self, target: &ResourceRef) -> Option<ResourceItem> {
        let listed = self
            .entries
            .iter()
            .filter(|(key, _)| key.kind == target.kind && key.scope == target.scope)
            .find_map(|(_, entry)| entry.presented.iter().find(|item| item.id == target.id))
            .cloned();
        listed.or_else(|| {
            let base = self.details.get(target).map(|detail| detail.item.clone());
            self.fold(target.kind, &target.scope, &target.id, base)
        })
    }

    /// Stores a freshly fetched single item and updates every listing
    /// holding it.
    pub fn upsert_item(&mut self, target: &ResourceRef, item: ResourceItem) {
        self.replace_base(target, item.clone());
        self.detail_seq += 1;
        let stored = self.detail_seq;
        self.details.insert(target.clone(), Detail { item, stored });
        while self.item_count(target.kind) > self.policy.max_items_per_kind {
            if !self.evict_detail(target.kind, Some(target)) {
                break;
            }
        }
        self.represent_scope(target.kind, &target.scope);
    }

    /// Drops an item the server no longer knows about.
    pub fn remove_item(&mut self, target: &ResourceRef) {
        self.remove_base(target);
        self.represent_scope(target.kind, &target.scope);
    }

    /// Items of `kind` held in listings and single-item copies.
    pub fn item_count(&self, kind: ResourceKind) -> usize {
        let listed: usize = self
            .entries
            .iter()
            .filter(|(key, _)| key.kind == kind)
            .map(|(_, entry)| entry.base.len())
            .sum();
        listed + self.details.keys().filter(|target| target.kind == kind).count()
    }

    pub fn contains(&self, key: &CollectionKey) -> bool {
        self.entries.contains_key(key)
    }

    fn keys_in(&self, kind: ResourceKind, scope: &Scope) -> Vec<CollectionKey> {
        self.entries
            .keys()
            .filter(|key| key.kind == kind && key.scope == *scope)
            .cloned()
            .collect()
    }

    fn replace_base(&mut self, target: &ResourceRef, item: ResourceItem) {
        if let Some(detail) = self.details.get_mut(target) {
            detail.item = item.clone();
        }
        for (key, entry) in &mut self.entries {
            if key.kind == target.kind && key.scope == target.scope {
                if let Some(existing) = entry.base.iter_mut().find(|i| i.id == target.id) {
                    *existing = item.clone();
                }
            }
        }
    }

    fn insert_created(&mut self, placeholder: &ResourceRef, item: ResourceItem) {
        for (key, entry) in &mut self.entries {
            if key.kind == placeholder.kind
                && key.scope == placeholder.scope
                && entry.fetched_at.is_some()
                && !entry.base.iter().any(|i| i.id == item.id)
            {
                entry.base.push(item.clone());
            }
        }
    }

    fn remove_base(&mut self, target: &ResourceRef) {
        self.details.remove(target);
        for (key, entry) in &mut self.entries {
            if key.kind == target.kind && key.scope == target.scope {
                entry.base.retain(|i| i.id != target.id);
            }
        }
    }

    /// Drops fetches of `kind` in `scope` that were started before a
    /// confirmed change; their pages would bring the old state back. The
    /// listings are left stale so the next `get` reloads them.
    fn supersede_fetches(&mut self, kind: ResourceKind, scope: &Scope) {
        for key in self.keys_in(kind, scope) {
            if let Some(entry) = self.entries.get_mut(&key)
                && let Some(flight) = entry.in_flight.take()
            {
                debug!(%key, generation = flight.generation, "Dropping fetch older than a confirmed change");
                entry.invalidated = true;
            }
        }
    }

    fn clear_reverted(&mut self, kind: ResourceKind, scope: &Scope) {
        let scope_key = (kind, scope.clone());
        if let Some(overlays) = self.overlays.get_mut(&scope_key) {
            overlays.retain(|_, overlay| !overlay.pending.is_empty());
            if overlays.is_empty() {
                self.overlays.remove(&scope_key);
            }
        }
    }

    fn fold(&self, kind: ResourceKind, scope: &Scope, id: &str, base: Option<ResourceItem>) -> Option<ResourceItem> {
        let Some(overlay) = self
            .overlays
            .get(&(kind, scope.clone()))
            .and_then(|overlays| overlays.get(id))
        else {
            return base;
        };
        fold_overlay(base, id, overlay)
    }

    fn represent_scope(&mut self, kind: ResourceKind, scope: &Scope) {
        for key in self.keys_in(kind, scope) {
            self.represent(&key);
        }
    }

    /// Recomputes what `key` shows and announces it.
    fn represent(&mut self, key: &CollectionKey) {
        let Some(entry) = self.entries.get(key) else {
            return;
        };
        let overlays = self.overlays.get(&(key.kind, key.scope.clone()));

        let mut presented: Vec<ResourceItem> = entry
            .base
            .iter()
            .filter_map(|item| match overlays.and_then(|o| o.get(&item.id)) {
                Some(overlay) => fold_overlay(Some(item.clone()), &item.id, overlay),
                None => Some(item.clone()),
            })
            .collect();

        if let Some(overlays) = overlays
            && (entry.fetched_at.is_some() || !entry.base.is_empty())
        {
            let mut creates: Vec<(ActionId, ResourceItem)> = overlays
                .iter()
                .filter(|(id, _)| !entry.base.iter().any(|item| item.id == **id))
                .filter_map(|(id, overlay)| {
                    let (first, _) = overlay.pending.first()?;
                    fold_overlay(None, id, overlay).map(|item| (*first, item))
                })
                .collect();
            creates.sort_by_key(|(action, _)| *action);
            presented.extend(creates.into_iter().map(|(_, item)| item));
        }

        if let Some(entry) = self.entries.get_mut(key) {
            entry.presented = Arc::new(presented);
        }
        self.signal(key);
    }

    fn signal(&mut self, key: &CollectionKey) {
        self.changes.push(ChangeSignal {
            key: key.clone(),
            subscribers: self.subscribers.get(key).cloned().unwrap_or_default(),
        });
    }

    /// Drops single-item copies, oldest first, then least recently used
    /// listings of `kind` until the kind fits its item budget. Listings
    /// showing a pending action, listings being fetched and `keep` are never
    /// dropped.
    fn evict(&mut self, kind: ResourceKind, keep: &CollectionKey) {
        while self.item_count(kind) > self.policy.max_items_per_kind {
            if self.evict_detail(kind, None) {
                continue;
            }
            let victim = self
                .entries
                .iter()
                .filter(|(key, entry)| {
                    key.kind == kind
                        && *key != keep
                        && entry.in_flight.is_none()
                        && !self.has_pending_in(key, entry)
                })
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(key, _)| key.clone());

            let Some(victim) = victim else {
                break;
            };
            debug!(key = %victim, "Evicting cached listing");
            self.entries.remove(&victim);
            if self.keys_in(victim.kind, &victim.scope).is_empty() {
                self.clear_reverted(victim.kind, &victim.scope);
            }
        }
    }

    /// Drops the oldest single-item copy of `kind` other than `keep`. Items
    /// with a pending action stay.
    fn evict_detail(&mut self, kind: ResourceKind, keep: Option<&ResourceRef>) -> bool {
        let victim = self
            .details
            .iter()
            .filter(|(target, _)| target.kind == kind && keep != Some(*target) && !self.has_pending(target))
            .min_by_key(|(_, detail)| detail.stored)
            .map(|(target, _)| target.clone());

        let Some(victim) = victim else {
            return false;
        };
        debug!(target = %victim, "Evicting cached item");
        self.details.remove(&victim);
        true
    }

    fn has_pending_in(&self, key: &CollectionKey, entry: &Entry) -> bool {
        self.overlays
            .get(&(key.kind, key.scope.clone()))
            .is_some_and(|overlays| {
                overlays.iter().any(|(id, overlay)| {
                    !overlay.pending.is_empty()
                        && (entry.base.iter().any(|item| item.id == *id)
                            || entry.presented.iter().any(|item| item.id == *id))
                })
            })
    }
}

fn fold_overlay(base: Option<ResourceItem>, id: &str, overlay: &ItemOverlay) -> Option<ResourceItem> {
    let mut item = base;
    for (action, operation) in &overlay.pending {
        item = operation.apply(item, id);
        if let Some(item) = &mut item {
            item.state = ItemState::Optimistic { action: *action };
        }
    }
    if overlay.pending.is_empty()
        && overlay.reverted
        && let Some(item) = &mut item
    {
        item.state = ItemState::Reverted;
    }
    item
}

fn append_unique(target: &mut Vec<ResourceItem>, items: Vec<ResourceItem>) {
    let mut seen: HashSet<String> = target.iter().map(|item| item.id.clone()).collect();
    for item in items {
        if seen.insert(item.id.clone()) {
            target.push(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn key(kind: ResourceKind, scope: &str) -> CollectionKey {
        CollectionKey::new(kind, Scope::new(scope))
    }

    fn items(ids: &[&str]) -> Vec<ResourceItem> {
        ids.iter().map(|id| ResourceItem::new(*id, *id)).collect()
    }

    fn page(ids: &[&str], next: Option<&str>) -> Page {
        Page {
            items: items(ids),
            next_cursor: next.map(|c| Cursor(c.to_string())),
        }
    }

    fn ids(view: &CollectionView) -> Vec<&str> {
        view.items.iter().map(|item| item.id.as_str()).collect()
    }

    fn cache() -> ResourceCache {
        ResourceCache::new(CachePolicy {
            stale_after: Duration::from_secs(30),
            max_items_per_kind: 100,
            max_pages_per_fetch: 20,
        })
    }

    fn load(cache: &mut ResourceCache, key: &CollectionKey, ids: &[&str], now: Instant) {
        let (_, fetch) = cache.get(key, now);
        let fetch = fetch.expect("fetch requested");
        assert!(cache.apply_page(key, fetch.generation, page(ids, None), true, now));
    }

    fn patch(field: &str, value: &str) -> Operation {
        let mut patch = BTreeMap::new();
        patch.insert(field.to_string(), value.to_string());
        Operation::Update { patch }
    }

    #[test]
    fn test_get_missing_returns_empty_and_fetches_once() {
        let mut cache = cache();
        let key = key(ResourceKind::Deployment, "proj1");
        let now = Instant::now();

        let (view, fetch) = cache.get(&key, now);
        assert!(view.items.is_empty());
        assert_eq!(view.freshness, Freshness::Missing);
        let fetch = fetch.unwrap();
        assert_eq!(fetch.cursor, None);

        let (view, again) = cache.get(&key, now);
        assert!(again.is_none());
        assert!(view.loading);
    }

    #[test]
    fn test_pages_accumulate_in_server_order() {
        let mut cache = cache();
        let key = key(ResourceKind::Deployment, "proj1");
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(1);
        let t2 = t0 + Duration::from_secs(2);

        let (_, fetch) = cache.get(&key, t0);
        let generation = fetch.unwrap().generation;

        cache.apply_page(&key, generation, page(&["a", "b"], Some("c2")), false, t1);
        let partial = cache.peek(&key, t1);
        assert_eq!(ids(&partial), ["a", "b"]);
        assert!(partial.loading);

        cache.apply_page(&key, generation, page(&["c", "b"], None), true, t2);
        let view = cache.peek(&key, t2);
        assert_eq!(ids(&view), ["a", "b", "c"]);
        assert_eq!(view.fetched_at, Some(t2));
        assert_eq!(view.freshness, Freshness::Fresh);
        assert!(!view.has_more);
        assert!(!view.loading);
    }

    #[test]
    fn test_stale_while_revalidate() {
        let mut cache = cache();
        let key = key(ResourceKind::Agent, "p");
        let t0 = Instant::now();
        load(&mut cache, &key, &["a", "b"], t0);

        let later = t0 + Duration::from_secs(31);
        let (view, fetch) = cache.get(&key, later);
        assert_eq!(view.freshness, Freshness::Stale);
        assert_eq!(ids(&view), ["a", "b"]);
        let fetch = fetch.expect("one refetch");

        for _ in 0..5 {
            let (view, again) = cache.get(&key, later);
            assert!(again.is_none());
            assert_eq!(ids(&view), ["a", "b"]);
        }

        // Revalidation pages are not shown until the sequence ends.
        cache.apply_page(&key, fetch.generation, page(&["x"], Some("2")), false, later);
        assert_eq!(ids(&cache.peek(&key, later)), ["a", "b"]);
        cache.apply_page(&key, fetch.generation, page(&["y"], None), true, later);
        let view = cache.peek(&key, later);
        assert_eq!(ids(&view), ["x", "y"]);
        assert_eq!(view.freshness, Freshness::Fresh);
    }

    #[test]
    fn test_invalidate_ignores_late_pages() {
        let mut cache = cache();
        let key = key(ResourceKind::Agent, "p");
        let now = Instant::now();
        load(&mut cache, &key, &["a"], now);

        let fetch = cache.refresh(&key, now);
        cache.invalidate(&key);
        assert!(!cache.apply_page(&key, fetch.generation, page(&["zzz"], None), true, now));
        assert_eq!(ids(&cache.peek(&key, now)), ["a"]);

        let (view, next) = cache.get(&key, now);
        assert_eq!(view.freshness, Freshness::Stale);
        assert!(next.is_some());
    }

    #[test]
    fn test_failure_keeps_last_known_good() {
        let mut cache = cache();
        let key = key(ResourceKind::Agent, "p");
        let now = Instant::now();
        load(&mut cache, &key, &["a", "b"], now);

        let fetch = cache.refresh(&key, now);
        cache.apply_page(&key, fetch.generation, page(&["c"], Some("2")), false, now);
        assert!(cache.fetch_failed(&key, fetch.generation, ApiError::Fatal("bad payload".into()), now));

        let (view, again) = cache.get(&key, now);
        assert_eq!(ids(&view), ["a", "b"]);
        assert_eq!(view.error, Some(ApiError::Fatal("bad payload".into())));
        // no hammering right after a failure
        assert!(again.is_none());
    }

    #[test]
    fn test_failed_listing_retries_after_threshold() {
        let mut cache = cache();
        let key = key(ResourceKind::Agent, "p");
        let t0 = Instant::now();

        let (_, fetch) = cache.get(&key, t0);
        let fetch = fetch.unwrap();
        let error = ApiError::NetworkTransient("connection reset".into());
        assert!(cache.fetch_failed(&key, fetch.generation, error.clone(), t0));

        let (view, again) = cache.get(&key, t0 + Duration::from_secs(29));
        assert_eq!(view.freshness, Freshness::Missing);
        assert!(again.is_none());

        let (view, retry) = cache.get(&key, t0 + Duration::from_secs(30));
        let retry = retry.expect("retried once the failure has rested");
        assert!(view.loading);
        // the error stays visible until the retry succeeds
        assert_eq!(view.error, Some(error));

        let later = t0 + Duration::from_secs(31);
        assert!(cache.apply_page(&key, retry.generation, page(&["a"], None), true, later));
        let view = cache.peek(&key, later);
        assert_eq!(ids(&view), ["a"]);
        assert_eq!(view.error, None);
    }

    #[test]
    fn test_confirmed_delete_drops_older_revalidation() {
        let mut cache = cache();
        let key = key(ResourceKind::Agent, "p");
        let now = Instant::now();
        load(&mut cache, &key, &["r1", "r2"], now);
        let target = ResourceRef::new(ResourceKind::Agent, Scope::new("p"), "r1");

        let fetch = cache.refresh(&key, now);
        cache.apply_optimistic(&target, ActionId(1), Operation::Delete);
        cache.reconcile(ActionId(1), Reconcile::Confirmed(None));
        assert_eq!(ids(&cache.peek(&key, now)), ["r2"]);

        // snapshot taken before the delete landed
        assert!(!cache.apply_page(&key, fetch.generation, page(&["r1", "r2"], None), true, now));
        let (view, reload) = cache.get(&key, now);
        assert_eq!(ids(&view), ["r2"]);
        assert_eq!(view.freshness, Freshness::Stale);
        assert!(reload.is_some());
    }

    #[test]
    fn test_confirmed_rename_drops_older_first_load() {
        let mut cache = cache();
        let key = key(ResourceKind::Agent, "p");
        let now = Instant::now();
        let target = ResourceRef::new(ResourceKind::Agent, Scope::new("p"), "r1");

        let (_, first) = cache.get(&key, now);
        let first = first.unwrap();
        cache.apply_page(&key, first.generation, page(&["r1"], Some("2")), false, now);
        cache.apply_optimistic(&target, ActionId(2), patch("name", "renamed"));
        cache.reconcile(ActionId(2), Reconcile::Confirmed(Some(ResourceItem::new("r1", "renamed"))));

        let stale = Page {
            items: vec![ResourceItem::new("r1", "r1")],
            next_cursor: None,
        };
        assert!(!cache.apply_page(&key, first.generation, stale, true, now));
        assert_eq!(cache.find_item(&target).unwrap().name, "renamed");
    }

    #[test]
    fn test_item_copies_count_toward_budget() {
        let mut cache = ResourceCache::new(CachePolicy {
            max_items_per_kind: 2,
            ..CachePolicy::default()
        });
        let at = |id: &str| ResourceRef::new(ResourceKind::Agent, Scope::new("p"), id);

        for id in ["a", "b", "c"] {
            cache.upsert_item(&at(id), ResourceItem::new(id, id));
        }

        assert_eq!(cache.item_count(ResourceKind::Agent), 2);
        assert!(cache.find_item(&at("a")).is_none());
        assert!(cache.find_item(&at("b")).is_some());
        assert!(cache.find_item(&at("c")).is_some());
    }

    #[test]
    fn test_listing_load_evicts_item_copies_first() {
        let mut cache = ResourceCache::new(CachePolicy {
            max_items_per_kind: 3,
            ..CachePolicy::default()
        });
        let now = Instant::now();
        let listing = key(ResourceKind::Agent, "p");
        let loose = ResourceRef::new(ResourceKind::Agent, Scope::new("q"), "x");
        cache.upsert_item(&loose, ResourceItem::new("x", "x"));

        load(&mut cache, &listing, &["a", "b", "c"], now);

        assert!(cache.contains(&listing));
        assert!(cache.find_item(&loose).is_none());
        assert_eq!(cache.item_count(ResourceKind::Agent), 3);
    }

    #[test]
    fn test_reverted_marker_cleared_by_any_completed_fetch() {
        let mut cache = ResourceCache::new(CachePolicy {
            max_pages_per_fetch: 1,
            ..CachePolicy::default()
        });
        let key = key(ResourceKind::Agent, "p");
        let now = Instant::now();
        let target = ResourceRef::new(ResourceKind::Agent, Scope::new("p"), "r1");

        let (_, fetch) = cache.get(&key, now);
        cache.apply_page(&key, fetch.unwrap().generation, page(&["r1"], Some("1")), true, now);
        cache.apply_optimistic(&target, ActionId(4), Operation::Delete);
        cache.reconcile(ActionId(4), Reconcile::Reverted);
        assert_eq!(cache.find_item(&target).unwrap().state, ItemState::Reverted);

        let more = cache.load_more(&key, now).unwrap();
        cache.apply_page(&key, more.generation, page(&["r2"], None), true, now);

        assert_eq!(cache.find_item(&target).unwrap().state, ItemState::Confirmed);
        assert!(cache.overlays.is_empty());
    }

    #[test]
    fn test_evicted_scope_forgets_reverted_markers() {
        let mut cache = ResourceCache::new(CachePolicy {
            max_items_per_kind: 2,
            ..CachePolicy::default()
        });
        let t0 = Instant::now();
        let old = key(ResourceKind::Agent, "p1");
        load(&mut cache, &old, &["a", "b"], t0);
        let target = ResourceRef::new(ResourceKind::Agent, Scope::new("p1"), "a");
        cache.apply_optimistic(&target, ActionId(5), patch("name", "alpha"));
        cache.reconcile(ActionId(5), Reconcile::Reverted);

        load(&mut cache, &key(ResourceKind::Agent, "p2"), &["c"], t0 + Duration::from_secs(1));

        assert!(!cache.contains(&old));
        assert!(cache.overlays.is_empty());
    }

    #[test]
    fn test_load_more_appends_from_cursor() {
        let mut cache = ResourceCache::new(CachePolicy {
            max_pages_per_fetch: 1,
            ..CachePolicy::default()
        });
        let key = key(ResourceKind::Dataset, "p");
        let now = Instant::now();

        let (_, fetch) = cache.get(&key, now);
        let fetch = fetch.unwrap();
        assert_eq!(fetch.max_pages, 1);
        cache.apply_page(&key, fetch.generation, page(&["a"], Some("1")), true, now);
        assert!(cache.peek(&key, now).has_more);

        let more = cache.load_more(&key, now).unwrap();
        assert_eq!(more.cursor, Some(Cursor("1".into())));
        cache.apply_page(&key, more.generation, page(&["b"], None), true, now);

        let view = cache.peek(&key, now);
        assert_eq!(ids(&view), ["a", "b"]);
        assert!(!view.has_more);
        assert!(cache.load_more(&key, now).is_none());
    }

    #[test]
    fn test_lru_eviction_per_kind() {
        let mut cache = ResourceCache::new(CachePolicy {
            max_items_per_kind: 4,
            ..CachePolicy::default()
        });
        let t0 = Instant::now();
        let first = key(ResourceKind::Agent, "p1");
        let second = key(ResourceKind::Agent, "p2");
        let third = key(ResourceKind::Agent, "p3");
        let other_kind = key(ResourceKind::Dataset, "p1");

        load(&mut cache, &first, &["a", "b"], t0);
        load(&mut cache, &second, &["c", "d"], t0 + Duration::from_secs(1));
        load(&mut cache, &other_kind, &["x", "y", "z"], t0);
        cache.get(&first, t0 + Duration::from_secs(2));

        load(&mut cache, &third, &["e"], t0 + Duration::from_secs(3));

        assert!(cache.contains(&first));
        assert!(!cache.contains(&second));
        assert!(cache.contains(&third));
        assert!(cache.contains(&other_kind));
        assert!(cache.item_count(ResourceKind::Agent) <= 4);
    }

    #[test]
    fn test_eviction_spares_pending_items() {
        let mut cache = ResourceCache::new(CachePolicy {
            max_items_per_kind: 2,
            ..CachePolicy::default()
        });
        let t0 = Instant::now();
        let old = key(ResourceKind::Agent, "p1");
        let new = key(ResourceKind::Agent, "p2");

        load(&mut cache, &old, &["a", "b"], t0);
        cache.apply_optimistic(
            &ResourceRef::new(ResourceKind::Agent, Scope::new("p1"), "a"),
            ActionId(1),
            Operation::Delete,
        );
        load(&mut cache, &new, &["c"], t0 + Duration::from_secs(1));

        assert!(cache.contains(&old));
        assert!(cache.contains(&new));
    }

    #[test]
    fn test_optimistic_update_and_confirm_is_idempotent() {
        let mut cache = cache();
        let key = key(ResourceKind::Agent, "p");
        let now = Instant::now();
        load(&mut cache, &key, &["r1", "r2"], now);
        let target = ResourceRef::new(ResourceKind::Agent, Scope::new("p"), "r1");

        cache.apply_optimistic(&target, ActionId(1), patch("name", "renamed"));
        let shown = cache.find_item(&target).unwrap();
        assert_eq!(shown.name, "renamed");
        assert_eq!(shown.state, ItemState::Optimistic { action: ActionId(1) });

        let server = ResourceItem::new("r1", "renamed").with_status("Ready");
        assert!(cache.reconcile(ActionId(1), Reconcile::Confirmed(Some(server.clone()))));
        let once = cache.peek(&key, now).items;

        assert!(!cache.reconcile(ActionId(1), Reconcile::Confirmed(Some(server.clone()))));
        let twice = cache.peek(&key, now).items;

        assert_eq!(once, twice);
        assert_eq!(once[0], server);
    }

    #[test]
    fn test_revert_restores_snapshot() {
        let mut cache = cache();
        let key = key(ResourceKind::Agent, "p");
        let now = Instant::now();
        load(&mut cache, &key, &["r1"], now);
        let target = ResourceRef::new(ResourceKind::Agent, Scope::new("p"), "r1");

        cache.apply_optimistic(&target, ActionId(7), Operation::Delete);
        assert_eq!(cache.find_item(&target).unwrap().status.as_deref(), Some("Deleting"));

        cache.reconcile(ActionId(7), Reconcile::Reverted);
        let restored = cache.find_item(&target).unwrap();
        assert_eq!(restored.status, None);
        assert_eq!(restored.name, "r1");
        assert_eq!(restored.state, ItemState::Reverted);
        assert!(!cache.has_pending(&target));
    }

    #[test]
    fn test_confirmed_delete_removes_item() {
        let mut cache = cache();
        let key = key(ResourceKind::Agent, "p");
        let now = Instant::now();
        load(&mut cache, &key, &["r1", "r2"], now);
        let target = ResourceRef::new(ResourceKind::Agent, Scope::new("p"), "r1");

        cache.apply_optimistic(&target, ActionId(1), Operation::Delete);
        cache.reconcile(ActionId(1), Reconcile::Confirmed(None));

        assert_eq!(ids(&cache.peek(&key, now)), ["r2"]);
    }

    #[test]
    fn test_create_placeholder_is_replaced() {
        let mut cache = cache();
        let key = key(ResourceKind::Agent, "p");
        let now = Instant::now();
        load(&mut cache, &key, &["a"], now);

        let placeholder = cache.apply_optimistic(
            &ResourceRef::new(ResourceKind::Agent, Scope::new("p"), ""),
            ActionId(3),
            Operation::Create {
                name: "fresh".into(),
                fields: BTreeMap::new(),
            },
        );
        assert_eq!(placeholder.id, "pending-3");
        let view = cache.peek(&key, now);
        assert_eq!(ids(&view), ["a", "pending-3"]);
        assert!(view.items[1].is_pending());

        cache.reconcile(
            ActionId(3),
            Reconcile::Confirmed(Some(ResourceItem::new("agent-42", "fresh"))),
        );
        assert_eq!(ids(&cache.peek(&key, now)), ["a", "agent-42"]);
    }

    #[test]
    fn test_refresh_refolds_pending_operations() {
        let mut cache = cache();
        let key = key(ResourceKind::Agent, "p");
        let now = Instant::now();
        load(&mut cache, &key, &["r1"], now);
        let target = ResourceRef::new(ResourceKind::Agent, Scope::new("p"), "r1");
        cache.apply_optimistic(&target, ActionId(1), patch("model", "gpt-4o-mini"));

        let fetch = cache.refresh(&key, now);
        let server = ResourceItem::new("r1", "server name").with_field("model", "gpt-4o");
        cache.apply_page(
            &key,
            fetch.generation,
            Page {
                items: vec![server],
                next_cursor: None,
            },
            true,
            now,
        );

        let shown = cache.find_item(&target).unwrap();
        assert_eq!(shown.name, "server name");
        assert_eq!(shown.field("model"), Some("gpt-4o-mini"));
        assert!(shown.is_pending());
    }

    #[test]
    fn test_change_signals_reach_subscribers() {
        let mut cache = cache();
        let key = key(ResourceKind::Agent, "p");
        let now = Instant::now();
        cache.subscribe(&key, ScreenId(1));
        cache.subscribe(&key, ScreenId(2));

        load(&mut cache, &key, &["a"], now);
        let changes = cache.drain_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].subscribers, vec![ScreenId(1), ScreenId(2)]);

        cache.unsubscribe_all(ScreenId(1));
        cache.invalidate(&key);
        let changes = cache.drain_changes();
        assert_eq!(changes[0].subscribers, vec![ScreenId(2)]);
        assert!(cache.drain_changes().is_empty());
    }

    #[test]
    fn test_upsert_and_remove_item() {
        let mut cache = cache();
        let key = key(ResourceKind::Agent, "p");
        let now = Instant::now();
        load(&mut cache, &key, &["a", "b"], now);
        let target = ResourceRef::new(ResourceKind::Agent, Scope::new("p"), "b");

        cache.upsert_item(&target, ResourceItem::new("b", "bravo").with_status("Active"));
        assert_eq!(cache.peek(&key, now).items[1].name, "bravo");

        cache.remove_item(&target);
        assert_eq!(ids(&cache.peek(&key, now)), ["a"]);
        assert!(cache.find_item(&target).is_none());
    }
}
