//! Serialises mutating actions per resource.
//!
//! Every submission is shown optimistically in the cache at once. Per
//! resource only the oldest action is in flight; the rest wait in FIFO order
//! and go out when their predecessor resolves, whatever its outcome.

use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::ApiError;
use crate::cache::{Reconcile, ResourceCache};
use crate::model::{ActionId, Operation, ResourceItem, ResourceRef, ScreenId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStatus {
    Queued,
    InFlight,
}

/// Returned by `submit`; names the action and the item it affects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionHandle {
    pub id: ActionId,
    /// For creates this is the placeholder item.
    pub target: ResourceRef,
}

/// An action ready to be sent to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub action: ActionId,
    pub target: ResourceRef,
    pub operation: Operation,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub handle: ActionHandle,
    /// Present when nothing else was pending on the resource.
    pub dispatch: Option<Dispatch>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEvent {
    Confirmed {
        action: ActionId,
        target: ResourceRef,
        origin: ScreenId,
        verb: &'static str,
        item: Option<ResourceItem>,
        retries: u32,
    },
    Failed {
        action: ActionId,
        target: ResourceRef,
        origin: ScreenId,
        verb: &'static str,
        error: ApiError,
    },
    /// The next queued action may now go out.
    Send(Dispatch),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("{0} is still being created")]
    PendingCreate(ResourceRef),
    #[error("{0} cannot be modified from here")]
    Immutable(ResourceRef),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CancelError {
    #[error("action {0} was already sent and can only be awaited")]
    InFlight(ActionId),
    #[error("action {0} is not pending")]
    Unknown(ActionId),
}

#[derive(Debug)]
struct PendingAction {
    id: ActionId,
    operation: Operation,
    origin: ScreenId,
    submitted_at: Instant,
    status: ActionStatus,
}

pub struct ActionDispatcher {
    queues: HashMap<ResourceRef, VecDeque<PendingAction>>,
    index: HashMap<ActionId, ResourceRef>,
    next_id: u64,
    session: String,
}

impl Default for ActionDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionDispatcher {
    pub fn new() -> Self {
        Self::with_session(session_nonce())
    }

    /// Idempotency keys are `<session>-<action id>`.
    pub fn with_session(session: impl Into<String>) -> Self {
        Self {
            queues: HashMap::new(),
            index: HashMap::new(),
            next_id: 0,
            session: session.into(),
        }
    }

    /// Queues `operation` on `target` and applies its optimistic effect.
    ///
    /// # Errors
    /// Rejects targets that only exist as a pending create and kinds that
    /// cannot be modified.
    pub fn submit(
        &mut self,
        cache: &mut ResourceCache,
        target: &ResourceRef,
        operation: Operation,
        origin: ScreenId,
        now: Instant,
    ) -> Result<Submission, DispatchError> {
        if !target.kind.is_mutable() {
            return Err(DispatchError::Immutable(target.clone()));
        }
        let is_create = matches!(operation, Operation::Create { .. });
        if !is_create && target.id.starts_with("pending-") {
            return Err(DispatchError::PendingCreate(target.clone()));
        }

        self.next_id += 1;
        let id = ActionId(self.next_id);
        let affected = cache.apply_optimistic(target, id, operation.clone());

        let queue = self.queues.entry(affected.clone()).or_default();
        let status = if queue.is_empty() {
            ActionStatus::InFlight
        } else {
            ActionStatus::Queued
        };
        queue.push_back(PendingAction {
            id,
            operation: operation.clone(),
            origin,
            submitted_at: now,
            status,
        });
        self.index.insert(id, affected.clone());

        debug!(%id, target = %affected, verb = operation.verb(), ?status, "Action submitted");
        let dispatch = (status == ActionStatus::InFlight).then(|| self.dispatch(id, &affected, operation));

        Ok(Submission {
            handle: ActionHandle {
                id,
                target: affected,
            },
            dispatch,
        })
    }

    /// Resolves the in-flight action `action`.
    ///
    /// Events come in order: the outcome of `action`, then the next action
    /// on the same resource to send. Completing an action that is not in
    /// flight yields nothing.
    pub fn complete(
        &mut self,
        cache: &mut ResourceCache,
        action: ActionId,
        result: Result<Option<ResourceItem>, ApiError>,
        retries: u32,
        now: Instant,
    ) -> Vec<DispatchEvent> {
        let Some(target) = self.index.get(&action).cloned() else {
            return Vec::new();
        };
        let Some(queue) = self.queues.get_mut(&target) else {
            return Vec::new();
        };
        if !queue
            .front()
            .is_some_and(|front| front.id == action && front.status == ActionStatus::InFlight)
        {
            return Vec::new();
        }
        let Some(done) = queue.pop_front() else {
            return Vec::new();
        };
        self.index.remove(&action);

        let verb = done.operation.verb();
        let elapsed = now.saturating_duration_since(done.submitted_at);
        let mut events = Vec::with_capacity(2);

        match result {
            Ok(item) => {
                info!(%action, %target, verb, retries, ?elapsed, "Action confirmed");
                cache.reconcile(action, Reconcile::Confirmed(item.clone()));
                events.push(DispatchEvent::Confirmed {
                    action,
                    target: target.clone(),
                    origin: done.origin,
                    verb,
                    item,
                    retries,
                });
            }
            Err(error) => {
                warn!(%action, %target, verb, retries, %error, "Action failed");
                cache.reconcile(action, Reconcile::Reverted);
                if error.invalidates_cache() {
                    cache.invalidate_scope(target.kind, &target.scope);
                }
                events.push(DispatchEvent::Failed {
                    action,
                    target: target.clone(),
                    origin: done.origin,
                    verb,
                    error,
                });
            }
        }

        if let Some(next) = self.promote(&target) {
            events.push(DispatchEvent::Send(next));
        }
        events
    }

    /// Withdraws a queued action and rolls back its optimistic effect.
    ///
    /// # Errors
    /// An action already sent cannot be withdrawn.
    pub fn cancel(&mut self, cache: &mut ResourceCache, action: ActionId) -> Result<(), CancelError> {
        let target = self
            .index
            .get(&action)
            .cloned()
            .ok_or(CancelError::Unknown(action))?;
        let queue = self
            .queues
            .get_mut(&target)
            .ok_or(CancelError::Unknown(action))?;
        let position = queue
            .iter()
            .position(|pending| pending.id == action)
            .ok_or(CancelError::Unknown(action))?;
        if queue[position].status == ActionStatus::InFlight {
            return Err(CancelError::InFlight(action));
        }

        queue.remove(position);
        if queue.is_empty() {
            self.queues.remove(&target);
        }
        self.index.remove(&action);
        cache.reconcile(action, Reconcile::Reverted);
        debug!(%action, %target, "Action cancelled");
        Ok(())
    }

    pub fn status(&self, action: ActionId) -> Option<ActionStatus> {
        let target = self.index.get(&action)?;
        self.queues
            .get(target)?
            .iter()
            .find(|pending| pending.id == action)
            .map(|pending| pending.status)
    }

    /// Pending actions on `target`, oldest first.
    pub fn pending_on(&self, target: &ResourceRef) -> Vec<(ActionId, ActionStatus)> {
        self.queues
            .get(target)
            .map(|queue| queue.iter().map(|p| (p.id, p.status)).collect())
            .unwrap_or_default()
    }

    /// Newest queued (not yet sent) action on `target`.
    pub fn last_queued(&self, target: &ResourceRef) -> Option<ActionId> {
        self.queues.get(target)?.iter().rev().find_map(|pending| {
            (pending.status == ActionStatus::Queued).then_some(pending.id)
        })
    }

    pub fn in_flight_count(&self) -> usize {
        self.queues
            .values()
            .filter_map(VecDeque::front)
            .filter(|front| front.status == ActionStatus::InFlight)
            .count()
    }

    pub fn pending_count(&self) -> usize {
        self.index.len()
    }

    fn promote(&mut self, target: &ResourceRef) -> Option<Dispatch> {
        let Some(queue) = self.queues.get_mut(target) else {
            return None;
        };
        let Some(next) = queue.front_mut() else {
            self.queues.remove(target);
            return None;
        };
        next.status = ActionStatus::InFlight;
        let (id, operation) = (next.id, next.operation.clone());
        debug!(action = %id, %target, "Sending queued action");
        Some(self.dispatch(id, target, operation))
    }

    fn dispatch(&self, action: ActionId, target: &ResourceRef, operation: Operation) -> Dispatch {
        Dispatch {
            action,
            target: target.clone(),
            operation,
            idempotency_key: format!("{}-{}", self.session, action.0),
        }
    }
}

/// Random hex string identifying this process for idempotency keys.
fn session_nonce() -> String {
    let mut bytes = [0u8; 8];
    if getrandom::getrandom(&mut bytes).is_err() {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos());
        bytes = (nanos as u64).to_le_bytes();
    }
    bytes.iter().fold(String::with_capacity(16), |mut hex, byte| {
        let _ = write!(hex, "{byte:02x}");
        hex
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use super::*;
    use crate::cache::CachePolicy;
    use crate::model::{CollectionKey, Page, ResourceKind, Scope};

    fn setup() -> (ActionDispatcher, ResourceCache, CollectionKey) {
        let mut cache = ResourceCache::new(CachePolicy::default());
        let key = CollectionKey::new(ResourceKind::Agent, Scope::new("proj1"));
        let now = Instant::now();
        let (_, fetch) = cache.get(&key, now);
        cache.apply_page(
            &key,
            fetch.unwrap().generation,
            Page {
                items: vec![ResourceItem::new("r1", "one"), ResourceItem::new("r2", "two")],
                next_cursor: None,
            },
            true,
            now,
        );
        (ActionDispatcher::with_session("test"), cache, key)
    }

    fn r(id: &str) -> ResourceRef {
        ResourceRef::new(ResourceKind::Agent, Scope::new("proj1"), id)
    }

    fn rename(name: &str) -> Operation {
        let mut patch = BTreeMap::new();
        patch.insert("name".to_string(), name.to_string());
        Operation::Update { patch }
    }

    #[test]
    fn test_delete_waits_for_update() {
        let (mut dispatcher, mut cache, key) = setup();
        let now = Instant::now();

        let update = dispatcher
            .submit(&mut cache, &r("r1"), rename("uno"), ScreenId(1), now)
            .unwrap();
        let delete = dispatcher
            .submit(&mut cache, &r("r1"), Operation::Delete, ScreenId(1), now)
            .unwrap();

        assert!(update.dispatch.is_some());
        assert!(delete.dispatch.is_none());
        assert_eq!(dispatcher.status(delete.handle.id), Some(ActionStatus::Queued));

        // Both optimistic effects are visible at once.
        let shown = cache.find_item(&r("r1")).unwrap();
        assert_eq!(shown.name, "uno");
        assert_eq!(shown.status.as_deref(), Some("Deleting"));

        let events = dispatcher.complete(
            &mut cache,
            update.handle.id,
            Ok(Some(ResourceItem::new("r1", "uno"))),
            0,
            now,
        );
        assert!(matches!(events[0], DispatchEvent::Confirmed { .. }));
        match &events[1] {
            DispatchEvent::Send(dispatch) => {
                assert_eq!(dispatch.action, delete.handle.id);
                assert_eq!(dispatch.operation, Operation::Delete);
            }
            other => panic!("expected send, got {other:?}"),
        }

        dispatcher.complete(&mut cache, delete.handle.id, Ok(None), 0, now);
        let ids: Vec<_> = cache.peek(&key, now).items.iter().map(|i| i.id.clone()).collect();
        assert_eq!(ids, ["r2"]);
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[test]
    fn test_predecessor_failure_surfaces_first() {
        let (mut dispatcher, mut cache, key) = setup();
        let now = Instant::now();

        let update = dispatcher
            .submit(&mut cache, &r("r1"), rename("uno"), ScreenId(1), now)
            .unwrap();
        let delete = dispatcher
            .submit(&mut cache, &r("r1"), Operation::Delete, ScreenId(1), now)
            .unwrap();
        cache.drain_changes();

        let events = dispatcher.complete(
            &mut cache,
            update.handle.id,
            Err(ApiError::Conflict("etag mismatch".into())),
            0,
            now,
        );

        assert!(matches!(
            &events[0],
            DispatchEvent::Failed { error: ApiError::Conflict(_), .. }
        ));
        assert!(matches!(&events[1], DispatchEvent::Send(d) if d.action == delete.handle.id));

        // The rename is rolled back; the delete is still shown.
        let shown = cache.find_item(&r("r1")).unwrap();
        assert_eq!(shown.name, "one");
        assert_eq!(shown.status.as_deref(), Some("Deleting"));

        // Conflicts mark the listing for reload.
        let (_, fetch) = cache.get(&key, now);
        assert!(fetch.is_some());
    }

    #[test]
    fn test_cancel_queued_action() {
        let (mut dispatcher, mut cache, _) = setup();
        let now = Instant::now();

        let update = dispatcher
            .submit(&mut cache, &r("r1"), rename("uno"), ScreenId(1), now)
            .unwrap();
        let delete = dispatcher
            .submit(&mut cache, &r("r1"), Operation::Delete, ScreenId(1), now)
            .unwrap();

        assert_eq!(
            dispatcher.cancel(&mut cache, update.handle.id),
            Err(CancelError::InFlight(update.handle.id))
        );
        assert_eq!(dispatcher.cancel(&mut cache, delete.handle.id), Ok(()));
        assert_eq!(cache.find_item(&r("r1")).unwrap().status, None);

        let events = dispatcher.complete(&mut cache, update.handle.id, Ok(None), 0, now);
        assert_eq!(events.len(), 1);
        assert_eq!(
            dispatcher.cancel(&mut cache, delete.handle.id),
            Err(CancelError::Unknown(delete.handle.id))
        );
    }

    #[test]
    fn test_create_uses_placeholder_and_idempotency_key() {
        let (mut dispatcher, mut cache, _) = setup();
        let now = Instant::now();
        let create = Operation::Create {
            name: "new".into(),
            fields: BTreeMap::new(),
        };

        let submission = dispatcher
            .submit(&mut cache, &r(""), create, ScreenId(1), now)
            .unwrap();
        let dispatch = submission.dispatch.unwrap();
        assert_eq!(submission.handle.target.id, "pending-1");
        assert_eq!(dispatch.idempotency_key, "test-1");

        assert_eq!(
            dispatcher
                .submit(&mut cache, &submission.handle.target, Operation::Delete, ScreenId(1), now)
                .unwrap_err(),
            DispatchError::PendingCreate(submission.handle.target.clone())
        );
    }

    #[test]
    fn test_immutable_kinds_are_rejected() {
        let (mut dispatcher, mut cache, _) = setup();
        let connection = ResourceRef::new(ResourceKind::Connection, Scope::new("proj1"), "c1");
        let result = dispatcher.submit(&mut cache, &connection, Operation::Delete, ScreenId(1), Instant::now());
        assert!(matches!(result, Err(DispatchError::Immutable(_))));
    }

    #[test]
    fn test_completion_is_idempotent() {
        let (mut dispatcher, mut cache, _) = setup();
        let now = Instant::now();
        let update = dispatcher
            .submit(&mut cache, &r("r2"), rename("dos"), ScreenId(1), now)
            .unwrap();

        let first = dispatcher.complete(&mut cache, update.handle.id, Ok(Some(ResourceItem::new("r2", "dos"))), 1, now);
        let second = dispatcher.complete(&mut cache, update.handle.id, Ok(Some(ResourceItem::new("r2", "dos"))), 1, now);

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert_eq!(cache.find_item(&r("r2")).unwrap().name, "dos");
    }

    #[derive(Debug, Clone)]
    enum Step {
        Submit(usize),
        Complete(usize, bool),
        Cancel(usize),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (0usize..3).prop_map(Step::Submit),
            ((0usize..3), any::<bool>()).prop_map(|(i, ok)| Step::Complete(i, ok)),
            (0usize..3).prop_map(Step::Cancel),
        ]
    }

    proptest! {
        #[test]
        fn test_single_flight_fifo(steps in prop::collection::vec(step(), 1..60)) {
            let (mut dispatcher, mut cache, _) = setup();
            let now = Instant::now();
            let targets = [r("r1"), r("r2"), r("r3")];
            // Submitted, not cancelled, not yet sent; in submission order.
            let mut waiting: Vec<VecDeque<ActionId>> = vec![VecDeque::new(); 3];
            let mut in_flight: Vec<Option<ActionId>> = vec![None; 3];

            for step in steps {
                match step {
                    Step::Submit(i) => {
                        let submission = dispatcher
                            .submit(&mut cache, &targets[i], rename("x"), ScreenId(1), now)
                            .unwrap();
                        match submission.dispatch {
                            Some(d) => {
                                prop_assert!(in_flight[i].is_none());
                                in_flight[i] = Some(d.action);
                            }
                            None => waiting[i].push_back(submission.handle.id),
                        }
                    }
                    Step::Complete(i, ok) => {
                        let Some(action) = in_flight[i] else { continue };
                        let result = if ok { Ok(None) } else { Err(ApiError::Fatal("x".into())) };
                        let events = dispatcher.complete(&mut cache, action, result, 0, now);
                        in_flight[i] = None;
                        let sent: Vec<ActionId> = events
                            .iter()
                            .filter_map(|e| match e {
                                DispatchEvent::Send(d) => Some(d.action),
                                _ => None,
                            })
                            .collect();
                        // FIFO: the next one sent is the oldest waiting.
                        prop_assert_eq!(sent.first().copied(), waiting[i].pop_front());
                        in_flight[i] = sent.first().copied();
                    }
                    Step::Cancel(i) => {
                        if let Some(action) = waiting[i].pop_back() {
                            prop_assert!(dispatcher.cancel(&mut cache, action).is_ok());
                        }
                    }
                }

                for (i, target) in targets.iter().enumerate() {
                    let flying = dispatcher
                        .pending_on(target)
                        .iter()
                        .filter(|(_, status)| *status == ActionStatus::InFlight)
                        .count();
                    prop_assert!(flying <= 1);
                    prop_assert_eq!(flying == 1, in_flight[i].is_some());
                }
            }
        }
    }
}
