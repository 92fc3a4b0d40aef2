//! Stack of full-page screens with an explicit lifecycle per slot.
//!
//! Every slot moves through `Created → Active → Suspended ⇄ Active →
//! Destroyed`, and only stack operations move it. Hooks run synchronously on
//! the event loop; anything slow they need (fetching, mutating) is recorded in
//! [`Effects`] and carried out by the app after the hook returns, so a push
//! never waits for data.
//!
//! Whenever the stack is non-empty exactly one screen, the top, is `Active`
//! and every other is `Suspended`.

use std::fmt;

use crossterm::event::KeyEvent;
use ratatui::Frame;
use ratatui::layout::Rect;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::Theme;
use crate::api::ApiError;
use crate::cache::{CachePolicy, ChangeSignal, CollectionView, FetchRequest, ResourceCache};
use crate::commands::Command;
use crate::dispatch::{ActionDispatcher, ActionHandle, ActionStatus, CancelError, Dispatch, DispatchError, DispatchEvent};
use crate::model::{ActionId, CollectionKey, Operation, ResourceItem, ResourceRef, ScreenId};
use crate::ui::{self, Handled, Keybinding, Toast};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Active,
    Suspended,
    Destroyed,
}

impl Lifecycle {
    pub const fn can_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Active | Self::Destroyed)
                | (Self::Active, Self::Suspended | Self::Destroyed)
                | (Self::Suspended, Self::Active | Self::Destroyed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScreenError {
    #[error("{0} is no longer available")]
    Missing(ResourceRef),
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Requests the active screen makes of the stack.
pub enum Transition {
    Push(Box<dyn Screen>),
    Pop,
    Replace(Box<dyn Screen>),
    Quit,
}

impl fmt::Debug for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Push(screen) => write!(f, "Push({})", screen.breadcrumb()),
            Self::Pop => f.write_str("Pop"),
            Self::Replace(screen) => write!(f, "Replace({})", screen.breadcrumb()),
            Self::Quit => f.write_str("Quit"),
        }
    }
}

/// Whether the app keeps running after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopOutcome {
    /// The root was popped.
    Empty,
    Resumed(ScreenId),
}

/// A single-item fetch requested by a screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFetch {
    pub origin: ScreenId,
    pub target: ResourceRef,
}

/// Side effects collected while screens handle events.
#[derive(Default)]
pub struct Effects {
    pub fetches: Vec<FetchRequest>,
    pub item_fetches: Vec<ItemFetch>,
    pub dispatches: Vec<Dispatch>,
    pub commands: Vec<Box<dyn Command>>,
    pub toasts: Vec<Toast>,
}

impl Effects {
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    pub fn is_empty(&self) -> bool {
        self.fetches.is_empty()
            && self.item_fetches.is_empty()
            && self.dispatches.is_empty()
            && self.commands.is_empty()
            && self.toasts.is_empty()
    }
}

/// State the event loop owns and lends to screens.
pub struct Services {
    pub cache: ResourceCache,
    pub dispatcher: ActionDispatcher,
    pub effects: Effects,
    pub now: Instant,
}

impl Services {
    pub fn new(policy: CachePolicy, dispatcher: ActionDispatcher) -> Self {
        Self {
            cache: ResourceCache::new(policy),
            dispatcher,
            effects: Effects::default(),
            now: Instant::now(),
        }
    }
}

/// What a screen hook gets to work with: its own id and the shared services.
pub struct ScreenCtx<'a> {
    id: ScreenId,
    services: &'a mut Services,
}

impl<'a> ScreenCtx<'a> {
    pub const fn new(id: ScreenId, services: &'a mut Services) -> Self {
        Self { id, services }
    }

    pub const fn id(&self) -> ScreenId {
        self.id
    }

    pub const fn now(&self) -> Instant {
        self.services.now
    }

    pub const fn cache(&self) -> &ResourceCache {
        &self.services.cache
    }

    /// Current view of `key`. Subscribes this screen to its changes and
    /// schedules a fetch when the cache has nothing fresh.
    pub fn collection(&mut self, key: &CollectionKey) -> CollectionView {
        let services = &mut *self.services;
        services.cache.subscribe(key, self.id);
        let (view, fetch) = services.cache.get(key, services.now);
        services.effects.fetches.extend(fetch);
        view
    }

    pub fn peek(&self, key: &CollectionKey) -> CollectionView {
        self.services.cache.peek(key, self.services.now)
    }

    /// Refetches `key` from the first page even if it is fresh.
    pub fn refresh(&mut self, key: &CollectionKey) {
        let services = &mut *self.services;
        let fetch = services.cache.refresh(key, services.now);
        services.effects.fetches.push(fetch);
    }

    /// Continues `key` from its stored cursor. False when there is nothing
    /// more to load or a fetch is already running.
    pub fn load_more(&mut self, key: &CollectionKey) -> bool {
        let services = &mut *self.services;
        match services.cache.load_more(key, services.now) {
            Some(fetch) => {
                services.effects.fetches.push(fetch);
                true
            }
            None => false,
        }
    }

    pub fn fetch_item(&mut self, target: ResourceRef) {
        self.services.effects.item_fetches.push(ItemFetch {
            origin: self.id,
            target,
        });
    }

    pub fn find_item(&self, target: &ResourceRef) -> Option<ResourceItem> {
        self.services.cache.find_item(target)
    }

    /// Submits a mutation on behalf of this screen; its outcome comes back
    /// through [`Screen::on_action`].
    ///
    /// # Errors
    /// See [`ActionDispatcher::submit`].
    pub fn submit(&mut self, target: &ResourceRef, operation: Operation) -> Result<ActionHandle, DispatchError> {
        let services = &mut *self.services;
        let submission =
            services
                .dispatcher
                .submit(&mut services.cache, target, operation, self.id, services.now)?;
        services.effects.dispatches.extend(submission.dispatch);
        Ok(submission.handle)
    }

    /// # Errors
    /// See [`ActionDispatcher::cancel`].
    pub fn cancel(&mut self, action: ActionId) -> Result<(), CancelError> {
        let services = &mut *self.services;
        services.dispatcher.cancel(&mut services.cache, action)
    }

    pub fn pending_on(&self, target: &ResourceRef) -> Vec<(ActionId, ActionStatus)> {
        self.services.dispatcher.pending_on(target)
    }

    pub fn run(&mut self, command: impl Command) {
        self.services.effects.commands.push(Box::new(command));
    }

    pub fn toast(&mut self, toast: Toast) {
        self.services.effects.toasts.push(toast);
    }
}

/// A full-page view on the stack.
///
/// Hooks receive a [`ScreenCtx`]; a screen reads data only through it and
/// keeps its own snapshot for rendering.
pub trait Screen {
    /// Label of this screen in the breadcrumb trail.
    fn breadcrumb(&self) -> String;

    /// Runs once when the screen is pushed. An error discards the screen
    /// and reports the error to the screen below.
    fn on_enter(&mut self, ctx: &mut ScreenCtx<'_>) -> Result<(), ScreenError>;

    fn on_suspend(&mut self, ctx: &mut ScreenCtx<'_>) {
        _ = ctx;
    }

    /// Back on top; a good place to re-check freshness.
    fn on_resume(&mut self, ctx: &mut ScreenCtx<'_>) {
        _ = ctx;
    }

    fn on_exit(&mut self, ctx: &mut ScreenCtx<'_>) {
        _ = ctx;
    }

    fn handle_key(&mut self, key: KeyEvent, ctx: &mut ScreenCtx<'_>) -> ui::Result<Handled<Transition>>;

    fn on_tick(&mut self, ctx: &mut ScreenCtx<'_>) {
        _ = ctx;
    }

    /// Transition the screen wants without a key press, e.g. a timeout.
    /// Polled after every event until it returns `None`.
    fn poll_transition(&mut self, ctx: &mut ScreenCtx<'_>) -> Option<Transition> {
        _ = ctx;
        None
    }

    /// A listing this screen subscribed to changed.
    fn on_change(&mut self, key: &CollectionKey, ctx: &mut ScreenCtx<'_>) {
        _ = (key, ctx);
    }

    /// Answer to a [`ScreenCtx::fetch_item`] request.
    fn on_item(&mut self, target: &ResourceRef, result: &Result<ResourceItem, ApiError>, ctx: &mut ScreenCtx<'_>) {
        _ = (target, result, ctx);
    }

    /// Outcome of an action this screen submitted.
    fn on_action(&mut self, event: &DispatchEvent, ctx: &mut ScreenCtx<'_>) {
        _ = (event, ctx);
    }

    /// Shows an error inline, e.g. after a screen pushed from here failed.
    fn show_error(&mut self, message: String);

    fn render(&mut self, frame: &mut Frame, area: Rect, theme: &Theme);

    fn keybindings(&self) -> Vec<Keybinding> {
        Vec::new()
    }
}

struct Slot {
    id: ScreenId,
    state: Lifecycle,
    screen: Box<dyn Screen>,
}

impl Slot {
    fn advance(&mut self, next: Lifecycle) {
        debug_assert!(
            self.state.can_become(next),
            "screen {:?} cannot go from {:?} to {:?}",
            self.id,
            self.state,
            next
        );
        debug!(screen = self.id.0, from = ?self.state, to = ?next, "Screen lifecycle");
        self.state = next;
    }

    fn destroy(mut self, services: &mut Services) {
        self.screen.on_exit(&mut ScreenCtx::new(self.id, services));
        self.advance(Lifecycle::Destroyed);
        // late fetch results for this screen become no-ops
        services.cache.unsubscribe_all(self.id);
    }
}

#[derive(Default)]
pub struct NavigationStack {
    slots: Vec<Slot>,
    next_id: u64,
}

impl NavigationStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    pub fn active_id(&self) -> Option<ScreenId> {
        self.slots.last().map(|slot| slot.id)
    }

    pub fn contains(&self, id: ScreenId) -> bool {
        self.slots.iter().any(|slot| slot.id == id)
    }

    /// `(id, state)` of every slot, bottom first.
    pub fn states(&self) -> Vec<(ScreenId, Lifecycle)> {
        self.slots.iter().map(|slot| (slot.id, slot.state)).collect()
    }

    pub fn breadcrumbs(&self) -> Vec<String> {
        self.slots.iter().map(|slot| slot.screen.breadcrumb()).collect()
    }

    pub fn keybindings(&self) -> Vec<Keybinding> {
        self.slots
            .last()
            .map(|slot| slot.screen.keybindings())
            .unwrap_or_default()
    }

    /// Suspends the current top and enters `screen` above it.
    ///
    /// # Errors
    /// Returns the enter hook's error after the screen was discarded and the
    /// previous top resumed.
    pub fn push(&mut self, screen: Box<dyn Screen>, services: &mut Services) -> Result<ScreenId, ScreenError> {
        if let Some(top) = self.slots.last_mut() {
            top.advance(Lifecycle::Suspended);
            top.screen.on_suspend(&mut ScreenCtx::new(top.id, services));
        }
        self.push_created(screen);
        self.enter_top(services)
    }

    /// Destroys the top and resumes the one below it.
    pub fn pop(&mut self, services: &mut Services) -> PopOutcome {
        let Some(slot) = self.slots.pop() else {
            return PopOutcome::Empty;
        };
        slot.destroy(services);
        self.resume_top(services).map_or(PopOutcome::Empty, PopOutcome::Resumed)
    }

    /// Destroys the top and enters `screen` in its place. The screen below
    /// stays suspended throughout.
    ///
    /// # Errors
    /// As for [`NavigationStack::push`]; the replaced screen is gone either way.
    pub fn replace(&mut self, screen: Box<dyn Screen>, services: &mut Services) -> Result<ScreenId, ScreenError> {
        if let Some(slot) = self.slots.pop() {
            slot.destroy(services);
        }
        self.push_created(screen);
        self.enter_top(services)
    }

    /// Applies a screen's transition request.
    ///
    /// # Errors
    /// Only when a failed enter left the stack empty.
    pub fn apply(&mut self, transition: Transition, services: &mut Services) -> Result<Flow, ScreenError> {
        debug!(?transition, "Applying transition");
        let entered = match transition {
            Transition::Push(screen) => self.push(screen, services),
            Transition::Replace(screen) => self.replace(screen, services),
            Transition::Pop => {
                return Ok(match self.pop(services) {
                    PopOutcome::Empty => Flow::Quit,
                    PopOutcome::Resumed(_) => Flow::Continue,
                });
            }
            Transition::Quit => return Ok(Flow::Quit),
        };
        match entered {
            Ok(_) => Ok(Flow::Continue),
            Err(error) if self.is_empty() => Err(error),
            // already reported to the new top
            Err(_) => Ok(Flow::Continue),
        }
    }

    /// Pops everything, running every exit hook.
    pub fn clear(&mut self, services: &mut Services) {
        while let Some(slot) = self.slots.pop() {
            slot.destroy(services);
        }
    }

    pub fn handle_key(&mut self, key: KeyEvent, services: &mut Services) -> ui::Result<Handled<Transition>> {
        match self.slots.last_mut() {
            Some(top) => top.screen.handle_key(key, &mut ScreenCtx::new(top.id, services)),
            None => Ok(Handled::Ignored),
        }
    }

    pub fn tick(&mut self, services: &mut Services) {
        if let Some(top) = self.slots.last_mut() {
            top.screen.on_tick(&mut ScreenCtx::new(top.id, services));
        }
    }

    pub fn poll_transition(&mut self, services: &mut Services) -> Option<Transition> {
        let top = self.slots.last_mut()?;
        top.screen.poll_transition(&mut ScreenCtx::new(top.id, services))
    }

    /// Forwards a cache change to the subscribed screens still on the stack.
    pub fn notify(&mut self, signal: &ChangeSignal, services: &mut Services) {
        for slot in &mut self.slots {
            if signal.subscribers.contains(&slot.id) {
                slot.screen.on_change(&signal.key, &mut ScreenCtx::new(slot.id, services));
            }
        }
    }

    /// Runs `f` on screen `id`. Returns false when that screen is gone.
    pub fn with_screen(
        &mut self,
        id: ScreenId,
        services: &mut Services,
        f: impl FnOnce(&mut dyn Screen, &mut ScreenCtx<'_>),
    ) -> bool {
        match self.slots.iter_mut().find(|slot| slot.id == id) {
            Some(slot) => {
                f(slot.screen.as_mut(), &mut ScreenCtx::new(slot.id, services));
                true
            }
            None => false,
        }
    }

    pub fn render(&mut self, frame: &mut Frame, area: Rect, theme: &Theme) {
        if let Some(top) = self.slots.last_mut() {
            top.screen.render(frame, area, theme);
        }
    }

    fn push_created(&mut self, screen: Box<dyn Screen>) {
        self.next_id += 1;
        let id = ScreenId(self.next_id);
        debug!(screen = id.0, name = %screen.breadcrumb(), "Screen created");
        self.slots.push(Slot {
            id,
            state: Lifecycle::Created,
            screen,
        });
    }

    fn enter_top(&mut self, services: &mut Services) -> Result<ScreenId, ScreenError> {
        let Some(top) = self.slots.last_mut() else {
            return Err(ScreenError::Invalid("nothing to enter".to_string()));
        };
        let id = top.id;
        match top.screen.on_enter(&mut ScreenCtx::new(id, services)) {
            Ok(()) => {
                top.advance(Lifecycle::Active);
                Ok(id)
            }
            Err(error) => {
                warn!(screen = id.0, %error, "Screen failed to enter, discarding it");
                if let Some(failed) = self.slots.pop() {
                    failed.destroy(services);
                }
                if let Some(resumed) = self.resume_top(services)
                    && let Some(top) = self.slots.last_mut()
                {
                    debug_assert_eq!(top.id, resumed);
                    top.screen.show_error(error.to_string());
                }
                Err(error)
            }
        }
    }

    fn resume_top(&mut self, services: &mut Services) -> Option<ScreenId> {
        let top = self.slots.last_mut()?;
        top.advance(Lifecycle::Active);
        top.screen.on_resume(&mut ScreenCtx::new(top.id, services));
        Some(top.id)
    }
}
