use std::collections::VecDeque;
use std::sync::Arc;

use crossterm::event::KeyEvent;
use ratatui::Frame;
use ratatui::layout::Rect;
use tracing::{info, warn};

use crate::Theme;
use crate::cache::{CollectionView, Freshness};
use crate::config::{self, KeyResolver, NavAction, ResourceAction, SearchAction};
use crate::model::{CollectionKey, ResourceItem, ResourceKind, Scope};
use crate::nav::{Screen, ScreenCtx, ScreenError, Transition};
use crate::screens::{HomeScreen, columns_for, describe_error, render_error};
use crate::ui::{self, Component, Handled, Keybinding, Spinner, Table, TableEvent};

/// Lists one level of the selection flow: subscriptions, then the Foundry
/// accounts of a subscription, then the projects of an account.
pub struct PickerScreen {
    kind: ResourceKind,
    key: CollectionKey,
    resolver: Arc<KeyResolver>,
    table: Table<ResourceItem>,
    spinner: Spinner,
    loading: bool,
    has_more: bool,
    error: Option<String>,
    /// Remaining `(kind, id)` steps of a scope being resumed.
    resume: VecDeque<(ResourceKind, String)>,
}

impl PickerScreen {
    pub fn new(kind: ResourceKind, scope: Scope, resolver: Arc<KeyResolver>) -> Self {
        let table = Table::new(columns_for(kind), Arc::clone(&resolver)).with_title(format!(" {} ", kind.display_name()));
        Self {
            kind,
            key: CollectionKey::new(kind, scope),
            resolver,
            table,
            spinner: Spinner::new(format!("Loading {}...", kind.display_name().to_lowercase())),
            loading: false,
            has_more: false,
            error: None,
            resume: VecDeque::new(),
        }
    }

    /// Picker for the subscriptions at the root of the hierarchy.
    pub fn root(resolver: Arc<KeyResolver>) -> Self {
        Self::new(ResourceKind::Subscription, Scope::root(), resolver)
    }

    /// Walks straight down to `scope` once entered, one level per step.
    #[must_use]
    pub fn resuming(mut self, scope: Option<Scope>) -> Self {
        self.resume = scope
            .map(|scope| {
                scope
                    .segments()
                    .into_iter()
                    .map(|(kind, id)| (kind, id.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        self
    }

    fn open(&mut self, id: &str) -> Transition {
        let scope = self.key.scope.child(self.kind, id);
        let rest = std::mem::take(&mut self.resume);
        match self.kind.child() {
            Some(child) => {
                let mut picker = Self::new(child, scope, Arc::clone(&self.resolver));
                picker.resume = rest;
                Transition::Push(Box::new(picker))
            }
            None => {
                info!(%scope, "Project selected");
                if let Err(err) = config::save_last_selection(scope.as_str()) {
                    warn!(error = %err, "Could not remember the selected project");
                }
                Transition::Push(Box::new(HomeScreen::new(scope, Arc::clone(&self.resolver))))
            }
        }
    }

    fn sync(&mut self, view: &CollectionView) {
        self.table.set_items(view.items.as_ref().clone());
        self.loading = view.loading && view.items.is_empty();
        self.has_more = view.has_more;
        self.error = view.error.as_ref().map(describe_error);
        let more = if view.has_more { " (more available)" } else { "" };
        self.table
            .set_title(format!(" {} [{}]{more} ", self.kind.display_name(), view.items.len()));
    }
}

impl Screen for PickerScreen {
    fn breadcrumb(&self) -> String {
        match self.key.scope.segments().last() {
            Some((_, id)) => format!("{id} › {}", self.kind.display_name()),
            None => self.kind.display_name().to_string(),
        }
    }

    fn on_enter(&mut self, ctx: &mut ScreenCtx<'_>) -> Result<(), ScreenError> {
        if let Some((kind, _)) = self.resume.front()
            && *kind != self.kind
        {
            return Err(ScreenError::Invalid(format!(
                "cannot resume at {kind}, expected {}",
                self.kind.path_segment()
            )));
        }
        let view = ctx.collection(&self.key);
        self.sync(&view);
        Ok(())
    }

    fn on_resume(&mut self, ctx: &mut ScreenCtx<'_>) {
        let view = ctx.collection(&self.key);
        self.sync(&view);
    }

    fn on_change(&mut self, key: &CollectionKey, ctx: &mut ScreenCtx<'_>) {
        if *key == self.key {
            let view = ctx.peek(key);
            self.sync(&view);
        }
    }

    fn on_tick(&mut self, ctx: &mut ScreenCtx<'_>) {
        if self.loading {
            self.spinner.on_tick();
        }
        // the cache decides whether a stale or failed listing is due again
        if ctx.peek(&self.key).freshness != Freshness::Fresh {
            let view = ctx.collection(&self.key);
            self.sync(&view);
        }
    }

    fn poll_transition(&mut self, _ctx: &mut ScreenCtx<'_>) -> Option<Transition> {
        let (_, id) = self.resume.pop_front()?;
        Some(self.open(&id))
    }

    fn handle_key(&mut self, key: KeyEvent, ctx: &mut ScreenCtx<'_>) -> ui::Result<Handled<Transition>> {
        if !self.table.is_searching() {
            if self.resolver.matches_resource(&key, ResourceAction::Refresh) {
                ctx.refresh(&self.key);
                return Ok(Handled::Consumed);
            }
            if self.resolver.matches_resource(&key, ResourceAction::LoadMore) {
                if !ctx.load_more(&self.key) {
                    ctx.toast(ui::Toast::info("Nothing more to load"));
                }
                return Ok(Handled::Consumed);
            }
        }

        Ok(match self.table.handle_key(key)? {
            Handled::Event(TableEvent::Activated(item)) => Handled::Event(self.open(&item.id)),
            Handled::Event(_) | Handled::Consumed => Handled::Consumed,
            Handled::Ignored => Handled::Ignored,
        })
    }

    fn show_error(&mut self, message: String) {
        self.error = Some(message);
    }

    fn render(&mut self, frame: &mut Frame, area: Rect, theme: &Theme) {
        if let Some(error) = &self.error
            && self.table.items().is_empty()
        {
            render_error(frame, area, theme, error);
        } else if self.loading {
            self.spinner.render(frame, area, theme);
        } else {
            self.table.render(frame, area, theme);
        }
    }

    fn keybindings(&self) -> Vec<Keybinding> {
        let mut bindings = vec![
            Keybinding::hint(self.resolver.display_nav(NavAction::Select), "Open"),
            Keybinding::hint(self.resolver.display_search(SearchAction::Toggle), "Search"),
            Keybinding::hint(self.resolver.display_resource(ResourceAction::Refresh), "Refresh"),
        ];
        if self.has_more {
            bindings.push(Keybinding::hint(
                self.resolver.display_resource(ResourceAction::LoadMore),
                "Load more",
            ));
        }
        bindings
    }
}
