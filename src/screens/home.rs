use std::collections::BTreeMap;
use std::sync::Arc;

use crossterm::event::KeyEvent;
use ratatui::Frame;
use ratatui::layout::{Constraint, Layout, Rect};
use ratatui::style::{Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, BorderType, Borders, Paragraph, Wrap};
use tracing::debug;

use crate::Theme;
use crate::cache::{CollectionView, Freshness};
use crate::commands::CopyToClipboardCmd;
use crate::config::{KeyResolver, NavAction, ResourceAction, SearchAction};
use crate::dispatch::{ActionStatus, CancelError, DispatchEvent};
use crate::model::{CollectionKey, ItemState, Operation, ResourceItem, ResourceKind, ResourceRef, Scope};
use crate::nav::{Screen, ScreenCtx, ScreenError, Transition};
use crate::screens::{DetailScreen, columns_for, describe_error, render_error};
use crate::ui::{
    self, Component, ConfirmDialog, ConfirmEvent, Handled, Keybinding, Spinner, Table, TableEvent,
    TextInput, TextInputEvent, Toast,
};

const SIDEBAR_WIDTH: u16 = 22;
const PREVIEW_HEIGHT: u16 = 9;

enum Modal {
    Create(TextInput),
    Rename { target: ResourceRef, input: TextInput },
    Delete { target: ResourceRef, dialog: ConfirmDialog },
}

/// Resource browser of one project: a sidebar of kinds, the listing of the
/// selected kind and a preview of the highlighted item.
pub struct HomeScreen {
    scope: Scope,
    resolver: Arc<KeyResolver>,
    kind_index: usize,
    table: Table<ResourceItem>,
    spinner: Spinner,
    loading: bool,
    has_more: bool,
    error: Option<String>,
    /// Last failed action of this screen, cleared by the next key.
    action_error: Option<String>,
    modal: Option<Modal>,
}

impl HomeScreen {
    pub fn new(scope: Scope, resolver: Arc<KeyResolver>) -> Self {
        let kind = ResourceKind::PROJECT_KINDS[0];
        Self {
            scope,
            table: Table::new(columns_for(kind), Arc::clone(&resolver)),
            resolver,
            kind_index: 0,
            spinner: Spinner::default(),
            loading: false,
            has_more: false,
            error: None,
            action_error: None,
            modal: None,
        }
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::PROJECT_KINDS[self.kind_index]
    }

    fn key(&self) -> CollectionKey {
        CollectionKey::new(self.kind(), self.scope.clone())
    }

    fn target(&self, item: &ResourceItem) -> ResourceRef {
        ResourceRef::new(self.kind(), self.scope.clone(), item.id.clone())
    }

    fn project_name(&self) -> &str {
        self.scope.segments().last().map_or("project", |(_, id)| id)
    }

    fn sync(&mut self, view: &CollectionView) {
        self.table.set_items(view.items.as_ref().clone());
        self.loading = view.loading && view.items.is_empty();
        self.has_more = view.has_more;
        self.error = view.error.as_ref().map(describe_error);

        let mut title = format!(" {} [{}]", self.kind().display_name(), view.items.len());
        if view.has_more {
            title.push_str(" +more");
        }
        if view.loading {
            title.push_str(" · refreshing");
        } else if view.freshness == Freshness::Stale {
            title.push_str(" · stale");
        }
        title.push(' ');
        self.table.set_title(title);
    }

    fn switch_kind(&mut self, index: usize, ctx: &mut ScreenCtx<'_>) {
        self.kind_index = index % ResourceKind::PROJECT_KINDS.len();
        let kind = self.kind();
        debug!(%kind, scope = %self.scope, "Switching resource kind");
        self.spinner
            .set_label(format!("Loading {}...", kind.display_name().to_lowercase()));
        self.table.reset(columns_for(kind), Vec::new());
        self.table
            .set_empty_message(format!("No {} in this project", kind.display_name().to_lowercase()));
        let view = ctx.collection(&self.key());
        self.sync(&view);
    }

    fn require_mutable(&self, ctx: &mut ScreenCtx<'_>) -> bool {
        let kind = self.kind();
        if !kind.is_mutable() {
            ctx.toast(Toast::info(format!("{} are read-only here", kind.display_name())));
        }
        kind.is_mutable()
    }

    fn cancel_queued(&self, ctx: &mut ScreenCtx<'_>) {
        let Some(item) = self.table.selected_item() else {
            return;
        };
        let target = self.target(item);
        let pending = ctx.pending_on(&target);
        let queued = pending
            .iter()
            .rev()
            .find(|(_, status)| *status == ActionStatus::Queued)
            .map(|(id, _)| *id);

        let toast = match (queued, pending.first()) {
            (Some(action), _) => match ctx.cancel(action) {
                Ok(()) => Toast::info(format!("Cancelled action {action}")),
                Err(err) => Toast::error(err.to_string()),
            },
            (None, Some((action, _))) => Toast::error(CancelError::InFlight(*action).to_string()),
            (None, None) => Toast::info(format!("Nothing pending on {}", item.name)),
        };
        ctx.toast(toast);
    }

    fn handle_modal_key(&mut self, modal: Modal, key: KeyEvent, ctx: &mut ScreenCtx<'_>) -> ui::Result<()> {
        let kind = self.kind();
        match modal {
            Modal::Create(mut input) => match input.handle_key(key)? {
                Handled::Event(TextInputEvent::Submitted(name)) if !name.is_empty() => {
                    let target = ResourceRef::new(kind, self.scope.clone(), "");
                    let operation = Operation::Create {
                        name,
                        fields: BTreeMap::new(),
                    };
                    submit(&target, operation, ctx);
                }
                Handled::Event(_) => {}
                Handled::Consumed | Handled::Ignored => self.modal = Some(Modal::Create(input)),
            },
            Modal::Rename { target, mut input } => match input.handle_key(key)? {
                Handled::Event(TextInputEvent::Submitted(name)) if !name.is_empty() => {
                    let patch = BTreeMap::from([("name".to_string(), name)]);
                    submit(&target, Operation::Update { patch }, ctx);
                }
                Handled::Event(_) => {}
                Handled::Consumed | Handled::Ignored => self.modal = Some(Modal::Rename { target, input }),
            },
            Modal::Delete { target, mut dialog } => match dialog.handle_key(key)? {
                Handled::Event(ConfirmEvent::Confirmed) => submit(&target, Operation::Delete, ctx),
                Handled::Event(ConfirmEvent::Cancelled) => {}
                Handled::Consumed | Handled::Ignored => self.modal = Some(Modal::Delete { target, dialog }),
            },
        }
        Ok(())
    }

    /// Resource keys; `None` when `key` is not one of them.
    fn handle_resource_key(&mut self, key: KeyEvent, ctx: &mut ScreenCtx<'_>) -> Option<Handled<Transition>> {
        let resolver = Arc::clone(&self.resolver);
        let pressed = |action| resolver.matches_resource(&key, action);
        let kind = self.kind();

        if pressed(ResourceAction::Refresh) {
            ctx.refresh(&self.key());
        } else if pressed(ResourceAction::LoadMore) {
            if !ctx.load_more(&self.key()) {
                ctx.toast(Toast::info("Nothing more to load"));
            }
        } else if pressed(ResourceAction::New) {
            if self.require_mutable(ctx) {
                let input = TextInput::new(format!("New {} name", kind.singular()))
                    .with_placeholder(format!("my-{}", kind.singular()));
                self.modal = Some(Modal::Create(input));
            }
        } else if pressed(ResourceAction::Rename) {
            let item = self.table.selected_item()?.clone();
            if self.require_mutable(ctx) {
                let input = TextInput::new(format!("Rename {}", item.name)).with_value(item.name.clone());
                self.modal = Some(Modal::Rename {
                    target: self.target(&item),
                    input,
                });
            }
        } else if pressed(ResourceAction::Delete) {
            let item = self.table.selected_item()?.clone();
            if self.require_mutable(ctx) {
                let dialog = ConfirmDialog::new(
                    format!("Delete {} '{}'? This cannot be undone.", kind.singular(), item.name),
                    Arc::clone(&self.resolver),
                )
                .with_title(format!("Delete {}", kind.singular()))
                .with_confirm_text("Delete")
                .danger();
                self.modal = Some(Modal::Delete {
                    target: self.target(&item),
                    dialog,
                });
            }
        } else if pressed(ResourceAction::CopyId) {
            let item = self.table.selected_item()?;
            ctx.run(CopyToClipboardCmd::new(item.id.clone(), format!("id of {}", item.name)));
        } else if pressed(ResourceAction::Cancel) {
            self.cancel_queued(ctx);
        } else {
            return None;
        }
        Some(Handled::Consumed)
    }

    fn render_sidebar(&self, frame: &mut Frame, area: Rect, theme: &Theme) {
        let lines: Vec<Line> = ResourceKind::PROJECT_KINDS
            .iter()
            .enumerate()
            .map(|(i, kind)| {
                if i == self.kind_index {
                    Line::from(Span::styled(
                        format!("▶ {}", kind.display_name()),
                        Style::default()
                            .fg(theme.lavender())
                            .bg(theme.selection_bg())
                            .add_modifier(Modifier::BOLD),
                    ))
                } else {
                    Line::from(Span::styled(
                        format!("  {}", kind.display_name()),
                        Style::default().fg(theme.subtext0()),
                    ))
                }
            })
            .collect();

        let block = Block::default()
            .borders(Borders::ALL)
            .border_type(BorderType::Rounded)
            .border_style(Style::default().fg(theme.border()))
            .title(format!(" {} ", self.project_name()))
            .title_style(Style::default().fg(theme.mauve()).add_modifier(Modifier::BOLD));
        frame.render_widget(Paragraph::new(lines).block(block), area);
    }

    fn render_preview(&self, frame: &mut Frame, area: Rect, theme: &Theme) {
        let block = Block::default()
            .borders(Borders::ALL)
            .border_type(BorderType::Rounded)
            .border_style(Style::default().fg(theme.border()))
            .title(" Preview ");

        let label = Style::default().fg(theme.overlay1());
        let value = Style::default().fg(theme.text());
        let mut lines = Vec::new();

        if let Some(message) = &self.action_error {
            lines.push(Line::from(Span::styled(message.clone(), Style::default().fg(theme.error()))));
        }
        if let Some(item) = self.table.selected_item() {
            match item.state {
                ItemState::Optimistic { action } => lines.push(Line::from(Span::styled(
                    format!("⟳ waiting for the server (action {action})"),
                    Style::default().fg(theme.warning()),
                ))),
                ItemState::Reverted => lines.push(Line::from(Span::styled(
                    "✗ last change was rolled back",
                    Style::default().fg(theme.error()),
                ))),
                ItemState::Confirmed => {}
            }
            let status = item.status.clone().unwrap_or_else(|| "—".to_string());
            lines.push(Line::from(vec![
                Span::styled(format!("{:>12} ", "id"), label),
                Span::styled(item.id.clone(), value),
            ]));
            lines.push(Line::from(vec![
                Span::styled(format!("{:>12} ", "status"), label),
                Span::styled(status.clone(), Style::default().fg(theme.status(&status))),
            ]));
            for (key, field) in &item.fields {
                lines.push(Line::from(vec![
                    Span::styled(format!("{key:>12} "), label),
                    Span::styled(field.clone(), value),
                ]));
            }
        }

        frame.render_widget(
            Paragraph::new(lines).block(block).wrap(Wrap { trim: true }),
            area,
        );
    }
}

/// Submits `operation`; a rejected submission becomes an error toast.
fn submit(target: &ResourceRef, operation: Operation, ctx: &mut ScreenCtx<'_>) {
    if let Err(err) = ctx.submit(target, operation) {
        ctx.toast(Toast::error(err.to_string()));
    }
}

impl Screen for HomeScreen {
    fn breadcrumb(&self) -> String {
        format!("{} › {}", self.project_name(), self.kind().display_name())
    }

    fn on_enter(&mut self, ctx: &mut ScreenCtx<'_>) -> Result<(), ScreenError> {
        if !self
            .scope
            .segments()
            .last()
            .is_some_and(|(kind, _)| *kind == ResourceKind::Project)
        {
            return Err(ScreenError::Invalid(format!("{} is not a project", self.scope)));
        }
        self.switch_kind(self.kind_index, ctx);
        Ok(())
    }

    fn on_resume(&mut self, ctx: &mut ScreenCtx<'_>) {
        let view = ctx.collection(&self.key());
        self.sync(&view);
    }

    fn on_change(&mut self, key: &CollectionKey, ctx: &mut ScreenCtx<'_>) {
        if *key == self.key() {
            let view = ctx.peek(key);
            self.sync(&view);
        }
    }

    fn on_tick(&mut self, ctx: &mut ScreenCtx<'_>) {
        if self.loading {
            self.spinner.on_tick();
        }
        // visible listings are revalidated; the cache spaces out retries after a failure
        if ctx.peek(&self.key()).freshness != Freshness::Fresh {
            let view = ctx.collection(&self.key());
            self.sync(&view);
        }
    }

    fn on_action(&mut self, event: &DispatchEvent, _ctx: &mut ScreenCtx<'_>) {
        if let DispatchEvent::Failed {
            target, verb, error, ..
        } = event
        {
            self.action_error = Some(format!("Could not {verb} {}: {error}", target.id));
        }
    }

    fn handle_key(&mut self, key: KeyEvent, ctx: &mut ScreenCtx<'_>) -> ui::Result<Handled<Transition>> {
        if let Some(modal) = self.modal.take() {
            self.handle_modal_key(modal, key, ctx)?;
            return Ok(Handled::Consumed);
        }
        self.action_error = None;

        if !self.table.is_searching() {
            if self.resolver.matches_nav(&key, NavAction::Left) {
                let previous = self.kind_index + ResourceKind::PROJECT_KINDS.len() - 1;
                self.switch_kind(previous, ctx);
                return Ok(Handled::Consumed);
            }
            if self.resolver.matches_nav(&key, NavAction::Right) {
                self.switch_kind(self.kind_index + 1, ctx);
                return Ok(Handled::Consumed);
            }
            if let Some(handled) = self.handle_resource_key(key, ctx) {
                return Ok(handled);
            }
        }

        Ok(match self.table.handle_key(key)? {
            Handled::Event(TableEvent::Activated(item)) => {
                let detail = DetailScreen::new(self.target(&item), Arc::clone(&self.resolver));
                Handled::Event(Transition::Push(Box::new(detail)))
            }
            Handled::Event(_) | Handled::Consumed => Handled::Consumed,
            Handled::Ignored => Handled::Ignored,
        })
    }

    fn show_error(&mut self, message: String) {
        self.action_error = Some(message);
    }

    fn render(&mut self, frame: &mut Frame, area: Rect, theme: &Theme) {
        let [sidebar, main] =
            Layout::horizontal([Constraint::Length(SIDEBAR_WIDTH), Constraint::Min(0)]).areas(area);
        let [listing, preview] =
            Layout::vertical([Constraint::Min(0), Constraint::Length(PREVIEW_HEIGHT)]).areas(main);

        self.render_sidebar(frame, sidebar, theme);
        if let Some(error) = &self.error
            && self.table.items().is_empty()
        {
            render_error(frame, listing, theme, error);
        } else if self.loading {
            self.spinner.render(frame, listing, theme);
        } else {
            self.table.render(frame, listing, theme);
        }
        self.render_preview(frame, preview, theme);

        match &mut self.modal {
            Some(Modal::Create(input) | Modal::Rename { input, .. }) => input.render(frame, area, theme),
            Some(Modal::Delete { dialog, .. }) => dialog.render(frame, area, theme),
            None => {}
        }
    }

    fn keybindings(&self) -> Vec<Keybinding> {
        let r = &self.resolver;
        let mut bindings = vec![
            Keybinding::hint(r.display_nav(NavAction::Select), "Details"),
            Keybinding::hint(r.display_search(SearchAction::Toggle), "Search"),
            Keybinding::hint(
                format!("{}/{}", r.display_nav(NavAction::Left), r.display_nav(NavAction::Right)),
                "Kind",
            ),
            Keybinding::hint(r.display_resource(ResourceAction::Refresh), "Refresh"),
            Keybinding::hint(r.display_resource(ResourceAction::CopyId), "Copy id"),
        ];
        if self.kind().is_mutable() {
            bindings.extend([
                Keybinding::hint(r.display_resource(ResourceAction::New), "New"),
                Keybinding::hint(r.display_resource(ResourceAction::Rename), "Rename"),
                Keybinding::hint(r.display_resource(ResourceAction::Delete), "Delete"),
                Keybinding::new(r.display_resource(ResourceAction::Cancel), "Cancel queued"),
            ]);
        }
        if self.has_more {
            bindings.push(Keybinding::hint(r.display_resource(ResourceAction::LoadMore), "Load more"));
        }
        bindings
    }
}

#[cfg(test)]
mod tests {
    use crossterm::event::{KeyCode, KeyModifiers};

    use super::*;
    use crate::cache::CachePolicy;
    use crate::dispatch::ActionDispatcher;
    use crate::model::{Page, ScreenId};
    use crate::nav::Services;

    const ID: ScreenId = ScreenId(7);

    fn services() -> Services {
        Services::new(CachePolicy::default(), ActionDispatcher::with_session("test"))
    }

    fn project() -> Scope {
        Scope::new("subscriptions/s/accounts/a/projects/proj1")
    }

    fn press(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn loaded(services: &mut Services, home: &mut HomeScreen, items: Vec<ResourceItem>) {
        let fetch = services.effects.take().fetches.remove(0);
        let now = services.now;
        let page = Page {
            items,
            next_cursor: None,
        };
        services.cache.apply_page(&fetch.key, fetch.generation, page, true, now);
        for signal in services.cache.drain_changes() {
            home.on_change(&signal.key, &mut ScreenCtx::new(ID, services));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_non_project_scope() {
        let mut services = services();
        let mut home = HomeScreen::new(Scope::new("subscriptions/s"), Arc::default());
        assert!(home.on_enter(&mut ScreenCtx::new(ID, &mut services)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_is_confirmed_then_applied_optimistically() {
        let mut services = services();
        let mut home = HomeScreen::new(project(), Arc::default());
        home.on_enter(&mut ScreenCtx::new(ID, &mut services)).unwrap();
        loaded(
            &mut services,
            &mut home,
            vec![ResourceItem::new("irma", "irma"), ResourceItem::new("testar", "testar")],
        );
        assert_eq!(home.table.items().len(), 2);

        let mut ctx = ScreenCtx::new(ID, &mut services);
        home.handle_key(press(KeyCode::Char('d')), &mut ctx).unwrap();
        assert!(matches!(home.modal, Some(Modal::Delete { .. })));
        home.handle_key(press(KeyCode::Char('y')), &mut ctx).unwrap();
        assert!(home.modal.is_none());

        let effects = services.effects.take();
        assert_eq!(effects.dispatches.len(), 1);
        assert_eq!(effects.dispatches[0].target.id, "irma");
        assert_eq!(effects.dispatches[0].operation, Operation::Delete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_shows_placeholder_row() {
        let mut services = services();
        let mut home = HomeScreen::new(project(), Arc::default());
        home.on_enter(&mut ScreenCtx::new(ID, &mut services)).unwrap();
        loaded(&mut services, &mut home, vec![ResourceItem::new("irma", "irma")]);

        let mut ctx = ScreenCtx::new(ID, &mut services);
        home.handle_key(press(KeyCode::Char('n')), &mut ctx).unwrap();
        for c in "helper".chars() {
            home.handle_key(press(KeyCode::Char(c)), &mut ctx).unwrap();
        }
        home.handle_key(press(KeyCode::Enter), &mut ctx).unwrap();

        for signal in services.cache.drain_changes() {
            home.on_change(&signal.key, &mut ScreenCtx::new(ID, &mut services));
        }
        let pending: Vec<&ResourceItem> = home.table.items().iter().filter(|i| i.is_pending()).collect();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].name, "helper");
    }

    #[tokio::test(start_paused = true)]
    async fn test_connections_are_read_only() {
        let mut services = services();
        let mut home = HomeScreen::new(project(), Arc::default());
        let mut ctx = ScreenCtx::new(ID, &mut services);
        home.on_enter(&mut ctx).unwrap();
        let connections = ResourceKind::PROJECT_KINDS
            .iter()
            .position(|k| *k == ResourceKind::Connection)
            .unwrap();
        home.switch_kind(connections, &mut ctx);

        home.handle_key(press(KeyCode::Char('n')), &mut ctx).unwrap();
        assert!(home.modal.is_none());
        assert_eq!(services.effects.take().toasts.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_action_is_shown_inline() {
        let mut services = services();
        let mut home = HomeScreen::new(project(), Arc::default());
        let target = ResourceRef::new(ResourceKind::Agent, project(), "irma");
        let event = DispatchEvent::Failed {
            action: crate::model::ActionId(1),
            target,
            origin: ID,
            verb: "delete",
            error: crate::api::ApiError::Conflict("etag mismatch".to_string()),
        };
        home.on_action(&event, &mut ScreenCtx::new(ID, &mut services));
        assert_eq!(
            home.action_error.as_deref(),
            Some("Could not delete irma: conflicting change on the server: etag mismatch")
        );
    }
}
