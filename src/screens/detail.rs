use std::sync::Arc;

use crossterm::event::KeyEvent;
use ratatui::Frame;
use ratatui::layout::{Constraint, Layout, Rect};
use ratatui::style::{Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, BorderType, Borders, Paragraph, Wrap};

use crate::Theme;
use crate::api::ApiError;
use crate::commands::CopyToClipboardCmd;
use crate::config::{KeyResolver, NavAction, ResourceAction};
use crate::dispatch::DispatchEvent;
use crate::model::{CollectionKey, ItemState, ResourceItem, ResourceRef};
use crate::nav::{Screen, ScreenCtx, ScreenError, Transition};
use crate::screens::{describe_error, render_error};
use crate::ui::{self, Component, Handled, Keybinding, Spinner};

/// Every display field of one resource.
pub struct DetailScreen {
    target: ResourceRef,
    resolver: Arc<KeyResolver>,
    item: Option<ResourceItem>,
    /// The item disappeared from its listing.
    gone: bool,
    loading: bool,
    spinner: Spinner,
    error: Option<String>,
    scroll: u16,
}

impl DetailScreen {
    pub fn new(target: ResourceRef, resolver: Arc<KeyResolver>) -> Self {
        Self {
            target,
            resolver,
            item: None,
            gone: false,
            loading: false,
            spinner: Spinner::new("Reloading..."),
            error: None,
            scroll: 0,
        }
    }

    fn parent(&self) -> CollectionKey {
        CollectionKey::new(self.target.kind, self.target.scope.clone())
    }

    fn field_lines(&self, theme: &Theme) -> Vec<Line<'static>> {
        let Some(item) = &self.item else {
            return Vec::new();
        };
        let label = Style::default().fg(theme.overlay1());
        let value = Style::default().fg(theme.text());
        let width = item
            .fields
            .keys()
            .map(|k| k.chars().count())
            .chain([6])
            .max()
            .unwrap_or(6);

        let mut lines = Vec::new();
        match item.state {
            ItemState::Optimistic { action } => lines.push(Line::from(Span::styled(
                format!("⟳ action {action} is waiting for the server"),
                Style::default().fg(theme.warning()),
            ))),
            ItemState::Reverted => lines.push(Line::from(Span::styled(
                "✗ the last change was rolled back",
                Style::default().fg(theme.error()),
            ))),
            ItemState::Confirmed => {}
        }
        if self.gone {
            lines.push(Line::from(Span::styled(
                "This resource is no longer listed on the server.",
                Style::default().fg(theme.warning()),
            )));
        }
        if !lines.is_empty() {
            lines.push(Line::from(""));
        }

        let status = item.status.clone().unwrap_or_else(|| "—".to_string());
        lines.push(Line::from(vec![
            Span::styled(format!("{:>width$}  ", "id"), label),
            Span::styled(item.id.clone(), value),
        ]));
        lines.push(Line::from(vec![
            Span::styled(format!("{:>width$}  ", "name"), label),
            Span::styled(item.name.clone(), value.add_modifier(Modifier::BOLD)),
        ]));
        lines.push(Line::from(vec![
            Span::styled(format!("{:>width$}  ", "status"), label),
            Span::styled(status.clone(), Style::default().fg(theme.status(&status))),
        ]));
        for (key, field) in &item.fields {
            lines.push(Line::from(vec![
                Span::styled(format!("{key:>width$}  "), label),
                Span::styled(field.clone(), value),
            ]));
        }
        lines
    }
}

impl Screen for DetailScreen {
    fn breadcrumb(&self) -> String {
        self.item
            .as_ref()
            .map_or_else(|| self.target.id.clone(), |item| item.name.clone())
    }

    fn on_enter(&mut self, ctx: &mut ScreenCtx<'_>) -> Result<(), ScreenError> {
        let item = ctx
            .find_item(&self.target)
            .ok_or_else(|| ScreenError::Missing(self.target.clone()))?;
        self.item = Some(item);
        ctx.collection(&self.parent());
        Ok(())
    }

    fn on_resume(&mut self, ctx: &mut ScreenCtx<'_>) {
        let parent = self.parent();
        ctx.collection(&parent);
        self.on_change(&parent, ctx);
    }

    fn on_change(&mut self, key: &CollectionKey, ctx: &mut ScreenCtx<'_>) {
        if *key != self.parent() {
            return;
        }
        match ctx.find_item(&self.target) {
            Some(item) => {
                self.item = Some(item);
                self.gone = false;
            }
            None => self.gone = !ctx.peek(key).loading,
        }
    }

    fn on_item(&mut self, target: &ResourceRef, result: &Result<ResourceItem, ApiError>, ctx: &mut ScreenCtx<'_>) {
        if *target != self.target {
            return;
        }
        self.loading = false;
        match result {
            Ok(_) => {
                // the cache folds in any pending action
                self.item = ctx.find_item(target).or_else(|| result.clone().ok());
                self.gone = false;
                self.error = None;
            }
            Err(error) => {
                self.gone = matches!(error, ApiError::NotFound(_));
                self.error = Some(describe_error(error));
            }
        }
    }

    fn on_action(&mut self, event: &DispatchEvent, _ctx: &mut ScreenCtx<'_>) {
        if let DispatchEvent::Failed {
            target, verb, error, ..
        } = event
            && *target == self.target
        {
            self.error = Some(format!("Could not {verb} {}: {error}", target.id));
        }
    }

    fn on_tick(&mut self, _ctx: &mut ScreenCtx<'_>) {
        if self.loading {
            self.spinner.on_tick();
        }
    }

    fn handle_key(&mut self, key: KeyEvent, ctx: &mut ScreenCtx<'_>) -> ui::Result<Handled<Transition>> {
        let r = &self.resolver;
        if r.matches_resource(&key, ResourceAction::Refresh) {
            self.loading = true;
            ctx.fetch_item(self.target.clone());
        } else if r.matches_resource(&key, ResourceAction::CopyId) {
            ctx.run(CopyToClipboardCmd::new(self.target.id.clone(), "resource id"));
        } else if r.matches_nav(&key, NavAction::Down) {
            self.scroll = self.scroll.saturating_add(1);
        } else if r.matches_nav(&key, NavAction::Up) {
            self.scroll = self.scroll.saturating_sub(1);
        } else if r.matches_nav(&key, NavAction::Home) {
            self.scroll = 0;
        } else {
            return Ok(Handled::Ignored);
        }
        Ok(Handled::Consumed)
    }

    fn show_error(&mut self, message: String) {
        self.error = Some(message);
    }

    fn render(&mut self, frame: &mut Frame, area: Rect, theme: &Theme) {
        let (error_area, body) = match &self.error {
            Some(_) => {
                let [top, rest] = Layout::vertical([Constraint::Length(7), Constraint::Min(0)]).areas(area);
                (Some(top), rest)
            }
            None => (None, area),
        };
        if let (Some(error_area), Some(error)) = (error_area, &self.error) {
            render_error(frame, error_area, theme, error);
        }

        let title = format!(
            " {} {} ",
            self.target.kind.singular(),
            self.item.as_ref().map_or(self.target.id.as_str(), |item| item.name.as_str())
        );
        let block = Block::default()
            .borders(Borders::ALL)
            .border_type(BorderType::Rounded)
            .border_style(Style::default().fg(theme.border_focused()))
            .title(title)
            .title_style(Style::default().fg(theme.mauve()).add_modifier(Modifier::BOLD));

        if self.loading {
            let inner = block.inner(body);
            frame.render_widget(block, body);
            self.spinner.render(frame, inner, theme);
            return;
        }

        let paragraph = Paragraph::new(self.field_lines(theme))
            .block(block)
            .wrap(Wrap { trim: false })
            .scroll((self.scroll, 0));
        frame.render_widget(paragraph, body);
    }

    fn keybindings(&self) -> Vec<Keybinding> {
        vec![
            Keybinding::hint(self.resolver.display_resource(ResourceAction::Refresh), "Reload"),
            Keybinding::hint(self.resolver.display_resource(ResourceAction::CopyId), "Copy id"),
            Keybinding::new(
                format!(
                    "{}/{}",
                    self.resolver.display_nav(NavAction::Up),
                    self.resolver.display_nav(NavAction::Down)
                ),
                "Scroll",
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachePolicy;
    use crate::dispatch::ActionDispatcher;
    use crate::model::{Page, ResourceKind, Scope, ScreenId};
    use crate::nav::Services;

    const ID: ScreenId = ScreenId(2);

    fn services() -> Services {
        Services::new(CachePolicy::default(), ActionDispatcher::with_session("test"))
    }

    fn target() -> ResourceRef {
        ResourceRef::new(
            ResourceKind::Deployment,
            Scope::new("subscriptions/s/accounts/a/projects/proj1"),
            "gpt-4o",
        )
    }

    fn seed(services: &mut Services) {
        let key = CollectionKey::new(ResourceKind::Deployment, target().scope);
        let (_, fetch) = services.cache.get(&key, services.now);
        let fetch = fetch.unwrap();
        let page = Page {
            items: vec![ResourceItem::new("gpt-4o", "gpt-4o").with_status("Succeeded")],
            next_cursor: None,
        };
        let now = services.now;
        services.cache.apply_page(&key, fetch.generation, page, true, now);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enter_fails_for_unknown_item() {
        let mut services = services();
        let mut detail = DetailScreen::new(target(), Arc::default());
        let result = detail.on_enter(&mut ScreenCtx::new(ID, &mut services));
        assert_eq!(result, Err(ScreenError::Missing(target())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_renders_inline() {
        let mut services = services();
        seed(&mut services);
        let mut detail = DetailScreen::new(target(), Arc::default());
        let mut ctx = ScreenCtx::new(ID, &mut services);
        detail.on_enter(&mut ctx).unwrap();
        assert_eq!(detail.breadcrumb(), "gpt-4o");

        let error = ApiError::NotFound("gpt-4o does not exist".to_string());
        detail.on_item(&target(), &Err(error), &mut ctx);
        assert!(detail.gone);
        assert!(detail.error.as_deref().is_some_and(|e| e.starts_with("not found")));
        // last known copy stays visible
        assert!(detail.item.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_requests_item() {
        let mut services = services();
        seed(&mut services);
        let mut detail = DetailScreen::new(target(), Arc::default());
        let mut ctx = ScreenCtx::new(ID, &mut services);
        detail.on_enter(&mut ctx).unwrap();
        detail
            .handle_key(
                KeyEvent::new(crossterm::event::KeyCode::Char('r'), crossterm::event::KeyModifiers::NONE),
                &mut ctx,
            )
            .unwrap();
        assert!(detail.loading);
        let fetches = services.effects.take().item_fetches;
        assert_eq!(fetches.len(), 1);
        assert_eq!(fetches[0].origin, ID);
    }
}
