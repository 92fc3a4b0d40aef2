//! Event loop: routes terminal events to the navigation stack, runs the side
//! effects screens ask for and feeds command results back into the cache,
//! the dispatcher and the screens.

use std::sync::Arc;

use color_eyre::eyre::eyre;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use ratatui::layout::{Constraint, Layout, Rect};
use ratatui::style::Style;
use ratatui::widgets::Block;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::Theme;
use crate::api::{ApiClient, ApiError};
use crate::cache::CachePolicy;
use crate::commands::{Command, ExecuteActionCmd, FetchCollectionCmd, FetchItemCmd};
use crate::config::{GlobalAction, KeyResolver};
use crate::dispatch::{ActionDispatcher, DispatchEvent};
use crate::model::{ActionId, CollectionKey, Page, ResourceItem, ResourceRef, Scope, ScreenId};
use crate::nav::{Flow, ItemFetch, NavigationStack, Screen, Services, Transition};
use crate::screens::SplashScreen;
use crate::tui::{Event, Tui};
use crate::ui::{Component, Handled, StatusBar, StatusInfo, Toast, ToastManager, ToastType};

const FRAME_RATE: f64 = 30.0;
const TICK_RATE: f64 = 4.0;
const STATUS_BAR_HEIGHT: u16 = 7;
/// Follow-up transitions applied per event before yielding to the terminal.
const MAX_FOLLOW_UPS: usize = 8;

/// Results of commands, delivered back to the event loop.
#[derive(Debug)]
pub enum AppMessage {
    PageLoaded {
        key: CollectionKey,
        generation: u64,
        page: Page,
        done: bool,
    },
    FetchFailed {
        key: CollectionKey,
        generation: u64,
        error: ApiError,
    },
    ItemLoaded {
        origin: ScreenId,
        target: ResourceRef,
        result: Result<ResourceItem, ApiError>,
    },
    ActionCompleted {
        action: ActionId,
        result: Result<Option<ResourceItem>, ApiError>,
        retries: u32,
    },
    ShowToast {
        message: String,
        toast_type: ToastType,
    },
}

enum Step {
    Event(Option<Event>),
    Message(AppMessage),
}

pub struct App {
    stack: NavigationStack,
    services: Services,
    client: Arc<ApiClient>,
    resolver: Arc<KeyResolver>,
    theme: Theme,
    toasts: ToastManager,
    status_bar: StatusBar,
    endpoint: String,
    resume: Option<Scope>,
    msg_tx: UnboundedSender<AppMessage>,
    msg_rx: UnboundedReceiver<AppMessage>,
    should_quit: bool,
    should_suspend: bool,
}

impl App {
    pub fn new(
        client: Arc<ApiClient>,
        policy: CachePolicy,
        resolver: Arc<KeyResolver>,
        theme: Theme,
        endpoint: String,
        resume: Option<Scope>,
    ) -> Self {
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        Self {
            stack: NavigationStack::new(),
            services: Services::new(policy, ActionDispatcher::new()),
            client,
            status_bar: StatusBar::new(Arc::clone(&resolver)),
            resolver,
            theme,
            toasts: ToastManager::new(),
            endpoint,
            resume,
            msg_tx,
            msg_rx,
            should_quit: false,
            should_suspend: false,
        }
    }

    pub async fn run(&mut self) -> color_eyre::Result<()> {
        let mut tui = Tui::new(FRAME_RATE, TICK_RATE)?;
        tui.enter()?;

        let splash = SplashScreen::new(Arc::clone(&self.resolver), self.endpoint.clone(), self.resume.take());
        self.open(Box::new(splash))?;

        loop {
            let step = tokio::select! {
                event = tui.next_event() => Step::Event(event),
                Some(message) = self.msg_rx.recv() => Step::Message(message),
            };
            self.services.now = Instant::now();
            match step {
                Step::Event(Some(event)) => self.handle_event(event, &mut tui)?,
                Step::Event(None) => break,
                Step::Message(message) => self.handle_message(message),
            }
            self.settle()?;

            if self.should_suspend {
                tui.suspend()?;
                self.should_suspend = false;
                tui.resume()?;
            } else if self.should_quit {
                break;
            }
        }

        info!("Shutting down");
        self.stack.clear(&mut self.services);
        tui.exit()?;
        Ok(())
    }

    /// Pushes `screen` and carries out whatever it asked for on entering.
    ///
    /// # Errors
    /// When the stack ends up empty because `screen` failed to enter.
    pub fn open(&mut self, screen: Box<dyn Screen>) -> color_eyre::Result<()> {
        self.apply(Transition::Push(screen))?;
        self.settle()
    }

    fn handle_event(&mut self, event: Event, tui: &mut Tui) -> color_eyre::Result<()> {
        match event {
            Event::Quit => self.should_quit = true,
            Event::Error(message) => {
                warn!(%message, "Terminal event error");
                self.toasts.show(Toast::error(message));
            }
            Event::Tick => {
                self.stack.tick(&mut self.services);
                self.toasts.on_tick();
            }
            Event::Render => self.render(tui)?,
            Event::Resize(width, height) => {
                tui.resize(Rect::new(0, 0, width, height))?;
                self.render(tui)?;
            }
            Event::Key(key) => self.handle_key(key)?,
        }
        Ok(())
    }

    fn handle_key(&mut self, key: KeyEvent) -> color_eyre::Result<()> {
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('z') {
            self.should_suspend = true;
            return Ok(());
        }

        match self.stack.handle_key(key, &mut self.services) {
            Ok(Handled::Event(transition)) => self.apply(transition)?,
            Ok(Handled::Consumed) => {}
            Ok(Handled::Ignored) => {
                if self.resolver.matches_global(&key, GlobalAction::Quit) {
                    self.should_quit = true;
                } else if self.resolver.matches_global(&key, GlobalAction::Back) {
                    self.apply(Transition::Pop)?;
                }
            }
            Err(err) => {
                error!(error = %err, "Screen failed to handle key");
                self.toasts.show(Toast::error(err.to_string()));
            }
        }
        Ok(())
    }

    fn handle_message(&mut self, message: AppMessage) {
        let now = self.services.now;
        match message {
            AppMessage::PageLoaded {
                key,
                generation,
                page,
                done,
            } => {
                if !self.services.cache.apply_page(&key, generation, page, done, now) {
                    debug!(%key, generation, "Dropped page of a superseded fetch");
                }
            }
            AppMessage::FetchFailed { key, generation, error } => {
                warn!(%key, generation, %error, "Listing failed");
                self.services.cache.fetch_failed(&key, generation, error, now);
            }
            AppMessage::ItemLoaded { origin, target, result } => self.item_loaded(origin, &target, &result),
            AppMessage::ActionCompleted {
                action,
                result,
                retries,
            } => {
                let events = self
                    .services
                    .dispatcher
                    .complete(&mut self.services.cache, action, result, retries, now);
                for event in events {
                    self.action_event(event);
                }
            }
            AppMessage::ShowToast { message, toast_type } => self.toasts.show(Toast::new(message, toast_type)),
        }
    }

    fn item_loaded(&mut self, origin: ScreenId, target: &ResourceRef, result: &Result<ResourceItem, ApiError>) {
        let cache = &mut self.services.cache;
        match result {
            Ok(item) => cache.upsert_item(target, item.clone()),
            Err(ApiError::NotFound(_)) => {
                cache.remove_item(target);
                cache.invalidate_scope(target.kind, &target.scope);
            }
            Err(error) => warn!(%target, %error, "Reload failed"),
        }
        let delivered = self
            .stack
            .with_screen(origin, &mut self.services, |screen, ctx| screen.on_item(target, result, ctx));
        if !delivered {
            debug!(%target, "Reload finished after its screen closed");
        }
    }

    fn action_event(&mut self, event: DispatchEvent) {
        match &event {
            DispatchEvent::Send(dispatch) => {
                self.spawn(Box::new(ExecuteActionCmd::new(Arc::clone(&self.client), dispatch.clone())));
            }
            DispatchEvent::Confirmed {
                target,
                origin,
                verb,
                item,
                retries,
                ..
            } => {
                let name = item.as_ref().map_or(target.id.as_str(), |item| item.name.as_str());
                let mut message = format!("{} {} {name}", past_tense(verb), target.kind.singular());
                if *retries > 0 {
                    message.push_str(&format!(" after {retries} retries"));
                }
                self.toasts.show(Toast::success(message));
                self.stack
                    .with_screen(*origin, &mut self.services, |screen, ctx| screen.on_action(&event, ctx));
            }
            DispatchEvent::Failed {
                target,
                origin,
                verb,
                error,
                ..
            } => {
                let delivered = self
                    .stack
                    .with_screen(*origin, &mut self.services, |screen, ctx| screen.on_action(&event, ctx));
                if !delivered {
                    self.toasts
                        .show(Toast::error(format!("Could not {verb} {}: {error}", target.id)));
                }
            }
        }
    }

    /// Applies follow-up transitions, announces cache changes and starts the
    /// side effects collected while handling the last event.
    fn settle(&mut self) -> color_eyre::Result<()> {
        for _ in 0..MAX_FOLLOW_UPS {
            match self.stack.poll_transition(&mut self.services) {
                Some(transition) => self.apply(transition)?,
                None => break,
            }
        }

        for signal in self.services.cache.drain_changes() {
            self.stack.notify(&signal, &mut self.services);
        }

        let effects = self.services.effects.take();
        for request in effects.fetches {
            self.spawn(Box::new(FetchCollectionCmd::new(Arc::clone(&self.client), request)));
        }
        for ItemFetch { origin, target } in effects.item_fetches {
            self.spawn(Box::new(FetchItemCmd::new(Arc::clone(&self.client), origin, target)));
        }
        for dispatch in effects.dispatches {
            self.spawn(Box::new(ExecuteActionCmd::new(Arc::clone(&self.client), dispatch)));
        }
        for command in effects.commands {
            self.spawn(command);
        }
        for toast in effects.toasts {
            self.toasts.show(toast);
        }
        Ok(())
    }

    fn apply(&mut self, transition: Transition) -> color_eyre::Result<()> {
        match self.stack.apply(transition, &mut self.services) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Quit) => self.should_quit = true,
            Err(err) => return Err(eyre!("could not open the first screen: {err}")),
        }
        Ok(())
    }

    fn spawn(&self, command: Box<dyn Command>) {
        let name = command.name();
        let tx = self.msg_tx.clone();
        debug!(command = %name, "Spawning command");
        tokio::spawn(async move {
            if let Err(err) = command.execute(tx.clone()).await {
                error!(command = %name, error = %err, "Command failed");
                _ = tx.send(AppMessage::ShowToast {
                    message: format!("{name} failed: {err}"),
                    toast_type: ToastType::Error,
                });
            }
        });
    }

    fn status_info(&self) -> StatusInfo {
        StatusInfo {
            breadcrumbs: self.stack.breadcrumbs(),
            endpoint: self.endpoint.clone(),
            pending_actions: self.services.dispatcher.pending_count(),
        }
    }

    fn render(&mut self, tui: &mut Tui) -> color_eyre::Result<()> {
        let info = self.status_info();
        let keybindings = self.stack.keybindings();
        tui.draw(|frame| {
            let area = frame.area();
            frame.render_widget(Block::default().style(Style::default().bg(self.theme.base())), area);
            let [main, status] =
                Layout::vertical([Constraint::Min(0), Constraint::Length(STATUS_BAR_HEIGHT)]).areas(area);

            self.stack.render(frame, main, &self.theme);
            self.status_bar.render(frame, status, &self.theme, &info, &keybindings);
            self.toasts.render(frame, main, &self.theme);
        })?;
        Ok(())
    }
}

fn past_tense(verb: &str) -> &'static str {
    match verb {
        "create" => "Created",
        "update" => "Updated",
        "delete" => "Deleted",
        _ => "Applied",
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crossterm::event::KeyEventKind;

    use super::*;
    use crate::api::MemoryTransport;
    use crate::api::credential::StaticCredentialProvider;
    use crate::api::error::{ErrorClass, RemoteError};
    use crate::model::ResourceKind;
    use crate::screens::HomeScreen;

    fn project() -> Scope {
        Scope::new("subscriptions/s/accounts/a/projects/proj1")
    }

    fn app(transport: Arc<MemoryTransport>) -> App {
        let client = ApiClient::new(transport, Arc::new(StaticCredentialProvider::new(["token"])));
        App::new(
            Arc::new(client),
            CachePolicy::default(),
            Arc::default(),
            Theme::default(),
            "memory".to_string(),
            None,
        )
    }

    fn press(app: &mut App, c: char) {
        let mut key = KeyEvent::new(KeyCode::Char(c), KeyModifiers::NONE);
        key.kind = KeyEventKind::Press;
        app.services.now = Instant::now();
        app.handle_key(key).unwrap();
        app.settle().unwrap();
    }

    /// Handles command results until nothing arrives for a moment.
    async fn pump(app: &mut App) {
        while let Ok(Some(message)) = tokio::time::timeout(Duration::from_millis(100), app.msg_rx.recv()).await {
            app.services.now = Instant::now();
            app.handle_message(message);
            app.settle().unwrap();
        }
    }

    fn agents() -> CollectionKey {
        CollectionKey::new(ResourceKind::Agent, project())
    }

    fn seeded() -> Arc<MemoryTransport> {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert(
            ResourceKind::Agent,
            &project(),
            [ResourceItem::new("irma", "irma"), ResourceItem::new("testar", "testar")],
        );
        transport
    }

    #[tokio::test]
    async fn test_listing_reaches_cache_through_commands() {
        let mut app = app(seeded());
        app.open(Box::new(HomeScreen::new(project(), Arc::default()))).unwrap();
        pump(&mut app).await;

        let view = app.services.cache.peek(&agents(), Instant::now());
        let ids: Vec<&str> = view.items.iter().map(|item| item.id.as_str()).collect();
        assert_eq!(ids, ["irma", "testar"]);
        assert_eq!(app.stack.breadcrumbs(), ["proj1 › Agents"]);
    }

    #[tokio::test]
    async fn test_confirmed_delete_toasts_and_updates_cache() {
        let transport = seeded();
        let mut app = app(Arc::clone(&transport));
        app.open(Box::new(HomeScreen::new(project(), Arc::default()))).unwrap();
        pump(&mut app).await;

        press(&mut app, 'd');
        press(&mut app, 'y');
        pump(&mut app).await;

        assert_eq!(app.services.dispatcher.pending_count(), 0);
        assert_eq!(app.toasts.len(), 1);
        let view = app.services.cache.peek(&agents(), Instant::now());
        assert_eq!(view.items.len(), 1);
        assert_eq!(transport.items(ResourceKind::Agent, &project()).len(), 1);
    }

    #[tokio::test]
    async fn test_conflict_reverts_and_stays_inline() {
        let transport = seeded();
        let mut app = app(Arc::clone(&transport));
        app.open(Box::new(HomeScreen::new(project(), Arc::default()))).unwrap();
        pump(&mut app).await;

        transport.fail_next(RemoteError::new(ErrorClass::Conflict, "etag mismatch"));
        press(&mut app, 'd');
        press(&mut app, 'y');
        pump(&mut app).await;

        // reported on the home screen, not as a toast
        assert!(app.toasts.is_empty());
        let view = app.services.cache.peek(&agents(), Instant::now());
        assert!(view.items.iter().any(|item| item.id == "irma"));
    }

    #[tokio::test]
    async fn test_back_from_root_quits() {
        let mut app = app(seeded());
        app.open(Box::new(HomeScreen::new(project(), Arc::default()))).unwrap();
        app.handle_key(KeyEvent::new(KeyCode::Esc, KeyModifiers::NONE)).unwrap();
        assert!(app.should_quit);
        assert_eq!(app.stack.depth(), 0);
    }

    #[test]
    fn test_past_tense() {
        assert_eq!(past_tense("create"), "Created");
        assert_eq!(past_tense("delete"), "Deleted");
    }
}
