use std::sync::Arc;
use std::time::Duration;

use crossterm::event::KeyEvent;
use ratatui::Frame;
use ratatui::layout::{Constraint, Flex, Layout, Rect};
use ratatui::style::{Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::Paragraph;
use tokio::time::Instant;

use crate::Theme;
use crate::config::KeyResolver;
use crate::model::Scope;
use crate::nav::{Screen, ScreenCtx, ScreenError, Transition};
use crate::screens::PickerScreen;
use crate::ui::{self, Handled};

const SHOW_FOR: Duration = Duration::from_secs(2);

const BANNER: &[&str] = &[
    r"   __ _   _ __  __   __ (_) | |",
    r"  / _` | | '_ \ \ \ / / | | | |",
    r" | (_| | | | | | \ V /  | | | |",
    r"  \__,_| |_| |_|  \_/   |_| |_|",
];

/// Banner shown at startup. Leaves after a moment or on any key.
pub struct SplashScreen {
    resolver: Arc<KeyResolver>,
    resume: Option<Scope>,
    entered_at: Option<Instant>,
    dismissed: bool,
    endpoint: String,
}

impl SplashScreen {
    /// `resume` is a saved or requested scope to walk down to.
    pub fn new(resolver: Arc<KeyResolver>, endpoint: impl Into<String>, resume: Option<Scope>) -> Self {
        Self {
            resolver,
            resume,
            entered_at: None,
            dismissed: false,
            endpoint: endpoint.into(),
        }
    }

    fn next_screen(&mut self) -> Transition {
        let picker = PickerScreen::root(Arc::clone(&self.resolver)).resuming(self.resume.take());
        Transition::Replace(Box::new(picker))
    }
}

impl Screen for SplashScreen {
    fn breadcrumb(&self) -> String {
        "Anvil".to_string()
    }

    fn on_enter(&mut self, ctx: &mut ScreenCtx<'_>) -> Result<(), ScreenError> {
        self.entered_at = Some(ctx.now());
        Ok(())
    }

    fn handle_key(&mut self, _key: KeyEvent, _ctx: &mut ScreenCtx<'_>) -> ui::Result<Handled<Transition>> {
        self.dismissed = true;
        Ok(Handled::Consumed)
    }

    fn poll_transition(&mut self, ctx: &mut ScreenCtx<'_>) -> Option<Transition> {
        let elapsed = self
            .entered_at
            .is_some_and(|at| ctx.now().saturating_duration_since(at) >= SHOW_FOR);
        (self.dismissed || elapsed).then(|| self.next_screen())
    }

    fn show_error(&mut self, _message: String) {}

    fn render(&mut self, frame: &mut Frame, area: Rect, theme: &Theme) {
        let height = u16::try_from(BANNER.len() + 3).unwrap_or(u16::MAX);
        let [banner_area] = Layout::vertical([Constraint::Length(height)])
            .flex(Flex::Center)
            .areas(area);

        let banner_style = Style::default().fg(theme.mauve()).add_modifier(Modifier::BOLD);
        let mut lines: Vec<Line> = BANNER
            .iter()
            .map(|line| Line::from(Span::styled(*line, banner_style)))
            .collect();
        lines.push(Line::from(""));
        lines.push(Line::from(Span::styled(
            "Foundry projects in your terminal",
            Style::default().fg(theme.subtext1()),
        )));
        lines.push(Line::from(Span::styled(
            self.endpoint.clone(),
            Style::default().fg(theme.overlay1()),
        )));

        frame.render_widget(Paragraph::new(lines).centered(), banner_area);
    }
}

#[cfg(test)]
mod tests {
    use crossterm::event::{KeyCode, KeyModifiers};

    use super::*;
    use crate::cache::CachePolicy;
    use crate::dispatch::ActionDispatcher;
    use crate::model::ScreenId;
    use crate::nav::Services;

    fn services() -> Services {
        Services::new(CachePolicy::default(), ActionDispatcher::with_session("test"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_leaves_after_timeout() {
        let mut services = services();
        let mut splash = SplashScreen::new(Arc::default(), "demo", None);
        splash.on_enter(&mut ScreenCtx::new(ScreenId(1), &mut services)).unwrap();

        services.now = Instant::now() + Duration::from_millis(500);
        assert!(splash.poll_transition(&mut ScreenCtx::new(ScreenId(1), &mut services)).is_none());

        services.now = Instant::now() + SHOW_FOR;
        assert!(matches!(
            splash.poll_transition(&mut ScreenCtx::new(ScreenId(1), &mut services)),
            Some(Transition::Replace(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_any_key_dismisses() {
        let mut services = services();
        let mut splash = SplashScreen::new(Arc::default(), "demo", None);
        let mut ctx = ScreenCtx::new(ScreenId(1), &mut services);
        splash.on_enter(&mut ctx).unwrap();
        splash
            .handle_key(KeyEvent::new(KeyCode::Char(' '), KeyModifiers::NONE), &mut ctx)
            .unwrap();
        assert!(splash.poll_transition(&mut ctx).is_some());
    }
}
