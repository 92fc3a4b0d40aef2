use std::sync::Arc;

use crossterm::event::KeyEvent;
use ratatui::Frame;
use ratatui::layout::{Alignment, Constraint, Rect};
use ratatui::style::{Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, BorderType, Borders, Clear, Paragraph, Wrap};

use crate::Theme;
use crate::config::{DialogAction, KeyResolver};
use crate::ui::{Component, Handled, Result};

pub enum ConfirmEvent {
    Confirmed,
    Cancelled,
}

/// Yes/no popup. Destructive prompts render in red.
pub struct ConfirmDialog {
    title: String,
    message: String,
    confirm_text: String,
    danger: bool,
    resolver: Arc<KeyResolver>,
}

impl ConfirmDialog {
    pub fn new(message: impl Into<String>, resolver: Arc<KeyResolver>) -> Self {
        Self {
            title: "Confirm".to_string(),
            message: message.into(),
            confirm_text: "Yes".to_string(),
            danger: false,
            resolver,
        }
    }

    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    #[must_use]
    pub fn with_confirm_text(mut self, text: impl Into<String>) -> Self {
        self.confirm_text = text.into();
        self
    }

    #[must_use]
    pub const fn danger(mut self) -> Self {
        self.danger = true;
        self
    }
}

impl Component for ConfirmDialog {
    type Output = ConfirmEvent;

    fn handle_key(&mut self, key: KeyEvent) -> Result<Handled<Self::Output>> {
        if self.resolver.matches_dialog(&key, DialogAction::Confirm) {
            return Ok(ConfirmEvent::Confirmed.into());
        }
        if self.resolver.matches_dialog(&key, DialogAction::Cancel) {
            return Ok(ConfirmEvent::Cancelled.into());
        }
        Ok(Handled::Consumed)
    }

    fn render(&mut self, frame: &mut Frame, area: Rect, theme: &Theme) {
        let popup_area = area.centered(Constraint::Percentage(50), Constraint::Length(7));
        frame.render_widget(Clear, popup_area);

        let (title_color, border_color, confirm_color) = if self.danger {
            (theme.red(), theme.red(), theme.red())
        } else {
            (theme.mauve(), theme.lavender(), theme.green())
        };
        let key_style = Style::default().fg(theme.peach()).add_modifier(Modifier::BOLD);

        let lines = vec![
            Line::from(""),
            Line::from(Span::styled(self.message.clone(), Style::default().fg(theme.text()))),
            Line::from(""),
            Line::from(vec![
                Span::styled(
                    format!("[{}]", self.resolver.display_dialog(DialogAction::Confirm)),
                    key_style,
                ),
                Span::raw(" "),
                Span::styled(
                    self.confirm_text.clone(),
                    Style::default().fg(confirm_color).add_modifier(Modifier::BOLD),
                ),
                Span::raw("    "),
                Span::styled(
                    format!("[{}]", self.resolver.display_dialog(DialogAction::Cancel)),
                    key_style,
                ),
                Span::raw(" "),
                Span::styled("No", Style::default().fg(theme.overlay1()).add_modifier(Modifier::BOLD)),
            ]),
        ];

        let block = Block::default()
            .title(format!(" {} ", self.title))
            .title_style(Style::default().fg(title_color).add_modifier(Modifier::BOLD))
            .borders(Borders::ALL)
            .border_type(BorderType::Rounded)
            .border_style(Style::default().fg(border_color))
            .style(Style::default().bg(theme.base()));

        let paragraph = Paragraph::new(lines)
            .block(block)
            .alignment(Alignment::Center)
            .wrap(Wrap { trim: true });
        frame.render_widget(paragraph, popup_area);
    }
}
