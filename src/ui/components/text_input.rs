use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use ratatui::Frame;
use ratatui::layout::{Constraint, Rect};
use ratatui::style::{Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, BorderType, Borders, Clear, Paragraph};

use crate::Theme;
use crate::ui::{Component, Handled, Result};

pub enum TextInputEvent {
    Submitted(String),
    Cancelled,
}

/// Single-line input shown as a centered popup. The cursor counts
/// characters, not bytes.
pub struct TextInput {
    label: String,
    value: String,
    cursor: usize,
    placeholder: Option<String>,
}

impl TextInput {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            value: String::new(),
            cursor: 0,
            placeholder: None,
        }
    }

    #[must_use]
    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = value.into();
        self.cursor = self.value.chars().count();
        self
    }

    #[must_use]
    pub fn with_placeholder(mut self, placeholder: impl Into<String>) -> Self {
        self.placeholder = Some(placeholder.into());
        self
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    fn byte_offset(&self, chars: usize) -> usize {
        self.value
            .char_indices()
            .nth(chars)
            .map_or(self.value.len(), |(offset, _)| offset)
    }

    fn len(&self) -> usize {
        self.value.chars().count()
    }

    fn insert_char(&mut self, c: char) {
        let offset = self.byte_offset(self.cursor);
        self.value.insert(offset, c);
        self.cursor += 1;
    }

    fn delete_char_before_cursor(&mut self) {
        if self.cursor > 0 {
            self.cursor -= 1;
            let offset = self.byte_offset(self.cursor);
            self.value.remove(offset);
        }
    }

    fn delete_char_at_cursor(&mut self) {
        if self.cursor < self.len() {
            let offset = self.byte_offset(self.cursor);
            self.value.remove(offset);
        }
    }

    fn delete_word_before_cursor(&mut self) {
        let chars: Vec<char> = self.value.chars().collect();
        let mut pos = self.cursor;
        while pos > 0 && chars[pos - 1] == ' ' {
            pos -= 1;
        }
        while pos > 0 && chars[pos - 1] != ' ' {
            pos -= 1;
        }
        let (start, end) = (self.byte_offset(pos), self.byte_offset(self.cursor));
        self.value.drain(start..end);
        self.cursor = pos;
    }
}

impl Component for TextInput {
    type Output = TextInputEvent;

    fn handle_key(&mut self, key: KeyEvent) -> Result<Handled<Self::Output>> {
        Ok(match (key.code, key.modifiers) {
            (KeyCode::Enter, _) => TextInputEvent::Submitted(self.value.trim().to_string()).into(),
            (KeyCode::Esc, _) => TextInputEvent::Cancelled.into(),

            (KeyCode::Backspace, KeyModifiers::ALT) | (KeyCode::Char('w'), KeyModifiers::CONTROL) => {
                self.delete_word_before_cursor();
                Handled::Consumed
            }
            (KeyCode::Backspace, _) => {
                self.delete_char_before_cursor();
                Handled::Consumed
            }
            (KeyCode::Delete, _) => {
                self.delete_char_at_cursor();
                Handled::Consumed
            }

            (KeyCode::Left, _) => {
                self.cursor = self.cursor.saturating_sub(1);
                Handled::Consumed
            }
            (KeyCode::Right, _) => {
                self.cursor = (self.cursor + 1).min(self.len());
                Handled::Consumed
            }
            (KeyCode::Home, _) | (KeyCode::Char('a'), KeyModifiers::CONTROL) => {
                self.cursor = 0;
                Handled::Consumed
            }
            (KeyCode::End, _) | (KeyCode::Char('e'), KeyModifiers::CONTROL) => {
                self.cursor = self.len();
                Handled::Consumed
            }
            (KeyCode::Char('u'), KeyModifiers::CONTROL) => {
                self.value.clear();
                self.cursor = 0;
                Handled::Consumed
            }

            (KeyCode::Char(c), KeyModifiers::NONE | KeyModifiers::SHIFT) => {
                self.insert_char(c);
                Handled::Consumed
            }

            // modal: nothing leaks to the screen underneath
            _ => Handled::Consumed,
        })
    }

    fn render(&mut self, frame: &mut Frame, area: Rect, theme: &Theme) {
        let popup_area = area.centered(Constraint::Percentage(50), Constraint::Length(3));
        frame.render_widget(Clear, popup_area);

        let input_style = Style::default().fg(theme.text());
        let cursor_style = Style::default()
            .fg(theme.base())
            .bg(theme.text())
            .add_modifier(Modifier::BOLD);

        let line = match (&self.placeholder, self.value.is_empty()) {
            (Some(placeholder), true) => Line::from(vec![
                Span::styled(" ", cursor_style),
                Span::styled(placeholder.clone(), Style::default().fg(theme.overlay0())),
            ]),
            _ => {
                let before: String = self.value.chars().take(self.cursor).collect();
                let mut rest = self.value.chars().skip(self.cursor);
                let at_cursor = rest.next().unwrap_or(' ');
                let after: String = rest.collect();
                Line::from(vec![
                    Span::styled(before, input_style),
                    Span::styled(at_cursor.to_string(), cursor_style),
                    Span::styled(after, input_style),
                ])
            }
        };

        let block = Block::default()
            .title(format!(" {} (Enter to confirm, Esc to cancel) ", self.label))
            .title_style(Style::default().fg(theme.mauve()).add_modifier(Modifier::BOLD))
            .borders(Borders::ALL)
            .border_type(BorderType::Rounded)
            .border_style(Style::default().fg(theme.lavender()))
            .style(Style::default().bg(theme.base()));

        frame.render_widget(Paragraph::new(line).block(block), popup_area);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn press(input: &mut TextInput, code: KeyCode) {
        input.handle_key(KeyEvent::new(code, KeyModifiers::NONE)).unwrap();
    }

    #[test]
    fn test_editing_multibyte_text() {
        let mut input = TextInput::new("Name").with_value("café");
        press(&mut input, KeyCode::Left);
        press(&mut input, KeyCode::Backspace);
        assert_eq!(input.value(), "caé");
        press(&mut input, KeyCode::Char('f'));
        assert_eq!(input.value(), "café");
        press(&mut input, KeyCode::End);
        press(&mut input, KeyCode::Char('!'));
        assert_eq!(input.value(), "café!");
    }

    #[test]
    fn test_submit_trims_value() {
        let mut input = TextInput::new("Name").with_value("  irma-v4 ");
        let event = input
            .handle_key(KeyEvent::new(KeyCode::Enter, KeyModifiers::NONE))
            .unwrap()
            .event();
        assert!(matches!(event, Some(TextInputEvent::Submitted(name)) if name == "irma-v4"));
    }

    #[test]
    fn test_delete_word() {
        let mut input = TextInput::new("Name").with_value("support tickets");
        input
            .handle_key(KeyEvent::new(KeyCode::Char('w'), KeyModifiers::CONTROL))
            .unwrap();
        assert_eq!(input.value(), "support ");
    }
}
