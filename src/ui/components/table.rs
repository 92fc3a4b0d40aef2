use crate::Theme;
use crate::config::{KeyResolver, NavAction, SearchAction};
use crate::ui::{Component, Handled, Result};
use crossterm::event::{KeyCode, KeyEvent};
use ratatui::Frame;
use ratatui::layout::{Alignment, Constraint, Layout, Rect};
use ratatui::prelude::{Modifier, Style};
use ratatui::widgets::{Block, BorderType, Borders, Cell, Paragraph, Row, Table as TableWidget, TableState};
use std::sync::Arc;

const PAGE_STEP: usize = 10;

pub enum TableEvent<T> {
    Changed(T),
    Activated(T),
    SearchChanged(String),
}

/// A column: header text, the row field it shows and its width.
#[derive(Debug, Clone, Copy)]
pub struct ColumnDef {
    pub header: &'static str,
    pub field: &'static str,
    pub constraint: Constraint,
}

impl ColumnDef {
    pub const fn new(header: &'static str, field: &'static str, constraint: Constraint) -> Self {
        Self {
            header,
            field,
            constraint,
        }
    }
}

pub trait TableRow {
    /// Stable identity used to keep the selection across data updates.
    fn row_key(&self) -> &str;

    fn render_cells(&self, columns: &[ColumnDef], theme: &Theme) -> Vec<Cell<'static>>;

    /// Return true if this row matches the search query for local filtering.
    fn matches(&self, query: &str) -> bool;
}

/// Selectable table with `/` filtering.
pub struct Table<T: TableRow + Clone> {
    items: Vec<T>,
    filtered_indices: Vec<usize>,
    state: TableState,
    columns: Vec<ColumnDef>,
    title: Option<String>,
    empty_message: String,
    searching: bool,
    query: String,
    focused: bool,
    resolver: Arc<KeyResolver>,
}

impl<T: TableRow + Clone> Table<T> {
    pub fn new(columns: Vec<ColumnDef>, resolver: Arc<KeyResolver>) -> Self {
        Self {
            items: Vec::new(),
            filtered_indices: Vec::new(),
            state: TableState::default(),
            columns,
            title: None,
            empty_message: "Nothing here yet".to_string(),
            searching: false,
            query: String::new(),
            focused: true,
            resolver,
        }
    }

    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        self.title = Some(title.into());
    }

    pub fn set_empty_message(&mut self, message: impl Into<String>) {
        self.empty_message = message.into();
    }

    pub const fn set_focused(&mut self, focused: bool) {
        self.focused = focused;
    }

    /// Replaces the columns and rows, clearing any filter.
    pub fn reset(&mut self, columns: Vec<ColumnDef>, items: Vec<T>) {
        self.columns = columns;
        self.query.clear();
        self.searching = false;
        self.state.select(None);
        self.set_items(items);
    }

    /// Replaces the rows, keeping the selected row when it still exists.
    pub fn set_items(&mut self, items: Vec<T>) {
        let selected_key = self.selected_item().map(|item| item.row_key().to_string());
        let selected_index = self.state.selected();
        self.items = items;
        self.update_filter();

        let by_key = selected_key.and_then(|key| {
            self.filtered_indices
                .iter()
                .position(|&idx| self.items[idx].row_key() == key)
        });
        match (by_key, selected_index) {
            (Some(position), _) => self.state.select(Some(position)),
            (None, Some(previous)) if !self.filtered_indices.is_empty() => {
                self.state.select(Some(previous.min(self.filtered_indices.len() - 1)));
            }
            _ => {}
        }
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn selected_item(&self) -> Option<&T> {
        let selected = self.state.selected()?;
        let &idx = self.filtered_indices.get(selected)?;
        self.items.get(idx)
    }

    pub const fn is_searching(&self) -> bool {
        self.searching
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    fn update_filter(&mut self) {
        self.filtered_indices = self
            .items
            .iter()
            .enumerate()
            .filter(|(_, item)| self.query.is_empty() || item.matches(&self.query))
            .map(|(i, _)| i)
            .collect();

        if self.filtered_indices.is_empty() {
            self.state.select(None);
        } else if self
            .state
            .selected()
            .is_none_or(|i| i >= self.filtered_indices.len())
        {
            self.state.select(Some(0));
        }
    }

    fn select(&mut self, index: usize) {
        if !self.filtered_indices.is_empty() {
            self.state.select(Some(index.min(self.filtered_indices.len() - 1)));
        }
    }

    fn change_event(&self, before: Option<usize>) -> Handled<TableEvent<T>> {
        match (self.state.selected(), self.selected_item()) {
            (Some(selected), Some(item)) if Some(selected) != before => {
                TableEvent::Changed(item.clone()).into()
            }
            _ => Handled::Consumed,
        }
    }

    fn handle_search_key(&mut self, key: KeyEvent) -> Handled<TableEvent<T>> {
        if self.resolver.matches_search(&key, SearchAction::Exit) {
            self.searching = false;
            let had_query = !self.query.is_empty();
            self.query.clear();
            self.update_filter();
            return if had_query {
                TableEvent::SearchChanged(String::new()).into()
            } else {
                Handled::Consumed
            };
        }

        // Enter leaves search mode but keeps the filter
        if self.resolver.matches_nav(&key, NavAction::Select) {
            self.searching = false;
            return Handled::Consumed;
        }

        match key.code {
            KeyCode::Backspace => {
                self.query.pop();
                self.update_filter();
                TableEvent::SearchChanged(self.query.clone()).into()
            }
            KeyCode::Char(c) => {
                self.query.push(c);
                self.update_filter();
                TableEvent::SearchChanged(self.query.clone()).into()
            }
            _ => Handled::Consumed,
        }
    }

    fn handle_navigation_key(&mut self, key: KeyEvent) -> Handled<TableEvent<T>> {
        let before = self.state.selected();
        let current = before.unwrap_or(0);
        let last = self.filtered_indices.len().saturating_sub(1);

        let target = if self.resolver.matches_nav(&key, NavAction::Down) {
            Some(if before.is_some() { current + 1 } else { 0 })
        } else if self.resolver.matches_nav(&key, NavAction::Up) {
            Some(current.saturating_sub(1))
        } else if self.resolver.matches_nav(&key, NavAction::Home) {
            Some(0)
        } else if self.resolver.matches_nav(&key, NavAction::End) {
            Some(last)
        } else if self.resolver.matches_nav(&key, NavAction::PageDown) {
            Some(current + PAGE_STEP)
        } else if self.resolver.matches_nav(&key, NavAction::PageUp) {
            Some(current.saturating_sub(PAGE_STEP))
        } else {
            None
        };
        if let Some(target) = target {
            self.select(target);
            return self.change_event(before);
        }

        if self.resolver.matches_nav(&key, NavAction::Select) {
            return self
                .selected_item()
                .map_or(Handled::Ignored, |item| TableEvent::Activated(item.clone()).into());
        }
        if self.resolver.matches_search(&key, SearchAction::Toggle) {
            self.searching = true;
            return Handled::Consumed;
        }
        if self.resolver.matches_search(&key, SearchAction::Exit) && !self.query.is_empty() {
            self.query.clear();
            self.update_filter();
            return TableEvent::SearchChanged(String::new()).into();
        }

        Handled::Ignored
    }
}

impl<T: TableRow + Clone> Component for Table<T> {
    type Output = TableEvent<T>;

    fn handle_key(&mut self, key: KeyEvent) -> Result<Handled<Self::Output>> {
        Ok(if self.searching {
            self.handle_search_key(key)
        } else {
            self.handle_navigation_key(key)
        })
    }

    fn render(&mut self, frame: &mut Frame, area: Rect, theme: &Theme) {
        let has_search_bar = self.searching || !self.query.is_empty();
        let (table_area, search_area) = if has_search_bar {
            let chunks = Layout::vertical([Constraint::Min(0), Constraint::Length(1)]).split(area);
            (chunks[0], Some(chunks[1]))
        } else {
            (area, None)
        };

        let border_color = if self.focused {
            theme.border_focused()
        } else {
            theme.border()
        };
        let mut block = Block::default()
            .borders(Borders::ALL)
            .border_type(BorderType::Rounded)
            .border_style(Style::default().fg(border_color));
        if let Some(title) = &self.title {
            block = block
                .title(title.as_str())
                .title_style(Style::default().fg(theme.mauve()).add_modifier(Modifier::BOLD));
        }

        if self.filtered_indices.is_empty() {
            let message = if self.query.is_empty() {
                self.empty_message.clone()
            } else {
                format!("No matches for '{}'", self.query)
            };
            let paragraph = Paragraph::new(message)
                .style(Style::default().fg(theme.overlay1()))
                .alignment(Alignment::Center)
                .block(block);
            frame.render_widget(paragraph, table_area);
        } else {
            let header = Row::new(self.columns.iter().map(|c| {
                Cell::from(c.header)
                    .style(Style::default().fg(theme.header()).add_modifier(Modifier::BOLD))
            }))
            .height(1)
            .style(Style::default().bg(theme.surface0()));

            let rows: Vec<Row> = self
                .filtered_indices
                .iter()
                .map(|&idx| {
                    Row::new(self.items[idx].render_cells(&self.columns, theme))
                        .style(Style::default().fg(theme.text()))
                })
                .collect();

            let widths: Vec<Constraint> = self.columns.iter().map(|c| c.constraint).collect();
            let table = TableWidget::new(rows, widths)
                .header(header)
                .block(block)
                .row_highlight_style(
                    Style::default()
                        .bg(theme.selection_bg())
                        .fg(theme.lavender())
                        .add_modifier(Modifier::BOLD),
                )
                .highlight_symbol("▶ ");
            frame.render_stateful_widget(table, table_area, &mut self.state);
        }

        if let Some(search_area) = search_area {
            let search_text = if self.searching {
                format!("/{}_", self.query)
            } else {
                format!("/{} ({} matches)", self.query, self.filtered_indices.len())
            };
            let search_style = if self.searching {
                Style::default().fg(theme.yellow())
            } else {
                Style::default().fg(theme.subtext0())
            };
            frame.render_widget(Paragraph::new(search_text).style(search_style), search_area);
        }
    }
}
