//! The dashboard's screens: splash, the scoped pickers that lead to a
//! project, the resource browser and the detail view.

mod detail;
mod home;
mod picker;
mod splash;

pub use detail::DetailScreen;
pub use home::HomeScreen;
pub use picker::PickerScreen;
pub use splash::SplashScreen;

use ratatui::Frame;
use ratatui::layout::{Alignment, Constraint, Rect};
use ratatui::style::{Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, BorderType, Borders, Cell, Paragraph, Wrap};

use crate::Theme;
use crate::api::ApiError;
use crate::model::{ItemState, ResourceItem, ResourceKind};
use crate::search::Matcher;
use crate::ui::{ColumnDef, TableRow};

/// Table columns of a resource kind; the first one takes the spare width.
fn columns_for(kind: ResourceKind) -> Vec<ColumnDef> {
    kind.columns()
        .iter()
        .enumerate()
        .map(|(i, column)| {
            let constraint = if i == 0 {
                Constraint::Min(20)
            } else {
                Constraint::Fill(1)
            };
            ColumnDef::new(column.header, column.field, constraint)
        })
        .collect()
}

impl TableRow for ResourceItem {
    fn row_key(&self) -> &str {
        &self.id
    }

    fn render_cells(&self, columns: &[ColumnDef], theme: &Theme) -> Vec<Cell<'static>> {
        columns
            .iter()
            .map(|column| {
                let value = self.field(column.field).unwrap_or("—").to_string();
                let style = match self.state {
                    ItemState::Optimistic { .. } => Style::default()
                        .fg(theme.overlay1())
                        .add_modifier(Modifier::ITALIC),
                    ItemState::Reverted => Style::default().fg(theme.error()),
                    ItemState::Confirmed if column.field == "status" => {
                        Style::default().fg(theme.status(&value))
                    }
                    ItemState::Confirmed => Style::default(),
                };
                Cell::from(value).style(style)
            })
            .collect()
    }

    fn matches(&self, query: &str) -> bool {
        Matcher::new().matches_any([self.name.as_str(), self.id.as_str()], query)
    }
}

/// What to tell the user about a failed request.
fn describe_error(error: &ApiError) -> String {
    match error {
        ApiError::Unauthorized(_) => {
            format!("{error}\n\nSign in again (renew the access token), then press r to retry.")
        }
        ApiError::NotFound(_) => format!("{error}\n\nIt may have been deleted elsewhere."),
        _ => format!("{error}\n\nPress r to retry."),
    }
}

/// Inline error panel shown in place of data.
fn render_error(frame: &mut Frame, area: Rect, theme: &Theme, message: &str) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_type(BorderType::Rounded)
        .border_style(Style::default().fg(theme.error()))
        .title(Line::from(Span::styled(
            " Error ",
            Style::default().fg(theme.error()).add_modifier(Modifier::BOLD),
        )));
    let paragraph = Paragraph::new(message.to_string())
        .style(Style::default().fg(theme.text()))
        .alignment(Alignment::Center)
        .wrap(Wrap { trim: false })
        .block(block);
    frame.render_widget(paragraph, area);
}
