use std::sync::Arc;

use ratatui::Frame;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, BorderType, Borders, Paragraph};

use crate::Theme;
use crate::config::{GlobalAction, KeyResolver};
use crate::ui::Keybinding;

const LOGO: &[&str] = &[
    r"    ___________ ",
    r"   /__________/|",
    r"   \___  ___\/ ",
    r"      |__|     ",
    r"    anvil      ",
];

/// What the status bar shows besides key hints.
#[derive(Debug, Clone, Default)]
pub struct StatusInfo {
    /// Breadcrumbs of every screen on the stack, root first.
    pub breadcrumbs: Vec<String>,
    /// API endpoint, or a marker for demo data.
    pub endpoint: String,
    /// Mutations submitted but not resolved yet.
    pub pending_actions: usize,
}

pub struct StatusBar {
    resolver: Arc<KeyResolver>,
}

impl StatusBar {
    pub const fn new(resolver: Arc<KeyResolver>) -> Self {
        Self { resolver }
    }

    pub fn render(
        &self,
        frame: &mut Frame,
        area: Rect,
        theme: &Theme,
        info: &StatusInfo,
        local_keybindings: &[Keybinding],
    ) {
        let block = Block::default()
            .borders(Borders::ALL)
            .border_type(BorderType::Rounded)
            .border_style(Style::default().fg(theme.surface1()));

        let inner_area = block.inner(area);
        frame.render_widget(block, area);

        let chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([
                Constraint::Length(44),
                Constraint::Min(20),
                Constraint::Length(16),
            ])
            .split(inner_area);

        Self::render_status_info(frame, chunks[0], theme, info);
        self.render_keybindings(frame, chunks[1], theme, local_keybindings);
        Self::render_logo(frame, chunks[2], theme);
    }

    fn render_status_info(frame: &mut Frame, area: Rect, theme: &Theme, info: &StatusInfo) {
        let w = area.width as usize;
        let label_style = Style::default().fg(theme.overlay1());
        let value_style = Style::default().fg(theme.text());

        let mut lines = Vec::new();
        let crumbs = info.breadcrumbs.join(" › ");
        lines.push(Line::from(Span::styled(
            truncate_start(&crumbs, w),
            Style::default().fg(theme.lavender()).add_modifier(Modifier::BOLD),
        )));
        lines.push(Line::from(""));
        lines.push(status_line("endpoint", &info.endpoint, w, label_style, value_style));
        let pending_style = if info.pending_actions > 0 {
            Style::default().fg(theme.warning())
        } else {
            value_style
        };
        lines.push(status_line(
            "pending",
            &info.pending_actions.to_string(),
            w,
            label_style,
            pending_style,
        ));

        frame.render_widget(Paragraph::new(lines), area);
    }

    fn render_keybindings(
        &self,
        frame: &mut Frame,
        area: Rect,
        theme: &Theme,
        local_keybindings: &[Keybinding],
    ) {
        let global_keybindings = self.global_keybindings();
        let hints: Vec<&Keybinding> = local_keybindings
            .iter()
            .chain(global_keybindings.iter())
            .filter(|kb| kb.hint)
            .collect();

        if hints.is_empty() || area.height == 0 {
            return;
        }

        // Align the separators so they form one vertical line per column.
        let max_key_w = hints.iter().map(|kb| kb.key.chars().count()).max().unwrap_or(1);
        let max_desc_w = hints.iter().map(|kb| kb.description.len()).max().unwrap_or(1);
        let col_width = u16::try_from(max_key_w + 3 + max_desc_w + 2).unwrap_or(u16::MAX);
        let num_cols = (area.width / col_width).max(1) as usize;
        let num_rows = area.height as usize;

        let mut columns: Vec<Vec<Line>> = vec![Vec::new(); num_cols];
        for (i, kb) in hints.iter().enumerate() {
            let col_idx = i / num_rows;
            if col_idx >= num_cols {
                break;
            }
            columns[col_idx].push(Line::from(vec![
                Span::styled(
                    format!("{:>width$}", kb.key, width = max_key_w),
                    Style::default().fg(theme.peach()),
                ),
                Span::styled(" │ ", Style::default().fg(theme.surface2())),
                Span::styled(kb.description.clone(), Style::default().fg(theme.subtext0())),
            ]));
        }

        let col_areas = Layout::default()
            .direction(Direction::Horizontal)
            .constraints(vec![Constraint::Length(col_width); num_cols])
            .split(area);
        for (col_lines, col_area) in columns.into_iter().zip(col_areas.iter()) {
            frame.render_widget(Paragraph::new(col_lines), *col_area);
        }
    }

    fn render_logo(frame: &mut Frame, area: Rect, theme: &Theme) {
        let style = Style::default().fg(theme.mauve()).add_modifier(Modifier::BOLD);
        let logo_lines: Vec<Line> = LOGO.iter().map(|line| Line::from(Span::styled(*line, style))).collect();
        frame.render_widget(Paragraph::new(logo_lines), area);
    }

    fn global_keybindings(&self) -> Vec<Keybinding> {
        vec![
            Keybinding::hint(self.resolver.display_global(GlobalAction::Back), "Back"),
            Keybinding::hint(self.resolver.display_global(GlobalAction::Quit), "Quit"),
        ]
    }
}

/// `  label  value` with a right-aligned label.
fn status_line<'a>(
    label: &'a str,
    value: &str,
    max_width: usize,
    label_style: Style,
    value_style: Style,
) -> Line<'a> {
    const LABEL_W: usize = 9;
    let available = max_width.saturating_sub(LABEL_W + 1);
    Line::from(vec![
        Span::styled(format!("{label:>LABEL_W$}"), label_style),
        Span::raw(" "),
        Span::styled(truncate_end(value, available), value_style),
    ])
}

fn truncate_end(s: &str, max_width: usize) -> String {
    let len = s.chars().count();
    if len <= max_width {
        s.to_string()
    } else if max_width > 3 {
        format!("{}...", s.chars().take(max_width - 3).collect::<String>())
    } else {
        s.chars().take(max_width).collect()
    }
}

/// Long breadcrumb trails lose their beginning, the current screen stays visible.
fn truncate_start(s: &str, max_width: usize) -> String {
    let len = s.chars().count();
    if len <= max_width {
        s.to_string()
    } else if max_width > 1 {
        format!("…{}", s.chars().skip(len - (max_width - 1)).collect::<String>())
    } else {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncation() {
        assert_eq!(truncate_end("contoso-foundry", 20), "contoso-foundry");
        assert_eq!(truncate_end("contoso-foundry", 10), "contoso...");
        assert_eq!(truncate_start("Subscriptions › Projects › Home", 10), "…ts › Home");
    }
}
