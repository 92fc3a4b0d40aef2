use crossterm::event::KeyEvent;
use ratatui::Frame;
use ratatui::layout::Rect;

use crate::Theme;
use crate::ui::{Handled, Result};

/// Interactive UI building block.
///
/// Components handle key events and emit generic outputs such as
/// [`TableEvent`](crate::ui::TableEvent). They know nothing about resources,
/// the cache or the API.
pub trait Component {
    type Output;

    /// Returns `Ignored` when the parent should see the key, `Consumed` when
    /// it was handled silently, `Event` when it produced an output.
    fn handle_key(&mut self, key: KeyEvent) -> Result<Handled<Self::Output>> {
        _ = key;
        Ok(Handled::Ignored)
    }

    /// Called on each tick for animations and time-based updates.
    fn on_tick(&mut self) {}

    fn render(&mut self, frame: &mut Frame, area: Rect, theme: &Theme);
}
