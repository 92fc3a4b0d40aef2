//! Reusable interactive widgets shared by the screens.
//!
//! - [`Component`]: building block that handles keys and renders itself
//! - [`Handled`]: outcome of routing one key event
//! - [`Keybinding`]: key hint shown in the status bar

pub mod components;
pub mod widgets;

mod component;
mod status_bar;
mod toast;

pub use component::Component;
pub use components::{
    ColumnDef, ConfirmDialog, ConfirmEvent, Table, TableEvent, TableRow, TextInput, TextInputEvent,
};
pub use status_bar::{StatusBar, StatusInfo};
pub use toast::{Toast, ToastManager, ToastType};
pub use widgets::Spinner;

/// Result type alias for UI operations.
pub type Result<T> = std::result::Result<T, color_eyre::Report>;

/// Result of handling an input event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled<E> {
    /// Input was not handled, parent should process it.
    Ignored,
    /// Input was consumed but produced no event.
    Consumed,
    /// Input was consumed and produced an event.
    Event(E),
}

impl<E> Handled<E> {
    pub const fn is_consumed(&self) -> bool {
        !matches!(self, Self::Ignored)
    }

    pub fn event(self) -> Option<E> {
        match self {
            Self::Event(e) => Some(e),
            _ => None,
        }
    }

    pub fn map<F, U>(self, f: F) -> Handled<U>
    where
        F: FnOnce(E) -> U,
    {
        match self {
            Self::Ignored => Handled::Ignored,
            Self::Consumed => Handled::Consumed,
            Self::Event(e) => Handled::Event(f(e)),
        }
    }
}

impl<E> From<E> for Handled<E> {
    fn from(event: E) -> Self {
        Self::Event(event)
    }
}

/// A key hint: the key as displayed plus what it does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keybinding {
    pub key: String,
    pub description: String,
    /// Shown in the status bar, not only in the full list.
    pub hint: bool,
}

impl Keybinding {
    pub fn new(key: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            description: description.into(),
            hint: false,
        }
    }

    pub fn hint(key: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            description: description.into(),
            hint: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handled_map_keeps_kind() {
        assert_eq!(Handled::<u8>::Ignored.map(u16::from), Handled::Ignored);
        assert_eq!(Handled::<u8>::Consumed.map(u16::from), Handled::Consumed);
        assert_eq!(Handled::Event(7u8).map(u16::from), Handled::Event(7u16));
        assert!(Handled::<()>::Consumed.is_consumed());
        assert_eq!(Handled::from(3).event(), Some(3));
    }
}
