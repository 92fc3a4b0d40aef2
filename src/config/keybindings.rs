use crossterm::event::KeyCode;
use serde::{Deserialize, Serialize};

use crate::config::key::{Key, KeyBinding};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalKeybindings {
    pub quit: KeyBinding,
    pub back: KeyBinding,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NavigationKeybindings {
    pub up: KeyBinding,
    pub down: KeyBinding,
    pub left: KeyBinding,
    pub right: KeyBinding,
    pub page_up: KeyBinding,
    pub page_down: KeyBinding,
    pub home: KeyBinding,
    pub end: KeyBinding,
    pub select: KeyBinding,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchKeybindings {
    pub toggle: KeyBinding,
    pub exit: KeyBinding,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceKeybindings {
    pub refresh: KeyBinding,
    pub new: KeyBinding,
    pub rename: KeyBinding,
    pub delete: KeyBinding,
    pub load_more: KeyBinding,
    pub copy_id: KeyBinding,
    pub cancel: KeyBinding,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogKeybindings {
    pub confirm: KeyBinding,
    pub cancel: KeyBinding,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct KeybindingsConfig {
    pub global: GlobalKeybindings,
    pub navigation: NavigationKeybindings,
    pub search: SearchKeybindings,
    pub resources: ResourceKeybindings,
    pub dialog: DialogKeybindings,
}

impl Default for GlobalKeybindings {
    fn default() -> Self {
        Self {
            quit: KeyBinding::multiple(vec![
                Key::new(KeyCode::Char('q')),
                Key::with_ctrl(KeyCode::Char('c')),
            ]),
            back: Key::new(KeyCode::Esc).into(),
        }
    }
}

impl Default for NavigationKeybindings {
    fn default() -> Self {
        Self {
            up: KeyBinding::multiple(vec![Key::new(KeyCode::Char('k')), Key::new(KeyCode::Up)]),
            down: KeyBinding::multiple(vec![Key::new(KeyCode::Char('j')), Key::new(KeyCode::Down)]),
            left: KeyBinding::multiple(vec![Key::new(KeyCode::Char('h')), Key::new(KeyCode::Left)]),
            right: KeyBinding::multiple(vec![Key::new(KeyCode::Char('l')), Key::new(KeyCode::Right)]),
            page_up: Key::new(KeyCode::PageUp).into(),
            page_down: Key::new(KeyCode::PageDown).into(),
            home: KeyBinding::multiple(vec![Key::new(KeyCode::Char('g')), Key::new(KeyCode::Home)]),
            end: KeyBinding::multiple(vec![Key::new(KeyCode::Char('G')), Key::new(KeyCode::End)]),
            select: Key::new(KeyCode::Enter).into(),
        }
    }
}

impl Default for SearchKeybindings {
    fn default() -> Self {
        Self {
            toggle: Key::new(KeyCode::Char('/')).into(),
            exit: Key::new(KeyCode::Esc).into(),
        }
    }
}

impl Default for ResourceKeybindings {
    fn default() -> Self {
        Self {
            refresh: Key::new(KeyCode::Char('r')).into(),
            new: Key::new(KeyCode::Char('n')).into(),
            rename: Key::new(KeyCode::Char('e')).into(),
            delete: KeyBinding::multiple(vec![
                Key::new(KeyCode::Char('d')),
                Key::new(KeyCode::Delete),
            ]),
            load_more: Key::new(KeyCode::Char('m')).into(),
            copy_id: Key::new(KeyCode::Char('y')).into(),
            cancel: Key::new(KeyCode::Char('x')).into(),
        }
    }
}

impl Default for DialogKeybindings {
    fn default() -> Self {
        Self {
            confirm: KeyBinding::multiple(vec![
                Key::new(KeyCode::Char('y')),
                Key::new(KeyCode::Char('Y')),
                Key::new(KeyCode::Enter),
            ]),
            cancel: KeyBinding::multiple(vec![
                Key::new(KeyCode::Char('n')),
                Key::new(KeyCode::Char('N')),
                Key::new(KeyCode::Esc),
            ]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_single_binding() {
        let config: KeybindingsConfig = toml::from_str(
            r#"
            [resources]
            refresh = "ctrl+r"
            delete = ["D", "Delete"]
            "#,
        )
        .unwrap();

        assert_eq!(config.resources.refresh, Key::with_ctrl(KeyCode::Char('r')).into());
        assert_eq!(config.resources.delete.display(), "D/Delete");
        // untouched entries keep their defaults
        assert_eq!(config.resources.new, Key::new(KeyCode::Char('n')).into());
        assert_eq!(config.navigation.select, Key::new(KeyCode::Enter).into());
    }
}
