use crate::config::actions::*;
use crate::config::key::KeyBinding;
use crate::config::keybindings::KeybindingsConfig;
use crossterm::event::KeyEvent;
use std::sync::Arc;

/// Maps key events to the actions configured for them.
pub struct KeyResolver {
    pub keybindings: Arc<KeybindingsConfig>,
}

impl KeyResolver {
    pub const fn new(keybindings: Arc<KeybindingsConfig>) -> Self {
        Self { keybindings }
    }

    fn global(&self, action: GlobalAction) -> &KeyBinding {
        let kb = &self.keybindings.global;
        match action {
            GlobalAction::Quit => &kb.quit,
            GlobalAction::Back => &kb.back,
        }
    }

    fn nav(&self, action: NavAction) -> &KeyBinding {
        let kb = &self.keybindings.navigation;
        match action {
            NavAction::Up => &kb.up,
            NavAction::Down => &kb.down,
            NavAction::Left => &kb.left,
            NavAction::Right => &kb.right,
            NavAction::PageUp => &kb.page_up,
            NavAction::PageDown => &kb.page_down,
            NavAction::Home => &kb.home,
            NavAction::End => &kb.end,
            NavAction::Select => &kb.select,
        }
    }

    fn search(&self, action: SearchAction) -> &KeyBinding {
        let kb = &self.keybindings.search;
        match action {
            SearchAction::Toggle => &kb.toggle,
            SearchAction::Exit => &kb.exit,
        }
    }

    fn resource(&self, action: ResourceAction) -> &KeyBinding {
        let kb = &self.keybindings.resources;
        match action {
            ResourceAction::Refresh => &kb.refresh,
            ResourceAction::New => &kb.new,
            ResourceAction::Rename => &kb.rename,
            ResourceAction::Delete => &kb.delete,
            ResourceAction::LoadMore => &kb.load_more,
            ResourceAction::CopyId => &kb.copy_id,
            ResourceAction::Cancel => &kb.cancel,
        }
    }

    fn dialog(&self, action: DialogAction) -> &KeyBinding {
        let kb = &self.keybindings.dialog;
        match action {
            DialogAction::Confirm => &kb.confirm,
            DialogAction::Cancel => &kb.cancel,
        }
    }

    pub fn matches_global(&self, event: &KeyEvent, action: GlobalAction) -> bool {
        self.global(action).matches(event)
    }

    pub fn display_global(&self, action: GlobalAction) -> String {
        self.global(action).display()
    }

    pub fn matches_nav(&self, event: &KeyEvent, action: NavAction) -> bool {
        self.nav(action).matches(event)
    }

    pub fn display_nav(&self, action: NavAction) -> String {
        self.nav(action).display()
    }

    pub fn matches_search(&self, event: &KeyEvent, action: SearchAction) -> bool {
        self.search(action).matches(event)
    }

    pub fn display_search(&self, action: SearchAction) -> String {
        self.search(action).display()
    }

    pub fn matches_resource(&self, event: &KeyEvent, action: ResourceAction) -> bool {
        self.resource(action).matches(event)
    }

    pub fn display_resource(&self, action: ResourceAction) -> String {
        self.resource(action).display()
    }

    pub fn matches_dialog(&self, event: &KeyEvent, action: DialogAction) -> bool {
        self.dialog(action).matches(event)
    }

    pub fn display_dialog(&self, action: DialogAction) -> String {
        self.dialog(action).display()
    }
}

impl Default for KeyResolver {
    fn default() -> Self {
        Self::new(Arc::new(KeybindingsConfig::default()))
    }
}
