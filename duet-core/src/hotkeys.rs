//! Keyboard shortcuts for mark toggles.
//!
//! Shortcuts are written the way browsers' hotkey helpers spell them:
//! `"mod+b"`, where `mod` is Cmd on macOS and Ctrl elsewhere.

use bitflags::bitflags;
use std::fmt;

use crate::editor::Editor;
use crate::node::Mark;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Modifiers: u8 {
        const CTRL = 1;
        const SHIFT = 1 << 1;
        const ALT = 1 << 2;
        const META = 1 << 3;
        /// Platform command key; resolved before matching.
        const MOD = 1 << 4;
    }
}

/// Platform used to resolve the `mod` modifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Mac,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Platform::Mac
        } else {
            Platform::Other
        }
    }
}

impl Modifiers {
    /// Replaces `MOD` with the platform's command key.
    pub fn resolve(self, platform: Platform) -> Modifiers {
        if !self.contains(Modifiers::MOD) {
            return self;
        }
        let command = match platform {
            Platform::Mac => Modifiers::META,
            Platform::Other => Modifiers::CTRL,
        };
        (self - Modifiers::MOD) | command
    }
}

/// A key press as delivered by the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    pub key: char,
    pub modifiers: Modifiers,
}

impl KeyEvent {
    pub fn new(key: char, modifiers: Modifiers) -> Self {
        Self {
            key: key.to_ascii_lowercase(),
            modifiers,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hotkey {
    pub modifiers: Modifiers,
    pub key: char,
}

impl Hotkey {
    /// Parses `"mod+shift+x"` style strings. Returns `None` for unknown
    /// modifiers or anything other than a single trailing key.
    pub fn parse(s: &str) -> Option<Self> {
        let mut modifiers = Modifiers::empty();
        let mut parts: Vec<&str> = s.split('+').collect();
        let key = parts.pop()?;
        for part in parts {
            modifiers |= match part.to_ascii_lowercase().as_str() {
                "mod" => Modifiers::MOD,
                "ctrl" | "control" => Modifiers::CTRL,
                "shift" => Modifiers::SHIFT,
                "alt" | "option" => Modifiers::ALT,
                "meta" | "cmd" => Modifiers::META,
                _ => return None,
            };
        }
        let mut chars = key.chars();
        let key = chars.next()?;
        if chars.next().is_some() {
            return None;
        }
        Some(Hotkey {
            modifiers,
            key: key.to_ascii_lowercase(),
        })
    }

    pub fn matches(&self, event: &KeyEvent, platform: Platform) -> bool {
        self.key == event.key && self.modifiers.resolve(platform) == event.modifiers.resolve(platform)
    }
}

impl fmt::Display for Hotkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (flag, name) in [
            (Modifiers::MOD, "mod"),
            (Modifiers::CTRL, "ctrl"),
            (Modifiers::SHIFT, "shift"),
            (Modifiers::ALT, "alt"),
            (Modifiers::META, "meta"),
        ] {
            if self.modifiers.contains(flag) {
                write!(f, "{}+", name)?;
            }
        }
        write!(f, "{}", self.key)
    }
}

/// Table of shortcut to mark bindings.
#[derive(Debug, Clone)]
pub struct Hotkeys {
    bindings: Vec<(Hotkey, Mark)>,
    platform: Platform,
}

impl Default for Hotkeys {
    fn default() -> Self {
        let mut hotkeys = Hotkeys::new(Platform::current());
        for (keys, mark) in [
            ("mod+b", Mark::Bold),
            ("mod+i", Mark::Italic),
            ("mod+u", Mark::Underline),
            ("mod+`", Mark::Code),
        ] {
            if let Some(hotkey) = Hotkey::parse(keys) {
                hotkeys.bind(hotkey, mark);
            }
        }
        hotkeys
    }
}

impl Hotkeys {
    pub fn new(platform: Platform) -> Self {
        Self {
            bindings: Vec::new(),
            platform,
        }
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn bind(&mut self, hotkey: Hotkey, mark: Mark) {
        self.bindings.retain(|(existing, _)| *existing != hotkey);
        self.bindings.push((hotkey, mark));
    }

    pub fn lookup(&self, event: &KeyEvent) -> Option<Mark> {
        self.bindings
            .iter()
            .find(|(hotkey, _)| hotkey.matches(event, self.platform))
            .map(|(_, mark)| *mark)
    }

    /// Toggles the bound mark on `editor`. Returns whether the key was handled.
    pub fn handle(&self, editor: &mut Editor, event: &KeyEvent) -> bool {
        match self.lookup(event) {
            Some(mark) => {
                log::trace!("hotkey {:?} toggles {}", event, mark);
                editor.toggle_mark(mark);
                true
            }
            None => false,
        }
    }
}
