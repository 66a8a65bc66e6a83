//! Toolbar state derived from an editor.

use serde::Serialize;

use crate::editor::{BlockFormat, Editor};
use crate::node::{Align, BlockKind, Mark};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolbarAction {
    Undo,
    Redo,
    Mark(Mark),
    Block(BlockFormat),
}

impl ToolbarAction {
    pub fn icon(&self) -> &'static str {
        match self {
            ToolbarAction::Undo => "undo",
            ToolbarAction::Redo => "redo",
            ToolbarAction::Mark(Mark::Bold) => "format_bold",
            ToolbarAction::Mark(Mark::Italic) => "format_italic",
            ToolbarAction::Mark(Mark::Underline) => "format_underlined",
            ToolbarAction::Mark(Mark::Code) => "code",
            ToolbarAction::Block(BlockFormat::Kind(BlockKind::HeadingOne)) => "looks_one",
            ToolbarAction::Block(BlockFormat::Kind(BlockKind::HeadingTwo)) => "looks_two",
            ToolbarAction::Block(BlockFormat::Kind(BlockKind::BlockQuote)) => "format_quote",
            ToolbarAction::Block(BlockFormat::Kind(BlockKind::NumberedList)) => "format_list_numbered",
            ToolbarAction::Block(BlockFormat::Kind(BlockKind::BulletedList)) => "format_list_bulleted",
            ToolbarAction::Block(BlockFormat::Kind(_)) => "notes",
            ToolbarAction::Block(BlockFormat::Align(Align::Left)) => "format_align_left",
            ToolbarAction::Block(BlockFormat::Align(Align::Center)) => "format_align_center",
            ToolbarAction::Block(BlockFormat::Align(Align::Right)) => "format_align_right",
            ToolbarAction::Block(BlockFormat::Align(Align::Justify)) => "format_align_justify",
        }
    }

    /// Runs the action against `editor`.
    pub fn activate(&self, editor: &mut Editor) {
        match *self {
            ToolbarAction::Undo => editor.undo(),
            ToolbarAction::Redo => editor.redo(),
            ToolbarAction::Mark(mark) => editor.toggle_mark(mark),
            ToolbarAction::Block(format) => editor.toggle_block(format),
        }
    }
}

/// Buttons in display order, undo/redo first.
pub const ACTIONS: [ToolbarAction; 15] = [
    ToolbarAction::Undo,
    ToolbarAction::Redo,
    ToolbarAction::Mark(Mark::Bold),
    ToolbarAction::Mark(Mark::Italic),
    ToolbarAction::Mark(Mark::Underline),
    ToolbarAction::Mark(Mark::Code),
    ToolbarAction::Block(BlockFormat::Kind(BlockKind::HeadingOne)),
    ToolbarAction::Block(BlockFormat::Kind(BlockKind::HeadingTwo)),
    ToolbarAction::Block(BlockFormat::Kind(BlockKind::BlockQuote)),
    ToolbarAction::Block(BlockFormat::Kind(BlockKind::NumberedList)),
    ToolbarAction::Block(BlockFormat::Kind(BlockKind::BulletedList)),
    ToolbarAction::Block(BlockFormat::Align(Align::Left)),
    ToolbarAction::Block(BlockFormat::Align(Align::Center)),
    ToolbarAction::Block(BlockFormat::Align(Align::Right)),
    ToolbarAction::Block(BlockFormat::Align(Align::Justify)),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolbarButton {
    #[serde(skip)]
    pub action: ToolbarAction,
    pub icon: &'static str,
    pub active: bool,
    pub disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Toolbar {
    pub buttons: Vec<ToolbarButton>,
}

impl Toolbar {
    pub fn from_editor(editor: &Editor) -> Self {
        let buttons = ACTIONS
            .iter()
            .map(|action| {
                let (active, disabled) = match action {
                    ToolbarAction::Undo => (false, !editor.can_undo()),
                    ToolbarAction::Redo => (false, !editor.can_redo()),
                    ToolbarAction::Mark(mark) => (editor.is_mark_active(*mark), false),
                    ToolbarAction::Block(format) => (editor.is_block_active(*format), false),
                };
                ToolbarButton {
                    action: *action,
                    icon: action.icon(),
                    active,
                    disabled,
                }
            })
            .collect();
        Self { buttons }
    }

    pub fn button(&self, icon: &str) -> Option<&ToolbarButton> {
        self.buttons.iter().find(|button| button.icon == icon)
    }

    /// Icons of the buttons currently shown as active.
    pub fn active(&self) -> Vec<&'static str> {
        self.buttons.iter().filter(|b| b.active).map(|b| b.icon).collect()
    }
}
