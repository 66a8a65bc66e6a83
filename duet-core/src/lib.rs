//! Local edit model and CRDT binding for a collaborative rich-text editor.
//!
//! The [`Editor`] owns a Slate-shaped [`Document`] and turns commands into
//! primitive [`Operation`]s. The [`collab::Binding`] mirrors those operations
//! into a yrs document and reconciles remote updates back into operations.

pub mod capability;
pub mod collab;
pub mod document;
pub mod editor;
pub mod error;
pub mod history;
pub mod hotkeys;
pub mod node;
pub mod normalize;
pub mod operation;
pub mod path;
pub mod render;
pub mod selection;
pub mod toolbar;

pub use capability::{OperationSink, SelectionObserver};
pub use collab::Binding;
pub use document::Document;
pub use editor::{BlockFormat, Editor};
pub use error::CoreError;
pub use history::History;
pub use hotkeys::{Hotkey, Hotkeys, KeyEvent, Modifiers, Platform};
pub use node::{Align, BlockKind, Element, Mark, Marks, Node, Text};
pub use operation::{Operation, Origin, Tagged};
pub use path::Path;
pub use selection::{Point, Range};
pub use toolbar::{Toolbar, ToolbarAction};
