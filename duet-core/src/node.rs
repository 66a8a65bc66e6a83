//! Rich-text nodes: block elements and marked text runs.
//!
//! The serialized shape follows the Slate value format so documents can be
//! exchanged with browser editors:
//!
//! ```text
//! { "type": "paragraph", "align": "center", "children": [
//!     { "text": "rich", "bold": true },
//!     { "text": " text" }
//! ] }
//! ```

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Block element kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockKind {
    Paragraph,
    HeadingOne,
    HeadingTwo,
    BlockQuote,
    NumberedList,
    BulletedList,
    ListItem,
}

impl BlockKind {
    pub const ALL: [BlockKind; 7] = [
        BlockKind::Paragraph,
        BlockKind::HeadingOne,
        BlockKind::HeadingTwo,
        BlockKind::BlockQuote,
        BlockKind::NumberedList,
        BlockKind::BulletedList,
        BlockKind::ListItem,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::Paragraph => "paragraph",
            BlockKind::HeadingOne => "heading-one",
            BlockKind::HeadingTwo => "heading-two",
            BlockKind::BlockQuote => "block-quote",
            BlockKind::NumberedList => "numbered-list",
            BlockKind::BulletedList => "bulleted-list",
            BlockKind::ListItem => "list-item",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == s)
    }

    /// List containers wrap `list-item` children.
    pub fn is_list(&self) -> bool {
        matches!(self, BlockKind::NumberedList | BlockKind::BulletedList)
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Block-level text alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Align {
    Left,
    Center,
    Right,
    Justify,
}

impl Align {
    pub const ALL: [Align; 4] = [Align::Left, Align::Center, Align::Right, Align::Justify];

    pub fn as_str(&self) -> &'static str {
        match self {
            Align::Left => "left",
            Align::Center => "center",
            Align::Right => "right",
            Align::Justify => "justify",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|align| align.as_str() == s)
    }
}

impl fmt::Display for Align {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single inline formatting mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mark {
    Bold,
    Italic,
    Underline,
    Code,
}

impl Mark {
    pub const ALL: [Mark; 4] = [Mark::Bold, Mark::Italic, Mark::Underline, Mark::Code];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mark::Bold => "bold",
            Mark::Italic => "italic",
            Mark::Underline => "underline",
            Mark::Code => "code",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|mark| mark.as_str() == s)
    }

    pub fn flag(&self) -> Marks {
        match self {
            Mark::Bold => Marks::BOLD,
            Mark::Italic => Marks::ITALIC,
            Mark::Underline => Marks::UNDERLINE,
            Mark::Code => Marks::CODE,
        }
    }
}

impl fmt::Display for Mark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

bitflags! {
    /// Set of marks carried by a text run.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Marks: u8 {
        const BOLD = 1;
        const ITALIC = 1 << 1;
        const UNDERLINE = 1 << 2;
        const CODE = 1 << 3;
    }
}

impl Marks {
    pub fn has(&self, mark: Mark) -> bool {
        self.contains(mark.flag())
    }

    pub fn with(self, mark: Mark) -> Self {
        self | mark.flag()
    }

    pub fn without(self, mark: Mark) -> Self {
        self - mark.flag()
    }

    /// Individual marks in canonical order.
    pub fn marks(&self) -> impl Iterator<Item = Mark> + '_ {
        Mark::ALL.into_iter().filter(move |mark| self.has(*mark))
    }
}

/// A run of text sharing one set of marks.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "TextRepr", into = "TextRepr")]
pub struct Text {
    pub text: String,
    pub marks: Marks,
}

impl Text {
    pub fn new(text: impl Into<String>, marks: Marks) -> Self {
        Self {
            text: text.into(),
            marks,
        }
    }

    pub fn plain(text: impl Into<String>) -> Self {
        Self::new(text, Marks::empty())
    }

    /// Length in chars; offsets into a text are char offsets.
    pub fn len(&self) -> usize {
        self.text.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

#[derive(Serialize, Deserialize)]
struct TextRepr {
    text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bold: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    italic: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    underline: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code: Option<bool>,
}

impl From<TextRepr> for Text {
    fn from(repr: TextRepr) -> Self {
        let mut marks = Marks::empty();
        marks.set(Marks::BOLD, repr.bold.unwrap_or(false));
        marks.set(Marks::ITALIC, repr.italic.unwrap_or(false));
        marks.set(Marks::UNDERLINE, repr.underline.unwrap_or(false));
        marks.set(Marks::CODE, repr.code.unwrap_or(false));
        Text {
            text: repr.text,
            marks,
        }
    }
}

impl From<Text> for TextRepr {
    fn from(text: Text) -> Self {
        let flag = |mark: Mark| text.marks.has(mark).then_some(true);
        TextRepr {
            bold: flag(Mark::Bold),
            italic: flag(Mark::Italic),
            underline: flag(Mark::Underline),
            code: flag(Mark::Code),
            text: text.text,
        }
    }
}

/// A block element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    #[serde(rename = "type")]
    pub kind: BlockKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub align: Option<Align>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(kind: BlockKind, children: Vec<Node>) -> Self {
        Self {
            kind,
            align: None,
            children,
        }
    }

    pub fn with_align(mut self, align: Align) -> Self {
        self.align = Some(align);
        self
    }

    /// Whether this element directly holds text (as opposed to other blocks).
    pub fn is_text_block(&self) -> bool {
        self.children.iter().all(Node::is_text)
    }
}

/// A node of the document tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Node {
    Element(Element),
    Text(Text),
}

impl Node {
    pub fn text(text: impl Into<String>) -> Self {
        Node::Text(Text::plain(text))
    }

    pub fn marked(text: impl Into<String>, marks: Marks) -> Self {
        Node::Text(Text::new(text, marks))
    }

    pub fn element(kind: BlockKind, children: Vec<Node>) -> Self {
        Node::Element(Element::new(kind, children))
    }

    /// An empty paragraph, the default block.
    pub fn paragraph() -> Self {
        Node::element(BlockKind::Paragraph, vec![Node::text("")])
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Node::Text(_))
    }

    pub fn is_element(&self) -> bool {
        matches!(self, Node::Element(_))
    }

    pub fn as_text(&self) -> Option<&Text> {
        match self {
            Node::Text(text) => Some(text),
            Node::Element(_) => None,
        }
    }

    pub fn as_element(&self) -> Option<&Element> {
        match self {
            Node::Element(element) => Some(element),
            Node::Text(_) => None,
        }
    }

    pub fn children(&self) -> Option<&Vec<Node>> {
        self.as_element().map(|element| &element.children)
    }

    pub fn children_mut(&mut self) -> Option<&mut Vec<Node>> {
        match self {
            Node::Element(element) => Some(&mut element.children),
            Node::Text(_) => None,
        }
    }

    /// Concatenated text of all descendant runs.
    pub fn string(&self) -> String {
        match self {
            Node::Text(text) => text.text.clone(),
            Node::Element(element) => element.children.iter().map(Node::string).collect(),
        }
    }

    /// The non-content properties of this node.
    pub fn properties(&self) -> Properties {
        match self {
            Node::Text(text) => Properties::Text { marks: text.marks },
            Node::Element(element) => Properties::Element {
                kind: element.kind,
                align: element.align,
            },
        }
    }

    /// Overwrites the properties; returns false when the variant does not match.
    pub fn set_properties(&mut self, properties: &Properties) -> bool {
        match (self, properties) {
            (Node::Text(text), Properties::Text { marks }) => {
                text.marks = *marks;
                true
            }
            (Node::Element(element), Properties::Element { kind, align }) => {
                element.kind = *kind;
                element.align = *align;
                true
            }
            _ => false,
        }
    }

    /// An empty node of the same variant carrying `properties`.
    pub fn from_properties(properties: &Properties) -> Node {
        match properties {
            Properties::Text { marks } => Node::Text(Text::new(String::new(), *marks)),
            Properties::Element { kind, align } => Node::Element(Element {
                kind: *kind,
                align: *align,
                children: Vec::new(),
            }),
        }
    }
}

/// Node properties excluding content, used by set and split operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Properties {
    Element { kind: BlockKind, align: Option<Align> },
    Text { marks: Marks },
}

/// Byte index of the `char_offset`-th char, or `None` past the end.
pub fn byte_index(s: &str, char_offset: usize) -> Option<usize> {
    if char_offset == 0 {
        return Some(0);
    }
    s.char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(s.len()))
        .nth(char_offset)
}

/// Chars `[start, end)` of `s` as an owned string.
pub fn char_slice(s: &str, start: usize, end: usize) -> String {
    s.chars().skip(start).take(end.saturating_sub(start)).collect()
}
