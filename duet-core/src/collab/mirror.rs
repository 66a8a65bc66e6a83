//! The yrs document mirroring the local tree.
//!
//! The root array `content` holds one map per top-level block. A block map
//! carries `type`, an optional `align`, and either a `children` array of block
//! maps or, when the block holds text, one `text` Y.Text. Text leaves are runs
//! of that Y.Text and their marks are its formatting attributes, so toggling a
//! mark formats characters in place and never moves them.
//!
//! Leaf boundaries yrs cannot see (neighbouring runs with equal marks, empty
//! runs) are resolved against the tree the operations were made on.

use std::sync::Arc;

use yrs::types::text::YChange;
use yrs::types::Attrs;
use yrs::{
    Any, Array, ArrayPrelim, ArrayRef, Doc, Map, MapPrelim, MapRef, Out, ReadTxn, Text as _, TextPrelim, TextRef,
    Transact, TransactionMut,
};

use crate::document::Document;
use crate::error::CoreError;
use crate::node::{byte_index, Align, BlockKind, Element, Mark, Marks, Node, Properties, Text};
use crate::operation::Operation;
use crate::path;

const CONTENT: &str = "content";
const TYPE: &str = "type";
const ALIGN: &str = "align";
const CHILDREN: &str = "children";
const TEXT: &str = "text";

pub struct Mirror {
    doc: Doc,
    content: ArrayRef,
}

impl Default for Mirror {
    fn default() -> Self {
        Self::new()
    }
}

impl Mirror {
    pub fn new() -> Self {
        let doc = Doc::new();
        let content = doc.get_or_insert_array(CONTENT);
        Self { doc, content }
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn content(&self) -> &ArrayRef {
        &self.content
    }

    pub fn is_empty(&self) -> bool {
        let txn = self.doc.transact();
        self.content.len(&txn) == 0
    }

    /// Derives the tree currently held by the mirror.
    pub fn read_document(&self) -> Document {
        let txn = self.doc.transact();
        Document::new(read_children(&txn, &self.content))
    }

    /// Writes `ops` into `txn`, in order. `before` is the tree the first
    /// operation was made on.
    pub fn apply_ops(&self, txn: &mut TransactionMut, ops: &[Operation], mut before: Document) -> Result<(), CoreError> {
        for op in ops {
            self.apply_op(txn, op, &before)?;
            before.apply(op)?;
        }
        Ok(())
    }

    /// Appends the blocks of `doc` to the root array.
    pub fn write_document(&self, txn: &mut TransactionMut, doc: &Document) -> Result<(), CoreError> {
        let start = self.content.len(&*txn);
        for (i, node) in doc.children.iter().enumerate() {
            write_node(txn, &self.content, start + i as u32, node)?;
        }
        Ok(())
    }

    fn apply_op(&self, txn: &mut TransactionMut, op: &Operation, tree: &Document) -> Result<(), CoreError> {
        let at = op.path();
        let (&index, parent_path) = at.split_last().ok_or_else(|| CoreError::InvalidPath(at.clone()))?;
        if targets_text(op) {
            return self.apply_text_op(txn, op, tree, parent_path, index);
        }

        match op {
            Operation::InsertNode { node, .. } => {
                let parent = self.children_container(txn, parent_path)?;
                if index as u32 > parent.len(&*txn) {
                    return Err(CoreError::InvalidPath(at.clone()));
                }
                write_node(txn, &parent, index as u32, node)?;
            }
            Operation::RemoveNode { .. } => {
                let parent = self.children_at(&*txn, parent_path)?;
                if index as u32 >= parent.len(&*txn) {
                    return Err(CoreError::InvalidPath(at.clone()));
                }
                parent.remove(txn, index as u32);
            }
            Operation::SplitNode {
                position,
                properties: Properties::Element { kind, align },
                ..
            } => {
                let parent = self.children_at(&*txn, parent_path)?;
                let element = element_at(tree, at)?;
                if *position > element.children.len() {
                    return Err(CoreError::InvalidOperation(format!("split position out of range at {:?}", at)));
                }
                let map = map_at(&*txn, &parent, index as u32, at)?;
                match map.get(&*txn, TEXT) {
                    Some(Out::YText(text)) => {
                        let from = run_start(&element.children, *position);
                        let to = run_start(&element.children, element.children.len());
                        if to > from {
                            text.remove_range(txn, from, to - from);
                        }
                    }
                    _ => {
                        let children = children_of(&*txn, &map, at)?;
                        let len = children.len(&*txn);
                        let position = *position as u32;
                        if len > position {
                            children.remove_range(txn, position, len - position);
                        }
                    }
                }
                let right = Node::Element(Element {
                    kind: *kind,
                    align: *align,
                    children: element.children[*position..].to_vec(),
                });
                write_node(txn, &parent, index as u32 + 1, &right)?;
            }
            Operation::MergeNode { .. } => {
                if index == 0 {
                    return Err(CoreError::InvalidOperation(format!("no previous sibling for {:?}", at)));
                }
                let parent = self.children_at(&*txn, parent_path)?;
                let element = element_at(tree, at)?;
                let previous_path = path::previous(at).ok_or_else(|| CoreError::InvalidPath(at.clone()))?;
                let previous = element_at(tree, &previous_path)?;
                let into = map_at(&*txn, &parent, index as u32 - 1, at)?;
                map_at(&*txn, &parent, index as u32, at)?;
                match into.get(&*txn, TEXT) {
                    Some(Out::YText(text)) => {
                        let end = run_start(&previous.children, previous.children.len());
                        write_runs(txn, &text, end, &element.children)?;
                    }
                    _ => {
                        let children = children_of(&*txn, &into, at)?;
                        let start = children.len(&*txn);
                        for (i, child) in element.children.iter().enumerate() {
                            write_node(txn, &children, start + i as u32, child)?;
                        }
                    }
                }
                parent.remove(txn, index as u32);
            }
            Operation::SetNode {
                new_properties: Properties::Element { kind, align },
                ..
            } => {
                let parent = self.children_at(&*txn, parent_path)?;
                let map = map_at(&*txn, &parent, index as u32, at)?;
                map.insert(txn, TYPE, kind.as_str());
                match align {
                    Some(align) => {
                        map.insert(txn, ALIGN, align.as_str());
                    }
                    None => {
                        map.remove(txn, ALIGN);
                    }
                }
            }
            _ => {
                return Err(CoreError::InvalidOperation(format!(
                    "{} does not match the node at {:?}",
                    op.kind(),
                    at
                )))
            }
        }
        Ok(())
    }

    /// Operations on text leaves become edits and formatting on the Y.Text of
    /// the enclosing block.
    fn apply_text_op(
        &self,
        txn: &mut TransactionMut,
        op: &Operation,
        tree: &Document,
        block: &[usize],
        index: usize,
    ) -> Result<(), CoreError> {
        let at = op.path();
        let leaves = tree
            .children_at(block)
            .filter(|_| !block.is_empty())
            .ok_or_else(|| CoreError::InvalidPath(at.clone()))?;
        let start = run_start(leaves, index);
        let map = self.block_at(&*txn, block)?;

        match op {
            Operation::InsertText { offset, text, .. } => {
                let leaf = leaf_at(leaves, index, at)?;
                let byte = byte_offset(&leaf.text, *offset, at)?;
                text_of(&*txn, &map, at)?.insert_with_attributes(txn, start + byte, text, attrs(leaf.marks));
            }
            Operation::RemoveText { offset, text, .. } => {
                let leaf = leaf_at(leaves, index, at)?;
                let from = byte_offset(&leaf.text, *offset, at)?;
                let to = byte_offset(&leaf.text, offset + text.chars().count(), at)?;
                text_of(&*txn, &map, at)?.remove_range(txn, start + from, to - from);
            }
            Operation::InsertNode { node, .. } => {
                if index > leaves.len() {
                    return Err(CoreError::InvalidPath(at.clone()));
                }
                let text = text_container(txn, &map, at)?;
                write_runs(txn, &text, start, std::slice::from_ref(node))?;
            }
            Operation::RemoveNode { .. } => {
                let leaf = leaf_at(leaves, index, at)?;
                if !leaf.is_empty() {
                    text_of(&*txn, &map, at)?.remove_range(txn, start, leaf.text.len() as u32);
                }
            }
            Operation::SplitNode {
                position,
                properties: Properties::Text { marks },
                ..
            } => {
                let leaf = leaf_at(leaves, index, at)?;
                let byte = byte_offset(&leaf.text, *position, at)?;
                let len = leaf.text.len() as u32 - byte;
                if *marks != leaf.marks && len > 0 {
                    text_of(&*txn, &map, at)?.format(txn, start + byte, len, changed_marks(leaf.marks, *marks));
                }
            }
            Operation::MergeNode { .. } => {
                if index == 0 {
                    return Err(CoreError::InvalidOperation(format!("no previous sibling for {:?}", at)));
                }
                let previous = leaf_at(leaves, index - 1, at)?;
                let leaf = leaf_at(leaves, index, at)?;
                if leaf.marks != previous.marks && !leaf.is_empty() {
                    let changes = changed_marks(leaf.marks, previous.marks);
                    text_of(&*txn, &map, at)?.format(txn, start, leaf.text.len() as u32, changes);
                }
            }
            Operation::SetNode {
                new_properties: Properties::Text { marks },
                ..
            } => {
                let leaf = leaf_at(leaves, index, at)?;
                if *marks != leaf.marks && !leaf.is_empty() {
                    let changes = changed_marks(leaf.marks, *marks);
                    text_of(&*txn, &map, at)?.format(txn, start, leaf.text.len() as u32, changes);
                }
            }
            _ => {
                return Err(CoreError::InvalidOperation(format!(
                    "{} does not match the node at {:?}",
                    op.kind(),
                    at
                )))
            }
        }
        Ok(())
    }

    /// Children array of the element at `at`, or the root array.
    fn children_at<T: ReadTxn>(&self, txn: &T, at: &[usize]) -> Result<ArrayRef, CoreError> {
        let mut array = self.content.clone();
        for (depth, &index) in at.iter().enumerate() {
            let map = map_at(txn, &array, index as u32, &at[..=depth])?;
            array = children_of(txn, &map, at)?;
        }
        Ok(array)
    }

    /// Like [`Self::children_at`], turning an empty text block into an
    /// element container first.
    fn children_container(&self, txn: &mut TransactionMut, at: &[usize]) -> Result<ArrayRef, CoreError> {
        if at.is_empty() {
            return Ok(self.content.clone());
        }
        let map = self.block_at(&*txn, at)?;
        match map.get(&*txn, CHILDREN) {
            Some(Out::YArray(array)) => Ok(array),
            _ => match map.get(&*txn, TEXT) {
                Some(Out::YText(text)) if text.len(&*txn) > 0 => Err(CoreError::InvalidOperation(format!(
                    "block at {:?} holds text, not blocks",
                    at
                ))),
                _ => {
                    map.remove(txn, TEXT);
                    Ok(map.insert(txn, CHILDREN, ArrayPrelim::default()))
                }
            },
        }
    }

    fn block_at<T: ReadTxn>(&self, txn: &T, at: &[usize]) -> Result<MapRef, CoreError> {
        let (&index, parent) = at.split_last().ok_or_else(|| CoreError::InvalidPath(at.to_vec()))?;
        let array = self.children_at(txn, parent)?;
        map_at(txn, &array, index as u32, at)
    }
}

fn targets_text(op: &Operation) -> bool {
    match op {
        Operation::InsertText { .. } | Operation::RemoveText { .. } => true,
        Operation::InsertNode { node, .. } | Operation::RemoveNode { node, .. } => node.is_text(),
        Operation::SplitNode { properties, .. }
        | Operation::MergeNode { properties, .. }
        | Operation::SetNode { properties, .. } => matches!(properties, Properties::Text { .. }),
    }
}

/// Byte offset of leaf `index` inside its block's Y.Text.
fn run_start(leaves: &[Node], index: usize) -> u32 {
    leaves
        .iter()
        .take(index)
        .filter_map(Node::as_text)
        .map(|leaf| leaf.text.len() as u32)
        .sum()
}

fn leaf_at<'a>(leaves: &'a [Node], index: usize, at: &[usize]) -> Result<&'a Text, CoreError> {
    leaves
        .get(index)
        .and_then(Node::as_text)
        .ok_or_else(|| CoreError::InvalidPath(at.to_vec()))
}

fn element_at<'a>(tree: &'a Document, at: &[usize]) -> Result<&'a Element, CoreError> {
    tree.node(at)
        .and_then(Node::as_element)
        .ok_or_else(|| CoreError::InvalidPath(at.to_vec()))
}

/// Every mark, set or explicitly cleared, so an insert never inherits the
/// formatting of its neighbours.
fn attrs(marks: Marks) -> Attrs {
    Mark::ALL
        .into_iter()
        .map(|mark| (Arc::from(mark.as_str()), mark_value(marks.has(mark))))
        .collect()
}

fn changed_marks(from: Marks, to: Marks) -> Attrs {
    Mark::ALL
        .into_iter()
        .filter(|mark| from.has(*mark) != to.has(*mark))
        .map(|mark| (Arc::from(mark.as_str()), mark_value(to.has(mark))))
        .collect()
}

fn mark_value(set: bool) -> Any {
    if set {
        Any::Bool(true)
    } else {
        Any::Null
    }
}

fn marks_of(attrs: &Attrs) -> Marks {
    Mark::ALL
        .into_iter()
        .filter(|mark| matches!(attrs.get(mark.as_str()), Some(Any::Bool(true))))
        .fold(Marks::empty(), |marks, mark| marks | mark.flag())
}

fn byte_offset(s: &str, offset: usize, at: &[usize]) -> Result<u32, CoreError> {
    byte_index(s, offset)
        .map(|b| b as u32)
        .ok_or_else(|| CoreError::InvalidOperation(format!("offset {} out of range at {:?}", offset, at)))
}

fn map_at<T: ReadTxn>(txn: &T, array: &ArrayRef, index: u32, at: &[usize]) -> Result<MapRef, CoreError> {
    match array.get(txn, index) {
        Some(Out::YMap(map)) => Ok(map),
        _ => Err(CoreError::InvalidPath(at.to_vec())),
    }
}

fn text_of<T: ReadTxn>(txn: &T, map: &MapRef, at: &[usize]) -> Result<TextRef, CoreError> {
    match map.get(txn, TEXT) {
        Some(Out::YText(text)) => Ok(text),
        _ => Err(CoreError::InvalidPath(at.to_vec())),
    }
}

/// The block's Y.Text, replacing an empty `children` array if needed.
fn text_container(txn: &mut TransactionMut, map: &MapRef, at: &[usize]) -> Result<TextRef, CoreError> {
    if let Some(Out::YText(text)) = map.get(&*txn, TEXT) {
        return Ok(text);
    }
    match map.get(&*txn, CHILDREN) {
        Some(Out::YArray(array)) if array.len(&*txn) > 0 => Err(CoreError::InvalidOperation(format!(
            "block at {:?} holds blocks, not text",
            at
        ))),
        _ => {
            map.remove(txn, CHILDREN);
            Ok(map.insert(txn, TEXT, TextPrelim::new("")))
        }
    }
}

fn children_of<T: ReadTxn>(txn: &T, map: &MapRef, at: &[usize]) -> Result<ArrayRef, CoreError> {
    match map.get(txn, CHILDREN) {
        Some(Out::YArray(array)) => Ok(array),
        _ => Err(CoreError::InvalidPath(at.to_vec())),
    }
}

fn write_node(txn: &mut TransactionMut, array: &ArrayRef, index: u32, node: &Node) -> Result<(), CoreError> {
    let Node::Element(element) = node else {
        return Err(CoreError::InvalidOperation("text outside a block".to_string()));
    };
    let text_block = element.is_text_block();
    if !text_block && element.children.iter().any(Node::is_text) {
        return Err(CoreError::InvalidOperation(format!(
            "{} mixes text and blocks",
            element.kind
        )));
    }

    let map = array.insert(txn, index, MapPrelim::default());
    map.insert(txn, TYPE, element.kind.as_str());
    if let Some(align) = element.align {
        map.insert(txn, ALIGN, align.as_str());
    }
    if text_block {
        let text = map.insert(txn, TEXT, TextPrelim::new(""));
        write_runs(txn, &text, 0, &element.children)?;
    } else {
        let children = map.insert(txn, CHILDREN, ArrayPrelim::default());
        for (i, child) in element.children.iter().enumerate() {
            write_node(txn, &children, i as u32, child)?;
        }
    }
    Ok(())
}

/// Inserts `leaves` as formatted runs starting at byte `at`.
fn write_runs(txn: &mut TransactionMut, text: &TextRef, mut at: u32, leaves: &[Node]) -> Result<(), CoreError> {
    for node in leaves {
        let Node::Text(leaf) = node else {
            return Err(CoreError::InvalidOperation("block inside a text block".to_string()));
        };
        if leaf.is_empty() {
            continue;
        }
        text.insert_with_attributes(txn, at, &leaf.text, attrs(leaf.marks));
        at += leaf.text.len() as u32;
    }
    Ok(())
}

fn read_children<T: ReadTxn>(txn: &T, array: &ArrayRef) -> Vec<Node> {
    array.iter(txn).map(|out| read_out(txn, out)).collect()
}

/// Unreadable entries still occupy their index so paths stay aligned;
/// normalization removes them afterwards.
fn read_out<T: ReadTxn>(txn: &T, out: Out) -> Node {
    match out {
        Out::YMap(map) => read_node(txn, &map),
        _ => Node::text(""),
    }
}

fn read_node<T: ReadTxn>(txn: &T, map: &MapRef) -> Node {
    let kind = match map.get(txn, TYPE) {
        Some(Out::Any(Any::String(kind))) => BlockKind::parse(&kind).unwrap_or(BlockKind::Paragraph),
        _ => BlockKind::Paragraph,
    };
    let align = match map.get(txn, ALIGN) {
        Some(Out::Any(Any::String(align))) => Align::parse(&align),
        _ => None,
    };
    let children = match (map.get(txn, TEXT), map.get(txn, CHILDREN)) {
        (Some(Out::YText(text)), _) => read_runs(txn, &text),
        (_, Some(Out::YArray(children))) => read_children(txn, &children),
        _ => Vec::new(),
    };
    Node::Element(Element { kind, align, children })
}

/// Formatted runs of a block, merged where yrs reports equal marks apart.
/// An empty block reads as one empty leaf.
fn read_runs<T: ReadTxn>(txn: &T, text: &TextRef) -> Vec<Node> {
    let mut runs: Vec<Text> = Vec::new();
    for chunk in text.diff(txn, YChange::identity) {
        let Out::Any(Any::String(s)) = chunk.insert else {
            continue;
        };
        let marks = chunk.attributes.as_deref().map(marks_of).unwrap_or_else(Marks::empty);
        match runs.last_mut() {
            Some(last) if last.marks == marks => last.text.push_str(&s),
            _ => runs.push(Text::new(s.to_string(), marks)),
        }
    }
    if runs.is_empty() {
        runs.push(Text::plain(""));
    }
    runs.into_iter().map(Node::Text).collect()
}
