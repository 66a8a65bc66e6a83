//! The local edit model.
//!
//! An [`Editor`] owns the document, the selection and the undo history.
//! Every command is expanded into primitive [`Operation`]s which are applied
//! to the document, collected into one history batch, and queued in an
//! outbox for whatever [`OperationSink`] mirrors the document.
//!
//! Commands never fail from the caller's point of view. Without a usable
//! selection they do nothing, and if an operation is rejected halfway the
//! whole command is rolled back and logged.

use log::{debug, warn};

use crate::capability::{OperationSink, SelectionObserver};
use crate::document::{paragraph_properties, Document};
use crate::error::CoreError;
use crate::history::{Batch, History, DEFAULT_MAX_STEPS};
use crate::node::{char_slice, Align, BlockKind, Mark, Marks, Node, Properties, Text};
use crate::normalize::{self, MAX_ITERATIONS};
use crate::operation::{Operation, Origin, Tagged};
use crate::path::{self, Path};
use crate::selection::{Point, Range};

/// A block-level toolbar format: either a block kind or an alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockFormat {
    Kind(BlockKind),
    Align(Align),
}

impl BlockFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockFormat::Kind(kind) => kind.as_str(),
            BlockFormat::Align(align) => align.as_str(),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        BlockKind::parse(s)
            .map(BlockFormat::Kind)
            .or_else(|| Align::parse(s).map(BlockFormat::Align))
    }
}

pub struct Editor {
    document: Document,
    selection: Option<Range>,
    stored_marks: Option<Marks>,
    history: History,
    outbox: Vec<Operation>,
    batch: Vec<Operation>,
    selection_dirty: bool,
}

impl Editor {
    /// Creates an editor over `document`, normalizing it first. The fixes
    /// are queued in the outbox so a mirror picks them up.
    pub fn new(document: Document) -> Self {
        Self::with_history_limit(document, DEFAULT_MAX_STEPS)
    }

    pub fn with_history_limit(document: Document, max_steps: usize) -> Self {
        let mut editor = Self {
            document,
            selection: None,
            stored_marks: None,
            history: History::new(max_steps),
            outbox: Vec::new(),
            batch: Vec::new(),
            selection_dirty: false,
        };
        editor.normalize();
        editor.batch.clear();
        editor
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn selection(&self) -> Option<&Range> {
        self.selection.as_ref()
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    // --- selection ---

    /// Moves the selection. Ranges that do not resolve are ignored.
    pub fn select(&mut self, range: Range) {
        if !self.document.has_point(&range.anchor) || !self.document.has_point(&range.focus) {
            debug!("ignoring selection outside the document: {:?}", range);
            return;
        }
        self.stored_marks = None;
        self.set_selection(Some(range));
    }

    pub fn deselect(&mut self) {
        self.stored_marks = None;
        self.set_selection(None);
    }

    pub fn select_all(&mut self) {
        if let (Some(first), Some(last)) = (self.document.first_point(), self.document.last_point()) {
            self.select(Range::new(first, last));
        }
    }

    fn set_selection(&mut self, selection: Option<Range>) {
        if self.selection != selection {
            self.selection = selection;
            self.selection_dirty = true;
        }
    }

    /// Returns the selection if it changed since the last call.
    pub fn take_selection_change(&mut self) -> Option<Option<Range>> {
        if !self.selection_dirty {
            return None;
        }
        self.selection_dirty = false;
        Some(self.selection.clone())
    }

    /// Tells `observer` about a pending selection change, if any.
    pub fn notify_selection<O: SelectionObserver>(&mut self, observer: &mut O) {
        if let Some(selection) = self.take_selection_change() {
            observer.selection_changed(selection.as_ref());
        }
    }

    // --- outbox ---

    /// Drains the local operations applied since the last call.
    pub fn take_outbox(&mut self) -> Vec<Operation> {
        std::mem::take(&mut self.outbox)
    }

    /// Drains the outbox into `sink`. Returns `None` when nothing was pending.
    pub fn flush_to<S: OperationSink>(&mut self, sink: &mut S) -> Result<Option<S::Output>, CoreError> {
        if self.outbox.is_empty() {
            return Ok(None);
        }
        let ops = self.take_outbox();
        sink.apply_local(&ops, &self.document).map(Some)
    }

    // --- operation plumbing ---

    fn apply(&mut self, tagged: Tagged) -> Result<(), CoreError> {
        let Tagged { origin, op } = tagged;
        self.document.apply(&op)?;
        if let Some(selection) = self.selection.take() {
            let moved = selection.transform(&op);
            if moved.as_ref() != Some(&selection) {
                self.selection_dirty = true;
            }
            self.selection = moved;
        }
        if origin == Origin::Local {
            self.batch.push(op.clone());
            self.outbox.push(op);
        }
        Ok(())
    }

    fn apply_local(&mut self, op: Operation) -> Result<(), CoreError> {
        self.apply(Tagged::local(op))
    }

    fn normalize(&mut self) {
        for _ in 0..MAX_ITERATIONS {
            let Some(op) = normalize::next_fix(&self.document) else {
                return;
            };
            if let Err(e) = self.apply_local(op) {
                warn!("normalization stopped: {}", e);
                return;
            }
        }
        warn!("normalization did not settle after {} fixes", MAX_ITERATIONS);
    }

    /// Re-clamps the selection after structural changes removed its points.
    fn repair_selection(&mut self, fallback: Option<&Range>) {
        let Some(range) = self.selection.clone().or_else(|| fallback.cloned()) else {
            return;
        };
        if self.document.has_point(&range.anchor) && self.document.has_point(&range.focus) {
            self.set_selection(Some(range));
            return;
        }
        let anchor = self.document.clamp_point(&range.anchor);
        let focus = self.document.clamp_point(&range.focus);
        self.set_selection(anchor.zip(focus).map(|(anchor, focus)| Range::new(anchor, focus)));
    }

    /// Runs one user command as a single undoable batch.
    fn command(&mut self, name: &'static str, f: impl FnOnce(&mut Self) -> Result<(), CoreError>) {
        let document = self.document.clone();
        let selection = self.selection.clone();
        let stored_marks = self.stored_marks;
        let dirty = self.selection_dirty;
        let outbox_len = self.outbox.len();
        self.batch.clear();

        if let Err(e) = f(self) {
            warn!("{} failed, rolling back: {}", name, e);
            self.document = document;
            self.selection = selection;
            self.stored_marks = stored_marks;
            self.selection_dirty = dirty;
            self.outbox.truncate(outbox_len);
            self.batch.clear();
            return;
        }

        self.normalize();
        self.repair_selection(selection.as_ref());
        let operations = std::mem::take(&mut self.batch);
        if !operations.is_empty() {
            debug!("{}: {} operations", name, operations.len());
            self.history.record(Batch {
                operations,
                selection_before: selection,
            });
        }
    }

    // --- queries ---

    fn text(&self, path: &[usize]) -> Result<&Text, CoreError> {
        self.document
            .text_at(path)
            .ok_or_else(|| CoreError::InvalidPath(path.to_vec()))
    }

    fn node(&self, path: &[usize]) -> Result<&Node, CoreError> {
        self.document.node(path).ok_or_else(|| CoreError::InvalidPath(path.to_vec()))
    }

    /// The selection with a trailing block-start edge pulled back into the
    /// previous block, so selecting a whole line does not touch the next one.
    fn unhung_selection(&self) -> Option<Range> {
        let range = self.selection.clone()?;
        let (start, end) = range.edges();
        if range.is_collapsed() || start.offset != 0 || end.offset != 0 || end.path.last() != Some(&0) {
            return Some(range);
        }
        let texts = self.document.texts();
        let end_block = path::parent(&end.path);
        let previous = texts
            .iter()
            .rev()
            .filter(|(path, _)| path::compare(path, &end.path).is_lt() && path::parent(path) != end_block)
            .find(|(path, _)| path::compare(path, &start.path).is_ge())?;
        Some(Range::new(start.clone(), Point::new(previous.0.clone(), previous.1.len())))
    }

    /// Texts overlapping `range` in document order.
    fn texts_in(&self, range: &Range) -> Vec<(Path, &Text)> {
        let (start, end) = range.edges();
        self.document
            .texts()
            .into_iter()
            .filter(|(path, _)| path::compare(path, &start.path).is_ge() && path::compare(path, &end.path).is_le())
            .collect()
    }

    /// Char span of the text at `path` covered by `range`.
    fn segment(range: &Range, path: &[usize], text: &Text) -> (usize, usize) {
        let (start, end) = range.edges();
        let from = if start.path == path { start.offset } else { 0 };
        let to = if end.path == path { end.offset } else { text.len() };
        (from, to.max(from))
    }

    /// Text blocks touched by `range`, deduplicated, in document order.
    fn lowest_blocks(&self, range: &Range) -> Vec<Path> {
        let mut blocks: Vec<Path> = Vec::new();
        for (path, _) in self.texts_in(range) {
            let block = path::parent(&path).to_vec();
            if blocks.last() != Some(&block) {
                blocks.push(block);
            }
        }
        blocks
    }

    /// The marks the next inserted text would carry.
    pub fn marks(&self) -> Option<Marks> {
        if let Some(marks) = self.stored_marks {
            return Some(marks);
        }
        let range = self.selection.as_ref()?;
        if !range.is_collapsed() {
            let texts = self.texts_in(range);
            let first = texts
                .iter()
                .find(|(path, text)| {
                    let (from, to) = Self::segment(range, path, text);
                    from < to
                })
                .or_else(|| texts.first())?;
            return Some(first.1.marks);
        }
        let anchor = &range.anchor;
        let text = self.document.text_at(&anchor.path)?;
        if anchor.offset == 0 {
            if let Some(previous) = path::previous(&anchor.path) {
                if let Some(Node::Text(previous)) = self.document.node(&previous) {
                    return Some(previous.marks);
                }
            }
        }
        Some(text.marks)
    }

    pub fn is_mark_active(&self, mark: Mark) -> bool {
        self.marks().is_some_and(|marks| marks.has(mark))
    }

    pub fn is_block_active(&self, format: BlockFormat) -> bool {
        let Some(range) = self.unhung_selection() else {
            return false;
        };
        self.texts_in(&range).iter().any(|(path, _)| {
            self.document.element_ancestors(path).iter().any(|ancestor| {
                match (self.document.node(ancestor).and_then(Node::as_element), format) {
                    (Some(element), BlockFormat::Kind(kind)) => element.kind == kind,
                    (Some(element), BlockFormat::Align(align)) => element.align == Some(align),
                    (None, _) => false,
                }
            })
        })
    }

    // --- text commands ---

    pub fn insert_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.command("insert_text", |editor| {
            let Some(range) = editor.selection.clone() else {
                return Ok(());
            };
            if !range.is_collapsed() {
                let (start, end) = range.edges();
                editor.delete_range(start.clone(), end.clone())?;
            }
            let Some(point) = editor.selection.as_ref().map(|range| range.focus.clone()) else {
                return Ok(());
            };
            let current = editor.text(&point.path)?.clone();
            let inserted = text.chars().count();

            match editor.stored_marks.take() {
                Some(marks) if marks != current.marks => {
                    let mut at = point.path.clone();
                    if point.offset == current.len() {
                        at = path::next(&at);
                    } else if point.offset > 0 {
                        editor.apply_local(Operation::SplitNode {
                            path: point.path.clone(),
                            position: point.offset,
                            properties: Properties::Text { marks: current.marks },
                        })?;
                        at = path::next(&at);
                    }
                    editor.apply_local(Operation::InsertNode {
                        path: at.clone(),
                        node: Node::marked(text, marks),
                    })?;
                    editor.set_selection(Some(Range::collapsed(Point::new(at, inserted))));
                }
                _ => {
                    editor.apply_local(Operation::InsertText {
                        path: point.path.clone(),
                        offset: point.offset,
                        text: text.to_string(),
                    })?;
                    editor.set_selection(Some(Range::collapsed(Point::new(point.path, point.offset + inserted))));
                }
            }
            Ok(())
        });
    }

    pub fn delete_backward(&mut self) {
        self.command("delete_backward", |editor| {
            let Some(range) = editor.selection.clone() else {
                return Ok(());
            };
            if !range.is_collapsed() {
                let (start, end) = range.edges();
                return editor.delete_range(start.clone(), end.clone());
            }
            let point = range.focus;
            let start = if point.offset > 0 {
                Point::new(point.path.clone(), point.offset - 1)
            } else {
                let texts = editor.document.texts();
                let Some(index) = texts.iter().position(|(path, _)| *path == point.path) else {
                    return Ok(());
                };
                let Some((previous, text)) = index.checked_sub(1).and_then(|i| texts.get(i)) else {
                    return Ok(());
                };
                if path::parent(previous) == path::parent(&point.path) && !text.is_empty() {
                    Point::new(previous.clone(), text.len() - 1)
                } else {
                    Point::new(previous.clone(), text.len())
                }
            };
            editor.delete_range(start, point)
        });
    }

    pub fn delete_forward(&mut self) {
        self.command("delete_forward", |editor| {
            let Some(range) = editor.selection.clone() else {
                return Ok(());
            };
            if !range.is_collapsed() {
                let (start, end) = range.edges();
                return editor.delete_range(start.clone(), end.clone());
            }
            let point = range.focus;
            let len = editor.text(&point.path)?.len();
            let end = if point.offset < len {
                Point::new(point.path.clone(), point.offset + 1)
            } else {
                let texts = editor.document.texts();
                let Some(index) = texts.iter().position(|(path, _)| *path == point.path) else {
                    return Ok(());
                };
                let Some((next, text)) = texts.get(index + 1) else {
                    return Ok(());
                };
                if path::parent(next) == path::parent(&point.path) && !text.is_empty() {
                    Point::new(next.clone(), 1)
                } else {
                    Point::new(next.clone(), 0)
                }
            };
            editor.delete_range(point, end)
        });
    }

    /// Deletes the selected content, merging the blocks at its edges.
    pub fn delete_fragment(&mut self) {
        self.command("delete_fragment", |editor| {
            let Some(range) = editor.selection.clone() else {
                return Ok(());
            };
            let (start, end) = range.edges();
            editor.delete_range(start.clone(), end.clone())
        });
    }

    fn remove_text(&mut self, path: &[usize], offset: usize, text: String) -> Result<(), CoreError> {
        if text.is_empty() {
            return Ok(());
        }
        self.apply_local(Operation::RemoveText {
            path: path.to_vec(),
            offset,
            text,
        })
    }

    /// Turns the block at `at` into an empty default paragraph in place.
    fn reset_block(&mut self, at: &[usize]) -> Result<(), CoreError> {
        let block = self.node(at)?.clone();
        let children = block.children().cloned().unwrap_or_default();
        let first = path::child(at, 0);

        match children.first().and_then(Node::as_text) {
            Some(leaf) if children.iter().all(Node::is_text) => {
                let leaf = leaf.clone();
                for index in (1..children.len()).rev() {
                    self.apply_local(Operation::RemoveNode {
                        path: path::child(at, index),
                        node: children[index].clone(),
                    })?;
                }
                self.remove_text(&first, 0, leaf.text)?;
                if !leaf.marks.is_empty() {
                    self.apply_local(Operation::SetNode {
                        path: first,
                        properties: Properties::Text { marks: leaf.marks },
                        new_properties: Properties::Text { marks: Marks::empty() },
                    })?;
                }
            }
            _ => {
                for index in (0..children.len()).rev() {
                    self.apply_local(Operation::RemoveNode {
                        path: path::child(at, index),
                        node: children[index].clone(),
                    })?;
                }
                self.apply_local(Operation::InsertNode {
                    path: first,
                    node: Node::text(""),
                })?;
            }
        }

        let properties = block.properties();
        let default = paragraph_properties();
        if properties != default {
            self.apply_local(Operation::SetNode {
                path: at.to_vec(),
                properties,
                new_properties: default,
            })?;
        }
        Ok(())
    }

    fn delete_range(&mut self, start: Point, end: Point) -> Result<(), CoreError> {
        if start == end {
            return Ok(());
        }
        let whole = Some(&start) == self.document.first_point().as_ref()
            && Some(&end) == self.document.last_point().as_ref()
            && start.path.first() != end.path.first();
        if whole {
            // the first block is kept and emptied, so replicas deleting
            // everything at once still end up sharing one block
            for index in (1..self.document.children.len()).rev() {
                let node = self.document.children[index].clone();
                self.apply_local(Operation::RemoveNode {
                    path: vec![index],
                    node,
                })?;
            }
            self.reset_block(&[0])?;
            self.set_selection(Some(Range::collapsed(Point::new(vec![0, 0], 0))));
            return Ok(());
        }

        if start.path == end.path {
            let removed = char_slice(&self.text(&start.path)?.text, start.offset, end.offset);
            self.remove_text(&start.path, start.offset, removed)?;
            self.set_selection(Some(Range::collapsed(start)));
            return Ok(());
        }

        let prefix = char_slice(&self.text(&end.path)?.text, 0, end.offset);
        self.remove_text(&end.path, 0, prefix)?;
        let start_text = self.text(&start.path)?;
        let suffix = char_slice(&start_text.text, start.offset, start_text.len());
        self.remove_text(&start.path, start.offset, suffix)?;

        let mut end_path = end.path.clone();
        for between in self.nodes_between(&start.path, &end.path).into_iter().rev() {
            let op = Operation::RemoveNode {
                node: self.node(&between)?.clone(),
                path: between,
            };
            end_path = path::transform(&end_path, &op).ok_or_else(|| CoreError::InvalidPath(end_path.clone()))?;
            self.apply_local(op)?;
        }

        let start_block = path::parent(&start.path).to_vec();
        let end_block = path::parent(&end_path).to_vec();
        if start_block != end_block {
            self.merge_blocks(&start_block, &end_block)?;
        }
        self.set_selection(Some(Range::collapsed(start)));
        Ok(())
    }

    /// Top-most nodes lying strictly between the texts at `start` and `end`.
    fn nodes_between(&self, start: &[usize], end: &[usize]) -> Vec<Path> {
        fn walk(nodes: &[Node], prefix: &mut Path, start: &[usize], end: &[usize], out: &mut Vec<Path>) {
            for (i, node) in nodes.iter().enumerate() {
                prefix.push(i);
                let after_start = path::compare(prefix, start).is_gt();
                let before_end = path::compare(prefix, end).is_lt();
                if after_start && before_end {
                    out.push(prefix.clone());
                } else if path::is_ancestor(prefix, start) || path::is_ancestor(prefix, end) {
                    if let Some(children) = node.children() {
                        walk(children, prefix, start, end, out);
                    }
                }
                prefix.pop();
            }
        }
        let mut out = Vec::new();
        walk(&self.document.children, &mut Vec::new(), start, end, &mut out);
        out
    }

    /// Merges the block at `from` into the block at `into`, which precedes it.
    /// Non-adjacent blocks are moved next to `into` first and their emptied
    /// ancestors removed.
    fn merge_blocks(&mut self, into: &[usize], from: &[usize]) -> Result<(), CoreError> {
        let target = path::next(into);
        if from != target.as_slice() {
            let node = self.node(from)?.clone();
            self.apply_local(Operation::RemoveNode {
                path: from.to_vec(),
                node: node.clone(),
            })?;
            let mut parent = path::parent(from).to_vec();
            while !parent.is_empty() && self.document.children_at(&parent).is_some_and(Vec::is_empty) {
                let node = self.node(&parent)?.clone();
                self.apply_local(Operation::RemoveNode {
                    path: parent.clone(),
                    node,
                })?;
                parent = path::parent(&parent).to_vec();
            }
            self.apply_local(Operation::InsertNode {
                path: target.clone(),
                node,
            })?;
        }
        let position = self
            .document
            .children_at(into)
            .map(Vec::len)
            .ok_or_else(|| CoreError::InvalidPath(into.to_vec()))?;
        let properties = self.node(&target)?.properties();
        self.apply_local(Operation::MergeNode {
            path: target,
            position,
            properties,
        })
    }

    /// Splits the current block at the caret.
    pub fn insert_break(&mut self) {
        self.command("insert_break", |editor| {
            let Some(range) = editor.selection.clone() else {
                return Ok(());
            };
            if !range.is_collapsed() {
                let (start, end) = range.edges();
                editor.delete_range(start.clone(), end.clone())?;
            }
            let Some(point) = editor.selection.as_ref().map(|range| range.focus.clone()) else {
                return Ok(());
            };
            let marks = editor.text(&point.path)?.marks;
            let block = path::parent(&point.path).to_vec();
            let Some(&index) = point.path.last() else {
                return Ok(());
            };
            let block_properties = editor.node(&block)?.properties();

            editor.apply_local(Operation::SplitNode {
                path: point.path.clone(),
                position: point.offset,
                properties: Properties::Text { marks },
            })?;
            editor.apply_local(Operation::SplitNode {
                path: block.clone(),
                position: index + 1,
                properties: block_properties,
            })?;
            editor.set_selection(Some(Range::collapsed(Point::new(
                path::child(&path::next(&block), 0),
                0,
            ))));
            Ok(())
        });
    }

    // --- formatting ---

    /// Adds `mark` to the selection, or removes it when it is already active.
    /// On a caret the mark applies to the next inserted text.
    pub fn toggle_mark(&mut self, mark: Mark) {
        let Some(range) = self.selection.clone() else {
            return;
        };
        let active = self.is_mark_active(mark);
        if range.is_collapsed() {
            let marks = self.marks().unwrap_or_default();
            self.stored_marks = Some(if active { marks.without(mark) } else { marks.with(mark) });
            return;
        }

        self.command("toggle_mark", |editor| {
            let targets: Vec<(Path, Text, usize, usize)> = editor
                .texts_in(&range)
                .into_iter()
                .map(|(path, text)| {
                    let (from, to) = Self::segment(&range, &path, text);
                    (path, text.clone(), from, to)
                })
                .collect();

            for (path, text, from, to) in targets.into_iter().rev() {
                let marks = if active { text.marks.without(mark) } else { text.marks.with(mark) };
                if from == to || marks == text.marks {
                    continue;
                }
                let properties = Properties::Text { marks: text.marks };
                if to < text.len() {
                    editor.apply_local(Operation::SplitNode {
                        path: path.clone(),
                        position: to,
                        properties,
                    })?;
                }
                let mut target = path;
                if from > 0 {
                    editor.apply_local(Operation::SplitNode {
                        path: target.clone(),
                        position: from,
                        properties,
                    })?;
                    target = path::next(&target);
                }
                editor.apply_local(Operation::SetNode {
                    path: target,
                    properties,
                    new_properties: Properties::Text { marks },
                })?;
            }
            Ok(())
        });
    }

    /// Applies a block kind or alignment to the selected blocks, reverting to
    /// the default when it is already active.
    pub fn toggle_block(&mut self, format: BlockFormat) {
        if self.selection.is_none() {
            return;
        }
        let active = self.is_block_active(format);
        self.command("toggle_block", |editor| {
            match format {
                BlockFormat::Align(align) => {
                    let align = if active { None } else { Some(align) };
                    editor.set_blocks(|kind, _| Properties::Element { kind, align })?;
                }
                BlockFormat::Kind(kind) => {
                    editor.unwrap_lists()?;
                    let new_kind = if active {
                        BlockKind::Paragraph
                    } else if kind.is_list() {
                        BlockKind::ListItem
                    } else {
                        kind
                    };
                    editor.set_blocks(|_, align| Properties::Element { kind: new_kind, align })?;
                    if !active && kind.is_list() {
                        editor.wrap_blocks(kind)?;
                    }
                }
            }
            Ok(())
        });
    }

    fn set_blocks(&mut self, props: impl Fn(BlockKind, Option<Align>) -> Properties) -> Result<(), CoreError> {
        let Some(range) = self.unhung_selection() else {
            return Ok(());
        };
        for block in self.lowest_blocks(&range) {
            let properties = self.node(&block)?.properties();
            let Properties::Element { kind, align } = properties else {
                continue;
            };
            let new_properties = props(kind, align);
            if new_properties != properties {
                self.apply_local(Operation::SetNode {
                    path: block,
                    properties,
                    new_properties,
                })?;
            }
        }
        Ok(())
    }

    /// Nearest list container holding part of the selection, with the first
    /// and last of its items that the selection touches.
    fn selected_list(&self) -> Option<(Path, usize, usize)> {
        let range = self.unhung_selection()?;
        let mut found: Option<(Path, usize, usize)> = None;
        for (path, _) in self.texts_in(&range) {
            let list = self.document.element_ancestors(&path).into_iter().find(|ancestor| {
                self.document
                    .node(ancestor)
                    .and_then(Node::as_element)
                    .is_some_and(|element| element.kind.is_list())
            });
            let Some(list) = list else {
                continue;
            };
            let item = path[list.len()];
            if let Some((current, _, last)) = found.as_mut() {
                if *current == list {
                    *last = item;
                }
            } else {
                found = Some((list, item, item));
            }
        }
        found
    }

    /// Lifts the selected items out of their list containers, splitting the
    /// lists around them.
    fn unwrap_lists(&mut self) -> Result<(), CoreError> {
        for _ in 0..MAX_ITERATIONS {
            let Some((mut list, first, last)) = self.selected_list() else {
                return Ok(());
            };
            let properties = self.node(&list)?.properties();
            let len = self.node(&list)?.children().map_or(0, Vec::len);
            if last + 1 < len {
                self.apply_local(Operation::SplitNode {
                    path: list.clone(),
                    position: last + 1,
                    properties,
                })?;
            }
            if first > 0 {
                self.apply_local(Operation::SplitNode {
                    path: list.clone(),
                    position: first,
                    properties,
                })?;
                list = path::next(&list);
            }
            self.unwrap_node(&list)?;
        }
        Ok(())
    }

    /// Replaces the element at `at` with its children.
    fn unwrap_node(&mut self, at: &[usize]) -> Result<(), CoreError> {
        let saved = self.selection.clone();
        let node = self.node(at)?.clone();
        let children = node.children().cloned().unwrap_or_default();
        self.apply_local(Operation::RemoveNode {
            path: at.to_vec(),
            node,
        })?;
        let depth = at.len() - 1;
        for (i, child) in children.into_iter().enumerate() {
            let mut path = at.to_vec();
            path[depth] += i;
            self.apply_local(Operation::InsertNode { path, node: child })?;
        }
        let remap = |point: &Point| {
            if !path::is_ancestor(at, &point.path) {
                return point.clone();
            }
            let mut path = at.to_vec();
            path[depth] += point.path[depth + 1];
            path.extend_from_slice(&point.path[depth + 2..]);
            Point::new(path, point.offset)
        };
        self.set_selection(saved.map(|range| Range::new(remap(&range.anchor), remap(&range.focus))));
        Ok(())
    }

    /// Wraps the selected sibling blocks in a new `kind` container.
    fn wrap_blocks(&mut self, kind: BlockKind) -> Result<(), CoreError> {
        let Some(range) = self.unhung_selection() else {
            return Ok(());
        };
        let blocks = self.lowest_blocks(&range);
        let (Some(first_block), Some(last_block)) = (blocks.first(), blocks.last()) else {
            return Ok(());
        };
        let mut parent: Path = first_block
            .iter()
            .zip(last_block.iter())
            .take_while(|(a, b)| a == b)
            .map(|(a, _)| *a)
            .collect();
        if parent.len() >= first_block.len() || parent.len() >= last_block.len() {
            parent = path::parent(first_block).to_vec();
        }
        let depth = parent.len();
        let (first, last) = (first_block[depth], last_block[depth]);

        let saved = self.selection.clone();
        let mut wrapped = Vec::new();
        for index in (first..=last).rev() {
            let path = path::child(&parent, index);
            let node = self.node(&path)?.clone();
            wrapped.push(node.clone());
            self.apply_local(Operation::RemoveNode { path, node })?;
        }
        wrapped.reverse();
        self.apply_local(Operation::InsertNode {
            path: path::child(&parent, first),
            node: Node::element(kind, wrapped),
        })?;

        let remap = |point: &Point| {
            let inside = point.path.len() > depth
                && point.path.starts_with(&parent)
                && (first..=last).contains(&point.path[depth]);
            if !inside {
                return point.clone();
            }
            let mut path = path::child(&parent, first);
            path.push(point.path[depth] - first);
            path.extend_from_slice(&point.path[depth + 1..]);
            Point::new(path, point.offset)
        };
        self.set_selection(saved.map(|range| Range::new(remap(&range.anchor), remap(&range.focus))));
        Ok(())
    }

    // --- history ---

    pub fn undo(&mut self) {
        let Some(batch) = self.history.pop_undo() else {
            return;
        };
        let inverse = batch.inverse();
        if self.replay(&inverse, "undo") {
            self.set_selection(batch.selection_before.clone());
            self.repair_selection(None);
            self.history.push_redo(batch);
        }
    }

    pub fn redo(&mut self) {
        let Some(batch) = self.history.pop_redo() else {
            return;
        };
        if self.replay(&batch.operations, "redo") {
            let mut after = batch.selection_before.clone();
            for op in &batch.operations {
                after = after.and_then(|range| range.transform(op));
            }
            self.set_selection(after);
            self.repair_selection(None);
            self.history.push_redone(batch);
        }
    }

    /// Applies history operations if they still fit the document. A batch
    /// invalidated by remote edits is dropped.
    fn replay(&mut self, ops: &[Operation], what: &str) -> bool {
        let mut scratch = self.document.clone();
        if let Some(e) = ops.iter().find_map(|op| scratch.apply(op).err()) {
            warn!("{} no longer applies, dropping it: {}", what, e);
            return false;
        }
        for op in ops {
            if let Err(e) = self.apply_local(op.clone()) {
                warn!("{} failed midway: {}", what, e);
                return false;
            }
        }
        self.normalize();
        self.batch.clear();
        true
    }

    // --- remote ---

    /// Applies operations that originated elsewhere. They are not recorded
    /// in history or the outbox; normalization fixes they trigger are.
    pub fn apply_remote(&mut self, ops: &[Operation]) -> Result<(), CoreError> {
        let mut scratch = self.document.clone();
        for op in ops {
            scratch.apply(op)?;
        }
        let before = self.selection.clone();
        for op in ops {
            self.apply(Tagged::remote(op.clone()))?;
        }
        self.history.rebase(ops);
        self.normalize();
        self.batch.clear();
        self.repair_selection(before.as_ref());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paragraph(children: Vec<Node>) -> Node {
        Node::element(BlockKind::Paragraph, children)
    }

    fn range(anchor: (&[usize], usize), focus: (&[usize], usize)) -> Range {
        Range::new(Point::new(anchor.0.to_vec(), anchor.1), Point::new(focus.0.to_vec(), focus.1))
    }

    fn caret(path: &[usize], offset: usize) -> Range {
        Range::collapsed(Point::new(path.to_vec(), offset))
    }

    #[test]
    fn test_new_normalizes_into_outbox() {
        let mut editor = Editor::new(Document::default());
        assert_eq!(editor.document().children, vec![Node::paragraph()]);
        assert_eq!(editor.take_outbox().len(), 1);
        assert!(!editor.can_undo());
    }

    #[test]
    fn test_commands_without_selection_are_noops() {
        let mut editor = Editor::new(Document::initial());
        let before = editor.document().clone();
        editor.insert_text("x");
        editor.delete_backward();
        editor.toggle_mark(Mark::Bold);
        editor.toggle_block(BlockFormat::Kind(BlockKind::HeadingOne));
        assert_eq!(editor.document(), &before);
        assert!(editor.take_outbox().is_empty());
    }

    #[test]
    fn test_insert_and_delete_text() {
        let mut editor = Editor::new(Document::new(vec![paragraph(vec![Node::text("helo")])]));
        editor.select(caret(&[0, 0], 3));
        editor.insert_text("l");
        assert_eq!(editor.document().plain_text(), "hello");
        assert_eq!(editor.selection(), Some(&caret(&[0, 0], 4)));
        editor.delete_backward();
        editor.delete_backward();
        assert_eq!(editor.document().plain_text(), "heo");
        editor.delete_forward();
        assert_eq!(editor.document().plain_text(), "he");
    }

    #[test]
    fn test_stored_mark_applies_to_next_insert() {
        let mut editor = Editor::new(Document::new(vec![paragraph(vec![Node::text("ab")])]));
        editor.select(caret(&[0, 0], 1));
        editor.toggle_mark(Mark::Bold);
        assert!(editor.is_mark_active(Mark::Bold));
        editor.insert_text("X");
        assert_eq!(
            editor.document().children,
            vec![paragraph(vec![
                Node::text("a"),
                Node::marked("X", Marks::BOLD),
                Node::text("b")
            ])]
        );
        assert_eq!(editor.selection(), Some(&caret(&[0, 1], 1)));
    }

    #[test]
    fn test_bold_is_additive_across_runs() {
        let mut editor = Editor::new(Document::initial());
        // "much" is [0, 3]; " better" is the first 7 chars of [0, 4]
        editor.select(range((&[0, 3], 0), (&[0, 4], 7)));
        editor.toggle_mark(Mark::Bold);
        let block = editor.document().node(&[0]).unwrap().children().unwrap().clone();
        assert_eq!(block[3], Node::marked("much", Marks::BOLD | Marks::ITALIC));
        assert_eq!(block[4], Node::marked(" better", Marks::BOLD));
        assert_eq!(block[5], Node::text(" than a "));
        assert!(editor.is_mark_active(Mark::Bold));
    }

    #[test]
    fn test_mark_toggles_xor() {
        let mut editor = Editor::new(Document::initial());
        editor.select(range((&[0, 0], 5), (&[0, 0], 13)));
        for round in 1..=5 {
            editor.toggle_mark(Mark::Underline);
            assert_eq!(editor.is_mark_active(Mark::Underline), round % 2 == 1);
        }
        editor.toggle_mark(Mark::Underline);
        assert_eq!(editor.document(), &Document::initial());
    }

    #[test]
    fn test_insert_break_splits_block() {
        let mut editor = Editor::new(Document::new(vec![Node::element(
            BlockKind::HeadingOne,
            vec![Node::text("title")],
        )]));
        editor.select(caret(&[0, 0], 2));
        editor.insert_break();
        assert_eq!(
            editor.document().children,
            vec![
                Node::element(BlockKind::HeadingOne, vec![Node::text("ti")]),
                Node::element(BlockKind::HeadingOne, vec![Node::text("tle")]),
            ]
        );
        assert_eq!(editor.selection(), Some(&caret(&[1, 0], 0)));
    }

    #[test]
    fn test_delete_backward_merges_blocks() {
        let mut editor = Editor::new(Document::new(vec![
            paragraph(vec![Node::text("one")]),
            paragraph(vec![Node::text("two")]),
        ]));
        editor.select(caret(&[1, 0], 0));
        editor.delete_backward();
        assert_eq!(editor.document().children, vec![paragraph(vec![Node::text("onetwo")])]);
        assert_eq!(editor.selection(), Some(&caret(&[0, 0], 3)));
    }

    #[test]
    fn test_delete_fragment_across_blocks() {
        let mut editor = Editor::new(Document::new(vec![
            paragraph(vec![Node::text("alpha")]),
            paragraph(vec![Node::text("beta")]),
            paragraph(vec![Node::text("gamma")]),
        ]));
        editor.select(range((&[0, 0], 2), (&[2, 0], 3)));
        editor.delete_fragment();
        assert_eq!(editor.document().children, vec![paragraph(vec![Node::text("alma")])]);
    }

    #[test]
    fn test_deleting_everything_leaves_one_paragraph() {
        let mut editor = Editor::new(Document::initial());
        editor.select_all();
        editor.delete_fragment();
        assert_eq!(editor.document().children, vec![Node::paragraph()]);
        assert_eq!(editor.selection(), Some(&caret(&[0, 0], 0)));
    }

    #[test]
    fn test_deleting_everything_keeps_the_first_block() {
        let list = Node::element(
            BlockKind::BulletedList,
            vec![Node::element(BlockKind::ListItem, vec![Node::marked("item", Marks::BOLD)])],
        );
        let heading = Node::Element(
            crate::node::Element::new(BlockKind::HeadingOne, vec![Node::marked("Title", Marks::ITALIC), Node::text(" rest")])
                .with_align(Align::Center),
        );
        for first in [list, heading] {
            let original = Document::new(vec![first, Node::element(BlockKind::Paragraph, vec![Node::text("tail")])]);
            let mut editor = Editor::new(original.clone());
            editor.select_all();
            editor.delete_fragment();
            assert_eq!(editor.document().children, vec![Node::paragraph()]);

            let ops = editor.take_outbox();
            assert!(!ops.iter().any(|op| matches!(op, Operation::RemoveNode { path, .. } if path == &vec![0])));

            editor.undo();
            assert_eq!(editor.document(), &original);
        }
    }

    #[test]
    fn test_toggle_heading_and_back() {
        let mut editor = Editor::new(Document::initial());
        editor.select(caret(&[2, 0], 3));
        let heading = BlockFormat::Kind(BlockKind::HeadingTwo);
        editor.toggle_block(heading);
        assert!(editor.is_block_active(heading));
        editor.toggle_block(heading);
        assert_eq!(
            editor.document().node(&[2]).unwrap().as_element().unwrap().kind,
            BlockKind::Paragraph
        );
    }

    #[test]
    fn test_list_toggled_twice_is_paragraph() {
        let mut editor = Editor::new(Document::new(vec![
            paragraph(vec![Node::text("one")]),
            paragraph(vec![Node::text("two")]),
        ]));
        editor.select(range((&[0, 0], 0), (&[1, 0], 3)));
        let list = BlockFormat::Kind(BlockKind::NumberedList);
        editor.toggle_block(list);
        assert_eq!(
            editor.document().children,
            vec![Node::element(
                BlockKind::NumberedList,
                vec![
                    Node::element(BlockKind::ListItem, vec![Node::text("one")]),
                    Node::element(BlockKind::ListItem, vec![Node::text("two")]),
                ]
            )]
        );
        assert_eq!(editor.selection(), Some(&range((&[0, 0, 0], 0), (&[0, 1, 0], 3))));
        assert!(editor.is_block_active(list));

        editor.toggle_block(list);
        assert_eq!(
            editor.document().children,
            vec![paragraph(vec![Node::text("one")]), paragraph(vec![Node::text("two")])]
        );
    }

    #[test]
    fn test_switching_list_kind_rewraps() {
        let mut editor = Editor::new(Document::new(vec![Node::element(
            BlockKind::BulletedList,
            vec![
                Node::element(BlockKind::ListItem, vec![Node::text("a")]),
                Node::element(BlockKind::ListItem, vec![Node::text("b")]),
                Node::element(BlockKind::ListItem, vec![Node::text("c")]),
            ],
        )]));
        editor.select(caret(&[0, 1, 0], 1));
        editor.toggle_block(BlockFormat::Kind(BlockKind::NumberedList));
        let kinds: Vec<BlockKind> = editor
            .document()
            .children
            .iter()
            .map(|node| node.as_element().unwrap().kind)
            .collect();
        assert_eq!(
            kinds,
            vec![BlockKind::BulletedList, BlockKind::NumberedList, BlockKind::BulletedList]
        );
        assert_eq!(editor.document().plain_text(), "a\nb\nc");
    }

    #[test]
    fn test_alignment_coexists_with_kind() {
        let mut editor = Editor::new(Document::initial());
        editor.select(caret(&[0, 0], 0));
        editor.toggle_block(BlockFormat::Kind(BlockKind::HeadingOne));
        editor.toggle_block(BlockFormat::Align(Align::Center));
        let element = editor.document().node(&[0]).unwrap().as_element().unwrap().clone();
        assert_eq!(element.kind, BlockKind::HeadingOne);
        assert_eq!(element.align, Some(Align::Center));
        editor.toggle_block(BlockFormat::Align(Align::Center));
        assert_eq!(editor.document().node(&[0]).unwrap().as_element().unwrap().align, None);
    }

    #[test]
    fn test_undo_redo() {
        let mut editor = Editor::new(Document::new(vec![paragraph(vec![Node::text("ab")])]));
        editor.select(caret(&[0, 0], 2));
        editor.insert_text("c");
        editor.insert_break();
        assert_eq!(editor.document().children.len(), 2);
        editor.undo();
        assert_eq!(editor.document().children, vec![paragraph(vec![Node::text("abc")])]);
        editor.undo();
        assert_eq!(editor.document().plain_text(), "ab");
        assert!(!editor.can_undo());
        editor.redo();
        assert_eq!(editor.document().plain_text(), "abc");
        editor.insert_text("d");
        assert!(!editor.can_redo());
    }

    #[test]
    fn test_remote_ops_skip_history_and_outbox() {
        let mut editor = Editor::new(Document::new(vec![paragraph(vec![Node::text("ab")])]));
        editor.take_outbox();
        editor.select(caret(&[0, 0], 1));
        editor
            .apply_remote(&[Operation::InsertText {
                path: vec![0, 0],
                offset: 0,
                text: "zz".into(),
            }])
            .unwrap();
        assert_eq!(editor.document().plain_text(), "zzab");
        assert_eq!(editor.selection(), Some(&caret(&[0, 0], 3)));
        assert!(editor.take_outbox().is_empty());
        assert!(!editor.can_undo());
    }

    #[test]
    fn test_remote_emptying_inserts_paragraph_into_outbox() {
        let mut editor = Editor::new(Document::new(vec![paragraph(vec![Node::text("x")])]));
        editor.take_outbox();
        editor
            .apply_remote(&[Operation::RemoveNode {
                path: vec![0],
                node: paragraph(vec![Node::text("x")]),
            }])
            .unwrap();
        assert_eq!(editor.document().children, vec![Node::paragraph()]);
        assert_eq!(editor.take_outbox().len(), 1);
    }

    #[test]
    fn test_undo_rebased_over_remote_edit() {
        let mut editor = Editor::new(Document::new(vec![paragraph(vec![Node::text("ab")])]));
        editor.select(caret(&[0, 0], 2));
        editor.insert_text("!");
        editor
            .apply_remote(&[Operation::InsertText {
                path: vec![0, 0],
                offset: 0,
                text: ">".into(),
            }])
            .unwrap();
        editor.undo();
        assert_eq!(editor.document().plain_text(), ">ab");
    }

    #[test]
    fn test_invalid_remote_batch_is_rejected_whole() {
        let mut editor = Editor::new(Document::new(vec![paragraph(vec![Node::text("ab")])]));
        let before = editor.document().clone();
        let result = editor.apply_remote(&[
            Operation::InsertText {
                path: vec![0, 0],
                offset: 0,
                text: "x".into(),
            },
            Operation::InsertText {
                path: vec![5, 0],
                offset: 0,
                text: "y".into(),
            },
        ]);
        assert!(result.is_err());
        assert_eq!(editor.document(), &before);
    }

    #[test]
    fn test_flush_to_sink() {
        let mut editor = Editor::new(Document::initial());
        editor.select(caret(&[0, 0], 0));
        editor.insert_text("A");
        let mut sink: Vec<Operation> = Vec::new();
        assert_eq!(editor.flush_to(&mut sink).unwrap(), Some(1));
        assert_eq!(editor.flush_to(&mut sink).unwrap(), None);
        assert_eq!(sink.len(), 1);
    }
}
