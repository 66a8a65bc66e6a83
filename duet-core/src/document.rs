//! The local document tree and atomic operation application.

use log::trace;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::node::{byte_index, Align, BlockKind, Element, Marks, Node, Properties, Text};
use crate::operation::Operation;
use crate::path::{self, Path};
use crate::selection::Point;

/// An ordered list of top-level block elements.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document {
    pub children: Vec<Node>,
}

impl Document {
    pub fn new(children: Vec<Node>) -> Self {
        Self { children }
    }

    /// The sample document offered when a room starts out empty.
    pub fn initial() -> Self {
        Self::new(vec![
            Node::element(
                BlockKind::Paragraph,
                vec![
                    Node::text("This is editable "),
                    Node::marked("rich", Marks::BOLD),
                    Node::text(" text, "),
                    Node::marked("much", Marks::ITALIC),
                    Node::text(" better than a "),
                    Node::marked("<textarea>", Marks::CODE),
                    Node::text("!"),
                ],
            ),
            Node::element(
                BlockKind::Paragraph,
                vec![
                    Node::text("Since it's rich text, you can do things like turn a selection of text "),
                    Node::marked("bold", Marks::BOLD),
                    Node::text(", or add a semantically rendered block quote in the middle of the page, like this:"),
                ],
            ),
            Node::element(BlockKind::BlockQuote, vec![Node::text("A wise quote.")]),
            Node::Element(
                Element::new(BlockKind::Paragraph, vec![Node::text("Try it out for yourself!")])
                    .with_align(Align::Center),
            ),
        ])
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn node(&self, path: &[usize]) -> Option<&Node> {
        let (&first, rest) = path.split_first()?;
        let mut node = self.children.get(first)?;
        for &index in rest {
            node = node.children()?.get(index)?;
        }
        Some(node)
    }

    pub fn node_mut(&mut self, path: &[usize]) -> Option<&mut Node> {
        let (&first, rest) = path.split_first()?;
        let mut node = self.children.get_mut(first)?;
        for &index in rest {
            node = node.children_mut()?.get_mut(index)?;
        }
        Some(node)
    }

    /// Children of the node at `path`, or the top-level blocks for the empty path.
    pub fn children_at(&self, path: &[usize]) -> Option<&Vec<Node>> {
        if path.is_empty() {
            return Some(&self.children);
        }
        self.node(path)?.children()
    }

    fn children_at_mut(&mut self, path: &[usize]) -> Option<&mut Vec<Node>> {
        if path.is_empty() {
            return Some(&mut self.children);
        }
        self.node_mut(path)?.children_mut()
    }

    pub fn text_at(&self, path: &[usize]) -> Option<&Text> {
        self.node(path)?.as_text()
    }

    /// All text runs in document order.
    pub fn texts(&self) -> Vec<(Path, &Text)> {
        fn walk<'a>(nodes: &'a [Node], prefix: &mut Path, out: &mut Vec<(Path, &'a Text)>) {
            for (i, node) in nodes.iter().enumerate() {
                prefix.push(i);
                match node {
                    Node::Text(text) => out.push((prefix.clone(), text)),
                    Node::Element(element) => walk(&element.children, prefix, out),
                }
                prefix.pop();
            }
        }
        let mut out = Vec::new();
        walk(&self.children, &mut Vec::new(), &mut out);
        out
    }

    /// Paths of every element from `path` up to the root, nearest first.
    pub fn element_ancestors(&self, path: &[usize]) -> Vec<Path> {
        (1..=path.len())
            .rev()
            .map(|len| path[..len].to_vec())
            .filter(|p| self.node(p).is_some_and(Node::is_element))
            .collect()
    }

    pub fn has_point(&self, point: &Point) -> bool {
        self.text_at(&point.path).is_some_and(|text| point.offset <= text.len())
    }

    pub fn first_point(&self) -> Option<Point> {
        self.texts().first().map(|(path, _)| Point::new(path.clone(), 0))
    }

    pub fn last_point(&self) -> Option<Point> {
        self.texts().last().map(|(path, text)| Point::new(path.clone(), text.len()))
    }

    /// The nearest valid point at or before `point`.
    pub fn clamp_point(&self, point: &Point) -> Option<Point> {
        if self.has_point(point) {
            return Some(point.clone());
        }
        let texts = self.texts();
        let (path, text) = texts
            .iter()
            .rev()
            .find(|(path, _)| path::compare(path, &point.path).is_le())
            .or_else(|| texts.first())?;
        let offset = match path::compare(path, &point.path) {
            _ if path == &point.path => point.offset.min(text.len()),
            std::cmp::Ordering::Less => text.len(),
            _ => 0,
        };
        Some(Point::new(path.clone(), offset))
    }

    /// Applies a single operation. Validation happens before any mutation,
    /// so a failed operation leaves the document untouched.
    pub fn apply(&mut self, op: &Operation) -> Result<(), CoreError> {
        trace!("apply {} at {:?}", op.kind(), op.path());
        match op {
            Operation::InsertText { path, offset, text } => {
                let node = self.text_mut(path)?;
                let at = byte_index(&node.text, *offset)
                    .ok_or_else(|| CoreError::InvalidOperation(format!("offset {} out of range at {:?}", offset, path)))?;
                node.text.insert_str(at, text);
            }
            Operation::RemoveText { path, offset, text } => {
                let node = self.text_mut(path)?;
                let len = text.chars().count();
                let range = byte_index(&node.text, *offset).zip(byte_index(&node.text, offset + len));
                match range {
                    Some((start, end)) if &node.text[start..end] == text => {
                        node.text.replace_range(start..end, "");
                    }
                    _ => {
                        return Err(CoreError::InvalidOperation(format!(
                            "text {:?} not found at {:?}:{}",
                            text, path, offset
                        )))
                    }
                }
            }
            Operation::InsertNode { path, node } => {
                let (index, parent) = split_index(path)?;
                let siblings = self.children_at_mut(parent).ok_or_else(|| CoreError::InvalidPath(path.clone()))?;
                if index > siblings.len() {
                    return Err(CoreError::InvalidPath(path.clone()));
                }
                siblings.insert(index, node.clone());
            }
            Operation::RemoveNode { path, node } => {
                let (index, parent) = split_index(path)?;
                let siblings = self.children_at_mut(parent).ok_or_else(|| CoreError::InvalidPath(path.clone()))?;
                let existing = siblings.get(index).ok_or_else(|| CoreError::InvalidPath(path.clone()))?;
                if existing != node {
                    return Err(CoreError::InvalidOperation(format!("node at {:?} does not match", path)));
                }
                siblings.remove(index);
            }
            Operation::SplitNode {
                path,
                position,
                properties,
            } => {
                let (index, parent) = split_index(path)?;
                let siblings = self.children_at_mut(parent).ok_or_else(|| CoreError::InvalidPath(path.clone()))?;
                let node = siblings.get_mut(index).ok_or_else(|| CoreError::InvalidPath(path.clone()))?;
                let mut right = Node::from_properties(properties);
                match (&mut *node, &mut right) {
                    (Node::Text(left), Node::Text(right)) => {
                        let at = byte_index(&left.text, *position).ok_or_else(|| {
                            CoreError::InvalidOperation(format!("split position {} out of range at {:?}", position, path))
                        })?;
                        right.text = left.text.split_off(at);
                    }
                    (Node::Element(left), Node::Element(right)) => {
                        if *position > left.children.len() {
                            return Err(CoreError::InvalidOperation(format!(
                                "split position {} out of range at {:?}",
                                position, path
                            )));
                        }
                        right.children = left.children.split_off(*position);
                    }
                    _ => {
                        return Err(CoreError::InvalidOperation(format!(
                            "split properties do not match node at {:?}",
                            path
                        )))
                    }
                }
                siblings.insert(index + 1, right);
            }
            Operation::MergeNode {
                path,
                position,
                properties,
            } => {
                let (index, parent) = split_index(path)?;
                if index == 0 {
                    return Err(CoreError::InvalidOperation(format!("no previous sibling for {:?}", path)));
                }
                let siblings = self.children_at_mut(parent).ok_or_else(|| CoreError::InvalidPath(path.clone()))?;
                if index >= siblings.len() {
                    return Err(CoreError::InvalidPath(path.clone()));
                }
                if siblings[index].properties() != *properties {
                    return Err(CoreError::InvalidOperation(format!("merge properties do not match at {:?}", path)));
                }
                let previous_len = match &siblings[index - 1] {
                    Node::Text(text) => text.len(),
                    Node::Element(element) => element.children.len(),
                };
                let compatible = siblings[index - 1].is_text() == siblings[index].is_text();
                if !compatible || previous_len != *position {
                    return Err(CoreError::InvalidOperation(format!("cannot merge {:?} at {}", path, position)));
                }
                let node = siblings.remove(index);
                match (&mut siblings[index - 1], node) {
                    (Node::Text(left), Node::Text(right)) => left.text.push_str(&right.text),
                    (Node::Element(left), Node::Element(right)) => left.children.extend(right.children),
                    _ => {}
                }
            }
            Operation::SetNode { path, new_properties, .. } => {
                let node = self.node_mut(path).ok_or_else(|| CoreError::InvalidPath(path.clone()))?;
                if !node.set_properties(new_properties) {
                    return Err(CoreError::InvalidOperation(format!("properties do not match node at {:?}", path)));
                }
            }
        }
        Ok(())
    }

    fn text_mut(&mut self, path: &[usize]) -> Result<&mut Text, CoreError> {
        match self.node_mut(path) {
            Some(Node::Text(text)) => Ok(text),
            _ => Err(CoreError::InvalidPath(path.to_vec())),
        }
    }

    pub fn to_json(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Text content with blocks separated by newlines.
    pub fn plain_text(&self) -> String {
        fn blocks(node: &Node, out: &mut Vec<String>) {
            match node.as_element() {
                Some(element) if !element.is_text_block() => {
                    element.children.iter().for_each(|child| blocks(child, out));
                }
                _ => out.push(node.string()),
            }
        }
        let mut out = Vec::new();
        self.children.iter().for_each(|node| blocks(node, &mut out));
        out.join("\n")
    }
}

/// Properties of a paragraph with no alignment.
pub fn paragraph_properties() -> Properties {
    Properties::Element {
        kind: BlockKind::Paragraph,
        align: None,
    }
}

fn split_index(path: &[usize]) -> Result<(usize, &[usize]), CoreError> {
    match path.split_last() {
        Some((&index, parent)) => Ok((index, parent)),
        None => Err(CoreError::InvalidPath(path.to_vec())),
    }
}
