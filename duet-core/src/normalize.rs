//! Structural normalization.
//!
//! After every batch the editor repeatedly asks for the next fix and applies
//! it until the document is in canonical shape:
//!
//! - the document has at least one block
//! - top-level nodes are elements
//! - every element has at least one child, and its children are either all
//!   elements or all texts
//! - adjacent texts with identical marks are merged
//! - an empty text is removed when it has a sibling

use crate::document::Document;
use crate::node::{Node, Text};
use crate::operation::Operation;
use crate::path::{self, Path};

/// Upper bound on fixes per pass, guarding against rules that fight each other.
pub const MAX_ITERATIONS: usize = 10_000;

/// The next operation that moves `doc` closer to canonical shape.
pub fn next_fix(doc: &Document) -> Option<Operation> {
    if doc.children.is_empty() {
        return Some(Operation::InsertNode {
            path: vec![0],
            node: Node::paragraph(),
        });
    }
    if let Some((i, node)) = doc.children.iter().enumerate().find(|(_, n)| n.is_text()) {
        return Some(Operation::RemoveNode {
            path: vec![i],
            node: node.clone(),
        });
    }
    let mut prefix = Vec::new();
    fix_children(&doc.children, &mut prefix)
}

fn fix_children(nodes: &[Node], prefix: &mut Path) -> Option<Operation> {
    for (i, node) in nodes.iter().enumerate() {
        if let Node::Element(element) = node {
            prefix.push(i);
            let fix = fix_element(&element.children, prefix);
            prefix.pop();
            if fix.is_some() {
                return fix;
            }
        }
    }
    None
}

fn fix_element(children: &[Node], path: &mut Path) -> Option<Operation> {
    let Some(first) = children.first() else {
        return Some(Operation::InsertNode {
            path: path::child(path, 0),
            node: Node::text(""),
        });
    };

    let wants_text = first.is_text();
    if let Some((i, node)) = children
        .iter()
        .enumerate()
        .find(|(_, n)| n.is_text() != wants_text)
    {
        return Some(Operation::RemoveNode {
            path: path::child(path, i),
            node: node.clone(),
        });
    }

    if !wants_text {
        return fix_children(children, path);
    }

    let texts: Vec<&Text> = children.iter().filter_map(Node::as_text).collect();
    for i in 1..texts.len() {
        let (prev, text) = (texts[i - 1], texts[i]);
        if prev.marks == text.marks || text.is_empty() && texts.len() > 1 {
            if text.is_empty() {
                return Some(Operation::RemoveNode {
                    path: path::child(path, i),
                    node: children[i].clone(),
                });
            }
            return Some(Operation::MergeNode {
                path: path::child(path, i),
                position: prev.len(),
                properties: children[i].properties(),
            });
        }
    }
    if texts.len() > 1 && texts[0].is_empty() {
        return Some(Operation::RemoveNode {
            path: path::child(path, 0),
            node: children[0].clone(),
        });
    }
    None
}

/// Applies fixes until none remain; returns the operations applied.
pub fn normalize(doc: &mut Document) -> Vec<Operation> {
    let mut applied = Vec::new();
    for _ in 0..MAX_ITERATIONS {
        let Some(op) = next_fix(doc) else {
            return applied;
        };
        if let Err(e) = doc.apply(&op) {
            log::error!("normalization fix {} failed: {}", op.kind(), e);
            return applied;
        }
        applied.push(op);
    }
    log::warn!("normalization did not settle after {} fixes", MAX_ITERATIONS);
    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{BlockKind, Marks};

    #[test]
    fn test_empty_document_gets_paragraph() {
        let mut doc = Document::default();
        let ops = normalize(&mut doc);
        assert_eq!(ops.len(), 1);
        assert_eq!(doc.children, vec![Node::paragraph()]);
    }

    #[test]
    fn test_adjacent_texts_merge() {
        let mut doc = Document::new(vec![Node::element(
            BlockKind::Paragraph,
            vec![Node::text("ab"), Node::text("cd"), Node::marked("ef", Marks::BOLD)],
        )]);
        normalize(&mut doc);
        assert_eq!(
            doc.node(&[0]).unwrap().children().unwrap(),
            &vec![Node::text("abcd"), Node::marked("ef", Marks::BOLD)]
        );
    }

    #[test]
    fn test_empty_texts_removed_but_one_kept() {
        let mut doc = Document::new(vec![Node::element(
            BlockKind::Paragraph,
            vec![Node::marked("", Marks::BOLD), Node::text("x"), Node::marked("", Marks::ITALIC)],
        )]);
        normalize(&mut doc);
        assert_eq!(doc.node(&[0]).unwrap().children().unwrap(), &vec![Node::text("x")]);

        let mut doc = Document::new(vec![Node::element(BlockKind::Paragraph, vec![])]);
        normalize(&mut doc);
        assert_eq!(doc.children, vec![Node::paragraph()]);
    }

    #[test]
    fn test_top_level_text_and_mixed_children() {
        let mut doc = Document::new(vec![
            Node::text("stray"),
            Node::element(
                BlockKind::BulletedList,
                vec![
                    Node::element(BlockKind::ListItem, vec![Node::text("one")]),
                    Node::text("stray"),
                ],
            ),
        ]);
        normalize(&mut doc);
        assert_eq!(
            doc.children,
            vec![Node::element(
                BlockKind::BulletedList,
                vec![Node::element(BlockKind::ListItem, vec![Node::text("one")])]
            )]
        );
    }
}
