//! Tree diff used to turn a changed mirror back into local operations.
//!
//! The produced operations, applied in order to `old`, yield `new`. Children
//! are matched by common prefix and suffix; an equal-length middle is diffed
//! pairwise so in-text edits surface as text operations and keep carets
//! stable. Anything else is replaced wholesale.

use crate::document::Document;
use crate::node::Node;
use crate::operation::Operation;
use crate::path::{child, Path};

pub fn diff(old: &Document, new: &Document) -> Vec<Operation> {
    let mut ops = Vec::new();
    diff_children(&[], &old.children, &new.children, &mut ops);
    ops
}

fn diff_children(parent: &[usize], old: &[Node], new: &[Node], ops: &mut Vec<Operation>) {
    let prefix = old.iter().zip(new).take_while(|(a, b)| a == b).count();
    let max_suffix = old.len().min(new.len()) - prefix;
    let suffix = old
        .iter()
        .rev()
        .zip(new.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    let old_middle = &old[prefix..old.len() - suffix];
    let new_middle = &new[prefix..new.len() - suffix];

    if old_middle.len() == new_middle.len() {
        for (i, (a, b)) in old_middle.iter().zip(new_middle).enumerate() {
            diff_node(child(parent, prefix + i), a, b, ops);
        }
        return;
    }

    for (i, node) in old_middle.iter().enumerate().rev() {
        ops.push(Operation::RemoveNode {
            path: child(parent, prefix + i),
            node: node.clone(),
        });
    }
    for (i, node) in new_middle.iter().enumerate() {
        ops.push(Operation::InsertNode {
            path: child(parent, prefix + i),
            node: node.clone(),
        });
    }
}

fn diff_node(path: Path, old: &Node, new: &Node, ops: &mut Vec<Operation>) {
    match (old, new) {
        (Node::Text(a), Node::Text(b)) => {
            if a.marks != b.marks {
                ops.push(Operation::SetNode {
                    path: path.clone(),
                    properties: old.properties(),
                    new_properties: new.properties(),
                });
            }
            diff_text(path, &a.text, &b.text, ops);
        }
        (Node::Element(a), Node::Element(b)) => {
            if a.kind != b.kind || a.align != b.align {
                ops.push(Operation::SetNode {
                    path: path.clone(),
                    properties: old.properties(),
                    new_properties: new.properties(),
                });
            }
            diff_children(&path, &a.children, &b.children, ops);
        }
        _ => {
            ops.push(Operation::RemoveNode {
                path: path.clone(),
                node: old.clone(),
            });
            ops.push(Operation::InsertNode {
                path,
                node: new.clone(),
            });
        }
    }
}

fn diff_text(path: Path, old: &str, new: &str, ops: &mut Vec<Operation>) {
    if old == new {
        return;
    }
    let a: Vec<char> = old.chars().collect();
    let b: Vec<char> = new.chars().collect();
    let prefix = a.iter().zip(&b).take_while(|(x, y)| x == y).count();
    let max_suffix = a.len().min(b.len()) - prefix;
    let suffix = a
        .iter()
        .rev()
        .zip(b.iter().rev())
        .take(max_suffix)
        .take_while(|(x, y)| x == y)
        .count();

    let removed: String = a[prefix..a.len() - suffix].iter().collect();
    let inserted: String = b[prefix..b.len() - suffix].iter().collect();
    if !removed.is_empty() {
        ops.push(Operation::RemoveText {
            path: path.clone(),
            offset: prefix,
            text: removed,
        });
    }
    if !inserted.is_empty() {
        ops.push(Operation::InsertText {
            path,
            offset: prefix,
            text: inserted,
        });
    }
}
