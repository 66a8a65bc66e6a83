//! Paths address nodes by child indices from the document root.

use std::cmp::Ordering;

use crate::operation::Operation;

pub type Path = Vec<usize>;

/// Path of the parent; empty for top-level nodes.
pub fn parent(path: &[usize]) -> &[usize] {
    match path.split_last() {
        Some((_, rest)) => rest,
        None => path,
    }
}

pub fn next(path: &[usize]) -> Path {
    let mut next = path.to_vec();
    if let Some(last) = next.last_mut() {
        *last += 1;
    }
    next
}

pub fn previous(path: &[usize]) -> Option<Path> {
    let (&last, rest) = path.split_last()?;
    if last == 0 {
        return None;
    }
    let mut previous = rest.to_vec();
    previous.push(last - 1);
    Some(previous)
}

pub fn child(path: &[usize], index: usize) -> Path {
    let mut child = path.to_vec();
    child.push(index);
    child
}

/// `ancestor` is a strict prefix of `path`.
pub fn is_ancestor(ancestor: &[usize], path: &[usize]) -> bool {
    ancestor.len() < path.len() && path.starts_with(ancestor)
}

pub fn is_sibling(a: &[usize], b: &[usize]) -> bool {
    a.len() == b.len() && !a.is_empty() && parent(a) == parent(b) && a != b
}

/// `a` is a sibling-or-ancestor-sibling positioned before `b` at the depth of `a`.
pub fn ends_before(a: &[usize], b: &[usize]) -> bool {
    let Some((&last, rest)) = a.split_last() else {
        return false;
    };
    b.len() >= a.len() && b.starts_with(rest) && last < b[rest.len()]
}

/// Document order; ancestors compare equal to their descendants.
pub fn compare(a: &[usize], b: &[usize]) -> Ordering {
    for (x, y) in a.iter().zip(b) {
        match x.cmp(y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Moves `path` through `op`. Returns `None` when the node was removed.
pub fn transform(path: &[usize], op: &Operation) -> Option<Path> {
    let mut p = path.to_vec();
    match op {
        Operation::InsertNode { path: at, .. } => {
            if at.as_slice() == path || ends_before(at, path) || is_ancestor(at, path) {
                p[at.len() - 1] += 1;
            }
        }
        Operation::RemoveNode { path: at, .. } => {
            if at.as_slice() == path || is_ancestor(at, path) {
                return None;
            }
            if ends_before(at, path) {
                p[at.len() - 1] -= 1;
            }
        }
        Operation::MergeNode { path: at, position, .. } => {
            if at.as_slice() == path || ends_before(at, path) {
                p[at.len() - 1] -= 1;
            } else if is_ancestor(at, path) {
                p[at.len() - 1] -= 1;
                p[at.len()] += position;
            }
        }
        Operation::SplitNode { path: at, position, .. } => {
            if at.as_slice() == path {
                return Some(p);
            }
            if ends_before(at, path) {
                p[at.len() - 1] += 1;
            } else if is_ancestor(at, path) && *position <= path[at.len()] {
                p[at.len() - 1] += 1;
                p[at.len()] -= position;
            }
        }
        Operation::InsertText { .. } | Operation::RemoveText { .. } | Operation::SetNode { .. } => {}
    }
    Some(p)
}
