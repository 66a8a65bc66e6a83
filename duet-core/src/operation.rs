//! Primitive document operations.
//!
//! Every edit the editor performs is expressed as a sequence of these. Each
//! operation carries enough information to be inverted, which is what the
//! undo history and the CRDT mirror rely on.

use crate::node::{Node, Properties};
use crate::path::{self, Path};
use crate::selection::{transform_point, Affinity, Point};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    InsertText {
        path: Path,
        offset: usize,
        text: String,
    },
    RemoveText {
        path: Path,
        offset: usize,
        text: String,
    },
    InsertNode {
        path: Path,
        node: Node,
    },
    RemoveNode {
        path: Path,
        node: Node,
    },
    /// Splits the node at `path` at `position` (chars for text, child index
    /// for elements). The new right half carries `properties`.
    SplitNode {
        path: Path,
        position: usize,
        properties: Properties,
    },
    /// Merges the node at `path` into its previous sibling, whose length was
    /// `position`. `properties` are those of the merged-away node.
    MergeNode {
        path: Path,
        position: usize,
        properties: Properties,
    },
    SetNode {
        path: Path,
        properties: Properties,
        new_properties: Properties,
    },
}

impl Operation {
    pub fn path(&self) -> &Path {
        match self {
            Operation::InsertText { path, .. }
            | Operation::RemoveText { path, .. }
            | Operation::InsertNode { path, .. }
            | Operation::RemoveNode { path, .. }
            | Operation::SplitNode { path, .. }
            | Operation::MergeNode { path, .. }
            | Operation::SetNode { path, .. } => path,
        }
    }

    /// Short name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::InsertText { .. } => "insert_text",
            Operation::RemoveText { .. } => "remove_text",
            Operation::InsertNode { .. } => "insert_node",
            Operation::RemoveNode { .. } => "remove_node",
            Operation::SplitNode { .. } => "split_node",
            Operation::MergeNode { .. } => "merge_node",
            Operation::SetNode { .. } => "set_node",
        }
    }

    /// The operation that undoes this one.
    pub fn inverse(&self) -> Operation {
        match self.clone() {
            Operation::InsertText { path, offset, text } => Operation::RemoveText { path, offset, text },
            Operation::RemoveText { path, offset, text } => Operation::InsertText { path, offset, text },
            Operation::InsertNode { path, node } => Operation::RemoveNode { path, node },
            Operation::RemoveNode { path, node } => Operation::InsertNode { path, node },
            Operation::SplitNode {
                path,
                position,
                properties,
            } => Operation::MergeNode {
                path: path::next(&path),
                position,
                properties,
            },
            Operation::MergeNode {
                path,
                position,
                properties,
            } => Operation::SplitNode {
                // merge paths are never first children
                path: path::previous(&path).unwrap_or_else(|| path.clone()),
                position,
                properties,
            },
            Operation::SetNode {
                path,
                properties,
                new_properties,
            } => Operation::SetNode {
                path,
                properties: new_properties,
                new_properties: properties,
            },
        }
    }

    /// Rebases this operation over `by`, which was applied first.
    ///
    /// Returns `None` when the target node no longer exists. The result is
    /// not guaranteed to apply cleanly; callers validate before committing.
    pub fn transform(&self, by: &Operation) -> Option<Operation> {
        match self {
            Operation::InsertText { path, offset, text } => {
                let point = transform_point(&Point::new(path.clone(), *offset), by, Affinity::Backward)?;
                Some(Operation::InsertText {
                    path: point.path,
                    offset: point.offset,
                    text: text.clone(),
                })
            }
            Operation::RemoveText { path, offset, text } => {
                let point = transform_point(&Point::new(path.clone(), *offset), by, Affinity::Forward)?;
                Some(Operation::RemoveText {
                    path: point.path,
                    offset: point.offset,
                    text: text.clone(),
                })
            }
            Operation::SplitNode {
                path,
                position,
                properties,
            } => {
                let (path, position) = match by {
                    Operation::InsertText { .. } | Operation::RemoveText { .. } if by.path() == path => {
                        let point = transform_point(&Point::new(path.clone(), *position), by, Affinity::Backward)?;
                        (point.path, point.offset)
                    }
                    _ => (path::transform(path, by)?, *position),
                };
                Some(Operation::SplitNode {
                    path,
                    position,
                    properties: *properties,
                })
            }
            Operation::MergeNode {
                path,
                position,
                properties,
            } => {
                let position = match by {
                    Operation::InsertText { path: at, text, .. } if path::previous(path).as_ref() == Some(at) => {
                        position + text.chars().count()
                    }
                    Operation::RemoveText { path: at, text, .. } if path::previous(path).as_ref() == Some(at) => {
                        position.saturating_sub(text.chars().count())
                    }
                    _ => *position,
                };
                Some(Operation::MergeNode {
                    path: path::transform(path, by)?,
                    position,
                    properties: *properties,
                })
            }
            Operation::InsertNode { path, node } => {
                // inserts survive the removal of the node they replace
                let path = match by {
                    Operation::RemoveNode { path: at, .. } if at == path => path.clone(),
                    _ => path::transform(path, by)?,
                };
                Some(Operation::InsertNode {
                    path,
                    node: node.clone(),
                })
            }
            Operation::RemoveNode { path, node } => Some(Operation::RemoveNode {
                path: path::transform(path, by)?,
                node: node.clone(),
            }),
            Operation::SetNode {
                path,
                properties,
                new_properties,
            } => Some(Operation::SetNode {
                path: path::transform(path, by)?,
                properties: *properties,
                new_properties: *new_properties,
            }),
        }
    }
}

/// Where a batch of operations came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Produced by this replica's editor.
    Local,
    /// Derived from an update received over the network.
    Remote,
}

/// An operation together with its origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tagged {
    pub origin: Origin,
    pub op: Operation,
}

impl Tagged {
    pub fn local(op: Operation) -> Self {
        Self { origin: Origin::Local, op }
    }

    pub fn remote(op: Operation) -> Self {
        Self {
            origin: Origin::Remote,
            op,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Marks;

    fn text_props() -> Properties {
        Properties::Text { marks: Marks::empty() }
    }

    #[test]
    fn test_inverse_is_involution() {
        let ops = vec![
            Operation::InsertText {
                path: vec![0, 0],
                offset: 1,
                text: "x".into(),
            },
            Operation::InsertNode {
                path: vec![1],
                node: Node::paragraph(),
            },
            Operation::SplitNode {
                path: vec![0, 1],
                position: 2,
                properties: text_props(),
            },
            Operation::SetNode {
                path: vec![0, 0],
                properties: text_props(),
                new_properties: Properties::Text { marks: Marks::BOLD },
            },
        ];
        for op in ops {
            assert_eq!(op.inverse().inverse(), op);
        }
    }

    #[test]
    fn test_split_inverse_merges_next_sibling() {
        let split = Operation::SplitNode {
            path: vec![2, 0],
            position: 4,
            properties: text_props(),
        };
        match split.inverse() {
            Operation::MergeNode { path, position, .. } => {
                assert_eq!(path, vec![2, 1]);
                assert_eq!(position, 4);
            }
            other => panic!("unexpected inverse {:?}", other),
        }
    }

    #[test]
    fn test_transform_text_over_earlier_insert() {
        let op = Operation::RemoveText {
            path: vec![0, 0],
            offset: 5,
            text: "ab".into(),
        };
        let by = Operation::InsertText {
            path: vec![0, 0],
            offset: 1,
            text: "xyz".into(),
        };
        assert_eq!(
            op.transform(&by),
            Some(Operation::RemoveText {
                path: vec![0, 0],
                offset: 8,
                text: "ab".into(),
            })
        );
    }

    #[test]
    fn test_transform_drops_ops_on_removed_nodes() {
        let op = Operation::SetNode {
            path: vec![1, 0],
            properties: text_props(),
            new_properties: Properties::Text { marks: Marks::BOLD },
        };
        let by = Operation::RemoveNode {
            path: vec![1],
            node: Node::paragraph(),
        };
        assert_eq!(op.transform(&by), None);
    }
}
