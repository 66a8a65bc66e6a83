//! Points and ranges inside the document, and how they follow edits.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::operation::Operation;
use crate::path::{self, Path};

/// A char offset inside the text node at `path`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub path: Path,
    pub offset: usize,
}

impl Point {
    pub fn new(path: Path, offset: usize) -> Self {
        Self { path, offset }
    }

    pub fn compare(&self, other: &Point) -> Ordering {
        match path::compare(&self.path, &other.path) {
            Ordering::Equal => self.offset.cmp(&other.offset),
            other => other,
        }
    }

    pub fn is_before(&self, other: &Point) -> bool {
        self.compare(other) == Ordering::Less
    }
}

/// Which side a point sticks to when content is inserted exactly at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    Forward,
    Backward,
}

/// Moves `point` through `op`; `None` when the point's node was removed.
pub fn transform_point(point: &Point, op: &Operation, affinity: Affinity) -> Option<Point> {
    let Point { path, offset } = point;
    match op {
        Operation::InsertText {
            path: at,
            offset: at_offset,
            text,
        } if at == path => {
            let shifted = *at_offset < *offset || (*at_offset == *offset && affinity == Affinity::Forward);
            let offset = if shifted {
                offset + text.chars().count()
            } else {
                *offset
            };
            Some(Point::new(path.clone(), offset))
        }
        Operation::RemoveText {
            path: at,
            offset: at_offset,
            text,
        } if at == path => {
            let offset = if *at_offset <= *offset {
                offset - (offset - at_offset).min(text.chars().count())
            } else {
                *offset
            };
            Some(Point::new(path.clone(), offset))
        }
        Operation::MergeNode { path: at, position, .. } if at == path => {
            Some(Point::new(path::previous(path)?, offset + position))
        }
        Operation::SplitNode { path: at, position, .. } if at == path => {
            if *position < *offset || (*position == *offset && affinity == Affinity::Forward) {
                Some(Point::new(path::next(path), offset - position))
            } else {
                Some(point.clone())
            }
        }
        _ => Some(Point::new(path::transform(path, op)?, *offset)),
    }
}

/// A selection between `anchor` (where it started) and `focus` (where the caret is).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    pub anchor: Point,
    pub focus: Point,
}

impl Range {
    pub fn new(anchor: Point, focus: Point) -> Self {
        Self { anchor, focus }
    }

    pub fn collapsed(point: Point) -> Self {
        Self {
            anchor: point.clone(),
            focus: point,
        }
    }

    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.focus
    }

    pub fn is_backward(&self) -> bool {
        self.focus.is_before(&self.anchor)
    }

    /// `(start, end)` in document order.
    pub fn edges(&self) -> (&Point, &Point) {
        if self.is_backward() {
            (&self.focus, &self.anchor)
        } else {
            (&self.anchor, &self.focus)
        }
    }

    pub fn start(&self) -> &Point {
        self.edges().0
    }

    pub fn end(&self) -> &Point {
        self.edges().1
    }

    /// Moves the range through `op`, keeping inserted content outside an
    /// expanded range and after a collapsed caret.
    pub fn transform(&self, op: &Operation) -> Option<Range> {
        let (anchor_affinity, focus_affinity) = if self.is_collapsed() {
            (Affinity::Forward, Affinity::Forward)
        } else if self.is_backward() {
            (Affinity::Backward, Affinity::Forward)
        } else {
            (Affinity::Forward, Affinity::Backward)
        };
        let anchor = transform_point(&self.anchor, op, anchor_affinity)?;
        let focus = transform_point(&self.focus, op, focus_affinity)?;
        Some(Range { anchor, focus })
    }
}
