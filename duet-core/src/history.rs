//! Undo/redo stacks of local operation batches.
//!
//! Only operations the local user produced are recorded. Remote operations
//! are never undone; instead the stored batches are rebased over them so a
//! later undo still targets the right nodes.

use crate::operation::Operation;
use crate::selection::Range;

/// Default number of undo steps kept.
pub const DEFAULT_MAX_STEPS: usize = 100;

/// One user-level edit: the operations of a single command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub operations: Vec<Operation>,
    /// Selection to restore when the batch is undone.
    pub selection_before: Option<Range>,
}

impl Batch {
    /// Operations that revert this batch, in application order.
    pub fn inverse(&self) -> Vec<Operation> {
        self.operations.iter().rev().map(Operation::inverse).collect()
    }

    fn rebase(&mut self, by: &Operation) {
        self.operations = self.operations.iter().filter_map(|op| op.transform(by)).collect();
        self.selection_before = self.selection_before.as_ref().and_then(|range| range.transform(by));
    }
}

#[derive(Debug, Clone)]
pub struct History {
    undos: Vec<Batch>,
    redos: Vec<Batch>,
    max_steps: usize,
}

impl Default for History {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STEPS)
    }
}

impl History {
    pub fn new(max_steps: usize) -> Self {
        Self {
            undos: Vec::new(),
            redos: Vec::new(),
            max_steps,
        }
    }

    /// Records a new local batch; any redo history is discarded.
    pub fn record(&mut self, batch: Batch) {
        if batch.operations.is_empty() {
            return;
        }
        self.redos.clear();
        self.push_undo(batch);
    }

    fn push_undo(&mut self, batch: Batch) {
        self.undos.push(batch);
        while self.undos.len() > self.max_steps {
            self.undos.remove(0);
        }
    }

    pub fn can_undo(&self) -> bool {
        !self.undos.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redos.is_empty()
    }

    pub fn pop_undo(&mut self) -> Option<Batch> {
        self.undos.pop()
    }

    pub fn pop_redo(&mut self) -> Option<Batch> {
        self.redos.pop()
    }

    /// Stores a batch that was just undone so it can be redone.
    pub fn push_redo(&mut self, batch: Batch) {
        self.redos.push(batch);
    }

    /// Stores a batch that was just redone without touching the redo stack.
    pub fn push_redone(&mut self, batch: Batch) {
        self.push_undo(batch);
    }

    /// Rebases every stored batch over operations applied from elsewhere.
    pub fn rebase(&mut self, remote: &[Operation]) {
        for op in remote {
            for batch in self.undos.iter_mut().chain(self.redos.iter_mut()) {
                batch.rebase(op);
            }
        }
        self.undos.retain(|batch| !batch.operations.is_empty());
        self.redos.retain(|batch| !batch.operations.is_empty());
    }

    pub fn clear(&mut self) {
        self.undos.clear();
        self.redos.clear();
    }

    pub fn undo_len(&self) -> usize {
        self.undos.len()
    }
}
