//! Seams between the editor and whatever consumes its output.

use crate::document::Document;
use crate::error::CoreError;
use crate::operation::Operation;
use crate::selection::Range;

/// Receives local operations after the editor has applied them.
pub trait OperationSink {
    type Output;

    /// `document` is the editor's tree with `ops` already applied.
    fn apply_local(&mut self, ops: &[Operation], document: &Document) -> Result<Self::Output, CoreError>;
}

/// Notified when the local selection changes.
pub trait SelectionObserver {
    fn selection_changed(&mut self, selection: Option<&Range>);
}

impl OperationSink for Vec<Operation> {
    type Output = usize;

    fn apply_local(&mut self, ops: &[Operation], _document: &Document) -> Result<usize, CoreError> {
        self.extend_from_slice(ops);
        Ok(ops.len())
    }
}
