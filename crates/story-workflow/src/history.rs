use crate::WorkflowError;

pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Whole-snapshot undo/redo with re-entrant grouping.
///
/// A snapshot is captured only when the outermost group opens; nested groups
/// fold into it. Opening a group clears the redo stack. Undo and redo close any
/// open group, so the next edit records a fresh snapshot of the restored state.
#[derive(Debug, Clone)]
pub struct SnapshotHistory<T> {
    undo_stack: Vec<T>,
    redo_stack: Vec<T>,
    depth: usize,
    limit: usize,
}

impl<T: Clone> SnapshotHistory<T> {
    pub fn new(limit: usize) -> Self {
        Self {
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            depth: 0,
            limit: limit.max(1),
        }
    }

    pub fn begin_group(&mut self, current: &T) {
        self.depth += 1;
        if self.depth > 1 {
            return;
        }
        self.undo_stack.push(current.clone());
        if self.undo_stack.len() > self.limit {
            let overflow = self.undo_stack.len() - self.limit;
            self.undo_stack.drain(..overflow);
        }
        self.redo_stack.clear();
    }

    pub fn end_group(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    pub fn in_group(&self) -> bool {
        self.depth > 0
    }

    /// Returns the snapshot to restore; `current` becomes redoable.
    pub fn undo(&mut self, current: T) -> Result<T, WorkflowError> {
        let previous = self
            .undo_stack
            .pop()
            .ok_or(WorkflowError::HistoryEmpty("undo stack"))?;
        self.depth = 0;
        self.redo_stack.push(current);
        Ok(previous)
    }

    pub fn redo(&mut self, current: T) -> Result<T, WorkflowError> {
        let next = self
            .redo_stack
            .pop()
            .ok_or(WorkflowError::HistoryEmpty("redo stack"))?;
        self.depth = 0;
        self.undo_stack.push(current);
        Ok(next)
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.depth = 0;
    }
}

impl<T: Clone> Default for SnapshotHistory<T> {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}
