// Copyright (c) 2026 Robert L. Snyder, Sierra Vista, AZ
// Licensed under the MIT License. See LICENSE file in the project root for details.

//! Undo/redo log shared by a song, its structure and its mix.
//!
//! Components push plain data records ([`Edit`]) holding before/after
//! snapshots and a weak handle to their target. Records pushed between
//! [`UndoManager::begin_compound`] and [`UndoManager::end_compound`] are
//! undone and redone as one step.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing::debug;

/// Default number of undoable steps kept
pub const DEFAULT_UNDO_LIMIT: usize = 100;

/// One reversible state change
pub trait Edit: Send + Sync {
    /// Short description
    fn name(&self) -> &str;

    /// Restore the state before the change
    fn undo(&self);

    /// Restore the state after the change
    fn redo(&self);
}

/// Edits undone and redone together
pub struct CompoundEdit {
    name: String,
    edits: Vec<Box<dyn Edit>>,
}

impl CompoundEdit {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            edits: Vec::new(),
        }
    }

    /// Get name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get number of edits
    pub fn len(&self) -> usize {
        self.edits.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    fn undo(&self) {
        for edit in self.edits.iter().rev() {
            edit.undo();
        }
    }

    fn redo(&self) {
        for edit in &self.edits {
            edit.redo();
        }
    }
}

#[derive(Default)]
struct UndoState {
    done: Vec<CompoundEdit>,
    undone: Vec<CompoundEdit>,
    open: Option<CompoundEdit>,
}

/// Undo/redo stacks of compound edits
pub struct UndoManager {
    state: Mutex<UndoState>,
    in_progress: AtomicBool,
    limit: usize,
}

impl Default for UndoManager {
    fn default() -> Self {
        Self::new()
    }
}

impl UndoManager {
    /// Create a manager keeping [`DEFAULT_UNDO_LIMIT`] steps
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_UNDO_LIMIT)
    }

    /// Create a manager keeping at most `limit` steps
    pub fn with_limit(limit: usize) -> Self {
        Self {
            state: Mutex::new(UndoState::default()),
            in_progress: AtomicBool::new(false),
            limit: limit.max(1),
        }
    }

    /// Open a compound edit; returns false if one is already open
    pub fn begin_compound(&self, name: &str) -> bool {
        let mut state = self.state.lock().expect("undo state lock poisoned");
        if state.open.is_some() {
            return false;
        }
        state.open = Some(CompoundEdit::new(name));
        true
    }

    /// Close the open compound edit
    pub fn end_compound(&self) {
        let mut state = self.state.lock().expect("undo state lock poisoned");
        if let Some(compound) = state.open.take() {
            if !compound.is_empty() {
                debug!(name = compound.name(), edits = compound.len(), "undoable step recorded");
                self.record(&mut state, compound);
            }
        }
    }

    /// Check if a compound edit is open
    pub fn is_compound_open(&self) -> bool {
        self.state.lock().expect("undo state lock poisoned").open.is_some()
    }

    /// Record an edit; ignored while undoing or redoing
    pub fn push(&self, edit: Box<dyn Edit>) {
        if self.is_undo_redo_in_progress() {
            return;
        }
        let mut state = self.state.lock().expect("undo state lock poisoned");
        match state.open.as_mut() {
            Some(compound) => compound.edits.push(edit),
            None => {
                let mut compound = CompoundEdit::new(edit.name().to_string());
                compound.edits.push(edit);
                self.record(&mut state, compound);
            }
        }
    }

    fn record(&self, state: &mut UndoState, compound: CompoundEdit) {
        state.undone.clear();
        state.done.push(compound);
        if state.done.len() > self.limit {
            state.done.remove(0);
        }
    }

    /// Check if undo/redo is replaying edits
    pub fn is_undo_redo_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Check if there is a step to undo
    pub fn can_undo(&self) -> bool {
        !self.state.lock().expect("undo state lock poisoned").done.is_empty()
    }

    /// Check if there is a step to redo
    pub fn can_redo(&self) -> bool {
        !self.state.lock().expect("undo state lock poisoned").undone.is_empty()
    }

    /// Get name of the next step to undo
    pub fn undo_name(&self) -> Option<String> {
        let state = self.state.lock().expect("undo state lock poisoned");
        state.done.last().map(|c| c.name.clone())
    }

    /// Undo the last step; returns false if there is none
    pub fn undo(&self) -> bool {
        let compound = {
            let mut state = self.state.lock().expect("undo state lock poisoned");
            if state.open.is_some() {
                return false;
            }
            match state.done.pop() {
                Some(c) => c,
                None => return false,
            }
        };
        debug!(name = compound.name(), "undo");
        self.in_progress.store(true, Ordering::SeqCst);
        compound.undo();
        self.in_progress.store(false, Ordering::SeqCst);
        self.state
            .lock()
            .expect("undo state lock poisoned")
            .undone
            .push(compound);
        true
    }

    /// Redo the last undone step; returns false if there is none
    pub fn redo(&self) -> bool {
        let compound = {
            let mut state = self.state.lock().expect("undo state lock poisoned");
            if state.open.is_some() {
                return false;
            }
            match state.undone.pop() {
                Some(c) => c,
                None => return false,
            }
        };
        debug!(name = compound.name(), "redo");
        self.in_progress.store(true, Ordering::SeqCst);
        compound.redo();
        self.in_progress.store(false, Ordering::SeqCst);
        self.state
            .lock()
            .expect("undo state lock poisoned")
            .done
            .push(compound);
        true
    }

    /// Drop all recorded steps
    pub fn clear(&self) {
        let mut state = self.state.lock().expect("undo state lock poisoned");
        state.done.clear();
        state.undone.clear();
    }
}
