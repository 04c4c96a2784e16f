// Copyright (c) 2026 Robert L. Snyder, Sierra Vista, AZ
// Licensed under the MIT License. See LICENSE file in the project root for details.

//! Lead sheet model and its change notifications.
//!
//! The lead sheet is an external collaborator: only sections matter to the
//! song structure, chord items are carried as opaque text. Every edit is
//! delivered twice to listeners: once to authorize it before anything
//! changes, once after it has been applied.

pub mod sheet;

pub use sheet::LeadSheet;

use std::fmt;

use crate::error::Veto;
use crate::rhythm::TimeSignature;

/// Stable identifier of a lead sheet section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectionId(u64);

impl SectionId {
    /// Create a section id
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get raw id
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

/// A section: a named bar range sharing one time signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub id: SectionId,
    pub name: String,
    pub time_signature: TimeSignature,
    /// Start bar
    pub bar: usize,
}

/// An item of the lead sheet timeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadSheetItem {
    Section(Section),
    Chord { bar: usize, symbol: String },
}

impl LeadSheetItem {
    /// Get item bar
    pub fn bar(&self) -> usize {
        match self {
            LeadSheetItem::Section(s) => s.bar,
            LeadSheetItem::Chord { bar, .. } => *bar,
        }
    }

    /// Get the section, if this item is one
    pub fn as_section(&self) -> Option<&Section> {
        match self {
            LeadSheetItem::Section(s) => Some(s),
            LeadSheetItem::Chord { .. } => None,
        }
    }
}

/// Sections among a list of items
pub fn sections_of(items: &[LeadSheetItem]) -> Vec<&Section> {
    items.iter().filter_map(LeadSheetItem::as_section).collect()
}

/// The user-level operation a group of changes belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadSheetAction {
    AddSection,
    RemoveSection,
    ChangeSection,
    MoveSection,
    SetSize,
    InsertBars { bar: usize, count: usize },
    DeleteBars { from: usize, count: usize },
    AddChord,
    RemoveChord,
}

impl LeadSheetAction {
    /// Short name used for composite actions downstream
    pub fn name(&self) -> &'static str {
        match self {
            LeadSheetAction::AddSection => "addSection",
            LeadSheetAction::RemoveSection => "removeSection",
            LeadSheetAction::ChangeSection => "changeSection",
            LeadSheetAction::MoveSection => "moveSection",
            LeadSheetAction::SetSize => "setSize",
            LeadSheetAction::InsertBars { .. } => "insertBars",
            LeadSheetAction::DeleteBars { .. } => "deleteBars",
            LeadSheetAction::AddChord => "addChord",
            LeadSheetAction::RemoveChord => "removeChord",
        }
    }
}

/// A lead sheet change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadSheetChange {
    ItemsAdded(Vec<LeadSheetItem>),
    ItemsRemoved(Vec<LeadSheetItem>),
    ItemChanged { old: LeadSheetItem, new: LeadSheetItem },
    /// Items pushed by a fixed bar offset; items carry their new bar
    ItemsBarShifted { items: Vec<LeadSheetItem>, offset: isize },
    SectionMoved { section: Section, old_bar: usize, new_bar: usize },
    SizeChanged { old_size: usize, new_size: usize },
    ActionStarted(LeadSheetAction),
    ActionCompleted(LeadSheetAction),
}

/// Two-phase lead sheet listener
pub trait LeadSheetListener: Send + Sync {
    /// Called before a change is applied; `sheet` is still in its previous state
    fn authorize_change(&self, _sheet: &LeadSheet, _change: &LeadSheetChange) -> Result<(), Veto> {
        Ok(())
    }

    /// Called after a change was applied. Must not fail.
    fn lead_sheet_changed(&self, sheet: &LeadSheet, change: &LeadSheetChange);
}
