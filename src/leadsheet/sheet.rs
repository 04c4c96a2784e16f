// Copyright (c) 2026 Robert L. Snyder, Sierra Vista, AZ
// Licensed under the MIT License. See LICENSE file in the project root for details.

//! Minimal lead sheet storage emitting two-phase change notifications.

use std::sync::Arc;

use super::{
    LeadSheetAction, LeadSheetChange, LeadSheetItem, LeadSheetListener, Section, SectionId,
};
use crate::error::LeadSheetError;
use crate::rhythm::TimeSignature;

/// An ordered timeline of sections and chord symbols
pub struct LeadSheet {
    /// Size in bars
    size: usize,
    /// Sections sorted by bar, the first one always at bar 0
    sections: Vec<Section>,
    /// Chord symbols sorted by bar
    chords: Vec<(usize, String)>,
    next_section_id: u64,
    listeners: Vec<Arc<dyn LeadSheetListener>>,
}

impl LeadSheet {
    /// Create a lead sheet with an initial section at bar 0
    pub fn new(init_name: impl Into<String>, time_signature: TimeSignature, size: usize) -> Self {
        Self {
            size: size.max(1),
            sections: vec![Section {
                id: SectionId::new(0),
                name: init_name.into(),
                time_signature,
                bar: 0,
            }],
            chords: Vec::new(),
            next_section_id: 1,
            listeners: Vec::new(),
        }
    }

    /// Add a listener
    pub fn add_listener(&mut self, listener: Arc<dyn LeadSheetListener>) {
        self.listeners.push(listener);
    }

    /// Remove a listener
    pub fn remove_listener(&mut self, listener: &Arc<dyn LeadSheetListener>) {
        self.listeners
            .retain(|l| Arc::as_ptr(l) as *const () != Arc::as_ptr(listener) as *const ());
    }

    /// Get size in bars
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get sections sorted by bar
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Get a section by id
    pub fn section(&self, id: SectionId) -> Option<&Section> {
        self.sections.iter().find(|s| s.id == id)
    }

    /// Get the section at bar 0
    pub fn init_section(&self) -> &Section {
        &self.sections[0]
    }

    /// Get the section starting exactly at `bar`
    pub fn section_at(&self, bar: usize) -> Option<&Section> {
        self.sections.iter().find(|s| s.bar == bar)
    }

    /// Get the section covering `bar`
    pub fn section_containing(&self, bar: usize) -> &Section {
        self.sections
            .iter()
            .rev()
            .find(|s| s.bar <= bar)
            .unwrap_or(&self.sections[0])
    }

    /// Get the section before `id`
    pub fn previous_section(&self, id: SectionId) -> Option<&Section> {
        let index = self.sections.iter().position(|s| s.id == id)?;
        index.checked_sub(1).map(|i| &self.sections[i])
    }

    /// Get the section after `id`
    pub fn next_section(&self, id: SectionId) -> Option<&Section> {
        let index = self.sections.iter().position(|s| s.id == id)?;
        self.sections.get(index + 1)
    }

    /// Get the number of bars covered by a section
    pub fn section_size(&self, id: SectionId) -> usize {
        match self.section(id) {
            Some(section) => {
                let end = self.next_section(id).map(|s| s.bar).unwrap_or(self.size);
                end.saturating_sub(section.bar)
            }
            None => 0,
        }
    }

    /// Get chord symbols as items
    pub fn chords(&self) -> Vec<LeadSheetItem> {
        self.chords
            .iter()
            .map(|(bar, symbol)| LeadSheetItem::Chord {
                bar: *bar,
                symbol: symbol.clone(),
            })
            .collect()
    }

    /// Add a section starting at `bar`
    pub fn add_section(
        &mut self,
        name: impl Into<String>,
        time_signature: TimeSignature,
        bar: usize,
    ) -> Result<SectionId, LeadSheetError> {
        self.check_new_section_bar(bar)?;
        let id = SectionId::new(self.next_section_id);
        let section = Section {
            id,
            name: name.into(),
            time_signature,
            bar,
        };
        self.perform(
            LeadSheetAction::AddSection,
            vec![LeadSheetChange::ItemsAdded(vec![LeadSheetItem::Section(section)])],
        )?;
        self.next_section_id += 1;
        Ok(id)
    }

    /// Remove a section; its bars are absorbed by the previous section
    pub fn remove_section(&mut self, id: SectionId) -> Result<(), LeadSheetError> {
        let section = self.existing_section(id)?;
        if section.bar == 0 {
            return Err(LeadSheetError::InitSection);
        }
        self.perform(
            LeadSheetAction::RemoveSection,
            vec![LeadSheetChange::ItemsRemoved(vec![LeadSheetItem::Section(section)])],
        )
    }

    /// Rename a section
    pub fn set_section_name(&mut self, id: SectionId, name: impl Into<String>) -> Result<(), LeadSheetError> {
        let old = self.existing_section(id)?;
        let name = name.into();
        if old.name == name {
            return Ok(());
        }
        let new = Section { name, ..old.clone() };
        self.perform(
            LeadSheetAction::ChangeSection,
            vec![LeadSheetChange::ItemChanged {
                old: LeadSheetItem::Section(old),
                new: LeadSheetItem::Section(new),
            }],
        )
    }

    /// Change the time signature of a section
    pub fn set_section_time_signature(
        &mut self,
        id: SectionId,
        time_signature: TimeSignature,
    ) -> Result<(), LeadSheetError> {
        let old = self.existing_section(id)?;
        if old.time_signature == time_signature {
            return Ok(());
        }
        let new = Section {
            time_signature,
            ..old.clone()
        };
        self.perform(
            LeadSheetAction::ChangeSection,
            vec![LeadSheetChange::ItemChanged {
                old: LeadSheetItem::Section(old),
                new: LeadSheetItem::Section(new),
            }],
        )
    }

    /// Move a section to another start bar
    pub fn move_section(&mut self, id: SectionId, new_bar: usize) -> Result<(), LeadSheetError> {
        let section = self.existing_section(id)?;
        if section.bar == 0 {
            return Err(LeadSheetError::InitSection);
        }
        if section.bar == new_bar {
            return Ok(());
        }
        self.check_new_section_bar(new_bar)?;
        let old_bar = section.bar;
        let moved = Section {
            bar: new_bar,
            ..section
        };
        self.perform(
            LeadSheetAction::MoveSection,
            vec![LeadSheetChange::SectionMoved {
                section: moved,
                old_bar,
                new_bar,
            }],
        )
    }

    /// Change the size; it can not cut the last section
    pub fn set_size(&mut self, new_size: usize) -> Result<(), LeadSheetError> {
        let last_bar = self.sections.last().map(|s| s.bar).unwrap_or(0);
        if new_size == 0 || new_size <= last_bar {
            return Err(LeadSheetError::InvalidSize(new_size));
        }
        if new_size == self.size {
            return Ok(());
        }
        let mut changes = Vec::new();
        let cut: Vec<LeadSheetItem> = self
            .chords()
            .into_iter()
            .filter(|c| c.bar() >= new_size)
            .collect();
        if !cut.is_empty() {
            changes.push(LeadSheetChange::ItemsRemoved(cut));
        }
        changes.push(LeadSheetChange::SizeChanged {
            old_size: self.size,
            new_size,
        });
        self.perform(LeadSheetAction::SetSize, changes)
    }

    /// Insert `count` bars at `bar`, shifting later items.
    ///
    /// Inserting at bar 0 keeps the initial section at bar 0: its previous
    /// content moves to a new section at bar `count` which takes over the
    /// initial section's name and time signature, and the initial section is
    /// renamed.
    pub fn insert_bars(&mut self, bar: usize, count: usize) -> Result<(), LeadSheetError> {
        if bar > self.size {
            return Err(LeadSheetError::InvalidBar {
                bar,
                size: self.size,
            });
        }
        if count == 0 {
            return Ok(());
        }
        let action = LeadSheetAction::InsertBars { bar, count };
        let mut changes = vec![LeadSheetChange::SizeChanged {
            old_size: self.size,
            new_size: self.size + count,
        }];
        // The initial section stays at bar 0, everything else moves
        let shifted = self.items_from(bar, usize::from(bar == 0), count as isize);
        if !shifted.is_empty() {
            changes.push(LeadSheetChange::ItemsBarShifted {
                items: shifted,
                offset: count as isize,
            });
        }
        if bar == 0 {
            let init = self.init_section().clone();
            let moved_content = Section {
                id: SectionId::new(self.next_section_id),
                name: init.name.clone(),
                time_signature: init.time_signature,
                bar: count,
            };
            let renamed = Section {
                name: self.free_section_name(),
                ..init.clone()
            };
            changes.push(LeadSheetChange::ItemsAdded(vec![LeadSheetItem::Section(moved_content)]));
            changes.push(LeadSheetChange::ItemChanged {
                old: LeadSheetItem::Section(init),
                new: LeadSheetItem::Section(renamed),
            });
        }
        self.perform(action, changes)?;
        if bar == 0 {
            self.next_section_id += 1;
        }
        Ok(())
    }

    /// Delete `count` bars starting at `from`; sections starting inside the range are removed
    pub fn delete_bars(&mut self, from: usize, count: usize) -> Result<(), LeadSheetError> {
        if from == 0 || from + count > self.size {
            return Err(LeadSheetError::InvalidBar {
                bar: from,
                size: self.size,
            });
        }
        if count == 0 {
            return Ok(());
        }
        let end = from + count;
        let mut changes = Vec::new();
        let mut removed: Vec<LeadSheetItem> = self
            .sections
            .iter()
            .filter(|s| s.bar >= from && s.bar < end)
            .cloned()
            .map(LeadSheetItem::Section)
            .collect();
        removed.extend(self.chords().into_iter().filter(|c| c.bar() >= from && c.bar() < end));
        if !removed.is_empty() {
            changes.push(LeadSheetChange::ItemsRemoved(removed));
        }
        let shifted = self.items_from(end, 0, -(count as isize));
        if !shifted.is_empty() {
            changes.push(LeadSheetChange::ItemsBarShifted {
                items: shifted,
                offset: -(count as isize),
            });
        }
        changes.push(LeadSheetChange::SizeChanged {
            old_size: self.size,
            new_size: self.size - count,
        });
        self.perform(LeadSheetAction::DeleteBars { from, count }, changes)
    }

    /// Add a chord symbol
    pub fn add_chord(&mut self, bar: usize, symbol: impl Into<String>) -> Result<(), LeadSheetError> {
        if bar >= self.size {
            return Err(LeadSheetError::InvalidBar {
                bar,
                size: self.size,
            });
        }
        let item = LeadSheetItem::Chord {
            bar,
            symbol: symbol.into(),
        };
        self.perform(LeadSheetAction::AddChord, vec![LeadSheetChange::ItemsAdded(vec![item])])
    }

    /// Remove the chord symbols of a bar
    pub fn remove_chord(&mut self, bar: usize) -> Result<(), LeadSheetError> {
        let items: Vec<LeadSheetItem> = self.chords().into_iter().filter(|c| c.bar() == bar).collect();
        if items.is_empty() {
            return Ok(());
        }
        self.perform(LeadSheetAction::RemoveChord, vec![LeadSheetChange::ItemsRemoved(items)])
    }

    fn existing_section(&self, id: SectionId) -> Result<Section, LeadSheetError> {
        self.section(id).cloned().ok_or(LeadSheetError::UnknownSection(id))
    }

    fn check_new_section_bar(&self, bar: usize) -> Result<(), LeadSheetError> {
        if bar == 0 || bar >= self.size {
            return Err(LeadSheetError::InvalidBar {
                bar,
                size: self.size,
            });
        }
        if self.section_at(bar).is_some() {
            return Err(LeadSheetError::BarOccupied(bar));
        }
        Ok(())
    }

    /// Items at or after `bar` (sections from index `first_section`), with their bar shifted
    fn items_from(&self, bar: usize, first_section: usize, offset: isize) -> Vec<LeadSheetItem> {
        let shift = |b: usize| (b as isize + offset) as usize;
        let mut items: Vec<LeadSheetItem> = self
            .sections
            .iter()
            .skip(first_section)
            .filter(|s| s.bar >= bar)
            .map(|s| {
                LeadSheetItem::Section(Section {
                    bar: shift(s.bar),
                    ..s.clone()
                })
            })
            .collect();
        items.extend(
            self.chords
                .iter()
                .filter(|(b, _)| *b >= bar)
                .map(|(b, s)| LeadSheetItem::Chord {
                    bar: shift(*b),
                    symbol: s.clone(),
                }),
        );
        items
    }

    fn free_section_name(&self) -> String {
        ('A'..='Z')
            .map(|c| c.to_string())
            .find(|n| self.sections.iter().all(|s| &s.name != n))
            .unwrap_or_else(|| format!("Section {}", self.next_section_id + 1))
    }

    /// Authorize every change against the current state, then apply and notify them in order
    fn perform(&mut self, action: LeadSheetAction, changes: Vec<LeadSheetChange>) -> Result<(), LeadSheetError> {
        let started = LeadSheetChange::ActionStarted(action.clone());
        self.authorize(&started)?;
        for change in &changes {
            self.authorize(change)?;
        }

        self.notify(&started);
        for change in changes {
            self.apply(&change);
            self.notify(&change);
        }
        self.notify(&LeadSheetChange::ActionCompleted(action));
        Ok(())
    }

    fn authorize(&self, change: &LeadSheetChange) -> Result<(), LeadSheetError> {
        for listener in &self.listeners {
            listener.authorize_change(self, change)?;
        }
        Ok(())
    }

    fn notify(&self, change: &LeadSheetChange) {
        for listener in &self.listeners {
            listener.lead_sheet_changed(self, change);
        }
    }

    fn apply(&mut self, change: &LeadSheetChange) {
        match change {
            LeadSheetChange::ItemsAdded(items) => {
                for item in items {
                    match item {
                        LeadSheetItem::Section(s) => self.sections.push(s.clone()),
                        LeadSheetItem::Chord { bar, symbol } => self.chords.push((*bar, symbol.clone())),
                    }
                }
            }
            LeadSheetChange::ItemsRemoved(items) => {
                for item in items {
                    match item {
                        LeadSheetItem::Section(s) => self.sections.retain(|x| x.id != s.id),
                        LeadSheetItem::Chord { bar, symbol } => {
                            if let Some(i) = self.chords.iter().position(|(b, c)| b == bar && c == symbol) {
                                self.chords.remove(i);
                            }
                        }
                    }
                }
            }
            LeadSheetChange::ItemChanged { new, .. } => {
                if let LeadSheetItem::Section(s) = new {
                    if let Some(x) = self.sections.iter_mut().find(|x| x.id == s.id) {
                        *x = s.clone();
                    }
                }
            }
            LeadSheetChange::ItemsBarShifted { items, offset } => {
                // Resolve every item against the unshifted state first
                let mut section_moves: Vec<(SectionId, usize)> = Vec::new();
                let mut chord_moves: Vec<(usize, usize)> = Vec::new();
                for item in items {
                    match item {
                        LeadSheetItem::Section(s) => section_moves.push((s.id, s.bar)),
                        LeadSheetItem::Chord { bar, symbol } => {
                            let old_bar = (*bar as isize - offset) as usize;
                            if let Some(i) = self.chords.iter().enumerate().position(|(i, (b, c))| {
                                *b == old_bar && c == symbol && !chord_moves.iter().any(|(j, _)| *j == i)
                            }) {
                                chord_moves.push((i, *bar));
                            }
                        }
                    }
                }
                for (id, bar) in section_moves {
                    if let Some(x) = self.sections.iter_mut().find(|x| x.id == id) {
                        x.bar = bar;
                    }
                }
                for (i, bar) in chord_moves {
                    self.chords[i].0 = bar;
                }
            }
            LeadSheetChange::SectionMoved { section, new_bar, .. } => {
                if let Some(x) = self.sections.iter_mut().find(|x| x.id == section.id) {
                    x.bar = *new_bar;
                }
            }
            LeadSheetChange::SizeChanged { new_size, .. } => self.size = *new_size,
            LeadSheetChange::ActionStarted(_) | LeadSheetChange::ActionCompleted(_) => {}
        }
        self.sections.sort_by_key(|s| s.bar);
        self.chords.sort_by_key(|(b, _)| *b);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Veto;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        changes: Mutex<Vec<LeadSheetChange>>,
        veto_adds: bool,
    }

    impl LeadSheetListener for Recorder {
        fn authorize_change(&self, _sheet: &LeadSheet, change: &LeadSheetChange) -> Result<(), Veto> {
            if self.veto_adds && matches!(change, LeadSheetChange::ItemsAdded(_)) {
                return Err(Veto::Rejected("no".to_string()));
            }
            Ok(())
        }

        fn lead_sheet_changed(&self, _sheet: &LeadSheet, change: &LeadSheetChange) {
            self.changes.lock().unwrap().push(change.clone());
        }
    }

    fn sheet() -> LeadSheet {
        let mut ls = LeadSheet::new("A", TimeSignature::FOUR_FOUR, 12);
        ls.add_section("B", TimeSignature::FOUR_FOUR, 4).unwrap();
        ls.add_section("C", TimeSignature::THREE_FOUR, 8).unwrap();
        ls
    }

    fn names(ls: &LeadSheet) -> Vec<(String, usize, usize)> {
        ls.sections()
            .iter()
            .map(|s| (s.name.clone(), s.bar, ls.section_size(s.id)))
            .collect()
    }

    #[test]
    fn test_section_queries() {
        let ls = sheet();
        assert_eq!(
            names(&ls),
            vec![("A".into(), 0, 4), ("B".into(), 4, 4), ("C".into(), 8, 4)]
        );
        let b = ls.section_at(4).unwrap().id;
        assert_eq!(ls.previous_section(b).unwrap().name, "A");
        assert_eq!(ls.next_section(b).unwrap().name, "C");
        assert_eq!(ls.section_containing(7).name, "B");
        assert_eq!(ls.section_containing(11).name, "C");
    }

    #[test]
    fn test_add_section_errors() {
        let mut ls = sheet();
        assert_eq!(
            ls.add_section("X", TimeSignature::FOUR_FOUR, 4),
            Err(LeadSheetError::BarOccupied(4))
        );
        assert!(matches!(
            ls.add_section("X", TimeSignature::FOUR_FOUR, 12),
            Err(LeadSheetError::InvalidBar { .. })
        ));
        assert!(matches!(
            ls.add_section("X", TimeSignature::FOUR_FOUR, 0),
            Err(LeadSheetError::InvalidBar { .. })
        ));
    }

    #[test]
    fn test_events_are_wrapped_in_actions() {
        let mut ls = sheet();
        let rec = Arc::new(Recorder::default());
        ls.add_listener(rec.clone());

        ls.add_section("D", TimeSignature::FOUR_FOUR, 10).unwrap();

        let changes = rec.changes.lock().unwrap();
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[0], LeadSheetChange::ActionStarted(LeadSheetAction::AddSection));
        assert!(matches!(&changes[1], LeadSheetChange::ItemsAdded(items) if items.len() == 1));
        assert_eq!(changes[2], LeadSheetChange::ActionCompleted(LeadSheetAction::AddSection));
    }

    #[test]
    fn test_veto_leaves_sheet_unchanged() {
        let mut ls = sheet();
        let rec = Arc::new(Recorder {
            veto_adds: true,
            ..Default::default()
        });
        ls.add_listener(rec.clone());

        let result = ls.add_section("D", TimeSignature::FOUR_FOUR, 10);
        assert!(matches!(result, Err(LeadSheetError::Vetoed(_))));
        assert_eq!(ls.sections().len(), 3);
        assert!(rec.changes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_remove_and_move_section() {
        let mut ls = sheet();
        let init = ls.init_section().id;
        assert_eq!(ls.remove_section(init), Err(LeadSheetError::InitSection));
        assert_eq!(ls.move_section(init, 2), Err(LeadSheetError::InitSection));

        let c = ls.section_at(8).unwrap().id;
        ls.move_section(c, 2).unwrap();
        assert_eq!(
            names(&ls),
            vec![("A".into(), 0, 2), ("C".into(), 2, 2), ("B".into(), 4, 8)]
        );

        let b = ls.section_at(4).unwrap().id;
        ls.remove_section(b).unwrap();
        assert_eq!(names(&ls), vec![("A".into(), 0, 2), ("C".into(), 2, 10)]);
    }

    #[test]
    fn test_insert_bars_in_middle() {
        let mut ls = sheet();
        ls.add_chord(9, "Dm7").unwrap();
        ls.insert_bars(6, 2).unwrap();
        assert_eq!(ls.size(), 14);
        assert_eq!(
            names(&ls),
            vec![("A".into(), 0, 4), ("B".into(), 4, 6), ("C".into(), 10, 4)]
        );
        assert_eq!(ls.chords()[0].bar(), 11);
    }

    #[test]
    fn test_insert_bars_at_start() {
        let mut ls = sheet();
        ls.add_chord(0, "C7").unwrap();
        let rec = Arc::new(Recorder::default());
        ls.add_listener(rec.clone());

        ls.insert_bars(0, 2).unwrap();
        assert_eq!(ls.size(), 14);
        // The initial section keeps its id, its content moved to a new section
        assert_eq!(ls.init_section().id, SectionId::new(0));
        assert_eq!(
            names(&ls),
            vec![("D".into(), 0, 2), ("A".into(), 2, 4), ("B".into(), 6, 4), ("C".into(), 10, 4)]
        );
        assert_eq!(ls.chords()[0].bar(), 2);

        let changes = rec.changes.lock().unwrap();
        assert_eq!(
            changes.first(),
            Some(&LeadSheetChange::ActionStarted(LeadSheetAction::InsertBars { bar: 0, count: 2 }))
        );
        assert!(changes.iter().any(|c| matches!(c, LeadSheetChange::ItemsAdded(_))));
    }

    #[test]
    fn test_delete_bars() {
        let mut ls = sheet();
        ls.add_chord(5, "G7").unwrap();
        ls.add_chord(9, "Cmaj7").unwrap();
        assert!(ls.delete_bars(0, 2).is_err());

        ls.delete_bars(4, 4).unwrap();
        assert_eq!(ls.size(), 8);
        assert_eq!(names(&ls), vec![("A".into(), 0, 4), ("C".into(), 4, 4)]);
        let chords = ls.chords();
        assert_eq!(chords.len(), 1);
        assert_eq!(chords[0].bar(), 5);
    }

    #[test]
    fn test_set_size() {
        let mut ls = sheet();
        ls.add_chord(11, "F").unwrap();
        assert_eq!(ls.set_size(8), Err(LeadSheetError::InvalidSize(8)));
        ls.set_size(10).unwrap();
        assert_eq!(ls.size(), 10);
        assert!(ls.chords().is_empty());
        let c = ls.section_at(8).unwrap().id;
        assert_eq!(ls.section_size(c), 2);
    }
}
