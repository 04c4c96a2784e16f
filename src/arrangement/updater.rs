// Copyright (c) 2026 Robert L. Snyder, Sierra Vista, AZ
// Licensed under the MIT License. See LICENSE file in the project root for details.

//! Keeps a song structure in sync with its lead sheet.
//!
//! Each lead sheet change is first checked against the structure's veto
//! listeners, then translated into structure operations once committed.
//! One lead sheet action becomes one structure action.

use std::sync::{Arc, Mutex};

use tracing::{debug, error};

use super::part::{Part, PartId};
use super::structure::SongStructure;
use crate::error::{SgsError, Veto};
use crate::leadsheet::{
    LeadSheet, LeadSheetAction, LeadSheetChange, LeadSheetItem, LeadSheetListener, Section, SectionId,
};

/// Translation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdaterState {
    /// Changes are translated as they come
    Default,
    /// Bars are being inserted at bar 0; translated on completion
    InsertInitBars { count: usize },
}

struct Inner {
    state: UpdaterState,
    /// The action being authorized inserts bars at bar 0
    authorizing_init_insert: bool,
    /// Whether the current lead sheet action opened the structure action
    opened_action: bool,
}

/// Lead sheet listener updating a song structure
pub struct SgsUpdater {
    structure: Arc<SongStructure>,
    inner: Mutex<Inner>,
}

impl SgsUpdater {
    /// Create an updater for `structure`
    pub fn new(structure: Arc<SongStructure>) -> Arc<Self> {
        Arc::new(Self {
            structure,
            inner: Mutex::new(Inner {
                state: UpdaterState::Default,
                authorizing_init_insert: false,
                opened_action: false,
            }),
        })
    }

    /// Create an updater and register it on `lead_sheet`
    pub fn attach(lead_sheet: &mut LeadSheet, structure: Arc<SongStructure>) -> Arc<Self> {
        let updater = Self::new(structure);
        lead_sheet.add_listener(updater.clone());
        updater
    }

    /// Get the structure
    pub fn structure(&self) -> &Arc<SongStructure> {
        &self.structure
    }

    /// Get the translation state
    pub fn state(&self) -> UpdaterState {
        self.inner.lock().expect("updater lock poisoned").state
    }

    fn section_part_ids(&self, section: SectionId) -> Vec<PartId> {
        self.structure
            .parts_for_section(section)
            .iter()
            .map(Part::id)
            .collect()
    }

    /// Bar where parts of a section following `previous` are inserted
    fn insertion_bar(&self, previous: Option<&Section>) -> usize {
        match previous {
            None => 0,
            Some(previous) => self
                .structure
                .parts_for_section(previous.id)
                .last()
                .map(Part::end_bar)
                .unwrap_or_else(|| self.structure.size_in_bars()),
        }
    }

    // ---- authorize ----

    fn check(&self, sheet: &LeadSheet, change: &LeadSheetChange) -> Result<(), SgsError> {
        match change {
            LeadSheetChange::ItemsAdded(items) => {
                let mut parts = Vec::new();
                for section in items.iter().filter_map(LeadSheetItem::as_section) {
                    // The sheet is not changed yet
                    let previous = sheet.section_containing(section.bar);
                    let next_bar = sheet
                        .sections()
                        .iter()
                        .find(|s| s.bar > section.bar)
                        .map(|s| s.bar)
                        .unwrap_or(sheet.size());
                    let bar = self.insertion_bar(Some(previous));
                    let rhythm = self.structure.recommended_rhythm(section.time_signature, bar);
                    parts.push(Part::new(
                        rhythm,
                        bar,
                        next_bar.saturating_sub(section.bar).max(1),
                        section.name.clone(),
                        Some(section.id),
                    ));
                }
                if parts.is_empty() {
                    return Ok(());
                }
                // Later parts are validated at the end of the structure
                let end = self.structure.size_in_bars();
                let parts: Vec<Part> = parts
                    .into_iter()
                    .enumerate()
                    .map(|(i, p)| if i == 0 { p } else { p.with_start_bar(end) })
                    .collect();
                self.structure.authorize_add_parts(&parts)
            }
            LeadSheetChange::ItemsRemoved(items) => {
                let ids: Vec<PartId> = items
                    .iter()
                    .filter_map(LeadSheetItem::as_section)
                    .flat_map(|s| self.section_part_ids(s.id))
                    .collect();
                if ids.is_empty() {
                    return Ok(());
                }
                self.structure.authorize_remove_parts(&ids)
            }
            LeadSheetChange::ItemChanged {
                old: LeadSheetItem::Section(old),
                new: LeadSheetItem::Section(new),
            } if old.time_signature != new.time_signature => {
                let old_parts = self.structure.parts_for_section(old.id);
                let ids: Vec<PartId> = old_parts.iter().map(Part::id).collect();
                let new_parts: Vec<Part> = old_parts
                    .iter()
                    .map(|p| {
                        let rhythm = self
                            .structure
                            .recommended_rhythm(new.time_signature, p.start_bar());
                        p.clone_for_rhythm(rhythm)
                    })
                    .collect();
                if ids.is_empty() {
                    return Ok(());
                }
                self.structure.authorize_replace_parts(&ids, &new_parts)
            }
            LeadSheetChange::ActionStarted(LeadSheetAction::InsertBars { bar: 0, count }) => {
                let ts = sheet.init_section().time_signature;
                let rhythm = self.structure.recommended_rhythm(ts, 0);
                let part = Part::new(rhythm, 0, *count, sheet.init_section().name.clone(), None);
                self.structure.authorize_add_parts(&[part])
            }
            _ => Ok(()),
        }
    }

    // ---- commit ----

    fn apply(&self, sheet: &LeadSheet, change: &LeadSheetChange) -> Result<(), SgsError> {
        match change {
            LeadSheetChange::ItemsAdded(items) => {
                for section in items.iter().filter_map(LeadSheetItem::as_section) {
                    self.section_added(sheet, section)?;
                }
                Ok(())
            }
            LeadSheetChange::ItemsRemoved(items) => {
                for section in items.iter().filter_map(LeadSheetItem::as_section) {
                    self.section_removed(sheet, section)?;
                }
                Ok(())
            }
            LeadSheetChange::ItemChanged {
                old: LeadSheetItem::Section(old),
                new: LeadSheetItem::Section(new),
            } => self.section_changed(old, new),
            LeadSheetChange::ItemChanged { .. } => Ok(()),
            LeadSheetChange::SectionMoved {
                section,
                old_bar,
                new_bar,
            } => self.section_moved(sheet, section, *old_bar, *new_bar),
            LeadSheetChange::ItemsBarShifted { items, .. } => self.bars_shifted(sheet, items),
            LeadSheetChange::SizeChanged { .. } => match sheet.sections().last() {
                Some(last) => self.resize_sections(sheet, &[last.id]),
                None => Ok(()),
            },
            LeadSheetChange::ActionStarted(_) | LeadSheetChange::ActionCompleted(_) => Ok(()),
        }
    }

    fn section_added(&self, sheet: &LeadSheet, section: &Section) -> Result<(), SgsError> {
        let previous = sheet.previous_section(section.id);
        if let Some(previous) = previous {
            self.resize_sections(sheet, &[previous.id])?;
        }
        let bar = self.insertion_bar(previous);
        let rhythm = self.structure.recommended_rhythm(section.time_signature, bar);
        let part = Part::new(
            rhythm,
            bar,
            sheet.section_size(section.id).max(1),
            section.name.clone(),
            Some(section.id),
        );
        debug!(section = %section.id, bar, "adding part for new section");
        self.structure.add_parts(vec![part])
    }

    fn section_removed(&self, sheet: &LeadSheet, section: &Section) -> Result<(), SgsError> {
        let ids = self.section_part_ids(section.id);
        if !ids.is_empty() {
            self.structure.remove_parts(&ids)?;
        }
        let previous = sheet.section_containing(section.bar).id;
        self.resize_sections(sheet, &[previous])
    }

    fn section_changed(&self, old: &Section, new: &Section) -> Result<(), SgsError> {
        if old.time_signature != new.time_signature {
            let old_parts = self.structure.parts_for_section(old.id);
            let ids: Vec<PartId> = old_parts.iter().map(Part::id).collect();
            let new_parts = old_parts
                .iter()
                .map(|p| {
                    let rhythm = self
                        .structure
                        .recommended_rhythm(new.time_signature, p.start_bar());
                    p.clone_for_rhythm(rhythm)
                })
                .collect();
            if !ids.is_empty() {
                self.structure.replace_parts(&ids, new_parts)?;
            }
        }
        if old.name != new.name {
            // Parts renamed by the user keep their name
            let ids: Vec<PartId> = self
                .structure
                .parts_for_section(old.id)
                .iter()
                .filter(|p| p.name() == old.name)
                .map(Part::id)
                .collect();
            if !ids.is_empty() {
                self.structure.set_parts_name(&ids, &new.name)?;
            }
        }
        Ok(())
    }

    fn section_moved(
        &self,
        sheet: &LeadSheet,
        section: &Section,
        old_bar: usize,
        new_bar: usize,
    ) -> Result<(), SgsError> {
        let (low, high) = (old_bar.min(new_bar), old_bar.max(new_bar));
        let crosses = sheet
            .sections()
            .iter()
            .any(|s| s.id != section.id && s.bar > low && s.bar < high);
        let new_previous = match sheet.previous_section(section.id) {
            Some(s) => s.id,
            None => return Ok(()),
        };

        if !crosses {
            return self.resize_sections(sheet, &[section.id, new_previous]);
        }

        let old_previous = sheet.section_containing(old_bar).id;
        let parts = self.structure.parts_for_section(section.id);
        let ids: Vec<PartId> = parts.iter().map(Part::id).collect();
        if !ids.is_empty() {
            self.structure.remove_parts(&ids)?;
            let mut bar = self
                .structure
                .parts_for_section(new_previous)
                .last()
                .map(Part::end_bar)
                .unwrap_or_else(|| self.structure.size_in_bars());
            let moved: Vec<Part> = parts
                .into_iter()
                .map(|p| {
                    let start = bar;
                    bar += p.nb_bars();
                    p.with_start_bar(start)
                })
                .collect();
            self.structure.add_parts(moved)?;
        }
        self.resize_sections(sheet, &[old_previous, new_previous, section.id])
    }

    fn bars_shifted(&self, sheet: &LeadSheet, items: &[LeadSheetItem]) -> Result<(), SgsError> {
        let mut sections = Vec::new();
        let first_shifted = items
            .iter()
            .filter_map(LeadSheetItem::as_section)
            .min_by_key(|s| s.bar);
        if let Some(first) = first_shifted {
            if let Some(previous) = sheet.previous_section(first.id) {
                sections.push(previous.id);
            }
        }
        if let Some(last_bar) = items.iter().map(LeadSheetItem::bar).max() {
            let containing = sheet.section_containing(last_bar.min(sheet.size().saturating_sub(1)));
            sections.push(containing.id);
        }
        self.resize_sections(sheet, &sections)
    }

    /// Fit the parts of each section to its current size in the lead sheet
    fn resize_sections(&self, sheet: &LeadSheet, sections: &[SectionId]) -> Result<(), SgsError> {
        let mut sizes: Vec<(PartId, usize)> = Vec::new();
        for &id in sections {
            if sheet.section(id).is_none() {
                continue;
            }
            let parts = self.structure.parts_for_section(id);
            if parts.is_empty() {
                continue;
            }
            let mut remaining = sheet.section_size(id);
            let count = parts.len();
            for (i, part) in parts.iter().enumerate() {
                let left = count - i - 1;
                let nb_bars = if left == 0 {
                    remaining
                } else {
                    part.nb_bars().min(remaining.saturating_sub(left))
                }
                .max(1);
                remaining = remaining.saturating_sub(nb_bars);
                if !sizes.iter().any(|(p, _)| *p == part.id()) {
                    sizes.push((part.id(), nb_bars));
                }
            }
        }
        if sizes.is_empty() {
            return Ok(());
        }
        self.structure.resize_parts(&sizes)
    }

    /// Complete an insertion of bars at bar 0
    fn finish_init_insert(&self, sheet: &LeadSheet, count: usize) -> Result<(), SgsError> {
        let init = sheet.init_section();
        let second = match sheet.next_section(init.id) {
            Some(s) => s.id,
            None => return Ok(()),
        };
        // The previous init content now belongs to the new second section
        let old_parts = self.structure.parts_for_section(init.id);
        let ids: Vec<PartId> = old_parts.iter().map(Part::id).collect();
        let moved: Vec<Part> = old_parts
            .iter()
            .map(|p| p.clone_for_section(Some(second)))
            .collect();
        if !ids.is_empty() {
            self.structure.replace_parts(&ids, moved)?;
        }

        let rhythm = self.structure.recommended_rhythm(init.time_signature, 0);
        let part = Part::new(rhythm, 0, count, init.name.clone(), Some(init.id));
        self.structure.add_parts(vec![part])
    }
}

fn to_veto(err: SgsError) -> Veto {
    match err {
        SgsError::Vetoed(veto) => veto,
        other => Veto::Rejected(other.to_string()),
    }
}

impl LeadSheetListener for SgsUpdater {
    fn authorize_change(&self, sheet: &LeadSheet, change: &LeadSheetChange) -> Result<(), Veto> {
        if self.structure.is_undo_redo_in_progress() {
            return Ok(());
        }
        {
            let mut inner = self.inner.lock().expect("updater lock poisoned");
            if let LeadSheetChange::ActionStarted(action) = change {
                inner.authorizing_init_insert =
                    matches!(action, LeadSheetAction::InsertBars { bar: 0, .. });
            } else if inner.authorizing_init_insert {
                return Ok(());
            }
        }
        self.check(sheet, change).map_err(to_veto)
    }

    fn lead_sheet_changed(&self, sheet: &LeadSheet, change: &LeadSheetChange) {
        if self.structure.is_undo_redo_in_progress() {
            return;
        }

        match change {
            LeadSheetChange::ActionStarted(action) => {
                let opened = self.structure.begin_action(action.name());
                let mut inner = self.inner.lock().expect("updater lock poisoned");
                inner.opened_action = opened;
                inner.authorizing_init_insert = false;
                if let LeadSheetAction::InsertBars { bar: 0, count } = action {
                    inner.state = UpdaterState::InsertInitBars { count: *count };
                }
                return;
            }
            LeadSheetChange::ActionCompleted(action) => {
                let (state, opened) = {
                    let mut inner = self.inner.lock().expect("updater lock poisoned");
                    let state = inner.state;
                    inner.state = UpdaterState::Default;
                    (state, std::mem::replace(&mut inner.opened_action, false))
                };
                if let UpdaterState::InsertInitBars { count } = state {
                    if let Err(e) = self.finish_init_insert(sheet, count) {
                        error!(error = %e, "failed to update structure after inserting initial bars");
                    }
                }
                if opened {
                    self.structure.end_action(action.name());
                }
                return;
            }
            _ => {}
        }

        if self.state() != UpdaterState::Default {
            return;
        }
        if let Err(e) = self.apply(sheet, change) {
            error!(error = %e, "failed to update structure after authorized lead sheet change");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rhythm::{InMemoryCatalog, TimeSignature};

    fn setup_with_updater() -> (LeadSheet, Arc<SongStructure>, Arc<SgsUpdater>) {
        let mut ls = LeadSheet::new("A", TimeSignature::FOUR_FOUR, 12);
        ls.add_section("B", TimeSignature::FOUR_FOUR, 4).unwrap();
        ls.add_section("C", TimeSignature::THREE_FOUR, 8).unwrap();
        let sgs = SongStructure::from_lead_sheet(&ls, Arc::new(InMemoryCatalog::demo()));
        let updater = SgsUpdater::attach(&mut ls, sgs.clone());
        (ls, sgs, updater)
    }

    fn setup() -> (LeadSheet, Arc<SongStructure>) {
        let (ls, sgs, _) = setup_with_updater();
        (ls, sgs)
    }

    fn layout(sgs: &SongStructure) -> Vec<(String, usize, usize)> {
        sgs.parts()
            .iter()
            .map(|p| (p.name().to_string(), p.start_bar(), p.nb_bars()))
            .collect()
    }

    /// Each section has its part(s) covering exactly its bar range
    fn assert_in_sync(ls: &LeadSheet, sgs: &SongStructure) {
        assert_eq!(sgs.size_in_bars(), ls.size());
        for section in ls.sections() {
            let parts = sgs.parts_for_section(section.id);
            assert!(!parts.is_empty(), "no part for section {}", section.name);
            assert_eq!(parts[0].start_bar(), section.bar);
            let bars: usize = parts.iter().map(Part::nb_bars).sum();
            assert_eq!(bars, ls.section_size(section.id));
        }
    }

    #[test]
    fn test_add_section() {
        let (mut ls, sgs) = setup();
        ls.add_section("D", TimeSignature::FOUR_FOUR, 6).unwrap();
        assert_eq!(
            layout(&sgs),
            vec![
                ("A".into(), 0, 4),
                ("B".into(), 4, 2),
                ("D".into(), 6, 2),
                ("C".into(), 8, 4)
            ]
        );
        assert_in_sync(&ls, &sgs);
    }

    #[test]
    fn test_remove_section() {
        let (mut ls, sgs) = setup();
        let b = ls.section_at(4).unwrap().id;
        ls.remove_section(b).unwrap();
        assert_eq!(layout(&sgs), vec![("A".into(), 0, 8), ("C".into(), 8, 4)]);
        assert_in_sync(&ls, &sgs);
    }

    #[test]
    fn test_delete_section_bars() {
        let (mut ls, sgs) = setup();
        ls.delete_bars(4, 4).unwrap();
        assert_eq!(layout(&sgs), vec![("A".into(), 0, 4), ("C".into(), 4, 4)]);
        assert_eq!(sgs.parts()[1].time_signature(), TimeSignature::THREE_FOUR);
        assert_in_sync(&ls, &sgs);
    }

    #[test]
    fn test_time_signature_change() {
        let (mut ls, sgs) = setup();
        let b = ls.section_at(4).unwrap().id;
        let old_id = sgs.parts_for_section(b)[0].id();
        ls.set_section_time_signature(b, TimeSignature::THREE_FOUR).unwrap();
        let part = &sgs.parts_for_section(b)[0];
        assert_ne!(part.id(), old_id);
        assert_eq!(part.time_signature(), TimeSignature::THREE_FOUR);
        assert_in_sync(&ls, &sgs);
    }

    #[test]
    fn test_rename_keeps_user_names() {
        let (mut ls, sgs) = setup();
        let a = ls.init_section().id;
        let b = ls.section_at(4).unwrap().id;
        let b_part = sgs.parts_for_section(b)[0].id();
        sgs.set_parts_name(&[b_part], "Bridge").unwrap();

        ls.set_section_name(a, "Intro").unwrap();
        ls.set_section_name(b, "Verse").unwrap();
        assert_eq!(sgs.parts_for_section(a)[0].name(), "Intro");
        assert_eq!(sgs.parts_for_section(b)[0].name(), "Bridge");
    }

    #[test]
    fn test_small_move() {
        let (mut ls, sgs) = setup();
        let b = ls.section_at(4).unwrap().id;
        ls.move_section(b, 6).unwrap();
        assert_eq!(
            layout(&sgs),
            vec![("A".into(), 0, 6), ("B".into(), 6, 2), ("C".into(), 8, 4)]
        );
        assert_in_sync(&ls, &sgs);
    }

    #[test]
    fn test_big_move_keeps_parts() {
        let (mut ls, sgs) = setup();
        let c = ls.section_at(8).unwrap().id;
        let c_part = sgs.parts_for_section(c)[0].id();
        ls.move_section(c, 2).unwrap();
        assert_eq!(
            layout(&sgs),
            vec![("A".into(), 0, 2), ("C".into(), 2, 2), ("B".into(), 4, 8)]
        );
        assert_eq!(sgs.parts_for_section(c)[0].id(), c_part);
        assert_in_sync(&ls, &sgs);
    }

    #[test]
    fn test_insert_and_resize_bars() {
        let (mut ls, sgs) = setup();
        ls.insert_bars(6, 2).unwrap();
        assert_eq!(
            layout(&sgs),
            vec![("A".into(), 0, 4), ("B".into(), 4, 6), ("C".into(), 10, 4)]
        );
        assert_in_sync(&ls, &sgs);

        ls.set_size(16).unwrap();
        assert_eq!(sgs.parts().last().unwrap().nb_bars(), 6);
        assert_in_sync(&ls, &sgs);
    }

    #[test]
    fn test_insert_bars_at_start() {
        let (mut ls, sgs, updater) = setup_with_updater();
        let a_part = sgs.parts()[0].clone();
        ls.insert_bars(0, 2).unwrap();
        assert_eq!(updater.state(), UpdaterState::Default);

        let init = ls.init_section().clone();
        let second = ls.section_at(2).unwrap().clone();
        assert_eq!(second.name, "A");
        let init_parts = sgs.parts_for_section(init.id);
        assert_eq!(init_parts.len(), 1);
        assert_eq!(init_parts[0].name(), init.name);
        assert_eq!(init_parts[0].nb_bars(), 2);

        let second_parts = sgs.parts_for_section(second.id);
        assert_eq!(second_parts[0].name(), "A");
        assert_eq!(second_parts[0].rhythm().id(), a_part.rhythm().id());
        assert_in_sync(&ls, &sgs);
    }

    #[test]
    fn test_lead_sheet_action_is_one_undo_step() {
        let (mut ls, sgs) = setup();
        let um = Arc::new(crate::undo::UndoManager::new());
        sgs.set_undo_manager(Some(um.clone()));
        let before = sgs.parts();

        ls.delete_bars(4, 4).unwrap();
        assert!(um.undo());
        assert_eq!(sgs.parts(), before);
        assert!(!um.can_undo());
    }
}
