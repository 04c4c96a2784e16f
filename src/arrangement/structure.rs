// Copyright (c) 2026 Robert L. Snyder, Sierra Vista, AZ
// Licensed under the MIT License. See LICENSE file in the project root for details.

//! Song structure: the ordered, contiguous list of parts.
//!
//! Every mutating operation follows the same protocol:
//!
//! 1. plan the new part list from the current one
//! 2. ask listeners to veto the proposal (add/remove/replace only)
//! 3. swap in the new list and recompute start bars
//! 4. record an undoable snapshot edit
//! 5. notify listeners
//!
//! Operations are grouped into composite actions. An action belongs to the
//! thread that opened it: other threads wait for it to complete before
//! opening their own. Listeners may read the structure from their callbacks
//! but must not call its mutators.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::thread::{self, ThreadId};

use tracing::{debug, warn};

use super::part::{Part, PartId};
use crate::error::{SgsError, Veto};
use crate::leadsheet::{LeadSheet, SectionId};
use crate::rhythm::{source_rhythm, Rhythm, RhythmCatalog, TimeSignature};
use crate::undo::{Edit, UndoManager};

/// A committed change of the structure
#[derive(Debug, Clone, PartialEq)]
pub enum SgsChange {
    /// Parts inserted
    PartsAdded(Vec<Part>),
    /// Parts removed, as they were before removal
    PartsRemoved(Vec<Part>),
    /// Parts replaced one for one
    PartsReplaced { old: Vec<Part>, new: Vec<Part> },
    /// Parts resized
    PartsResized { old: Vec<Part>, new: Vec<Part> },
    /// Parts renamed
    PartsRenamed { old: Vec<Part>, new: Vec<Part> },
    /// A rhythm parameter value changed
    RhythmParameterChanged { parameter: String, old: Part, new: Part },
    /// A composite action is starting
    ActionStarted(String),
    /// A composite action is complete
    ActionCompleted(String),
}

impl SgsChange {
    /// The change undoing this one
    pub fn inverse(&self) -> SgsChange {
        match self {
            SgsChange::PartsAdded(parts) => SgsChange::PartsRemoved(parts.clone()),
            SgsChange::PartsRemoved(parts) => SgsChange::PartsAdded(parts.clone()),
            SgsChange::PartsReplaced { old, new } => SgsChange::PartsReplaced {
                old: new.clone(),
                new: old.clone(),
            },
            SgsChange::PartsResized { old, new } => SgsChange::PartsResized {
                old: new.clone(),
                new: old.clone(),
            },
            SgsChange::PartsRenamed { old, new } => SgsChange::PartsRenamed {
                old: new.clone(),
                new: old.clone(),
            },
            SgsChange::RhythmParameterChanged { parameter, old, new } => {
                SgsChange::RhythmParameterChanged {
                    parameter: parameter.clone(),
                    old: new.clone(),
                    new: old.clone(),
                }
            }
            SgsChange::ActionStarted(name) => SgsChange::ActionStarted(name.clone()),
            SgsChange::ActionCompleted(name) => SgsChange::ActionCompleted(name.clone()),
        }
    }

    /// Short description
    pub fn name(&self) -> &str {
        match self {
            SgsChange::PartsAdded(_) => "add parts",
            SgsChange::PartsRemoved(_) => "remove parts",
            SgsChange::PartsReplaced { .. } => "replace parts",
            SgsChange::PartsResized { .. } => "resize parts",
            SgsChange::PartsRenamed { .. } => "rename parts",
            SgsChange::RhythmParameterChanged { .. } => "set rhythm parameter",
            SgsChange::ActionStarted(name) | SgsChange::ActionCompleted(name) => name,
        }
    }

    /// Check if the change can modify the set of rhythms in use
    pub fn changes_rhythms(&self) -> bool {
        matches!(
            self,
            SgsChange::PartsAdded(_) | SgsChange::PartsRemoved(_) | SgsChange::PartsReplaced { .. }
        )
    }

    /// Check if the change affects the generated music
    pub fn is_music_change(&self) -> bool {
        !matches!(
            self,
            SgsChange::PartsRenamed { .. } | SgsChange::ActionStarted(_) | SgsChange::ActionCompleted(_)
        )
    }
}

/// A pending change submitted to listeners for approval
#[derive(Debug, Clone)]
pub struct ChangeProposal {
    /// The change that would be committed
    pub change: SgsChange,
    /// The part list after the change
    pub parts_after: Vec<Part>,
}

impl ChangeProposal {
    /// Source rhythms used after the change, in order of first use
    pub fn rhythms_after(&self) -> Vec<Arc<Rhythm>> {
        unique_source_rhythms(&self.parts_after)
    }
}

/// Observer of a song structure
pub trait SgsChangeListener: Send + Sync {
    /// Reject a pending change
    fn authorize_change(&self, _proposal: &ChangeProposal) -> Result<(), Veto> {
        Ok(())
    }

    /// Called after a change is committed
    fn song_structure_changed(&self, structure: &SongStructure, change: &SgsChange);
}

type LastRhythms = HashMap<TimeSignature, Arc<Rhythm>>;

/// Snapshot record undoing and redoing one structure change
pub struct StructureEdit {
    target: Weak<SongStructure>,
    before: Vec<Part>,
    after: Vec<Part>,
    last_before: LastRhythms,
    last_after: LastRhythms,
    change: SgsChange,
}

impl Edit for StructureEdit {
    fn name(&self) -> &str {
        self.change.name()
    }

    fn undo(&self) {
        if let Some(structure) = self.target.upgrade() {
            structure.restore(&self.before, &self.last_before, &self.change.inverse());
        }
    }

    fn redo(&self) {
        if let Some(structure) = self.target.upgrade() {
            structure.restore(&self.after, &self.last_after, &self.change);
        }
    }
}

struct StructureState {
    parts: Vec<Part>,
    /// Most recently used rhythm per time signature
    last_rhythms: LastRhythms,
}

struct OpenAction {
    name: String,
    owner: ThreadId,
    owns_compound: bool,
}

/// The ordered list of parts of a song
pub struct SongStructure {
    me: Weak<SongStructure>,
    catalog: Arc<dyn RhythmCatalog>,
    /// Serializes mutating operations
    op_lock: Mutex<()>,
    state: RwLock<StructureState>,
    listeners: RwLock<Vec<Arc<dyn SgsChangeListener>>>,
    action: Mutex<Option<OpenAction>>,
    action_closed: Condvar,
    undo_manager: RwLock<Option<Arc<UndoManager>>>,
}

impl SongStructure {
    /// Create an empty structure
    pub fn new(catalog: Arc<dyn RhythmCatalog>) -> Arc<Self> {
        Self::with_parts(catalog, Vec::new(), HashMap::new())
    }

    fn with_parts(
        catalog: Arc<dyn RhythmCatalog>,
        mut parts: Vec<Part>,
        last_rhythms: LastRhythms,
    ) -> Arc<Self> {
        layout(&mut parts);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            catalog,
            op_lock: Mutex::new(()),
            state: RwLock::new(StructureState { parts, last_rhythms }),
            listeners: RwLock::new(Vec::new()),
            action: Mutex::new(None),
            action_closed: Condvar::new(),
            undo_manager: RwLock::new(None),
        })
    }

    /// Create a structure with one part per lead sheet section
    pub fn from_lead_sheet(lead_sheet: &LeadSheet, catalog: Arc<dyn RhythmCatalog>) -> Arc<Self> {
        let structure = Self::new(catalog);
        {
            let mut state = structure.state.write().expect("structure state lock poisoned");
            for section in lead_sheet.sections() {
                let rhythm = structure.recommend(&state, section.time_signature, section.bar);
                state.last_rhythms.insert(section.time_signature, rhythm.clone());
                let part = Part::new(
                    rhythm,
                    section.bar,
                    lead_sheet.section_size(section.id),
                    section.name.clone(),
                    Some(section.id),
                );
                state.parts.push(part);
            }
            layout(&mut state.parts);
        }
        structure.ensure_adapted_rhythms();
        structure
    }

    /// Copy with new part ids, without listeners or undo manager
    pub fn deep_copy(&self) -> Arc<Self> {
        let state = self.state.read().expect("structure state lock poisoned");
        let parts = state.parts.iter().map(Part::duplicate).collect();
        Self::with_parts(self.catalog.clone(), parts, state.last_rhythms.clone())
    }

    /// Get the rhythm catalog
    pub fn catalog(&self) -> &Arc<dyn RhythmCatalog> {
        &self.catalog
    }

    /// Install the undo manager receiving edits
    pub fn set_undo_manager(&self, undo_manager: Option<Arc<UndoManager>>) {
        *self.undo_manager.write().expect("undo manager lock poisoned") = undo_manager;
    }

    /// Get the undo manager
    pub fn undo_manager(&self) -> Option<Arc<UndoManager>> {
        self.undo_manager.read().expect("undo manager lock poisoned").clone()
    }

    /// Check if the undo manager is replaying edits
    pub fn is_undo_redo_in_progress(&self) -> bool {
        self.undo_manager()
            .map(|um| um.is_undo_redo_in_progress())
            .unwrap_or(false)
    }

    /// Add a listener
    pub fn add_listener(&self, listener: Arc<dyn SgsChangeListener>) {
        self.listeners.write().expect("listener lock poisoned").push(listener);
    }

    /// Remove a listener
    pub fn remove_listener(&self, listener: &Arc<dyn SgsChangeListener>) {
        self.listeners
            .write()
            .expect("listener lock poisoned")
            .retain(|l| Arc::as_ptr(l) as *const () != Arc::as_ptr(listener) as *const ());
    }

    // ---- queries ----

    /// Get a snapshot of the parts
    pub fn parts(&self) -> Vec<Part> {
        self.state.read().expect("structure state lock poisoned").parts.clone()
    }

    /// Get number of parts
    pub fn len(&self) -> usize {
        self.state.read().expect("structure state lock poisoned").parts.len()
    }

    /// Check if there are no parts
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get a part by id
    pub fn part(&self, id: PartId) -> Option<Part> {
        let state = self.state.read().expect("structure state lock poisoned");
        state.parts.iter().find(|p| p.id() == id).cloned()
    }

    /// Get the part covering `bar`
    pub fn part_at_bar(&self, bar: usize) -> Option<Part> {
        let state = self.state.read().expect("structure state lock poisoned");
        state
            .parts
            .iter()
            .find(|p| p.start_bar() <= bar && bar < p.end_bar())
            .cloned()
    }

    /// Get total size in bars
    pub fn size_in_bars(&self) -> usize {
        let state = self.state.read().expect("structure state lock poisoned");
        state.parts.last().map(Part::end_bar).unwrap_or(0)
    }

    /// Get the parts created from a lead sheet section
    pub fn parts_for_section(&self, section: SectionId) -> Vec<Part> {
        let state = self.state.read().expect("structure state lock poisoned");
        state
            .parts
            .iter()
            .filter(|p| p.parent_section() == Some(section))
            .cloned()
            .collect()
    }

    /// Get the rhythms used, in order of first use.
    ///
    /// With `exclude_adapted`, adapted rhythms are reported as their source.
    pub fn unique_rhythms(&self, exclude_adapted: bool) -> Vec<Arc<Rhythm>> {
        let state = self.state.read().expect("structure state lock poisoned");
        if exclude_adapted {
            return unique_source_rhythms(&state.parts);
        }
        let mut seen = HashSet::new();
        state
            .parts
            .iter()
            .filter(|p| seen.insert(p.rhythm().id().clone()))
            .map(|p| p.rhythm().clone())
            .collect()
    }

    /// Get the time signatures used
    pub fn time_signatures(&self) -> Vec<TimeSignature> {
        let state = self.state.read().expect("structure state lock poisoned");
        let mut result: Vec<TimeSignature> = Vec::new();
        for part in &state.parts {
            if !result.contains(&part.time_signature()) {
                result.push(part.time_signature());
            }
        }
        result
    }

    /// Get the source rhythm covering the most bars
    pub fn dominant_rhythm(&self) -> Option<Arc<Rhythm>> {
        let state = self.state.read().expect("structure state lock poisoned");
        dominant_source_rhythm(&state.parts)
    }

    /// Get the rhythm to use for a new part with `ts` starting at `bar`
    pub fn recommended_rhythm(&self, ts: TimeSignature, bar: usize) -> Arc<Rhythm> {
        let state = self.state.read().expect("structure state lock poisoned");
        self.recommend(&state, ts, bar)
    }

    fn recommend(&self, state: &StructureState, ts: TimeSignature, bar: usize) -> Arc<Rhythm> {
        if let Some(rhythm) = state.last_rhythms.get(&ts) {
            return rhythm.clone();
        }

        let previous = if bar == 0 {
            None
        } else {
            state
                .parts
                .iter()
                .rev()
                .find(|p| p.start_bar() < bar)
        };
        if let Some(previous) = previous {
            let source = source_rhythm(previous.rhythm());
            if source.time_signature() == ts {
                return source;
            }
            if let Some(adapted) = self.catalog.adapted_rhythm(&source, ts) {
                return adapted;
            }
        }

        if let Some(rhythm) = self.catalog.default_rhythm(ts) {
            return rhythm;
        }
        warn!(time_signature = %ts, "no rhythm available, using stub");
        self.catalog.stub_rhythm(ts)
    }

    // ---- composite actions ----

    /// Open a composite action.
    ///
    /// Returns false if the calling thread already has one open. Blocks while
    /// an action of another thread is open.
    pub fn begin_action(&self, name: &str) -> bool {
        let me = thread::current().id();
        {
            let mut action = self.action.lock().expect("action lock poisoned");
            loop {
                match action.as_ref() {
                    Some(open) if open.owner == me => return false,
                    Some(_) => {
                        action = self
                            .action_closed
                            .wait(action)
                            .expect("action lock poisoned");
                    }
                    None => break,
                }
            }
            let owns_compound = self
                .undo_manager()
                .map(|um| um.begin_compound(name))
                .unwrap_or(false);
            *action = Some(OpenAction {
                name: name.to_string(),
                owner: me,
                owns_compound,
            });
        }
        self.notify(&SgsChange::ActionStarted(name.to_string()));
        true
    }

    /// Close the composite action opened with `name` by the calling thread
    pub fn end_action(&self, name: &str) {
        let me = thread::current().id();
        let owns_compound = {
            let action = self.action.lock().expect("action lock poisoned");
            match action.as_ref() {
                Some(open) if open.name == name && open.owner == me => open.owns_compound,
                Some(open) => {
                    warn!(open = %open.name, closing = name, "mismatched action end ignored");
                    return;
                }
                None => return,
            }
        };
        // Listener reactions to the completion land in the same undo step
        self.notify(&SgsChange::ActionCompleted(name.to_string()));
        if owns_compound {
            if let Some(um) = self.undo_manager() {
                um.end_compound();
            }
        }
        self.action.lock().expect("action lock poisoned").take();
        self.action_closed.notify_all();
    }

    /// Get the name of the open action
    pub fn current_action(&self) -> Option<String> {
        self.action
            .lock()
            .expect("action lock poisoned")
            .as_ref()
            .map(|a| a.name.clone())
    }

    /// Run `f` inside one composite action
    pub fn in_action<T>(&self, name: &str, f: impl FnOnce(&Self) -> T) -> T {
        let opened = self.begin_action(name);
        let result = f(self);
        if opened {
            self.end_action(name);
        }
        result
    }

    // ---- veto only ----

    /// Check that listeners accept adding `parts`
    pub fn authorize_add_parts(&self, parts: &[Part]) -> Result<(), SgsError> {
        let before = self.parts();
        let proposal = plan_add(&before, parts)?;
        self.authorize(&proposal)
    }

    /// Check that listeners accept removing the parts
    pub fn authorize_remove_parts(&self, ids: &[PartId]) -> Result<(), SgsError> {
        let before = self.parts();
        let proposal = plan_remove(&before, ids)?;
        self.authorize(&proposal)
    }

    /// Check that listeners accept the replacement
    pub fn authorize_replace_parts(&self, old: &[PartId], new: &[Part]) -> Result<(), SgsError> {
        let before = self.parts();
        let proposal = plan_replace(&before, old, new)?;
        self.authorize(&proposal)
    }

    // ---- mutations ----

    /// Insert parts at their start bar.
    ///
    /// A start bar must be the start of an existing part (the new part goes
    /// before it) or the end of the structure.
    pub fn add_parts(&self, parts: Vec<Part>) -> Result<(), SgsError> {
        self.execute("addParts", true, |before| plan_add(before, &parts).map(Some))
    }

    /// Remove parts
    pub fn remove_parts(&self, ids: &[PartId]) -> Result<(), SgsError> {
        self.execute("removeParts", true, |before| plan_remove(before, ids).map(Some))
    }

    /// Replace each part of `old` with the part at the same index of `new`
    pub fn replace_parts(&self, old: &[PartId], new: Vec<Part>) -> Result<(), SgsError> {
        self.execute("replaceParts", true, |before| plan_replace(before, old, &new).map(Some))
    }

    /// Change part sizes; unchanged sizes are skipped
    pub fn resize_parts(&self, sizes: &[(PartId, usize)]) -> Result<(), SgsError> {
        self.execute("resizeParts", false, |before| {
            let mut after = before.to_vec();
            let mut old = Vec::new();
            for &(id, nb_bars) in sizes {
                if nb_bars == 0 {
                    return Err(SgsError::InvalidSize(nb_bars));
                }
                let part = find_mut(&mut after, id)?;
                if part.nb_bars() != nb_bars {
                    old.push(part.clone());
                    part.set_nb_bars(nb_bars);
                }
            }
            if old.is_empty() {
                return Ok(None);
            }
            layout(&mut after);
            let new = current_of(&old, &after);
            Ok(Some(ChangeProposal {
                change: SgsChange::PartsResized { old, new },
                parts_after: after,
            }))
        })
    }

    /// Rename parts; parts already named `name` are skipped
    pub fn set_parts_name(&self, ids: &[PartId], name: &str) -> Result<(), SgsError> {
        self.execute("setPartsName", false, |before| {
            let mut after = before.to_vec();
            let mut old = Vec::new();
            for &id in ids {
                let part = find_mut(&mut after, id)?;
                if part.name() != name {
                    old.push(part.clone());
                    part.set_name(name);
                }
            }
            if old.is_empty() {
                return Ok(None);
            }
            let new = current_of(&old, &after);
            Ok(Some(ChangeProposal {
                change: SgsChange::PartsRenamed { old, new },
                parts_after: after,
            }))
        })
    }

    /// Set a rhythm parameter value of a part
    pub fn set_rhythm_parameter_value(&self, id: PartId, parameter: &str, value: &str) -> Result<(), SgsError> {
        self.execute("setRhythmParameterValue", false, |before| {
            let mut after = before.to_vec();
            let part = find_mut(&mut after, id)?;
            let accepted = part
                .rhythm()
                .parameter(parameter)
                .map(|p| p.accepts(value))
                .unwrap_or(false);
            if !accepted {
                return Err(SgsError::InvalidParameter {
                    parameter: parameter.to_string(),
                    value: value.to_string(),
                });
            }
            if part.param_value(parameter) == Some(value) {
                return Ok(None);
            }
            let old = part.clone();
            part.set_param_value(parameter, value);
            let new = part.clone();
            Ok(Some(ChangeProposal {
                change: SgsChange::RhythmParameterChanged {
                    parameter: parameter.to_string(),
                    old,
                    new,
                },
                parts_after: after,
            }))
        })
    }

    fn execute<F>(&self, action: &str, vetoable: bool, plan: F) -> Result<(), SgsError>
    where
        F: FnOnce(&[Part]) -> Result<Option<ChangeProposal>, SgsError>,
    {
        let opened = self.begin_action(action);
        let result = self.execute_locked(vetoable, plan);
        if opened {
            self.end_action(action);
        }
        result
    }

    fn execute_locked<F>(&self, vetoable: bool, plan: F) -> Result<(), SgsError>
    where
        F: FnOnce(&[Part]) -> Result<Option<ChangeProposal>, SgsError>,
    {
        let _guard = self.op_lock.lock().expect("structure operation lock poisoned");
        let (before, last_before) = {
            let state = self.state.read().expect("structure state lock poisoned");
            (state.parts.clone(), state.last_rhythms.clone())
        };
        let proposal = match plan(&before)? {
            Some(proposal) => proposal,
            None => return Ok(()),
        };
        if vetoable {
            self.authorize(&proposal)?;
        }

        let ChangeProposal { change, parts_after } = proposal;
        assert_contiguous(&parts_after);
        let last_after = {
            let mut state = self.state.write().expect("structure state lock poisoned");
            state.parts = parts_after.clone();
            if let SgsChange::PartsAdded(new) | SgsChange::PartsReplaced { new, .. } = &change {
                for part in new {
                    state.last_rhythms.insert(part.time_signature(), part.rhythm().clone());
                }
            }
            state.last_rhythms.clone()
        };
        debug!(change = change.name(), parts = parts_after.len(), "structure changed");

        if let Some(um) = self.undo_manager() {
            um.push(Box::new(StructureEdit {
                target: self.me.clone(),
                before,
                after: parts_after,
                last_before,
                last_after,
                change: change.clone(),
            }));
        }

        self.notify(&change);

        if change.changes_rhythms() {
            self.ensure_adapted_rhythms();
        }
        Ok(())
    }

    fn authorize(&self, proposal: &ChangeProposal) -> Result<(), SgsError> {
        for listener in self.listener_snapshot() {
            listener.authorize_change(proposal)?;
        }
        Ok(())
    }

    fn listener_snapshot(&self) -> Vec<Arc<dyn SgsChangeListener>> {
        self.listeners.read().expect("listener lock poisoned").clone()
    }

    fn notify(&self, change: &SgsChange) {
        for listener in self.listener_snapshot() {
            listener.song_structure_changed(self, change);
        }
    }

    /// Swap in a snapshot while undoing or redoing
    fn restore(&self, parts: &[Part], last_rhythms: &LastRhythms, change: &SgsChange) {
        {
            let _guard = self.op_lock.lock().expect("structure operation lock poisoned");
            let mut state = self.state.write().expect("structure state lock poisoned");
            state.parts = parts.to_vec();
            state.last_rhythms = last_rhythms.clone();
        }
        self.notify(change);
    }

    /// Make sure each rhythm in use has a variant for every time signature in use
    fn ensure_adapted_rhythms(&self) {
        let rhythms = self.unique_rhythms(true);
        let signatures = self.time_signatures();
        for rhythm in &rhythms {
            for ts in &signatures {
                if *ts != rhythm.time_signature() && !rhythm.is_stub() {
                    self.catalog.adapted_rhythm(rhythm, *ts);
                }
            }
        }
    }
}

fn layout(parts: &mut [Part]) {
    let mut bar = 0;
    for part in parts.iter_mut() {
        part.set_start_bar(bar);
        bar += part.nb_bars();
    }
}

fn assert_contiguous(parts: &[Part]) {
    let mut bar = 0;
    for part in parts {
        assert_eq!(part.start_bar(), bar, "part list is not contiguous at {}", part.id());
        assert!(part.nb_bars() >= 1, "empty part {}", part.id());
        bar = part.end_bar();
    }
}

fn find_mut(parts: &mut [Part], id: PartId) -> Result<&mut Part, SgsError> {
    parts
        .iter_mut()
        .find(|p| p.id() == id)
        .ok_or(SgsError::UnknownPart(id))
}

/// The versions in `after` of the parts in `old`
fn current_of(old: &[Part], after: &[Part]) -> Vec<Part> {
    old.iter()
        .filter_map(|o| after.iter().find(|p| p.id() == o.id()).cloned())
        .collect()
}

fn plan_add(before: &[Part], parts: &[Part]) -> Result<ChangeProposal, SgsError> {
    let mut after = before.to_vec();
    for part in parts {
        if part.nb_bars() == 0 {
            return Err(SgsError::InvalidSize(0));
        }
        if after.iter().any(|p| p.id() == part.id()) {
            return Err(SgsError::DuplicatePart(part.id()));
        }
        let end = after.last().map(Part::end_bar).unwrap_or(0);
        let index = if part.start_bar() == end {
            after.len()
        } else {
            after
                .iter()
                .position(|p| p.start_bar() == part.start_bar())
                .ok_or(SgsError::InvalidPosition {
                    bar: part.start_bar(),
                    size: end,
                })?
        };
        after.insert(index, part.clone());
        layout(&mut after);
    }
    let added = current_of(parts, &after);
    Ok(ChangeProposal {
        change: SgsChange::PartsAdded(added),
        parts_after: after,
    })
}

fn plan_remove(before: &[Part], ids: &[PartId]) -> Result<ChangeProposal, SgsError> {
    let mut removed = Vec::new();
    for &id in ids {
        let part = before
            .iter()
            .find(|p| p.id() == id)
            .ok_or(SgsError::UnknownPart(id))?;
        removed.push(part.clone());
    }
    let mut after: Vec<Part> = before
        .iter()
        .filter(|p| !ids.contains(&p.id()))
        .cloned()
        .collect();
    layout(&mut after);
    Ok(ChangeProposal {
        change: SgsChange::PartsRemoved(removed),
        parts_after: after,
    })
}

fn plan_replace(before: &[Part], old: &[PartId], new: &[Part]) -> Result<ChangeProposal, SgsError> {
    assert_eq!(old.len(), new.len(), "replacement lists differ in length");
    let mut after = before.to_vec();
    let mut replaced = Vec::new();
    for (&id, part) in old.iter().zip(new) {
        if part.nb_bars() == 0 {
            return Err(SgsError::InvalidSize(0));
        }
        if part.id() != id && after.iter().any(|p| p.id() == part.id()) {
            return Err(SgsError::DuplicatePart(part.id()));
        }
        let slot = find_mut(&mut after, id)?;
        replaced.push(slot.clone());
        *slot = part.clone();
    }
    layout(&mut after);
    let new = current_of(new, &after);
    Ok(ChangeProposal {
        change: SgsChange::PartsReplaced { old: replaced, new },
        parts_after: after,
    })
}

fn unique_source_rhythms(parts: &[Part]) -> Vec<Arc<Rhythm>> {
    let mut seen = HashSet::new();
    parts
        .iter()
        .map(|p| source_rhythm(p.rhythm()))
        .filter(|r| seen.insert(r.id().clone()))
        .collect()
}

/// Source rhythm covering the most bars, first used wins ties
pub(crate) fn dominant_source_rhythm(parts: &[Part]) -> Option<Arc<Rhythm>> {
    let rhythms = unique_source_rhythms(parts);
    let bars = |r: &Arc<Rhythm>| -> usize {
        parts
            .iter()
            .filter(|p| p.rhythm().source_id() == r.id())
            .map(Part::nb_bars)
            .sum()
    };
    let mut best: Option<(Arc<Rhythm>, usize)> = None;
    for rhythm in rhythms {
        let count = bars(&rhythm);
        if best.as_ref().map(|(_, c)| count > *c).unwrap_or(true) {
            best = Some((rhythm, count));
        }
    }
    best.map(|(r, _)| r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rhythm::InMemoryCatalog;

    #[derive(Default)]
    struct Recorder {
        changes: Mutex<Vec<SgsChange>>,
        veto: bool,
    }

    impl SgsChangeListener for Recorder {
        fn authorize_change(&self, _proposal: &ChangeProposal) -> Result<(), Veto> {
            if self.veto {
                return Err(Veto::Rejected("vetoed".to_string()));
            }
            Ok(())
        }

        fn song_structure_changed(&self, _structure: &SongStructure, change: &SgsChange) {
            self.changes.lock().unwrap().push(change.clone());
        }
    }

    fn catalog() -> Arc<InMemoryCatalog> {
        Arc::new(InMemoryCatalog::demo())
    }

    fn structure() -> Arc<SongStructure> {
        let catalog = catalog();
        let sgs = SongStructure::new(catalog.clone());
        let swing = sgs.recommended_rhythm(TimeSignature::FOUR_FOUR, 0);
        sgs.add_parts(vec![
            Part::new(swing.clone(), 0, 4, "A", None),
            Part::new(swing.clone(), 4, 4, "B", None),
            Part::new(swing, 8, 4, "C", None),
        ])
        .unwrap();
        sgs
    }

    fn bars(sgs: &SongStructure) -> Vec<(usize, usize)> {
        sgs.parts().iter().map(|p| (p.start_bar(), p.nb_bars())).collect()
    }

    #[test]
    fn test_add_parts_layout() {
        let sgs = structure();
        assert_eq!(bars(&sgs), vec![(0, 4), (4, 4), (8, 4)]);
        assert_eq!(sgs.size_in_bars(), 12);

        // Insert before B
        let rhythm = sgs.recommended_rhythm(TimeSignature::FOUR_FOUR, 4);
        sgs.add_parts(vec![Part::new(rhythm, 4, 2, "X", None)]).unwrap();
        let names: Vec<String> = sgs.parts().iter().map(|p| p.name().to_string()).collect();
        assert_eq!(names, vec!["A", "X", "B", "C"]);
        assert_eq!(bars(&sgs), vec![(0, 4), (4, 2), (6, 4), (10, 4)]);
    }

    #[test]
    fn test_add_parts_invalid_position() {
        let sgs = structure();
        let rhythm = sgs.recommended_rhythm(TimeSignature::FOUR_FOUR, 0);
        let result = sgs.add_parts(vec![Part::new(rhythm.clone(), 5, 2, "X", None)]);
        assert_eq!(result, Err(SgsError::InvalidPosition { bar: 5, size: 12 }));
        let result = sgs.add_parts(vec![Part::new(rhythm, 12, 0, "X", None)]);
        assert_eq!(result, Err(SgsError::InvalidSize(0)));
        assert_eq!(sgs.len(), 3);
    }

    #[test]
    fn test_remove_and_resize() {
        let sgs = structure();
        let parts = sgs.parts();
        sgs.remove_parts(&[parts[1].id()]).unwrap();
        assert_eq!(bars(&sgs), vec![(0, 4), (4, 4)]);

        sgs.resize_parts(&[(parts[0].id(), 8)]).unwrap();
        assert_eq!(bars(&sgs), vec![(0, 8), (8, 4)]);

        let unknown = parts[1].id();
        assert_eq!(sgs.remove_parts(&[unknown]), Err(SgsError::UnknownPart(unknown)));
    }

    #[test]
    fn test_veto_precedes_mutation() {
        let sgs = structure();
        let before = sgs.parts();
        let rec = Arc::new(Recorder {
            veto: true,
            ..Default::default()
        });
        sgs.add_listener(rec.clone());

        let result = sgs.remove_parts(&[before[0].id()]);
        assert!(matches!(result, Err(SgsError::Vetoed(_))));
        assert_eq!(sgs.parts(), before);
        // Resize has no veto phase
        sgs.resize_parts(&[(before[0].id(), 2)]).unwrap();
        assert_eq!(sgs.parts()[0].nb_bars(), 2);
    }

    #[test]
    fn test_action_events_and_coalescing() {
        let sgs = structure();
        let rec = Arc::new(Recorder::default());
        sgs.add_listener(rec.clone());
        let parts = sgs.parts();

        sgs.in_action("edit", |s| {
            s.set_parts_name(&[parts[0].id()], "Intro").unwrap();
            s.resize_parts(&[(parts[0].id(), 2)]).unwrap();
        });

        let changes = rec.changes.lock().unwrap();
        assert_eq!(changes.len(), 4);
        assert_eq!(changes[0], SgsChange::ActionStarted("edit".to_string()));
        assert!(matches!(changes[1], SgsChange::PartsRenamed { .. }));
        assert!(matches!(changes[2], SgsChange::PartsResized { .. }));
        assert_eq!(changes[3], SgsChange::ActionCompleted("edit".to_string()));
    }

    #[test]
    fn test_no_op_changes() {
        let sgs = structure();
        let rec = Arc::new(Recorder::default());
        sgs.add_listener(rec.clone());
        let parts = sgs.parts();

        sgs.set_parts_name(&[parts[0].id()], "A").unwrap();
        sgs.resize_parts(&[(parts[0].id(), 4)]).unwrap();
        let changes = rec.changes.lock().unwrap();
        assert!(changes
            .iter()
            .all(|c| matches!(c, SgsChange::ActionStarted(_) | SgsChange::ActionCompleted(_))));
    }

    #[test]
    fn test_rhythm_parameter() {
        let sgs = structure();
        let id = sgs.parts()[0].id();
        sgs.set_rhythm_parameter_value(id, "Variation", "Main B-1").unwrap();
        assert_eq!(sgs.part(id).unwrap().param_value("Variation"), Some("Main B-1"));

        let result = sgs.set_rhythm_parameter_value(id, "Variation", "Z");
        assert!(matches!(result, Err(SgsError::InvalidParameter { .. })));
        let result = sgs.set_rhythm_parameter_value(id, "Nope", "A");
        assert!(matches!(result, Err(SgsError::InvalidParameter { .. })));
    }

    #[test]
    fn test_undo_redo_round_trip() {
        let sgs = structure();
        let um = Arc::new(UndoManager::new());
        sgs.set_undo_manager(Some(um.clone()));
        let before = sgs.parts();

        let waltz = sgs.recommended_rhythm(TimeSignature::THREE_FOUR, 4);
        let replacement = before[1].clone_for_rhythm(waltz);
        sgs.replace_parts(&[before[1].id()], vec![replacement]).unwrap();
        let after = sgs.parts();
        assert_ne!(after, before);

        assert!(um.undo());
        assert_eq!(sgs.parts(), before);
        assert!(um.redo());
        assert_eq!(sgs.parts(), after);
    }

    fn assert_undo_redo(sgs: &SongStructure, um: &UndoManager, before: &[Part]) {
        let after = sgs.parts();
        assert_ne!(after, before);
        assert!(um.undo());
        assert_eq!(sgs.parts(), before);
        assert!(um.redo());
        assert_eq!(sgs.parts(), after);
    }

    fn with_undo() -> (Arc<SongStructure>, Arc<UndoManager>) {
        let sgs = structure();
        let um = Arc::new(UndoManager::new());
        sgs.set_undo_manager(Some(um.clone()));
        (sgs, um)
    }

    #[test]
    fn test_undo_redo_each_operation() {
        let (sgs, um) = with_undo();
        let before = sgs.parts();
        let rhythm = sgs.recommended_rhythm(TimeSignature::FOUR_FOUR, 4);
        sgs.add_parts(vec![Part::new(rhythm, 4, 2, "X", None)]).unwrap();
        assert_undo_redo(&sgs, &um, &before);

        let before = sgs.parts();
        sgs.remove_parts(&[before[0].id(), before[2].id()]).unwrap();
        assert_undo_redo(&sgs, &um, &before);

        let before = sgs.parts();
        sgs.resize_parts(&[(before[0].id(), 7)]).unwrap();
        assert_undo_redo(&sgs, &um, &before);

        let before = sgs.parts();
        sgs.set_parts_name(&[before[1].id()], "Bridge").unwrap();
        assert_undo_redo(&sgs, &um, &before);

        let before = sgs.parts();
        sgs.set_rhythm_parameter_value(before[0].id(), "Variation", "Main B-1")
            .unwrap();
        assert_undo_redo(&sgs, &um, &before);
    }

    #[test]
    fn test_undo_restores_recommended_rhythm() {
        let (sgs, um) = with_undo();
        let parts = sgs.parts();
        let adapted = sgs.recommended_rhythm(TimeSignature::THREE_FOUR, 8);
        assert!(adapted.is_adapted());

        let waltz = sgs.catalog().rhythm(&crate::rhythm::RhythmId::new("jazz-waltz")).unwrap();
        sgs.replace_parts(&[parts[2].id()], vec![parts[2].clone_for_rhythm(waltz.clone())])
            .unwrap();
        assert_eq!(sgs.recommended_rhythm(TimeSignature::THREE_FOUR, 0).id(), waltz.id());

        assert!(um.undo());
        assert_eq!(sgs.recommended_rhythm(TimeSignature::THREE_FOUR, 8).id(), adapted.id());
        assert!(um.redo());
        assert_eq!(sgs.recommended_rhythm(TimeSignature::THREE_FOUR, 0).id(), waltz.id());
    }

    #[test]
    fn test_concurrent_callers_do_not_share_actions() {
        let sgs = structure();
        let rec = Arc::new(Recorder::default());
        sgs.add_listener(rec.clone());
        let parts = sgs.parts();
        let bossa = sgs.catalog().rhythm(&crate::rhythm::RhythmId::new("bossa-nova")).unwrap();
        let (opened_tx, opened_rx) = std::sync::mpsc::channel();

        let worker = {
            let sgs = sgs.clone();
            std::thread::spawn(move || {
                opened_rx.recv().unwrap();
                sgs.add_parts(vec![Part::new(bossa, 0, 4, "D", None)]).unwrap();
            })
        };
        sgs.in_action("edit", |s| {
            opened_tx.send(()).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(50));
            s.resize_parts(&[(parts[0].id(), 2)]).unwrap();
        });
        worker.join().unwrap();

        let changes = rec.changes.lock().unwrap();
        let names: Vec<&str> = changes.iter().map(|c| c.name()).collect();
        assert_eq!(
            names,
            vec!["edit", "resize parts", "edit", "addParts", "add parts", "addParts"]
        );
        assert_eq!(sgs.len(), 4);
        assert!(sgs.current_action().is_none());
    }

    #[test]
    fn test_recommended_rhythm() {
        let sgs = structure();
        let swing = sgs.parts()[0].rhythm().clone();
        assert_eq!(sgs.recommended_rhythm(TimeSignature::FOUR_FOUR, 12).id(), swing.id());

        // No 3/4 part yet: adapted variant of the previous part's rhythm
        let waltz = sgs.recommended_rhythm(TimeSignature::THREE_FOUR, 8);
        assert!(waltz.is_adapted());
        assert_eq!(waltz.source_id(), swing.id());

        // Unknown signature with no previous part falls back to the stub
        let empty = SongStructure::new(catalog());
        assert!(empty.recommended_rhythm(TimeSignature::FIVE_FOUR, 0).is_stub());
    }

    #[test]
    fn test_unique_rhythms_and_dominant() {
        let sgs = structure();
        let parts = sgs.parts();
        let waltz = sgs.catalog().rhythm(&crate::rhythm::RhythmId::new("jazz-waltz")).unwrap();
        sgs.replace_parts(&[parts[2].id()], vec![parts[2].clone_for_rhythm(waltz.clone())])
            .unwrap();
        let swing = parts[0].rhythm().clone();
        assert_eq!(sgs.unique_rhythms(true).len(), 2);
        assert_eq!(sgs.dominant_rhythm().unwrap().id(), swing.id());
    }

    #[test]
    fn test_deep_copy() {
        let sgs = structure();
        let copy = sgs.deep_copy();
        assert_eq!(bars(&copy), bars(&sgs));
        assert_ne!(copy.parts()[0].id(), sgs.parts()[0].id());
        assert!(copy.undo_manager().is_none());
    }

    #[test]
    fn test_from_lead_sheet() {
        let mut ls = LeadSheet::new("A", TimeSignature::FOUR_FOUR, 12);
        ls.add_section("B", TimeSignature::FOUR_FOUR, 4).unwrap();
        ls.add_section("C", TimeSignature::THREE_FOUR, 8).unwrap();
        let sgs = SongStructure::from_lead_sheet(&ls, catalog());
        assert_eq!(bars(&sgs), vec![(0, 4), (4, 4), (8, 4)]);
        let parts = sgs.parts();
        assert_eq!(parts[2].time_signature(), TimeSignature::THREE_FOUR);
        assert_eq!(parts[1].parent_section(), Some(ls.sections()[1].id));
    }
}
