// Copyright (c) 2026 Robert L. Snyder, Sierra Vista, AZ
// Licensed under the MIT License. See LICENSE file in the project root for details.

//! Songs: a song structure plus the user phrases played on their own channels.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use tracing::debug;

use crate::arrangement::{SgsUpdater, SongStructure};
use crate::error::{SongError, Veto};
use crate::leadsheet::LeadSheet;
use crate::rhythm::RhythmCatalog;
use crate::undo::{Edit, UndoManager};

static NEXT_SONG_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a song, used as cache key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SongId(u64);

impl SongId {
    fn next() -> Self {
        SongId(NEXT_SONG_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get raw value
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SongId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "song-{}", self.0)
    }
}

/// A note of a user phrase
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhraseNote {
    /// MIDI pitch
    pub pitch: u8,
    /// MIDI velocity
    pub velocity: u8,
    /// Start in beats
    pub position: f32,
    /// Duration in beats
    pub duration: f32,
}

/// A phrase recorded or written by the user
#[derive(Debug, Clone, PartialEq)]
pub struct UserPhrase {
    name: String,
    drums: bool,
    notes: Vec<PhraseNote>,
}

impl UserPhrase {
    /// Create an empty phrase
    pub fn new(name: impl Into<String>, drums: bool) -> Self {
        Self {
            name: name.into(),
            drums,
            notes: Vec::new(),
        }
    }

    /// Builder: add a note
    pub fn with_note(mut self, pitch: u8, velocity: u8, position: f32, duration: f32) -> Self {
        self.notes.push(PhraseNote {
            pitch,
            velocity,
            position,
            duration,
        });
        self
    }

    /// Get name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if played by a drum kit
    pub fn is_drums(&self) -> bool {
        self.drums
    }

    /// Get notes
    pub fn notes(&self) -> &[PhraseNote] {
        &self.notes
    }

    /// Get length in beats
    pub fn length(&self) -> f32 {
        self.notes
            .iter()
            .map(|n| n.position + n.duration)
            .fold(0.0, f32::max)
    }
}

/// A change of the user phrase set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhraseChange {
    /// Phrase added
    Added { name: String, drums: bool },
    /// Phrase removed
    Removed { name: String, drums: bool },
    /// Phrase renamed
    Renamed { old: String, new: String },
}

impl PhraseChange {
    /// The change undoing this one
    pub fn inverse(&self) -> PhraseChange {
        match self {
            PhraseChange::Added { name, drums } => PhraseChange::Removed {
                name: name.clone(),
                drums: *drums,
            },
            PhraseChange::Removed { name, drums } => PhraseChange::Added {
                name: name.clone(),
                drums: *drums,
            },
            PhraseChange::Renamed { old, new } => PhraseChange::Renamed {
                old: new.clone(),
                new: old.clone(),
            },
        }
    }

    fn name(&self) -> &'static str {
        match self {
            PhraseChange::Added { .. } => "addUserPhrase",
            PhraseChange::Removed { .. } => "removeUserPhrase",
            PhraseChange::Renamed { .. } => "renameUserPhrase",
        }
    }
}

/// Observer of the user phrase set
pub trait PhraseListener: Send + Sync {
    /// Reject a pending change
    fn authorize_phrase_change(&self, _song: &Song, _change: &PhraseChange) -> Result<(), Veto> {
        Ok(())
    }

    /// Called after a change is committed
    fn phrase_changed(&self, song: &Song, change: &PhraseChange);
}

struct PhraseEdit {
    target: Weak<Song>,
    before: BTreeMap<String, UserPhrase>,
    after: BTreeMap<String, UserPhrase>,
    change: PhraseChange,
}

impl Edit for PhraseEdit {
    fn name(&self) -> &str {
        self.change.name()
    }

    fn undo(&self) {
        if let Some(song) = self.target.upgrade() {
            song.restore_phrases(&self.before, &self.change.inverse());
        }
    }

    fn redo(&self) {
        if let Some(song) = self.target.upgrade() {
            song.restore_phrases(&self.after, &self.change);
        }
    }
}

/// A song arrangement
pub struct Song {
    me: Weak<Song>,
    id: SongId,
    name: RwLock<String>,
    structure: Arc<SongStructure>,
    phrases: RwLock<BTreeMap<String, UserPhrase>>,
    listeners: RwLock<Vec<Arc<dyn PhraseListener>>>,
    undo_manager: Arc<UndoManager>,
    /// Where the mix of this song is saved
    mix_file: RwLock<Option<PathBuf>>,
    /// Keeps the structure in sync with the lead sheet
    updater: Option<Arc<SgsUpdater>>,
}

impl Song {
    /// Create a song owning `structure`
    pub fn new(name: impl Into<String>, structure: Arc<SongStructure>) -> Arc<Self> {
        Self::build(name.into(), structure, None)
    }

    /// Create a song from a lead sheet; later lead sheet edits update the structure
    pub fn from_lead_sheet(
        name: impl Into<String>,
        lead_sheet: &mut LeadSheet,
        catalog: Arc<dyn RhythmCatalog>,
    ) -> Arc<Self> {
        let structure = SongStructure::from_lead_sheet(lead_sheet, catalog);
        let updater = SgsUpdater::attach(lead_sheet, structure.clone());
        Self::build(name.into(), structure, Some(updater))
    }

    fn build(name: String, structure: Arc<SongStructure>, updater: Option<Arc<SgsUpdater>>) -> Arc<Self> {
        let undo_manager = Arc::new(UndoManager::new());
        structure.set_undo_manager(Some(undo_manager.clone()));
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            id: SongId::next(),
            name: RwLock::new(name),
            structure,
            phrases: RwLock::new(BTreeMap::new()),
            listeners: RwLock::new(Vec::new()),
            undo_manager,
            mix_file: RwLock::new(None),
            updater,
        })
    }

    /// Get id
    pub fn id(&self) -> SongId {
        self.id
    }

    /// Get name
    pub fn name(&self) -> String {
        self.name.read().expect("song lock poisoned").clone()
    }

    /// Set name
    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write().expect("song lock poisoned") = name.into();
    }

    /// Get the song structure
    pub fn structure(&self) -> &Arc<SongStructure> {
        &self.structure
    }

    /// Get the lead sheet updater, set for songs created from a lead sheet
    pub fn updater(&self) -> Option<&Arc<SgsUpdater>> {
        self.updater.as_ref()
    }

    /// Get the undo manager shared by the song, its structure and its mix
    pub fn undo_manager(&self) -> &Arc<UndoManager> {
        &self.undo_manager
    }

    /// Get the mix file path
    pub fn mix_file(&self) -> Option<PathBuf> {
        self.mix_file.read().expect("song lock poisoned").clone()
    }

    /// Set the mix file path
    pub fn set_mix_file(&self, path: Option<&Path>) {
        *self.mix_file.write().expect("song lock poisoned") = path.map(Path::to_path_buf);
    }

    /// Get size in bars
    pub fn size_in_bars(&self) -> usize {
        self.structure.size_in_bars()
    }

    /// Undo the last step
    pub fn undo(&self) -> bool {
        self.undo_manager.undo()
    }

    /// Redo the last undone step
    pub fn redo(&self) -> bool {
        self.undo_manager.redo()
    }

    /// Add a phrase listener
    pub fn add_phrase_listener(&self, listener: Arc<dyn PhraseListener>) {
        self.listeners.write().expect("song lock poisoned").push(listener);
    }

    /// Remove a phrase listener
    pub fn remove_phrase_listener(&self, listener: &Arc<dyn PhraseListener>) {
        self.listeners
            .write()
            .expect("song lock poisoned")
            .retain(|l| Arc::as_ptr(l) as *const () != Arc::as_ptr(listener) as *const ());
    }

    // ---- user phrases ----

    /// Get user phrase names
    pub fn phrase_names(&self) -> Vec<String> {
        self.phrases.read().expect("song lock poisoned").keys().cloned().collect()
    }

    /// Get a user phrase
    pub fn user_phrase(&self, name: &str) -> Option<UserPhrase> {
        self.phrases.read().expect("song lock poisoned").get(name).cloned()
    }

    /// Get all user phrases
    pub fn user_phrases(&self) -> Vec<UserPhrase> {
        self.phrases.read().expect("song lock poisoned").values().cloned().collect()
    }

    /// Add a user phrase; listeners may veto
    pub fn add_user_phrase(&self, phrase: UserPhrase) -> Result<(), SongError> {
        let mut after = self.phrases.read().expect("song lock poisoned").clone();
        if after.contains_key(phrase.name()) {
            return Err(SongError::PhraseExists(phrase.name().to_string()));
        }
        let change = PhraseChange::Added {
            name: phrase.name().to_string(),
            drums: phrase.is_drums(),
        };
        after.insert(phrase.name().to_string(), phrase);
        self.perform(change, after, true)
    }

    /// Remove a user phrase; listeners may veto
    pub fn remove_user_phrase(&self, name: &str) -> Result<(), SongError> {
        let mut after = self.phrases.read().expect("song lock poisoned").clone();
        let removed = after
            .remove(name)
            .ok_or_else(|| SongError::UnknownPhrase(name.to_string()))?;
        let change = PhraseChange::Removed {
            name: name.to_string(),
            drums: removed.is_drums(),
        };
        self.perform(change, after, true)
    }

    /// Rename a user phrase; listeners may veto
    pub fn rename_user_phrase(&self, old: &str, new: &str) -> Result<(), SongError> {
        if old == new {
            return Ok(());
        }
        let mut after = self.phrases.read().expect("song lock poisoned").clone();
        if after.contains_key(new) {
            return Err(SongError::PhraseExists(new.to_string()));
        }
        let mut phrase = after
            .remove(old)
            .ok_or_else(|| SongError::UnknownPhrase(old.to_string()))?;
        phrase.name = new.to_string();
        after.insert(new.to_string(), phrase);
        let change = PhraseChange::Renamed {
            old: old.to_string(),
            new: new.to_string(),
        };
        self.perform(change, after, true)
    }

    /// Add an empty phrase without asking listeners.
    ///
    /// Repairs a mix channel left without its phrase.
    pub fn insert_empty_phrase(&self, name: &str, drums: bool) -> Result<(), SongError> {
        let mut after = self.phrases.read().expect("song lock poisoned").clone();
        if after.contains_key(name) {
            return Err(SongError::PhraseExists(name.to_string()));
        }
        after.insert(name.to_string(), UserPhrase::new(name, drums));
        let change = PhraseChange::Added {
            name: name.to_string(),
            drums,
        };
        self.perform(change, after, false)
    }

    fn perform(
        &self,
        change: PhraseChange,
        after: BTreeMap<String, UserPhrase>,
        vetoable: bool,
    ) -> Result<(), SongError> {
        if vetoable {
            for listener in self.listener_snapshot() {
                listener.authorize_phrase_change(self, &change)?;
            }
        }

        let opened = self.undo_manager.begin_compound(change.name());
        let before = std::mem::replace(
            &mut *self.phrases.write().expect("song lock poisoned"),
            after.clone(),
        );
        debug!(song = %self.id, ?change, "user phrases changed");
        self.undo_manager.push(Box::new(PhraseEdit {
            target: self.me.clone(),
            before,
            after,
            change: change.clone(),
        }));
        self.notify(&change);
        if opened {
            self.undo_manager.end_compound();
        }
        Ok(())
    }

    fn listener_snapshot(&self) -> Vec<Arc<dyn PhraseListener>> {
        self.listeners.read().expect("song lock poisoned").clone()
    }

    fn notify(&self, change: &PhraseChange) {
        for listener in self.listener_snapshot() {
            listener.phrase_changed(self, change);
        }
    }

    fn restore_phrases(&self, phrases: &BTreeMap<String, UserPhrase>, change: &PhraseChange) {
        *self.phrases.write().expect("song lock poisoned") = phrases.clone();
        self.notify(change);
    }
}
