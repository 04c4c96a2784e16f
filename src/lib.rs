// Copyright (c) 2026 Robert L. Snyder, Sierra Vista, AZ
// Licensed under the MIT License. See LICENSE file in the project root for details.

//! Song structure and MIDI mix synchronization.
//!
//! A song's part timeline follows its lead sheet sections, and its 16-channel
//! MIDI mix follows the rhythms and user phrases the song uses. Every edit
//! either completes with all views consistent or is rejected before any
//! state changes.

pub mod arrangement;
pub mod config;
pub mod error;
pub mod leadsheet;
pub mod mix;
pub mod rhythm;
pub mod song;
pub mod undo;

pub use arrangement::{Part, PartId, SgsChange, SgsChangeListener, SgsUpdater, SongStructure};
pub use config::Settings;
pub use error::{LeadSheetError, MixError, SgsError, SongError, Veto};
pub use leadsheet::{LeadSheet, Section, SectionId};
pub use mix::{InstrumentMix, MidiMix, MidiMixManager, MixChange, Voice};
pub use rhythm::{InMemoryCatalog, Rhythm, RhythmCatalog, RhythmId, TimeSignature};
pub use song::{Song, SongId, UserPhrase};
pub use undo::{Edit, UndoManager};
