// Copyright (c) 2026 Robert L. Snyder, Sierra Vista, AZ
// Licensed under the MIT License. See LICENSE file in the project root for details.

//! Rhythm catalog lookups.
//!
//! The catalog is an external provider: the pipeline only asks it for
//! rhythms by id, for the default rhythm of a time signature, and for
//! adapted variants of a rhythm.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use tracing::debug;

use super::{Instrument, InstrumentFamily, Rhythm, RhythmId, RhythmParameter, TimeSignature, VoiceKind};

/// Lookup provider for rhythms
pub trait RhythmCatalog: Send + Sync {
    /// Find a rhythm by id
    fn rhythm(&self, id: &RhythmId) -> Option<Arc<Rhythm>>;

    /// Default rhythm for a time signature
    fn default_rhythm(&self, ts: TimeSignature) -> Option<Arc<Rhythm>>;

    /// Get or create the variant of `source` for `ts`.
    ///
    /// Returns None when `source` already uses `ts` or can not be adapted.
    fn adapted_rhythm(&self, source: &Arc<Rhythm>, ts: TimeSignature) -> Option<Arc<Rhythm>>;

    /// Fallback rhythm when nothing else is available
    fn stub_rhythm(&self, ts: TimeSignature) -> Arc<Rhythm> {
        Arc::new(Rhythm::stub(ts))
    }
}

/// In-memory rhythm catalog
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    rhythms: RwLock<BTreeMap<RhythmId, Arc<Rhythm>>>,
    defaults: RwLock<HashMap<TimeSignature, RhythmId>>,
    stubs: Mutex<HashMap<TimeSignature, Arc<Rhythm>>>,
}

impl InMemoryCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rhythm; the first rhythm of a time signature becomes its default
    pub fn add(&self, rhythm: Rhythm) -> Arc<Rhythm> {
        let rhythm = Arc::new(rhythm);
        let ts = rhythm.time_signature();
        if !rhythm.is_adapted() {
            let mut defaults = self.defaults.write().expect("catalog lock poisoned");
            defaults.entry(ts).or_insert_with(|| rhythm.id().clone());
        }
        self.rhythms
            .write()
            .expect("catalog lock poisoned")
            .insert(rhythm.id().clone(), rhythm.clone());
        rhythm
    }

    /// Builder: add a rhythm
    pub fn with_rhythm(self, rhythm: Rhythm) -> Self {
        self.add(rhythm);
        self
    }

    /// Set the default rhythm for a time signature
    pub fn set_default(&self, ts: TimeSignature, id: &RhythmId) -> bool {
        let known = self
            .rhythms
            .read()
            .expect("catalog lock poisoned")
            .get(id)
            .is_some_and(|r| r.time_signature() == ts);
        if known {
            self.defaults
                .write()
                .expect("catalog lock poisoned")
                .insert(ts, id.clone());
        }
        known
    }

    /// Number of rhythms, adapted variants included
    pub fn len(&self) -> usize {
        self.rhythms.read().expect("catalog lock poisoned").len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A small catalog with a few jazz rhythms, used by the demo and tests
    pub fn demo() -> Self {
        let variation = || {
            RhythmParameter::new(
                "Variation",
                &["Main A-1", "Main B-1", "Main C-1", "Main D-1"],
                "Main A-1",
            )
        };
        let intensity = || RhythmParameter::new("Intensity", &["-2", "-1", "0", "1", "2"], "0");

        Self::new()
            .with_rhythm(
                Rhythm::new("medium-swing", "Medium Swing", TimeSignature::FOUR_FOUR)
                    .with_voice("Drums", VoiceKind::Drums, Instrument::drum_kit("Jazz Kit", "jazz", "GM", 32), 9)
                    .with_voice("Bass", VoiceKind::Bass, Instrument::new("Acoustic Bass", InstrumentFamily::Bass, 32), 1)
                    .with_voice("Piano", VoiceKind::Chord1, Instrument::new("Acoustic Grand Piano", InstrumentFamily::Piano, 0), 2)
                    .with_voice("Guitar", VoiceKind::Chord2, Instrument::new("Jazz Guitar", InstrumentFamily::Guitar, 26), 3)
                    .with_voice("Strings", VoiceKind::Pad, Instrument::new("String Ensemble 1", InstrumentFamily::Ensemble, 48), 4)
                    .with_parameter(variation())
                    .with_parameter(intensity()),
            )
            .with_rhythm(
                Rhythm::new("jazz-waltz", "Jazz Waltz", TimeSignature::THREE_FOUR)
                    .with_voice("Drums", VoiceKind::Drums, Instrument::drum_kit("Brush Kit", "brush", "GM", 40), 9)
                    .with_voice("Bass", VoiceKind::Bass, Instrument::new("Acoustic Bass", InstrumentFamily::Bass, 32), 1)
                    .with_voice("Piano", VoiceKind::Chord1, Instrument::new("Bright Acoustic Piano", InstrumentFamily::Piano, 1), 2)
                    .with_voice("Vibes", VoiceKind::Chord2, Instrument::new("Vibraphone", InstrumentFamily::ChromaticPercussion, 11), 3)
                    .with_parameter(variation()),
            )
            .with_rhythm(
                Rhythm::new("bossa-nova", "Bossa Nova", TimeSignature::FOUR_FOUR)
                    .with_voice("Drums", VoiceKind::Drums, Instrument::drum_kit("Standard Kit", "standard", "GM", 0), 9)
                    .with_voice("Percussion", VoiceKind::Percussion, Instrument::drum_kit("Standard Kit", "standard", "GM", 0), 8)
                    .with_voice("Bass", VoiceKind::Bass, Instrument::new("Fingered Bass", InstrumentFamily::Bass, 33), 1)
                    .with_voice("Guitar", VoiceKind::Chord1, Instrument::new("Nylon Guitar", InstrumentFamily::Guitar, 24), 2)
                    .with_parameter(variation()),
            )
    }
}

impl RhythmCatalog for InMemoryCatalog {
    fn rhythm(&self, id: &RhythmId) -> Option<Arc<Rhythm>> {
        self.rhythms.read().expect("catalog lock poisoned").get(id).cloned()
    }

    fn default_rhythm(&self, ts: TimeSignature) -> Option<Arc<Rhythm>> {
        let id = self.defaults.read().expect("catalog lock poisoned").get(&ts).cloned()?;
        self.rhythm(&id)
    }

    fn adapted_rhythm(&self, source: &Arc<Rhythm>, ts: TimeSignature) -> Option<Arc<Rhythm>> {
        let origin = super::source_rhythm(source);
        if origin.time_signature() == ts || origin.is_stub() {
            return None;
        }
        let adapted = Rhythm::adapted(&origin, ts);
        let mut rhythms = self.rhythms.write().expect("catalog lock poisoned");
        let entry = rhythms.entry(adapted.id().clone()).or_insert_with(|| {
            debug!(rhythm = %adapted.id(), "Created adapted rhythm");
            Arc::new(adapted)
        });
        Some(entry.clone())
    }

    fn stub_rhythm(&self, ts: TimeSignature) -> Arc<Rhythm> {
        self.stubs
            .lock()
            .expect("catalog lock poisoned")
            .entry(ts)
            .or_insert_with(|| Arc::new(Rhythm::stub(ts)))
            .clone()
    }
}
