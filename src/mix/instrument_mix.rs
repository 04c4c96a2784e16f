// Copyright (c) 2026 Robert L. Snyder, Sierra Vista, AZ
// Licensed under the MIT License. See LICENSE file in the project root for details.

//! Channel payload: an instrument with its performance settings.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::rhythm::Instrument;

static NEXT_MIX_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of an instrument mix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrumentMixId(u64);

impl InstrumentMixId {
    fn next() -> Self {
        InstrumentMixId(NEXT_MIX_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for InstrumentMixId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "M{}", self.0)
    }
}

/// Which settings are sent to the output device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnabledSettings {
    pub instrument: bool,
    pub volume: bool,
    pub pan: bool,
    pub reverb: bool,
    pub chorus: bool,
}

impl EnabledSettings {
    /// Everything enabled
    pub const ALL: EnabledSettings = EnabledSettings {
        instrument: true,
        volume: true,
        pan: true,
        reverb: true,
        chorus: true,
    };

    /// Everything disabled
    pub const NONE: EnabledSettings = EnabledSettings {
        instrument: false,
        volume: false,
        pan: false,
        reverb: false,
        chorus: false,
    };
}

impl Default for EnabledSettings {
    fn default() -> Self {
        Self::ALL
    }
}

/// Performance settings of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentSettings {
    /// Volume (0-127)
    pub volume: u8,
    /// Pan (0-127, 64 = center)
    pub pan: u8,
    /// Reverb send (0-127)
    pub reverb: u8,
    /// Chorus send (0-127)
    pub chorus: u8,
    /// Transposition in semitones
    pub transposition: i8,
    /// Added to note velocities
    pub velocity_shift: i8,
    /// Enabled settings
    pub enabled: EnabledSettings,
}

impl Default for InstrumentSettings {
    fn default() -> Self {
        Self {
            volume: 100,
            pan: 64,
            reverb: 20,
            chorus: 0,
            transposition: 0,
            velocity_shift: 0,
            enabled: EnabledSettings::ALL,
        }
    }
}

/// Instrument and settings bound to one channel
///
/// `Clone` keeps the id; [`InstrumentMix::copy_of`] creates a distinct mix.
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentMix {
    id: InstrumentMixId,
    instrument: Instrument,
    settings: InstrumentSettings,
    mute: bool,
    solo: bool,
}

impl InstrumentMix {
    /// Create a mix with default settings
    pub fn new(instrument: Instrument) -> Self {
        Self {
            id: InstrumentMixId::next(),
            instrument,
            settings: InstrumentSettings::default(),
            mute: false,
            solo: false,
        }
    }

    /// Copy of `other` with a new identity
    pub fn copy_of(other: &InstrumentMix) -> Self {
        Self {
            id: InstrumentMixId::next(),
            ..other.clone()
        }
    }

    /// Builder: set settings
    pub fn with_settings(mut self, settings: InstrumentSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Builder: set mute
    pub fn with_mute(mut self, mute: bool) -> Self {
        self.mute = mute;
        self
    }

    /// Get id
    pub fn id(&self) -> InstrumentMixId {
        self.id
    }

    /// Get instrument
    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    /// Get settings
    pub fn settings(&self) -> &InstrumentSettings {
        &self.settings
    }

    /// Check if muted
    pub fn is_mute(&self) -> bool {
        self.mute
    }

    /// Check if soloed
    pub fn is_solo(&self) -> bool {
        self.solo
    }

    pub(crate) fn set_instrument(&mut self, instrument: Instrument) {
        self.instrument = instrument;
    }

    pub(crate) fn settings_mut(&mut self) -> &mut InstrumentSettings {
        &mut self.settings
    }

    pub(crate) fn set_mute(&mut self, mute: bool) {
        self.mute = mute;
    }

    pub(crate) fn set_solo(&mut self, solo: bool) {
        self.solo = solo;
    }

    /// Take instrument and settings from `other`, keeping identity, mute and solo
    pub(crate) fn take_sound_of(&mut self, other: &InstrumentMix) {
        self.instrument = other.instrument.clone();
        self.settings = other.settings;
    }
}
