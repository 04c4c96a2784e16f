// Copyright (c) 2026 Robert L. Snyder, Sierra Vista, AZ
// Licensed under the MIT License. See LICENSE file in the project root for details.

//! MIDI mix: the 16-channel table binding voices to instrument mixes.
//!
//! This module provides:
//! - InstrumentMix: Per-channel instrument and performance settings
//! - MidiMix: The channel table with solo/mute and drums rerouting
//! - Import and adaptation heuristics between mixes
//! - MixFile: The persisted layout
//! - MidiMixManager: Per-song mix cache

pub mod file;
pub mod import;
pub mod instrument_mix;
pub mod manager;
pub mod midi_mix;

use std::fmt;

pub use file::{MixEntry, MixFile, VoiceKey};
pub use import::MatchPolicy;
pub use instrument_mix::{EnabledSettings, InstrumentMix, InstrumentMixId, InstrumentSettings};
pub use manager::{MidiMixManager, RhythmMixLibrary, RhythmMixProvider};
pub use midi_mix::{MidiMix, MixEdit};

use crate::rhythm::{Instrument, RhythmId, RhythmVoice, VoiceKind};

/// Number of MIDI channels
pub const NB_CHANNELS: usize = 16;

/// The channel reserved for drums
pub const DRUMS_CHANNEL: u8 = 9;

/// A voice owned by the song rather than a rhythm
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserVoice {
    /// Name of the user phrase
    pub name: String,
    /// Played by a drum kit
    pub drums: bool,
}

/// A musical line bound to a channel
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Voice {
    /// A voice of a rhythm
    Rhythm(RhythmVoice),
    /// A user phrase
    User(UserVoice),
}

impl Voice {
    /// Create a user voice
    pub fn user(name: impl Into<String>, drums: bool) -> Self {
        Voice::User(UserVoice {
            name: name.into(),
            drums,
        })
    }

    /// Get name
    pub fn name(&self) -> &str {
        match self {
            Voice::Rhythm(v) => v.name(),
            Voice::User(u) => &u.name,
        }
    }

    /// Check if played by a drum kit
    pub fn is_drums(&self) -> bool {
        match self {
            Voice::Rhythm(v) => v.is_drums(),
            Voice::User(u) => u.drums,
        }
    }

    /// Check if this is a user voice
    pub fn is_user(&self) -> bool {
        matches!(self, Voice::User(_))
    }

    /// Get the owning rhythm id
    pub fn rhythm_id(&self) -> Option<&RhythmId> {
        match self {
            Voice::Rhythm(v) => Some(v.rhythm()),
            Voice::User(_) => None,
        }
    }

    /// Get the voice kind of a rhythm voice
    pub fn kind(&self) -> Option<VoiceKind> {
        match self {
            Voice::Rhythm(v) => Some(v.kind()),
            Voice::User(_) => None,
        }
    }

    /// Instrument used for a fresh channel
    pub fn preferred_instrument(&self) -> Instrument {
        match self {
            Voice::Rhythm(v) => v.preferred_instrument().clone(),
            Voice::User(u) if u.drums => Instrument::default_drums(),
            Voice::User(_) => Instrument::default_melodic(),
        }
    }
}

impl fmt::Display for Voice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Voice::Rhythm(v) => write!(f, "{}/{}", v.rhythm(), v.name()),
            Voice::User(u) => write!(f, "user/{}", u.name),
        }
    }
}

/// A change of a mix
#[derive(Debug, Clone, PartialEq)]
pub enum MixChange {
    /// A channel got a new binding or was released
    ChannelBound {
        channel: u8,
        old: Option<Voice>,
        new: Option<Voice>,
    },
    /// A binding moved to another channel
    ChannelSwapped { voice: Voice, from: u8, to: u8 },
    /// Mute changed
    Mute { channel: u8, mute: bool },
    /// Solo changed
    Solo { channel: u8, solo: bool },
    /// Transposition changed
    Transposition { channel: u8, value: i8 },
    /// Velocity shift changed
    VelocityShift { channel: u8, value: i8 },
    /// Volume, pan or effect settings changed
    Settings { channel: u8 },
    /// Instrument changed
    Instrument { channel: u8 },
    /// The key map of a drums channel changed
    DrumKeyMap { channel: u8 },
    /// Drums rerouting changed
    DrumsRerouted { channel: u8, rerouted: bool },
    /// A user voice was renamed
    VoiceRenamed { channel: u8, old: String, new: String },
    /// Modified vs saved state changed
    Modified(bool),
}

impl MixChange {
    /// Check if the generated music must be regenerated
    pub fn is_music_change(&self) -> bool {
        matches!(
            self,
            MixChange::ChannelBound { .. }
                | MixChange::ChannelSwapped { .. }
                | MixChange::Transposition { .. }
                | MixChange::VelocityShift { .. }
                | MixChange::DrumKeyMap { .. }
                | MixChange::DrumsRerouted { .. }
        )
    }
}

/// Observer of a mix
pub trait MidiMixListener: Send + Sync {
    /// Called after each change
    fn mix_changed(&self, mix: &MidiMix, change: &MixChange);
}
