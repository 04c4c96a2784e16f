// Copyright (c) 2026 Robert L. Snyder, Sierra Vista, AZ
// Licensed under the MIT License. See LICENSE file in the project root for details.

//! Rhythm voices: the musical lines a rhythm produces.

use serde::{Deserialize, Serialize};

use super::instrument::Instrument;
use super::RhythmId;

/// The role of a voice within its rhythm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceKind {
    Drums,
    Percussion,
    Bass,
    Chord1,
    Chord2,
    Chord3,
    Chord4,
    Pad,
    Phrase1,
    Phrase2,
}

impl VoiceKind {
    /// Whether voices of this kind play a drum kit
    pub fn is_drums(&self) -> bool {
        matches!(self, VoiceKind::Drums | VoiceKind::Percussion)
    }
}

/// One voice of a rhythm
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RhythmVoice {
    /// Owning (source) rhythm
    rhythm: RhythmId,
    /// Voice name, unique within the rhythm
    name: String,
    /// Voice role
    kind: VoiceKind,
    /// Instrument used when the rhythm gets a fresh channel
    preferred_instrument: Instrument,
    /// Channel used when the rhythm gets a fresh mix (0-15)
    preferred_channel: u8,
}

impl RhythmVoice {
    /// Create a new voice
    pub fn new(
        rhythm: RhythmId,
        name: impl Into<String>,
        kind: VoiceKind,
        preferred_instrument: Instrument,
        preferred_channel: u8,
    ) -> Self {
        Self {
            rhythm,
            name: name.into(),
            kind,
            preferred_instrument,
            preferred_channel: preferred_channel.min(15),
        }
    }

    /// Get owning rhythm id
    pub fn rhythm(&self) -> &RhythmId {
        &self.rhythm
    }

    /// Get voice name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get voice kind
    pub fn kind(&self) -> VoiceKind {
        self.kind
    }

    /// Get preferred instrument
    pub fn preferred_instrument(&self) -> &Instrument {
        &self.preferred_instrument
    }

    /// Get preferred channel
    pub fn preferred_channel(&self) -> u8 {
        self.preferred_channel
    }

    /// Whether this voice plays a drum kit
    pub fn is_drums(&self) -> bool {
        self.kind.is_drums()
    }
}
