// Copyright (c) 2026 Robert L. Snyder, Sierra Vista, AZ
// Licensed under the MIT License. See LICENSE file in the project root for details.

//! Error types shared by the synchronization pipeline.
//!
//! Vetoes are plain values returned by listeners; every other variant is
//! raised by the component that detected the problem, before any state
//! was mutated.

use thiserror::Error;

use crate::arrangement::PartId;
use crate::leadsheet::SectionId;

/// Why a listener rejected a pending change
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Veto {
    #[error("not enough MIDI channels: {needed} needed, {available} available")]
    NotEnoughChannels { needed: usize, available: usize },

    #[error("{0}")]
    Rejected(String),
}

/// Errors raised by song structure operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SgsError {
    #[error("change vetoed: {0}")]
    Vetoed(#[from] Veto),

    #[error("unknown part {0}")]
    UnknownPart(PartId),

    #[error("part {0} is already in the structure")]
    DuplicatePart(PartId),

    #[error("invalid insertion bar {bar}, structure has {size} bars")]
    InvalidPosition { bar: usize, size: usize },

    #[error("invalid part size {0}")]
    InvalidSize(usize),

    #[error("rhythm parameter '{parameter}' does not accept '{value}'")]
    InvalidParameter { parameter: String, value: String },
}

/// Errors raised by MIDI mix operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MixError {
    #[error("voice {0} is not used by the song")]
    VoiceNotInSong(String),

    #[error("voice {voice} is already bound to channel {channel}")]
    VoiceAlreadyBound { voice: String, channel: u8 },

    #[error("instrument mix is already bound to channel {channel}")]
    InstrumentMixAlreadyBound { channel: u8 },

    #[error("channel {0} is already used")]
    ChannelInUse(u8),

    #[error("channel {0} is not used")]
    ChannelNotUsed(u8),

    #[error("voice {0} has no channel")]
    UnknownVoice(String),

    #[error("the drums channel can not be rerouted")]
    DrumsChannelReroute,

    #[error("not enough MIDI channels: {needed} needed, {available} available")]
    NotEnoughChannels { needed: usize, available: usize },

    #[error("mix is inconsistent with its song: {0}")]
    Inconsistent(String),
}

impl From<MixError> for Veto {
    fn from(err: MixError) -> Self {
        match err {
            MixError::NotEnoughChannels { needed, available } => {
                Veto::NotEnoughChannels { needed, available }
            }
            other => Veto::Rejected(other.to_string()),
        }
    }
}

/// Errors raised by song-level operations on user phrases
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SongError {
    #[error("change vetoed: {0}")]
    Vetoed(#[from] Veto),

    #[error("user phrase '{0}' already exists")]
    PhraseExists(String),

    #[error("unknown user phrase '{0}'")]
    UnknownPhrase(String),
}

/// Errors raised by lead sheet edits
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LeadSheetError {
    #[error("change vetoed: {0}")]
    Vetoed(#[from] Veto),

    #[error("bar {bar} is out of range, lead sheet has {size} bars")]
    InvalidBar { bar: usize, size: usize },

    #[error("a section already starts at bar {0}")]
    BarOccupied(usize),

    #[error("unknown section {0}")]
    UnknownSection(SectionId),

    #[error("the initial section can not be removed or moved")]
    InitSection,

    #[error("invalid lead sheet size {0}")]
    InvalidSize(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_veto_from_mix_error() {
        let veto: Veto = MixError::NotEnoughChannels { needed: 8, available: 3 }.into();
        assert_eq!(veto, Veto::NotEnoughChannels { needed: 8, available: 3 });

        let veto: Veto = MixError::ChannelInUse(4).into();
        assert_eq!(veto, Veto::Rejected("channel 4 is already used".to_string()));
    }

    #[test]
    fn test_error_messages() {
        let err = SgsError::from(Veto::NotEnoughChannels { needed: 8, available: 2 });
        assert_eq!(
            err.to_string(),
            "change vetoed: not enough MIDI channels: 8 needed, 2 available"
        );
        assert_eq!(
            LeadSheetError::BarOccupied(4).to_string(),
            "a section already starts at bar 4"
        );
    }
}
