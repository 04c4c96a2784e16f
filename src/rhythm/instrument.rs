// Copyright (c) 2026 Robert L. Snyder, Sierra Vista, AZ
// Licensed under the MIT License. See LICENSE file in the project root for details.

//! Instrument references used by rhythm voices and channel mixes.

use serde::{Deserialize, Serialize};

/// Instrument family (General MIDI grouping)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentFamily {
    Piano,
    ChromaticPercussion,
    Organ,
    Guitar,
    Bass,
    Strings,
    Ensemble,
    Brass,
    Reed,
    Pipe,
    SynthLead,
    SynthPad,
    SynthEffects,
    Ethnic,
    Percussive,
    SoundEffects,
    /// Drum kits, only valid on drums voices
    Drums,
}

impl InstrumentFamily {
    /// Short lowercase tag used in matching keys
    pub fn tag(&self) -> &'static str {
        match self {
            InstrumentFamily::Piano => "piano",
            InstrumentFamily::ChromaticPercussion => "chromperc",
            InstrumentFamily::Organ => "organ",
            InstrumentFamily::Guitar => "guitar",
            InstrumentFamily::Bass => "bass",
            InstrumentFamily::Strings => "strings",
            InstrumentFamily::Ensemble => "ensemble",
            InstrumentFamily::Brass => "brass",
            InstrumentFamily::Reed => "reed",
            InstrumentFamily::Pipe => "pipe",
            InstrumentFamily::SynthLead => "synthlead",
            InstrumentFamily::SynthPad => "synthpad",
            InstrumentFamily::SynthEffects => "synthfx",
            InstrumentFamily::Ethnic => "ethnic",
            InstrumentFamily::Percussive => "percussive",
            InstrumentFamily::SoundEffects => "soundfx",
            InstrumentFamily::Drums => "drums",
        }
    }
}

/// Drum kit description
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DrumKit {
    /// Kit type, e.g. "standard", "brush", "jazz"
    pub kit: String,
    /// Key map name, e.g. "GM", "XG"
    pub key_map: String,
}

/// An instrument reference (patch) from an output synth
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instrument {
    /// Patch name as shown to the user
    pub patch_name: String,
    /// Instrument family
    pub family: InstrumentFamily,
    /// Bank select (MSB << 7 | LSB)
    #[serde(default)]
    pub bank: u16,
    /// Program change number (0-127)
    pub program: u8,
    /// Drum kit details, set only for drum kits
    #[serde(default)]
    pub drum_kit: Option<DrumKit>,
}

impl Instrument {
    /// Create a melodic instrument
    pub fn new(patch_name: impl Into<String>, family: InstrumentFamily, program: u8) -> Self {
        Self {
            patch_name: patch_name.into(),
            family,
            bank: 0,
            program: program.min(127),
            drum_kit: None,
        }
    }

    /// Create a drum kit instrument
    pub fn drum_kit(patch_name: impl Into<String>, kit: &str, key_map: &str, program: u8) -> Self {
        Self {
            patch_name: patch_name.into(),
            family: InstrumentFamily::Drums,
            bank: 0,
            program: program.min(127),
            drum_kit: Some(DrumKit {
                kit: kit.to_string(),
                key_map: key_map.to_string(),
            }),
        }
    }

    /// Default instrument for a melodic user channel
    pub fn default_melodic() -> Self {
        Self::new("Acoustic Grand Piano", InstrumentFamily::Piano, 0)
    }

    /// Default instrument for a drums user channel
    pub fn default_drums() -> Self {
        Self::drum_kit("Standard Kit", "standard", "GM", 0)
    }

    /// Builder: set bank
    pub fn with_bank(mut self, bank: u16) -> Self {
        self.bank = bank;
        self
    }

    /// Check if this is a drum kit
    pub fn is_drum_kit(&self) -> bool {
        self.drum_kit.is_some()
    }

    /// Get the drum key map, if any
    pub fn key_map(&self) -> Option<&str> {
        self.drum_kit.as_ref().map(|k| k.key_map.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drum_kit_instrument() {
        let kit = Instrument::drum_kit("Brush Kit", "brush", "XG", 40);
        assert!(kit.is_drum_kit());
        assert_eq!(kit.family, InstrumentFamily::Drums);
        assert_eq!(kit.key_map(), Some("XG"));

        let piano = Instrument::default_melodic();
        assert!(!piano.is_drum_kit());
        assert_eq!(piano.key_map(), None);
    }

    #[test]
    fn test_program_clamped() {
        let ins = Instrument::new("Weird", InstrumentFamily::Organ, 200);
        assert_eq!(ins.program, 127);
    }
}
