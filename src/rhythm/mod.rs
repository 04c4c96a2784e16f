// Copyright (c) 2026 Robert L. Snyder, Sierra Vista, AZ
// Licensed under the MIT License. See LICENSE file in the project root for details.

//! Rhythm and instrument lookups.
//!
//! This module provides:
//! - Time signatures and rhythm identifiers
//! - Rhythms with their voices and parameters, including adapted variants
//! - The rhythm catalog lookup trait and an in-memory catalog

pub mod catalog;
pub mod instrument;
pub mod voice;

pub use catalog::{InMemoryCatalog, RhythmCatalog};
pub use instrument::{DrumKit, Instrument, InstrumentFamily};
pub use voice::{RhythmVoice, VoiceKind};

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A musical time signature, e.g. 4/4
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeSignature {
    upper: u8,
    lower: u8,
}

impl TimeSignature {
    pub const TWO_FOUR: TimeSignature = TimeSignature { upper: 2, lower: 4 };
    pub const THREE_FOUR: TimeSignature = TimeSignature { upper: 3, lower: 4 };
    pub const FOUR_FOUR: TimeSignature = TimeSignature { upper: 4, lower: 4 };
    pub const FIVE_FOUR: TimeSignature = TimeSignature { upper: 5, lower: 4 };
    pub const SIX_EIGHT: TimeSignature = TimeSignature { upper: 6, lower: 8 };

    /// Create a time signature, None if invalid
    pub fn new(upper: u8, lower: u8) -> Option<Self> {
        if (1..=16).contains(&upper) && matches!(lower, 2 | 4 | 8 | 16) {
            Some(Self { upper, lower })
        } else {
            None
        }
    }

    /// Beats per bar
    pub fn upper(&self) -> u8 {
        self.upper
    }

    /// Beat unit
    pub fn lower(&self) -> u8 {
        self.lower
    }
}

impl Default for TimeSignature {
    fn default() -> Self {
        TimeSignature::FOUR_FOUR
    }
}

impl fmt::Display for TimeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.upper, self.lower)
    }
}

impl FromStr for TimeSignature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (upper, lower) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| format!("Invalid time signature: {}", s))?;
        let upper: u8 = upper
            .trim()
            .parse()
            .map_err(|_| format!("Invalid time signature: {}", s))?;
        let lower: u8 = lower
            .trim()
            .parse()
            .map_err(|_| format!("Invalid time signature: {}", s))?;
        TimeSignature::new(upper, lower).ok_or_else(|| format!("Invalid time signature: {}", s))
    }
}

impl TryFrom<String> for TimeSignature {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeSignature> for String {
    fn from(ts: TimeSignature) -> Self {
        ts.to_string()
    }
}

/// Unique identifier of a rhythm in a catalog
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RhythmId(String);

impl RhythmId {
    /// Create a rhythm id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get id as str
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RhythmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A string-valued rhythm parameter, e.g. "Variation" or "Intensity"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RhythmParameter {
    name: String,
    values: Vec<String>,
    default: String,
}

impl RhythmParameter {
    /// Create a parameter; the default must be one of the values
    pub fn new(name: impl Into<String>, values: &[&str], default: &str) -> Self {
        let values: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        let default = if values.iter().any(|v| v == default) {
            default.to_string()
        } else {
            values.first().cloned().unwrap_or_default()
        };
        Self {
            name: name.into(),
            values,
            default,
        }
    }

    /// Get parameter name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get allowed values
    pub fn values(&self) -> &[String] {
        &self.values
    }

    /// Get default value
    pub fn default_value(&self) -> &str {
        &self.default
    }

    /// Check if a value is allowed
    pub fn accepts(&self, value: &str) -> bool {
        self.values.iter().any(|v| v == value)
    }
}

/// A rhythm: a style producing a fixed set of voices for one time signature
#[derive(Debug, Clone)]
pub struct Rhythm {
    id: RhythmId,
    name: String,
    time_signature: TimeSignature,
    voices: Vec<RhythmVoice>,
    parameters: Vec<RhythmParameter>,
    /// Set when this rhythm is a variant of another rhythm for a different time signature
    source: Option<Arc<Rhythm>>,
    stub: bool,
}

impl Rhythm {
    /// Create a new rhythm without voices
    pub fn new(id: impl Into<String>, name: impl Into<String>, time_signature: TimeSignature) -> Self {
        Self {
            id: RhythmId::new(id),
            name: name.into(),
            time_signature,
            voices: Vec::new(),
            parameters: Vec::new(),
            source: None,
            stub: false,
        }
    }

    /// Create the fallback rhythm used when no real rhythm is available
    pub fn stub(time_signature: TimeSignature) -> Self {
        Self::new(format!("stub-{}", time_signature), "Stub", time_signature)
            .with_voice("Drums", VoiceKind::Drums, Instrument::default_drums(), 9)
            .into_stub()
    }

    fn into_stub(mut self) -> Self {
        self.stub = true;
        self
    }

    /// Create the variant of `source` for another time signature.
    ///
    /// The variant reuses the source voices so that it shares the source's
    /// channels in a mix.
    pub fn adapted(source: &Arc<Rhythm>, time_signature: TimeSignature) -> Self {
        let origin = source.source().cloned().unwrap_or_else(|| source.clone());
        Self {
            id: RhythmId::new(format!("{}@{}", origin.id, time_signature)),
            name: format!("{} [{}]", origin.name, time_signature),
            time_signature,
            voices: origin.voices.clone(),
            parameters: origin.parameters.clone(),
            source: Some(origin),
            stub: false,
        }
    }

    /// Builder: add a voice
    pub fn with_voice(
        mut self,
        name: &str,
        kind: VoiceKind,
        instrument: Instrument,
        preferred_channel: u8,
    ) -> Self {
        let voice = RhythmVoice::new(self.id.clone(), name, kind, instrument, preferred_channel);
        self.voices.push(voice);
        self
    }

    /// Builder: add a parameter
    pub fn with_parameter(mut self, parameter: RhythmParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Get rhythm id
    pub fn id(&self) -> &RhythmId {
        &self.id
    }

    /// Get rhythm name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get time signature
    pub fn time_signature(&self) -> TimeSignature {
        self.time_signature
    }

    /// Get voices
    pub fn voices(&self) -> &[RhythmVoice] {
        &self.voices
    }

    /// Find a voice by name
    pub fn voice(&self, name: &str) -> Option<&RhythmVoice> {
        self.voices.iter().find(|v| v.name() == name)
    }

    /// Get parameters
    pub fn parameters(&self) -> &[RhythmParameter] {
        &self.parameters
    }

    /// Find a parameter by name
    pub fn parameter(&self, name: &str) -> Option<&RhythmParameter> {
        self.parameters.iter().find(|p| p.name() == name)
    }

    /// Source rhythm, set for adapted rhythms
    pub fn source(&self) -> Option<&Arc<Rhythm>> {
        self.source.as_ref()
    }

    /// Id of the rhythm owning the voices (self for non-adapted rhythms)
    pub fn source_id(&self) -> &RhythmId {
        self.source.as_ref().map(|s| &s.id).unwrap_or(&self.id)
    }

    /// Check if this is an adapted rhythm
    pub fn is_adapted(&self) -> bool {
        self.source.is_some()
    }

    /// Check if this is the fallback stub rhythm
    pub fn is_stub(&self) -> bool {
        self.stub
    }
}

impl PartialEq for Rhythm {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Rhythm {}

/// Resolve an adapted rhythm to the rhythm owning its voices
pub fn source_rhythm(rhythm: &Arc<Rhythm>) -> Arc<Rhythm> {
    rhythm.source().cloned().unwrap_or_else(|| rhythm.clone())
}
