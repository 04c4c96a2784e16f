// Copyright (c) 2026 Robert L. Snyder, Sierra Vista, AZ
// Licensed under the MIT License. See LICENSE file in the project root for details.

//! Persisted mix layout.
//!
//! A mix file lists the bound channels with enough information to find the
//! voices back in a rhythm catalog. Missing rhythms are replaced by the
//! catalog's default rhythm for the same time signature.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{InstrumentMix, InstrumentSettings, MidiMix, Voice, NB_CHANNELS};
use crate::rhythm::{Instrument, Rhythm, RhythmCatalog, RhythmId, TimeSignature, VoiceKind};

/// Rhythm id used for user melodic voices
pub const USER_MELODIC: &str = "#user-melodic";

/// Rhythm id used for user drums voices
pub const USER_DRUMS: &str = "#user-drums";

/// Identifies a voice independently of any loaded rhythm
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceKey {
    /// Rhythm id, or a user sentinel
    pub rhythm: String,
    /// Time signature of the rhythm
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_signature: Option<TimeSignature>,
    /// Voice name, or phrase name for user voices
    pub voice: String,
    /// Voice kind, used when the name is not found
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<VoiceKind>,
}

impl VoiceKey {
    /// Build the key of a voice
    pub fn of(voice: &Voice, time_signature: Option<TimeSignature>) -> Self {
        match voice {
            Voice::Rhythm(rv) => Self {
                rhythm: rv.rhythm().to_string(),
                time_signature,
                voice: rv.name().to_string(),
                kind: Some(rv.kind()),
            },
            Voice::User(user) => Self {
                rhythm: if user.drums { USER_DRUMS } else { USER_MELODIC }.to_string(),
                time_signature: None,
                voice: user.name.clone(),
                kind: None,
            },
        }
    }

    /// Check if this is a user voice
    pub fn is_user(&self) -> bool {
        self.rhythm == USER_MELODIC || self.rhythm == USER_DRUMS
    }
}

/// One bound channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixEntry {
    /// MIDI channel, 0-15
    pub channel: u8,
    /// The bound voice
    pub key: VoiceKey,
    /// Instrument of the channel
    pub instrument: Instrument,
    /// Volume, pan, effects and performance settings
    #[serde(default)]
    pub settings: InstrumentSettings,
    #[serde(default)]
    pub mute: bool,
}

/// A mix as saved on disk
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MixFile {
    #[serde(default)]
    pub channels: Vec<MixEntry>,
}

impl MixFile {
    /// Load a mix file from YAML
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read mix file: {:?}", path.as_ref()))?;
        Self::from_yaml(&contents)
    }

    /// Parse a mix file from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse mix file")
    }

    /// Serialize to YAML string
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize mix to YAML")
    }

    /// Save to a YAML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = self.to_yaml()?;
        fs::write(path.as_ref(), yaml)
            .with_context(|| format!("Failed to write mix file: {:?}", path.as_ref()))
    }
}

/// Rhythm ids already reported as missing
fn reported_missing() -> &'static Mutex<HashSet<String>> {
    static REPORTED: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    REPORTED.get_or_init(|| Mutex::new(HashSet::new()))
}

fn resolve_rhythm(catalog: &dyn RhythmCatalog, key: &VoiceKey) -> Arc<Rhythm> {
    if let Some(rhythm) = catalog.rhythm(&RhythmId::new(key.rhythm.as_str())) {
        return rhythm;
    }
    let ts = key.time_signature.unwrap_or_default();
    let substitute = catalog
        .default_rhythm(ts)
        .unwrap_or_else(|| catalog.stub_rhythm(ts));
    let first_report = reported_missing()
        .lock()
        .expect("missing rhythm lock poisoned")
        .insert(key.rhythm.clone());
    if first_report {
        warn!(rhythm = %key.rhythm, substitute = %substitute.id(), "Rhythm not found, using substitute");
    }
    substitute
}

fn resolve_voice(rhythm: &Rhythm, key: &VoiceKey, taken: &[Voice]) -> Option<Voice> {
    let free = |v: &&crate::rhythm::RhythmVoice| !taken.contains(&Voice::Rhythm((*v).clone()));
    rhythm
        .voice(&key.voice)
        .filter(free)
        .or_else(|| {
            rhythm
                .voices()
                .iter()
                .filter(free)
                .find(|v| Some(v.kind()) == key.kind)
        })
        .map(|v| Voice::Rhythm(v.clone()))
}

impl MidiMix {
    /// Get the persisted layout.
    ///
    /// Channels are saved as they are without solo and drums rerouting: the
    /// mutes and enabled settings saved are the ones these would restore.
    pub fn to_file(&self) -> MixFile {
        let rhythm_ts = |voice: &Voice| -> Option<TimeSignature> {
            self.song().and_then(|song| {
                let id = voice.rhythm_id()?;
                song.structure()
                    .unique_rhythms(true)
                    .into_iter()
                    .find(|r| r.id() == id)
                    .map(|r| r.time_signature())
            })
        };
        let channels = self
            .channels_at_rest()
            .into_iter()
            .map(|(channel, voice, mix)| MixEntry {
                channel,
                key: VoiceKey::of(&voice, rhythm_ts(&voice)),
                instrument: mix.instrument().clone(),
                settings: *mix.settings(),
                mute: mix.is_mute(),
            })
            .collect();
        MixFile { channels }
    }

    /// Rebuild a mix from its persisted layout.
    ///
    /// Solo and drums rerouting are not restored. Entries whose channel or
    /// voice is already bound are skipped.
    pub fn from_file(file: &MixFile, catalog: &dyn RhythmCatalog) -> Result<Arc<MidiMix>> {
        let mix = MidiMix::new();
        let mut taken: Vec<Voice> = Vec::new();
        let mut used = HashSet::new();
        for entry in &file.channels {
            if entry.channel as usize >= NB_CHANNELS {
                bail!("Invalid channel {} in mix file", entry.channel);
            }
            if !used.insert(entry.channel) {
                warn!(channel = entry.channel, voice = %entry.key.voice, "Channel already bound, entry skipped");
                continue;
            }
            let voice = if entry.key.is_user() {
                Voice::user(entry.key.voice.as_str(), entry.key.rhythm == USER_DRUMS)
            } else {
                let rhythm = resolve_rhythm(catalog, &entry.key);
                match resolve_voice(&rhythm, &entry.key, &taken) {
                    Some(voice) => voice,
                    None => {
                        warn!(channel = entry.channel, voice = %entry.key.voice, "No matching voice, channel skipped");
                        continue;
                    }
                }
            };
            if taken.contains(&voice) {
                warn!(channel = entry.channel, %voice, "Voice already bound, channel skipped");
                continue;
            }
            let instrument_mix = InstrumentMix::new(entry.instrument.clone())
                .with_settings(entry.settings)
                .with_mute(entry.mute);
            mix.assign(entry.channel, voice.clone(), instrument_mix)
                .with_context(|| format!("Failed to restore channel {}", entry.channel))?;
            taken.push(voice);
        }
        mix.mark_saved();
        debug!(channels = taken.len(), "Mix loaded");
        Ok(mix)
    }

    /// Save to a YAML mix file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.to_file().save(path)?;
        self.mark_saved();
        Ok(())
    }

    /// Load a YAML mix file
    pub fn load<P: AsRef<Path>>(path: P, catalog: &dyn RhythmCatalog) -> Result<Arc<MidiMix>> {
        let file = MixFile::load(path)?;
        Self::from_file(&file, catalog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rhythm::InMemoryCatalog;

    fn swing_mix(catalog: &InMemoryCatalog) -> Arc<MidiMix> {
        let swing = catalog.rhythm(&RhythmId::new("medium-swing")).unwrap();
        MidiMix::for_rhythm(&swing)
    }

    #[test]
    fn test_parse_mix_file() {
        let yaml = r##"
channels:
  - channel: 1
    key:
      rhythm: medium-swing
      time_signature: 4/4
      voice: Bass
      kind: bass
    instrument:
      patch_name: Fretless Bass
      family: bass
      program: 35
    settings:
      volume: 90
      transposition: -12
    mute: true
  - channel: 12
    key:
      rhythm: "#user-melodic"
      voice: Melody
    instrument:
      patch_name: Alto Sax
      family: reed
      program: 65
"##;
        let file = MixFile::from_yaml(yaml).unwrap();
        assert_eq!(file.channels.len(), 2);
        assert_eq!(file.channels[0].settings.volume, 90);
        assert_eq!(file.channels[0].settings.pan, 64);
        assert!(file.channels[1].key.is_user());

        let catalog = InMemoryCatalog::demo();
        let mix = MidiMix::from_file(&file, &catalog).unwrap();
        assert_eq!(mix.used_channels(), vec![1, 12]);
        assert_eq!(mix.instrument_mix(1).unwrap().settings().transposition, -12);
        assert!(mix.instrument_mix(1).unwrap().is_mute());
        assert_eq!(mix.voice(12), Some(Voice::user("Melody", false)));
        assert!(!mix.is_modified());
    }

    #[test]
    fn test_round_trip_file() {
        let catalog = InMemoryCatalog::demo();
        let mix = swing_mix(&catalog);
        mix.set_transposition(1, -12).unwrap();
        mix.set_solo(2, true).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("song.mix.yaml");
        mix.save(&path).unwrap();
        assert!(!mix.is_modified());

        let loaded = MidiMix::load(&path, &catalog).unwrap();
        assert_eq!(loaded.used_channels(), mix.used_channels());
        for (channel, voice, _) in mix.bound_channels() {
            assert_eq!(loaded.voice(channel), Some(voice));
        }
        assert_eq!(loaded.instrument_mix(1).unwrap().settings().transposition, -12);
        // Solo is not persisted, nor are the mutes it caused
        assert!(!loaded.is_solo_active());
        for c in loaded.used_channels() {
            assert!(!loaded.instrument_mix(c).unwrap().is_mute(), "channel {}", c);
        }
    }

    #[test]
    fn test_saved_mute_under_solo() {
        let catalog = InMemoryCatalog::demo();
        let mix = swing_mix(&catalog);
        mix.set_mute(4, true).unwrap();
        mix.set_solo(2, true).unwrap();

        let file = mix.to_file();
        let mutes: Vec<(u8, bool)> = file.channels.iter().map(|e| (e.channel, e.mute)).collect();
        assert_eq!(mutes, vec![(1, false), (2, false), (3, false), (4, true), (9, false)]);
    }

    #[test]
    fn test_rerouted_drums_saved_enabled() {
        let catalog = InMemoryCatalog::demo();
        let bossa = catalog.rhythm(&RhythmId::new("bossa-nova")).unwrap();
        let mix = MidiMix::for_rhythm(&bossa);
        mix.set_drums_rerouted(8, true).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bossa.mix.yaml");
        mix.save(&path).unwrap();
        assert!(mix.is_drums_rerouted(8));

        let loaded = MidiMix::load(&path, &catalog).unwrap();
        assert!(!loaded.is_drums_rerouted(8));
        assert_eq!(
            loaded.instrument_mix(8).unwrap().settings().enabled,
            crate::mix::EnabledSettings::ALL
        );
    }

    #[test]
    fn test_duplicate_channel_skipped() {
        let catalog = InMemoryCatalog::demo();
        let mut file = swing_mix(&catalog).to_file();
        let bass = file.channels.iter().position(|e| e.channel == 1).unwrap();
        file.channels[bass + 1].channel = 1;
        let mix = MidiMix::from_file(&file, &catalog).unwrap();
        assert_eq!(mix.used_channels().len(), file.channels.len() - 1);
        assert_eq!(mix.voice(1).unwrap().name(), "Bass");
    }

    #[test]
    fn test_missing_rhythm_substituted() {
        let catalog = InMemoryCatalog::demo();
        let mut file = swing_mix(&catalog).to_file();
        for entry in &mut file.channels {
            entry.key.rhythm = "lost-rhythm".to_string();
            entry.key.time_signature = Some(TimeSignature::THREE_FOUR);
        }
        let mix = MidiMix::from_file(&file, &catalog).unwrap();
        // Jazz waltz has Drums, Bass, Piano and Vibes; Guitar maps to Vibes by kind
        assert_eq!(mix.rhythm_ids(), vec![RhythmId::new("jazz-waltz")]);
        assert_eq!(mix.used_channels().len(), 4);
    }

    #[test]
    fn test_invalid_channel() {
        let catalog = InMemoryCatalog::demo();
        let mut file = swing_mix(&catalog).to_file();
        file.channels[0].channel = 16;
        assert!(MidiMix::from_file(&file, &catalog).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let catalog = InMemoryCatalog::demo();
        let err = MidiMix::load("/nonexistent/song.mix.yaml", &catalog).unwrap_err();
        assert!(err.to_string().contains("Failed to read mix file"));
    }
}
