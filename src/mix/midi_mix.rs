// Copyright (c) 2026 Robert L. Snyder, Sierra Vista, AZ
// Licensed under the MIT License. See LICENSE file in the project root for details.

//! The 16-channel table of a song.
//!
//! Each channel holds at most one (voice, instrument mix) binding. A voice
//! and an instrument mix are bound to at most one channel. Once attached to
//! a song, the mix follows the rhythms used by the song structure and the
//! song's user phrases, and vetoes changes needing more channels than
//! remain.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use tracing::{debug, error, warn};

use super::import::{ChannelView, MatchPolicy};
use super::manager::RhythmMixProvider;
use super::{
    EnabledSettings, InstrumentMix, InstrumentSettings, MidiMixListener, MixChange, UserVoice, Voice,
    DRUMS_CHANNEL, NB_CHANNELS,
};
use crate::arrangement::structure::dominant_source_rhythm;
use crate::arrangement::{ChangeProposal, SgsChange, SgsChangeListener, SongStructure};
use crate::error::{MixError, Veto};
use crate::rhythm::{Instrument, Rhythm, RhythmId};
use crate::song::{PhraseChange, PhraseListener, Song};
use crate::undo::{Edit, UndoManager};

#[derive(Debug, Clone, PartialEq)]
struct Slot {
    voice: Voice,
    mix: InstrumentMix,
    /// Enabled settings saved while drums are rerouted
    reroute_snapshot: Option<EnabledSettings>,
    /// Mute state saved while a solo is active
    saved_mute: Option<bool>,
}

type Slots = [Option<Slot>; NB_CHANNELS];

fn check_channel(channel: u8) -> usize {
    assert!((channel as usize) < NB_CHANNELS, "invalid MIDI channel {}", channel);
    channel as usize
}

struct MixState {
    slots: Slots,
}

impl MixState {
    fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
        }
    }

    fn solo_active(&self) -> bool {
        self.slots.iter().flatten().any(|s| s.mix.is_solo())
    }

    fn channel_of(&self, voice: &Voice) -> Option<u8> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| &s.voice == voice))
            .map(|i| i as u8)
    }

    fn user_channel(&self, name: &str) -> Option<u8> {
        self.slots
            .iter()
            .position(|s| {
                s.as_ref()
                    .is_some_and(|s| matches!(&s.voice, Voice::User(u) if u.name == name))
            })
            .map(|i| i as u8)
    }

    fn slot(&self, channel: u8) -> Result<&Slot, MixError> {
        self.slots[check_channel(channel)]
            .as_ref()
            .ok_or(MixError::ChannelNotUsed(channel))
    }

    fn slot_mut(&mut self, channel: u8) -> Result<&mut Slot, MixError> {
        self.slots[check_channel(channel)]
            .as_mut()
            .ok_or(MixError::ChannelNotUsed(channel))
    }

    fn free_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_none()).count()
    }

    /// Drum channel first when wanted, then upward above it, then downward below it
    fn find_free_channel(&self, want_drums: bool, exclude: &[u8]) -> Option<u8> {
        let free = |c: u8| self.slots[c as usize].is_none() && !exclude.contains(&c);
        if want_drums && free(DRUMS_CHANNEL) {
            return Some(DRUMS_CHANNEL);
        }
        let above = (DRUMS_CHANNEL + 1)..(NB_CHANNELS as u8);
        let below = (0..DRUMS_CHANNEL).rev();
        above.chain(below).find(|&c| free(c))
    }

    fn bind(&mut self, channel: u8, voice: Voice, mut mix: InstrumentMix, changes: &mut Vec<MixChange>) -> Result<(), MixError> {
        let index = check_channel(channel);
        if let Some(other) = self.channel_of(&voice) {
            if other != channel {
                return Err(MixError::VoiceAlreadyBound {
                    voice: voice.to_string(),
                    channel: other,
                });
            }
        }
        let bound_elsewhere = self
            .slots
            .iter()
            .enumerate()
            .find(|(i, s)| *i != index && matches!(s, Some(s) if s.mix.id() == mix.id()));
        if let Some((other, _)) = bound_elsewhere {
            return Err(MixError::InstrumentMixAlreadyBound { channel: other as u8 });
        }

        let old = match self.slots[index].as_ref() {
            Some(slot) => {
                let voice = slot.voice.clone();
                self.solo_off(channel, changes);
                self.slots[index] = None;
                Some(voice)
            }
            None => None,
        };

        mix.set_solo(false);
        let saved_mute = if self.solo_active() {
            let prior = mix.is_mute();
            mix.set_mute(true);
            Some(prior)
        } else {
            None
        };
        changes.push(MixChange::ChannelBound {
            channel,
            old,
            new: Some(voice.clone()),
        });
        self.slots[index] = Some(Slot {
            voice,
            mix,
            reroute_snapshot: None,
            saved_mute,
        });
        Ok(())
    }

    fn unbind(&mut self, channel: u8, changes: &mut Vec<MixChange>) -> Result<Slot, MixError> {
        self.slot(channel)?;
        self.solo_off(channel, changes);
        let slot = self.slots[channel as usize]
            .take()
            .ok_or(MixError::ChannelNotUsed(channel))?;
        changes.push(MixChange::ChannelBound {
            channel,
            old: Some(slot.voice.clone()),
            new: None,
        });
        Ok(slot)
    }

    fn set_mute_flag(&mut self, channel: u8, mute: bool, changes: &mut Vec<MixChange>) {
        if let Some(slot) = self.slots[channel as usize].as_mut() {
            if slot.mix.is_mute() != mute {
                slot.mix.set_mute(mute);
                changes.push(MixChange::Mute { channel, mute });
            }
        }
    }

    fn solo_on(&mut self, channel: u8, changes: &mut Vec<MixChange>) {
        let already = match self.slots[channel as usize].as_ref() {
            Some(slot) => slot.mix.is_solo(),
            None => return,
        };
        if already {
            return;
        }
        if !self.solo_active() {
            for slot in self.slots.iter_mut().flatten() {
                slot.saved_mute = Some(slot.mix.is_mute());
            }
            for other in 0..NB_CHANNELS as u8 {
                if other != channel {
                    self.set_mute_flag(other, true, changes);
                }
            }
        }
        if let Some(slot) = self.slots[channel as usize].as_mut() {
            slot.mix.set_solo(true);
        }
        changes.push(MixChange::Solo { channel, solo: true });
        self.set_mute_flag(channel, false, changes);
    }

    fn solo_off(&mut self, channel: u8, changes: &mut Vec<MixChange>) {
        match self.slots[channel as usize].as_mut() {
            Some(slot) if slot.mix.is_solo() => slot.mix.set_solo(false),
            _ => return,
        }
        changes.push(MixChange::Solo { channel, solo: false });
        if self.solo_active() {
            self.set_mute_flag(channel, true, changes);
            return;
        }
        // Last solo cleared
        for other in 0..NB_CHANNELS as u8 {
            let saved = self.slots[other as usize]
                .as_mut()
                .and_then(|s| s.saved_mute.take());
            if let Some(saved) = saved {
                self.set_mute_flag(other, saved, changes);
            }
        }
    }

    fn set_mute(&mut self, channel: u8, mute: bool, changes: &mut Vec<MixChange>) -> Result<(), MixError> {
        let slot = self.slot(channel)?;
        let (is_mute, is_solo) = (slot.mix.is_mute(), slot.mix.is_solo());
        if mute {
            if is_solo {
                self.solo_off(channel, changes);
            }
            self.set_mute_flag(channel, true, changes);
        } else if is_mute {
            if self.solo_active() {
                // Unmuting under solo joins the soloed channels
                self.solo_on(channel, changes);
            } else {
                self.set_mute_flag(channel, false, changes);
            }
        }
        Ok(())
    }

    fn set_solo(&mut self, channel: u8, solo: bool, changes: &mut Vec<MixChange>) -> Result<(), MixError> {
        self.slot(channel)?;
        if solo {
            self.solo_on(channel, changes);
        } else {
            self.solo_off(channel, changes);
        }
        Ok(())
    }

    /// Fit a slot put back by undo or redo into the current solo state
    fn settle(&mut self, channel: u8, solo_active: bool, changes: &mut Vec<MixChange>) {
        let mute = match self.slots[channel as usize].as_mut() {
            Some(slot) => {
                let mute = slot.saved_mute.take().unwrap_or_else(|| slot.mix.is_mute());
                slot.mix.set_solo(false);
                if solo_active {
                    slot.saved_mute = Some(mute);
                }
                mute
            }
            None => return,
        };
        self.set_mute_flag(channel, solo_active || mute, changes);
    }

    /// Get a slot's mix as it is without solo and drums rerouting
    fn at_rest(slot: &Slot) -> InstrumentMix {
        let mut mix = slot.mix.clone();
        mix.set_solo(false);
        if let Some(mute) = slot.saved_mute {
            mix.set_mute(mute);
        }
        if let Some(enabled) = slot.reroute_snapshot {
            mix.settings_mut().enabled = enabled;
        }
        mix
    }
}

/// Snapshot record undoing and redoing one mix operation
pub struct MixEdit {
    target: Weak<MidiMix>,
    name: String,
    before: Slots,
    after: Slots,
}

impl Edit for MixEdit {
    fn name(&self) -> &str {
        &self.name
    }

    fn undo(&self) {
        if let Some(mix) = self.target.upgrade() {
            mix.restore(&self.after, &self.before);
        }
    }

    fn redo(&self) {
        if let Some(mix) = self.target.upgrade() {
            mix.restore(&self.before, &self.after);
        }
    }
}

/// The channel table of a song
pub struct MidiMix {
    me: Weak<MidiMix>,
    state: Mutex<MixState>,
    listeners: RwLock<Vec<Arc<dyn MidiMixListener>>>,
    song: RwLock<Option<Weak<Song>>>,
    undo_manager: RwLock<Option<Arc<UndoManager>>>,
    provider: RwLock<Option<Arc<dyn RhythmMixProvider>>>,
    policy: RwLock<MatchPolicy>,
    modified: AtomicBool,
}

impl MidiMix {
    /// Create an empty mix
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            state: Mutex::new(MixState::new()),
            listeners: RwLock::new(Vec::new()),
            song: RwLock::new(None),
            undo_manager: RwLock::new(None),
            provider: RwLock::new(None),
            policy: RwLock::new(MatchPolicy::default()),
            modified: AtomicBool::new(false),
        })
    }

    /// Create the default mix of a rhythm: preferred instruments on preferred channels
    pub fn for_rhythm(rhythm: &Rhythm) -> Arc<Self> {
        let mix = Self::new();
        let result = mix.mutate("forRhythm", false, |state, changes| {
            for voice in rhythm.voices() {
                let preferred = voice.preferred_channel();
                let channel = if (preferred as usize) < NB_CHANNELS && state.slots[preferred as usize].is_none() {
                    Some(preferred)
                } else {
                    state.find_free_channel(voice.is_drums(), &[])
                };
                match channel {
                    Some(channel) => {
                        let instrument_mix = InstrumentMix::new(voice.preferred_instrument().clone());
                        state.bind(channel, Voice::Rhythm(voice.clone()), instrument_mix, changes)?;
                    }
                    None => warn!(rhythm = %rhythm.id(), voice = voice.name(), "no channel left for voice"),
                }
            }
            Ok(())
        });
        if let Err(e) = result {
            error!(rhythm = %rhythm.id(), error = %e, "failed to build rhythm mix");
        }
        mix.modified.store(false, Ordering::SeqCst);
        mix
    }

    // ---- wiring ----

    /// Attach to a song: follow its structure and phrases, record undoable edits
    pub fn attach(&self, song: &Arc<Song>) {
        self.detach();
        let me = match self.me.upgrade() {
            Some(me) => me,
            None => return,
        };
        *self.song.write().expect("mix lock poisoned") = Some(Arc::downgrade(song));
        self.set_undo_manager(Some(song.undo_manager().clone()));
        song.structure().add_listener(me.clone());
        song.add_phrase_listener(me);
        debug!(song = %song.id(), "mix attached");
    }

    /// Stop following the attached song
    pub fn detach(&self) {
        let song = self.song.write().expect("mix lock poisoned").take();
        let me = self.me.upgrade();
        if let (Some(song), Some(me)) = (song.and_then(|w| w.upgrade()), me) {
            let structure_listener: Arc<dyn SgsChangeListener> = me.clone();
            song.structure().remove_listener(&structure_listener);
            let phrase_listener: Arc<dyn PhraseListener> = me;
            song.remove_phrase_listener(&phrase_listener);
            debug!(song = %song.id(), "mix detached");
        }
        self.set_undo_manager(None);
    }

    /// Get the attached song
    pub fn song(&self) -> Option<Arc<Song>> {
        self.song
            .read()
            .expect("mix lock poisoned")
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// Set the undo manager receiving channel edits
    pub fn set_undo_manager(&self, undo_manager: Option<Arc<UndoManager>>) {
        *self.undo_manager.write().expect("mix lock poisoned") = undo_manager;
    }

    fn undo_manager(&self) -> Option<Arc<UndoManager>> {
        self.undo_manager.read().expect("mix lock poisoned").clone()
    }

    fn is_undo_redo_in_progress(&self) -> bool {
        self.undo_manager()
            .map(|um| um.is_undo_redo_in_progress())
            .unwrap_or(false)
    }

    /// Set where default rhythm mixes come from
    pub fn set_rhythm_mix_provider(&self, provider: Option<Arc<dyn RhythmMixProvider>>) {
        *self.provider.write().expect("mix lock poisoned") = provider;
    }

    /// Set the matching heuristics used by import and adaptation
    pub fn set_match_policy(&self, policy: MatchPolicy) {
        *self.policy.write().expect("mix lock poisoned") = policy;
    }

    /// Get the matching heuristics
    pub fn match_policy(&self) -> MatchPolicy {
        *self.policy.read().expect("mix lock poisoned")
    }

    /// Add a listener
    pub fn add_listener(&self, listener: Arc<dyn MidiMixListener>) {
        self.listeners.write().expect("mix lock poisoned").push(listener);
    }

    /// Remove a listener
    pub fn remove_listener(&self, listener: &Arc<dyn MidiMixListener>) {
        self.listeners
            .write()
            .expect("mix lock poisoned")
            .retain(|l| Arc::as_ptr(l) as *const () != Arc::as_ptr(listener) as *const ());
    }

    // ---- queries ----

    /// Get the voice of a channel
    pub fn voice(&self, channel: u8) -> Option<Voice> {
        let state = self.state.lock().expect("mix state lock poisoned");
        state.slots[check_channel(channel)].as_ref().map(|s| s.voice.clone())
    }

    /// Get the instrument mix of a channel
    pub fn instrument_mix(&self, channel: u8) -> Option<InstrumentMix> {
        let state = self.state.lock().expect("mix state lock poisoned");
        state.slots[check_channel(channel)].as_ref().map(|s| s.mix.clone())
    }

    /// Get the channel of a voice
    pub fn channel_of(&self, voice: &Voice) -> Option<u8> {
        self.state.lock().expect("mix state lock poisoned").channel_of(voice)
    }

    /// Get the channel of a user phrase
    pub fn user_channel(&self, name: &str) -> Option<u8> {
        self.state.lock().expect("mix state lock poisoned").user_channel(name)
    }

    /// Get bound channels in channel order
    pub fn used_channels(&self) -> Vec<u8> {
        let state = self.state.lock().expect("mix state lock poisoned");
        (0..NB_CHANNELS as u8)
            .filter(|&c| state.slots[c as usize].is_some())
            .collect()
    }

    /// Get free channels in channel order
    pub fn unused_channels(&self) -> Vec<u8> {
        let state = self.state.lock().expect("mix state lock poisoned");
        (0..NB_CHANNELS as u8)
            .filter(|&c| state.slots[c as usize].is_none())
            .collect()
    }

    /// Get all bindings in channel order
    pub fn bound_channels(&self) -> Vec<(u8, Voice, InstrumentMix)> {
        let state = self.state.lock().expect("mix state lock poisoned");
        state
            .slots
            .iter()
            .enumerate()
            .filter_map(|(c, s)| s.as_ref().map(|s| (c as u8, s.voice.clone(), s.mix.clone())))
            .collect()
    }

    /// Get all bindings in channel order, as they are without solo and drums rerouting
    pub fn channels_at_rest(&self) -> Vec<(u8, Voice, InstrumentMix)> {
        let state = self.state.lock().expect("mix state lock poisoned");
        state
            .slots
            .iter()
            .enumerate()
            .filter_map(|(c, s)| s.as_ref().map(|s| (c as u8, s.voice.clone(), MixState::at_rest(s))))
            .collect()
    }

    /// Get ids of the rhythms having channels
    pub fn rhythm_ids(&self) -> Vec<RhythmId> {
        let state = self.state.lock().expect("mix state lock poisoned");
        let mut ids: Vec<RhythmId> = Vec::new();
        for slot in state.slots.iter().flatten() {
            if let Some(id) = slot.voice.rhythm_id() {
                if !ids.contains(id) {
                    ids.push(id.clone());
                }
            }
        }
        ids
    }

    /// Find a free channel, see [`DRUMS_CHANNEL`]
    pub fn find_free_channel(&self, want_drums: bool) -> Option<u8> {
        self.state
            .lock()
            .expect("mix state lock poisoned")
            .find_free_channel(want_drums, &[])
    }

    /// Check if drums of a channel are rerouted
    pub fn is_drums_rerouted(&self, channel: u8) -> bool {
        let state = self.state.lock().expect("mix state lock poisoned");
        state.slots[check_channel(channel)]
            .as_ref()
            .is_some_and(|s| s.reroute_snapshot.is_some())
    }

    /// Check if a solo is active
    pub fn is_solo_active(&self) -> bool {
        self.state.lock().expect("mix state lock poisoned").solo_active()
    }

    /// Check if changed since last save
    pub fn is_modified(&self) -> bool {
        self.modified.load(Ordering::SeqCst)
    }

    /// Mark as saved
    pub fn mark_saved(&self) {
        if self.modified.swap(false, Ordering::SeqCst) {
            self.notify(&MixChange::Modified(false));
        }
    }

    // ---- channel operations ----

    /// Bind `voice` and `mix` to `channel`, replacing its current binding
    pub fn assign(&self, channel: u8, voice: Voice, mix: InstrumentMix) -> Result<(), MixError> {
        check_channel(channel);
        self.validate_voice(&voice)?;
        self.mutate("assign", true, |state, changes| state.bind(channel, voice, mix, changes))
    }

    /// Release a channel
    pub fn unassign(&self, channel: u8) -> Result<(), MixError> {
        self.mutate("unassign", true, |state, changes| {
            state.unbind(channel, changes).map(|_| ())
        })
    }

    /// Move the binding of `voice` to the free channel `to`
    pub fn swap_channel(&self, voice: &Voice, to: u8) -> Result<(), MixError> {
        let to_index = check_channel(to);
        self.mutate("swapChannel", true, |state, changes| {
            let from = state
                .channel_of(voice)
                .ok_or_else(|| MixError::UnknownVoice(voice.to_string()))?;
            if from == to {
                return Ok(());
            }
            if state.slots[to_index].is_some() {
                return Err(MixError::ChannelInUse(to));
            }
            state.slots[to_index] = state.slots[from as usize].take();
            changes.push(MixChange::ChannelSwapped {
                voice: voice.clone(),
                from,
                to,
            });
            Ok(())
        })
    }

    /// Mute or unmute a channel
    pub fn set_mute(&self, channel: u8, mute: bool) -> Result<(), MixError> {
        self.mutate("setMute", false, |state, changes| state.set_mute(channel, mute, changes))
    }

    /// Solo or unsolo a channel
    pub fn set_solo(&self, channel: u8, solo: bool) -> Result<(), MixError> {
        self.mutate("setSolo", false, |state, changes| state.set_solo(channel, solo, changes))
    }

    /// Set the transposition of a channel
    pub fn set_transposition(&self, channel: u8, value: i8) -> Result<(), MixError> {
        self.mutate("setTransposition", false, |state, changes| {
            let slot = state.slot_mut(channel)?;
            if slot.mix.settings().transposition != value {
                slot.mix.settings_mut().transposition = value;
                changes.push(MixChange::Transposition { channel, value });
            }
            Ok(())
        })
    }

    /// Set the velocity shift of a channel
    pub fn set_velocity_shift(&self, channel: u8, value: i8) -> Result<(), MixError> {
        self.mutate("setVelocityShift", false, |state, changes| {
            let slot = state.slot_mut(channel)?;
            if slot.mix.settings().velocity_shift != value {
                slot.mix.settings_mut().velocity_shift = value;
                changes.push(MixChange::VelocityShift { channel, value });
            }
            Ok(())
        })
    }

    /// Set the volume of a channel
    pub fn set_volume(&self, channel: u8, volume: u8) -> Result<(), MixError> {
        self.mutate("setVolume", false, |state, changes| {
            let slot = state.slot_mut(channel)?;
            let volume = volume.min(127);
            if slot.mix.settings().volume != volume {
                slot.mix.settings_mut().volume = volume;
                changes.push(MixChange::Settings { channel });
            }
            Ok(())
        })
    }

    /// Replace the settings of a channel; transposition and velocity changes are reported as such
    pub fn set_settings(&self, channel: u8, settings: InstrumentSettings) -> Result<(), MixError> {
        self.mutate("setSettings", false, |state, changes| {
            let slot = state.slot_mut(channel)?;
            let old = *slot.mix.settings();
            if old == settings {
                return Ok(());
            }
            *slot.mix.settings_mut() = settings;
            if old.transposition != settings.transposition {
                changes.push(MixChange::Transposition {
                    channel,
                    value: settings.transposition,
                });
            }
            if old.velocity_shift != settings.velocity_shift {
                changes.push(MixChange::VelocityShift {
                    channel,
                    value: settings.velocity_shift,
                });
            }
            changes.push(MixChange::Settings { channel });
            Ok(())
        })
    }

    /// Change the instrument of a channel
    pub fn set_instrument(&self, channel: u8, instrument: Instrument) -> Result<(), MixError> {
        self.mutate("setInstrument", false, |state, changes| {
            let slot = state.slot_mut(channel)?;
            if slot.mix.instrument() == &instrument {
                return Ok(());
            }
            let key_map_changed = slot.voice.is_drums() && slot.mix.instrument().key_map() != instrument.key_map();
            slot.mix.set_instrument(instrument);
            changes.push(MixChange::Instrument { channel });
            if key_map_changed {
                changes.push(MixChange::DrumKeyMap { channel });
            }
            Ok(())
        })
    }

    /// Reroute a channel's drums to the drums channel, or stop rerouting.
    ///
    /// While rerouted the channel's own instrument, volume, pan and effects
    /// are disabled.
    pub fn set_drums_rerouted(&self, channel: u8, rerouted: bool) -> Result<(), MixError> {
        check_channel(channel);
        if channel == DRUMS_CHANNEL {
            return Err(MixError::DrumsChannelReroute);
        }
        self.mutate("setDrumsRerouted", false, |state, changes| {
            let slot = state.slot_mut(channel)?;
            if slot.reroute_snapshot.is_some() == rerouted {
                return Ok(());
            }
            if rerouted {
                slot.reroute_snapshot = Some(slot.mix.settings().enabled);
                slot.mix.settings_mut().enabled = EnabledSettings::NONE;
            } else {
                let saved = slot.reroute_snapshot.take().unwrap_or_default();
                slot.mix.settings_mut().enabled = saved;
            }
            changes.push(MixChange::DrumsRerouted { channel, rerouted });
            Ok(())
        })
    }

    // ---- multi-channel operations ----

    /// Add the channels of `rhythm` found in `from`, all or nothing.
    ///
    /// Each voice keeps its channel in `from` when free here, otherwise it
    /// gets a free channel. Returns the channels used.
    pub fn add_instrument_mixes(&self, from: &MidiMix, rhythm: &Rhythm) -> Result<Vec<u8>, MixError> {
        let source_id = rhythm.source_id().clone();
        let incoming: Vec<(u8, Voice, InstrumentMix)> = from
            .bound_channels()
            .into_iter()
            .filter(|(_, voice, _)| voice.rhythm_id() == Some(&source_id))
            .collect();

        self.mutate("addInstrumentMixes", true, |state, changes| {
            let mut placed: Vec<(u8, Voice, InstrumentMix)> = Vec::new();
            let mut missing = 0;
            let to_place: Vec<_> = incoming
                .iter()
                .filter(|(_, voice, _)| state.channel_of(voice).is_none())
                .collect();
            for (channel, voice, mix) in &to_place {
                let taken: Vec<u8> = placed.iter().map(|(c, _, _)| *c).collect();
                let target = if state.slots[*channel as usize].is_none() && !taken.contains(channel) {
                    Some(*channel)
                } else {
                    state.find_free_channel(voice.is_drums(), &taken)
                };
                match target {
                    Some(target) => placed.push((target, voice.clone(), InstrumentMix::copy_of(mix))),
                    None => missing += 1,
                }
            }
            if missing > 0 {
                return Err(MixError::NotEnoughChannels {
                    needed: to_place.len(),
                    available: state.free_count(),
                });
            }
            let mut channels = Vec::new();
            for (channel, voice, mix) in placed {
                state.bind(channel, voice, mix, changes)?;
                channels.push(channel);
            }
            Ok(channels)
        })
    }

    /// Release every channel of a rhythm
    pub fn remove_rhythm(&self, rhythm: &RhythmId) -> Result<Vec<u8>, MixError> {
        self.mutate("removeRhythm", true, |state, changes| {
            let channels: Vec<u8> = (0..NB_CHANNELS as u8)
                .filter(|&c| {
                    state.slots[c as usize]
                        .as_ref()
                        .is_some_and(|s| s.voice.rhythm_id() == Some(rhythm))
                })
                .collect();
            for &channel in &channels {
                state.unbind(channel, changes)?;
            }
            Ok(channels)
        })
    }

    /// Bind a user phrase to a free channel with a default instrument
    pub fn add_user_channel(&self, name: &str, drums: bool) -> Result<u8, MixError> {
        let voice = Voice::user(name, drums);
        self.validate_voice(&voice)?;
        self.mutate("addUserChannel", true, |state, changes| {
            let channel = state
                .find_free_channel(drums, &[])
                .ok_or(MixError::NotEnoughChannels { needed: 1, available: 0 })?;
            let mix = InstrumentMix::new(voice.preferred_instrument());
            state.bind(channel, voice, mix, changes)?;
            Ok(channel)
        })
    }

    /// Rename the voice of a user channel
    pub fn rename_user_channel(&self, old: &str, new: &str) -> Result<(), MixError> {
        self.mutate("renameUserChannel", true, |state, changes| {
            let channel = state
                .user_channel(old)
                .ok_or_else(|| MixError::UnknownVoice(old.to_string()))?;
            let slot = state.slot_mut(channel)?;
            if let Voice::User(user) = &mut slot.voice {
                user.name = new.to_string();
            }
            changes.push(MixChange::VoiceRenamed {
                channel,
                old: old.to_string(),
                new: new.to_string(),
            });
            Ok(())
        })
    }

    /// Give the channels of `incoming` the sound of the matching channels of
    /// this mix's `dominant` rhythm. Returns the number of adapted channels.
    pub fn adapt_instrument_mixes(&self, incoming: &MidiMix, dominant: &RhythmId) -> usize {
        let reference: Vec<(u8, Voice, InstrumentMix)> = self
            .bound_channels()
            .into_iter()
            .filter(|(_, voice, _)| voice.rhythm_id() == Some(dominant))
            .collect();
        let targets = incoming.bound_channels();
        let pairs = {
            let reference_views: Vec<ChannelView<'_>> = views(&reference);
            let target_views: Vec<ChannelView<'_>> = views(&targets);
            self.match_policy().adapt_pairs(&target_views, &reference_views)
        };
        if pairs.is_empty() {
            return 0;
        }
        let result = incoming.mutate("adaptInstrumentMixes", false, |state, changes| {
            for (target, source) in &pairs {
                if let (Ok(slot), Some((_, _, mix))) = (
                    state.slot_mut(*target),
                    reference.iter().find(|(c, _, _)| c == source),
                ) {
                    slot.mix.take_sound_of(mix);
                    changes.push(MixChange::Instrument { channel: *target });
                }
            }
            Ok(pairs.len())
        });
        result.unwrap_or(0)
    }

    /// Copy instruments and settings of `foreign` channels into the matching
    /// channels of this mix. Returns the number of imported channels.
    pub fn import_from(&self, foreign: &MidiMix) -> Result<usize, MixError> {
        let foreign_channels = foreign.bound_channels();
        let local_channels = self.bound_channels();
        let pairs = {
            let foreign_views = views(&foreign_channels);
            let local_views = views(&local_channels);
            self.match_policy().import_pairs(&foreign_views, &local_views)
        };
        if pairs.is_empty() {
            return Ok(0);
        }
        self.mutate("importMix", true, |state, changes| {
            for (from, to) in &pairs {
                let source = foreign_channels.iter().find(|(c, _, _)| c == from);
                if let (Ok(slot), Some((_, _, mix))) = (state.slot_mut(*to), source) {
                    let key_map_changed =
                        slot.voice.is_drums() && slot.mix.instrument().key_map() != mix.instrument().key_map();
                    slot.mix.take_sound_of(mix);
                    changes.push(MixChange::Instrument { channel: *to });
                    if key_map_changed {
                        changes.push(MixChange::DrumKeyMap { channel: *to });
                    }
                }
            }
            debug!(imported = pairs.len(), "mix imported");
            Ok(pairs.len())
        })
    }

    /// Check the bindings against `song`.
    ///
    /// Every rhythm voice bound must belong to a rhythm of the song. With
    /// `full`, every voice of the song's rhythms must be bound and user
    /// channels must match user phrases; a user channel without phrase gets
    /// an empty phrase.
    pub fn check_consistency(&self, song: &Song, full: bool) -> Result<(), MixError> {
        let bound = self.bound_channels();
        let rhythms = song.structure().unique_rhythms(true);

        for (channel, voice, _) in &bound {
            if let Voice::Rhythm(rv) = voice {
                let known = rhythms
                    .iter()
                    .any(|r| r.id() == rv.rhythm() && r.voice(rv.name()).is_some());
                if !known {
                    return Err(MixError::Inconsistent(format!(
                        "channel {} voice {} is not used by the song",
                        channel, voice
                    )));
                }
            }
        }
        if !full {
            return Ok(());
        }

        for rhythm in &rhythms {
            for rv in rhythm.voices() {
                let voice = Voice::Rhythm(rv.clone());
                if !bound.iter().any(|(_, v, _)| *v == voice) {
                    return Err(MixError::Inconsistent(format!("voice {} has no channel", voice)));
                }
            }
        }

        let phrases = song.phrase_names();
        for (channel, voice, _) in &bound {
            if let Voice::User(UserVoice { name, drums }) = voice {
                if !phrases.contains(name) {
                    warn!(channel, phrase = %name, "user channel without phrase, adding an empty phrase");
                    song.insert_empty_phrase(name, *drums)
                        .map_err(|e| MixError::Inconsistent(e.to_string()))?;
                }
            }
        }
        for phrase in song.user_phrases() {
            let has_channel = bound
                .iter()
                .any(|(_, v, _)| matches!(v, Voice::User(u) if u.name == phrase.name()));
            if !has_channel {
                return Err(MixError::Inconsistent(format!(
                    "user phrase {} has no channel",
                    phrase.name()
                )));
            }
        }
        Ok(())
    }

    // ---- internals ----

    fn validate_voice(&self, voice: &Voice) -> Result<(), MixError> {
        let song = match self.song() {
            Some(song) => song,
            None => return Ok(()),
        };
        let valid = match voice {
            Voice::Rhythm(rv) => song
                .structure()
                .unique_rhythms(true)
                .iter()
                .any(|r| r.id() == rv.rhythm() && r.voice(rv.name()).is_some()),
            Voice::User(user) => song.user_phrase(&user.name).is_some(),
        };
        if valid {
            Ok(())
        } else {
            Err(MixError::VoiceNotInSong(voice.to_string()))
        }
    }

    /// Run `f` on the state atomically: on error the state is left untouched
    fn mutate<T, F>(&self, name: &str, undoable: bool, f: F) -> Result<T, MixError>
    where
        F: FnOnce(&mut MixState, &mut Vec<MixChange>) -> Result<T, MixError>,
    {
        let mut changes = Vec::new();
        let (result, before, after) = {
            let mut state = self.state.lock().expect("mix state lock poisoned");
            let before = state.slots.clone();
            let result = f(&mut *state, &mut changes);
            if result.is_err() {
                state.slots = before;
                return result;
            }
            (result, before, state.slots.clone())
        };
        if changes.is_empty() {
            return result;
        }
        if undoable {
            if let Some(um) = self.undo_manager() {
                um.push(Box::new(MixEdit {
                    target: self.me.clone(),
                    name: name.to_string(),
                    before,
                    after,
                }));
            }
        }
        debug!(operation = name, changes = changes.len(), "mix changed");
        self.fire(&changes);
        result
    }

    /// Put back the channels touched between `from` and `to`, others keep their live state.
    ///
    /// Restored channels join the current solo state: they are never soloed
    /// and are muted while another channel is soloed.
    fn restore(&self, from: &Slots, to: &Slots) {
        let changes: Vec<MixChange> = {
            let mut state = self.state.lock().expect("mix state lock poisoned");
            let mut changes = Vec::new();
            let touched: Vec<u8> = (0..NB_CHANNELS as u8)
                .filter(|&c| from[c as usize] != to[c as usize])
                .collect();
            for &channel in &touched {
                state.solo_off(channel, &mut changes);
            }
            for &channel in &touched {
                let index = channel as usize;
                let old_voice = state.slots[index].as_ref().map(|s| s.voice.clone());
                let new_voice = to[index].as_ref().map(|s| s.voice.clone());
                if old_voice != new_voice {
                    changes.push(MixChange::ChannelBound {
                        channel,
                        old: old_voice,
                        new: new_voice,
                    });
                } else {
                    changes.push(MixChange::Instrument { channel });
                }
                state.slots[index] = to[index].clone();
            }
            let solo_active = state
                .slots
                .iter()
                .enumerate()
                .any(|(c, s)| !touched.contains(&(c as u8)) && matches!(s, Some(s) if s.mix.is_solo()));
            for &channel in &touched {
                state.settle(channel, solo_active, &mut changes);
            }
            changes
        };
        self.fire(&changes);
    }

    fn fire(&self, changes: &[MixChange]) {
        for change in changes {
            self.notify(change);
        }
        if !changes.is_empty() && !self.modified.swap(true, Ordering::SeqCst) {
            self.notify(&MixChange::Modified(true));
        }
    }

    fn notify(&self, change: &MixChange) {
        let listeners = self.listeners.read().expect("mix lock poisoned").clone();
        for listener in listeners {
            listener.mix_changed(self, change);
        }
    }

    fn rhythm_mix(&self, rhythm: &Arc<Rhythm>) -> Arc<MidiMix> {
        let provider = self.provider.read().expect("mix lock poisoned").clone();
        match provider {
            Some(provider) => provider.rhythm_mix(rhythm),
            None => MidiMix::for_rhythm(rhythm),
        }
    }

    /// Release channels of rhythms no longer used, add channels for new ones
    fn sync_rhythms(&self, structure: &SongStructure) {
        let used = structure.unique_rhythms(true);
        let bound = self.rhythm_ids();

        for id in bound.iter().filter(|id| !used.iter().any(|r| r.id() == *id)) {
            if let Err(e) = self.remove_rhythm(id) {
                error!(rhythm = %id, error = %e, "failed to release rhythm channels");
            }
        }

        let remaining: HashSet<&RhythmId> = bound.iter().filter(|id| used.iter().any(|r| r.id() == *id)).collect();
        let remaining_parts: Vec<_> = structure
            .parts()
            .into_iter()
            .filter(|p| remaining.contains(p.rhythm().source_id()))
            .collect();
        let dominant = dominant_source_rhythm(&remaining_parts);

        for rhythm in used.iter().filter(|r| !bound.contains(r.id())) {
            let incoming = self.rhythm_mix(rhythm);
            if let Some(dominant) = &dominant {
                self.adapt_instrument_mixes(&incoming, dominant.id());
            }
            match self.add_instrument_mixes(&incoming, rhythm) {
                Ok(channels) => debug!(rhythm = %rhythm.id(), ?channels, "rhythm channels added"),
                Err(e) => error!(rhythm = %rhythm.id(), error = %e, "failed to add rhythm channels"),
            }
        }
    }
}

impl fmt::Debug for MidiMix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MidiMix")
            .field("channels", &self.used_channels())
            .field("modified", &self.is_modified())
            .finish()
    }
}

fn views(channels: &[(u8, Voice, InstrumentMix)]) -> Vec<ChannelView<'_>> {
    channels
        .iter()
        .map(|(channel, voice, mix)| ChannelView {
            channel: *channel,
            voice,
            mix,
        })
        .collect()
}

impl SgsChangeListener for MidiMix {
    fn authorize_change(&self, proposal: &ChangeProposal) -> Result<(), Veto> {
        if !proposal.change.changes_rhythms() || self.is_undo_redo_in_progress() {
            return Ok(());
        }
        let after = proposal.rhythms_after();
        let state = self.state.lock().expect("mix state lock poisoned");
        let bound_ids: Vec<RhythmId> = state
            .slots
            .iter()
            .flatten()
            .filter_map(|s| s.voice.rhythm_id().cloned())
            .collect();
        // Channels of rhythms dropped by the change become available
        let released = state
            .slots
            .iter()
            .flatten()
            .filter(|s| {
                s.voice
                    .rhythm_id()
                    .is_some_and(|id| !after.iter().any(|r| r.id() == id))
            })
            .count();
        let available = state.free_count() + released;
        let needed: usize = after
            .iter()
            .filter(|r| !bound_ids.contains(r.id()))
            .map(|r| r.voices().len())
            .sum();
        if needed > available {
            debug!(needed, available, "structure change vetoed");
            return Err(Veto::NotEnoughChannels { needed, available });
        }
        Ok(())
    }

    fn song_structure_changed(&self, structure: &SongStructure, change: &SgsChange) {
        if self.is_undo_redo_in_progress() {
            return;
        }
        // Reacting once per action keeps channels of parts removed then re-added
        if let SgsChange::ActionCompleted(_) = change {
            self.sync_rhythms(structure);
        }
    }
}

impl PhraseListener for MidiMix {
    fn authorize_phrase_change(&self, _song: &Song, change: &PhraseChange) -> Result<(), Veto> {
        if self.is_undo_redo_in_progress() {
            return Ok(());
        }
        if let PhraseChange::Added { name, drums } = change {
            let state = self.state.lock().expect("mix state lock poisoned");
            if state.user_channel(name).is_none() && state.find_free_channel(*drums, &[]).is_none() {
                return Err(Veto::NotEnoughChannels { needed: 1, available: 0 });
            }
        }
        Ok(())
    }

    fn phrase_changed(&self, _song: &Song, change: &PhraseChange) {
        if self.is_undo_redo_in_progress() {
            return;
        }
        let result = match change {
            PhraseChange::Added { name, drums } => {
                if self.user_channel(name).is_some() {
                    Ok(())
                } else {
                    self.add_user_channel(name, *drums).map(|_| ())
                }
            }
            PhraseChange::Removed { name, .. } => match self.user_channel(name) {
                Some(channel) => self.unassign(channel),
                None => Ok(()),
            },
            PhraseChange::Renamed { old, new } => self.rename_user_channel(old, new),
        };
        if let Err(e) = result {
            error!(?change, error = %e, "failed to update user channels");
        }
    }
}
