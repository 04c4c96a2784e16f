// Copyright (c) 2026 Robert L. Snyder, Sierra Vista, AZ
// Licensed under the MIT License. See LICENSE file in the project root for details.

//! Channel matching between two mixes.
//!
//! Matching is best-effort. Channels are paired in stages, each stage only
//! considering channels left unpaired by the previous ones.

use super::{InstrumentMix, Voice};
use crate::rhythm::InstrumentFamily;

/// Parameters of the similarity heuristics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchPolicy {
    /// Number of voice name letters in a match key
    pub name_prefix_len: usize,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self { name_prefix_len: 3 }
    }
}

impl MatchPolicy {
    /// Create a policy
    pub fn new(name_prefix_len: usize) -> Self {
        Self { name_prefix_len }
    }

    /// Key made of the first letters of the voice name and the instrument family
    pub fn key(&self, voice_name: &str, family: InstrumentFamily) -> String {
        let prefix: String = voice_name
            .chars()
            .filter(|c| c.is_alphanumeric())
            .flat_map(char::to_lowercase)
            .take(self.name_prefix_len)
            .collect();
        format!("{}-{}", prefix, family.tag())
    }

    fn channel_key(&self, view: &ChannelView<'_>) -> String {
        self.key(view.voice.name(), view.mix.instrument().family)
    }

    /// Pair foreign channels with local channels for an import.
    ///
    /// Stages: same voice, same voice kind, same key, same instrument family.
    /// User voices only pair with the local user voice of the same name.
    pub(crate) fn import_pairs(&self, foreign: &[ChannelView<'_>], local: &[ChannelView<'_>]) -> Vec<(u8, u8)> {
        let mut pairs = Vec::new();
        pair_up(&mut pairs, foreign, local, |f, l| match (f.voice, l.voice) {
            (Voice::User(fu), Voice::User(lu)) => fu.name == lu.name,
            (f, l) => f == l,
        });
        pair_up(&mut pairs, foreign, local, |f, l| {
            f.voice.kind().is_some() && f.voice.kind() == l.voice.kind()
        });
        self.pair_by_sound(&mut pairs, foreign, local);
        pairs
    }

    /// Pair incoming channels with reference channels by key then family
    pub(crate) fn adapt_pairs(&self, incoming: &[ChannelView<'_>], reference: &[ChannelView<'_>]) -> Vec<(u8, u8)> {
        let mut pairs = Vec::new();
        self.pair_by_sound(&mut pairs, incoming, reference);
        pairs
    }

    fn pair_by_sound(&self, pairs: &mut Vec<(u8, u8)>, from: &[ChannelView<'_>], to: &[ChannelView<'_>]) {
        pair_up(pairs, from, to, |f, l| {
            !f.voice.is_user() && !l.voice.is_user() && self.channel_key(f) == self.channel_key(l)
        });
        pair_up(pairs, from, to, |f, l| {
            !f.voice.is_user()
                && !l.voice.is_user()
                && f.mix.instrument().family == l.mix.instrument().family
        });
    }
}

/// A bound channel as seen by the matcher
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChannelView<'a> {
    pub channel: u8,
    pub voice: &'a Voice,
    pub mix: &'a InstrumentMix,
}

fn pair_up<F>(pairs: &mut Vec<(u8, u8)>, from: &[ChannelView<'_>], to: &[ChannelView<'_>], matches: F)
where
    F: Fn(&ChannelView<'_>, &ChannelView<'_>) -> bool,
{
    for f in from {
        if pairs.iter().any(|(a, _)| *a == f.channel) {
            continue;
        }
        let found = to
            .iter()
            .filter(|t| !pairs.iter().any(|(_, b)| *b == t.channel))
            .find(|t| matches(f, t));
        if let Some(t) = found {
            pairs.push((f.channel, t.channel));
        }
    }
}
