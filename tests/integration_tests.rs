// Copyright (c) 2026 Robert L. Snyder, Sierra Vista, AZ
// Licensed under the MIT License. See LICENSE file in the project root for details.

//! Integration tests for songsync
//!
//! These tests drive a song through its lead sheet and check that the part
//! timeline and the MIDI mix stay consistent.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use songsync::arrangement::ChangeProposal;
use songsync::mix::{MixFile, NB_CHANNELS};
use songsync::rhythm::{Instrument, InstrumentFamily, VoiceKind};
use songsync::{
    InMemoryCatalog, LeadSheet, MidiMix, MidiMixManager, MixError, Part, Rhythm, RhythmCatalog, RhythmId,
    Settings, SgsChange, SgsChangeListener, SgsError, Song, SongError, SongStructure, TimeSignature, UserPhrase,
    Veto,
};

fn wide_rhythm(id: &str, voices: usize) -> Rhythm {
    let mut rhythm = Rhythm::new(id, id, TimeSignature::FOUR_FOUR);
    for i in 0..voices {
        rhythm = rhythm.with_voice(
            &format!("Voice {}", i),
            VoiceKind::Phrase1,
            Instrument::new("Square Lead", InstrumentFamily::SynthLead, 80),
            i as u8,
        );
    }
    rhythm
}

/// Lead sheet A (4/4, bar 0), B (3/4, bar 4), C (4/4, bar 8), 12 bars
fn three_sections() -> LeadSheet {
    let mut ls = LeadSheet::new("A", TimeSignature::FOUR_FOUR, 12);
    ls.add_section("B", TimeSignature::THREE_FOUR, 4).unwrap();
    ls.add_section("C", TimeSignature::FOUR_FOUR, 8).unwrap();
    ls
}

struct Fixture {
    catalog: Arc<InMemoryCatalog>,
    lead_sheet: LeadSheet,
    song: Arc<Song>,
    mix: Arc<MidiMix>,
    _manager: MidiMixManager,
}

fn fixture() -> Fixture {
    let catalog = Arc::new(InMemoryCatalog::demo());
    let mut lead_sheet = three_sections();
    let song = Song::from_lead_sheet("Test", &mut lead_sheet, catalog.clone());
    let manager = MidiMixManager::new(Settings::default(), catalog.clone());
    let mix = manager.find_mix(&song).unwrap();
    Fixture {
        catalog,
        lead_sheet,
        song,
        mix,
        _manager: manager,
    }
}

fn assert_contiguous(sgs: &SongStructure) {
    let parts = sgs.parts();
    let mut bar = 0;
    for part in &parts {
        assert_eq!(part.start_bar(), bar, "gap or overlap at {}", part.name());
        assert!(part.nb_bars() > 0);
        bar = part.end_bar();
    }
    assert_eq!(sgs.size_in_bars(), bar);
}

fn assert_exclusive(mix: &MidiMix) {
    let bound = mix.bound_channels();
    let voices: HashSet<String> = bound.iter().map(|(_, v, _)| v.to_string()).collect();
    assert_eq!(voices.len(), bound.len(), "a voice is bound twice");
    let mixes: HashSet<_> = bound.iter().map(|(_, _, m)| m.id()).collect();
    assert_eq!(mixes.len(), bound.len(), "an instrument mix is bound twice");
}

/// Replace the part of section B with a jazz waltz part
fn use_waltz_for_b(f: &Fixture) {
    let waltz = f.catalog.rhythm(&RhythmId::new("jazz-waltz")).unwrap();
    let old = f.song.structure().part_at_bar(4).unwrap();
    let part = Part::new(waltz, old.start_bar(), old.nb_bars(), old.name(), old.parent_section());
    f.song.structure().replace_parts(&[old.id()], vec![part]).unwrap();
}

#[test]
fn test_song_from_lead_sheet() {
    let f = fixture();
    let parts = f.song.structure().parts();
    assert_eq!(parts.len(), 3);
    assert_eq!(parts[1].time_signature(), TimeSignature::THREE_FOUR);
    // Section B uses the 3/4 variant of the first rhythm, sharing its channels
    assert_eq!(parts[1].rhythm().source_id().as_str(), "medium-swing");
    assert_eq!(f.mix.used_channels(), vec![1, 2, 3, 4, 9]);
    f.mix.check_consistency(&f.song, true).unwrap();
    assert_contiguous(f.song.structure());
}

#[test]
fn test_delete_section_bars() {
    let mut f = fixture();
    use_waltz_for_b(&f);
    assert_eq!(f.mix.used_channels().len(), 9);

    f.lead_sheet.delete_bars(4, 4).unwrap();

    let layout: Vec<(String, usize, usize)> = f
        .song
        .structure()
        .parts()
        .iter()
        .map(|p| (p.name().to_string(), p.start_bar(), p.nb_bars()))
        .collect();
    assert_eq!(layout, vec![("A".to_string(), 0, 4), ("C".to_string(), 4, 4)]);
    // Waltz channels released
    assert_eq!(f.mix.used_channels(), vec![1, 2, 3, 4, 9]);
    f.mix.check_consistency(&f.song, true).unwrap();
    assert_exclusive(&f.mix);
}

#[test]
fn test_lead_sheet_edits_keep_structure_contiguous() {
    let mut f = fixture();
    f.lead_sheet.add_section("D", TimeSignature::FOUR_FOUR, 10).unwrap();
    assert_contiguous(f.song.structure());
    f.lead_sheet.insert_bars(0, 2).unwrap();
    assert_contiguous(f.song.structure());
    let b = f.lead_sheet.section_at(6).unwrap().id;
    f.lead_sheet.move_section(b, 7).unwrap();
    assert_contiguous(f.song.structure());
    f.lead_sheet.set_size(20).unwrap();
    assert_contiguous(f.song.structure());
    f.lead_sheet.delete_bars(3, 2).unwrap();
    assert_contiguous(f.song.structure());
    assert_eq!(f.song.size_in_bars(), f.lead_sheet.size());
    f.mix.check_consistency(&f.song, true).unwrap();
}

#[test]
fn test_undo_redo_structure_and_mix() {
    let f = fixture();
    let parts_before = f.song.structure().parts();
    let channels_before = f.mix.bound_channels();

    use_waltz_for_b(&f);
    let parts_after = f.song.structure().parts();
    let channels_after = f.mix.bound_channels();
    assert_eq!(channels_after.len(), 9);

    // Replacing the part and adding the channels is one step
    assert!(f.song.undo());
    assert_eq!(f.song.structure().parts(), parts_before);
    assert_eq!(f.mix.bound_channels(), channels_before);

    assert!(f.song.redo());
    assert_eq!(f.song.structure().parts(), parts_after);
    assert_eq!(f.mix.bound_channels(), channels_after);
    f.mix.check_consistency(&f.song, true).unwrap();
}

#[test]
fn test_concurrent_structure_edits_keep_mix_in_step() {
    let f = fixture();
    let structure = f.song.structure().clone();
    let bossa = f.catalog.rhythm(&RhythmId::new("bossa-nova")).unwrap();
    let first = structure.parts()[0].id();
    let (opened_tx, opened_rx) = std::sync::mpsc::channel();

    let worker = {
        let structure = structure.clone();
        std::thread::spawn(move || {
            opened_rx.recv().unwrap();
            structure.add_parts(vec![Part::new(bossa, 0, 4, "Intro", None)]).unwrap();
        })
    };
    structure.in_action("edit", |s| {
        opened_tx.send(()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        s.resize_parts(&[(first, 2)]).unwrap();
    });
    worker.join().unwrap();

    assert_eq!(structure.len(), 4);
    assert_eq!(f.mix.rhythm_ids().len(), 2);
    assert_eq!(f.mix.used_channels().len(), 9);
    f.mix.check_consistency(&f.song, true).unwrap();
    assert_exclusive(&f.mix);

    // The added part and its channels are one step, separate from the resize
    assert!(f.song.undo());
    assert_eq!(structure.len(), 3);
    assert_eq!(structure.parts()[0].nb_bars(), 2);
    assert_eq!(f.mix.used_channels(), vec![1, 2, 3, 4, 9]);
}

#[test]
fn test_mix_vetoes_structure_change() {
    let f = fixture();
    let wide = f.catalog.add(wide_rhythm("wide-12", 12));
    let parts_before = f.song.structure().parts();
    let channels_before = f.mix.bound_channels();

    let old = f.song.structure().part_at_bar(4).unwrap();
    let part = Part::new(wide, old.start_bar(), old.nb_bars(), "W", old.parent_section());
    let err = f.song.structure().replace_parts(&[old.id()], vec![part]).unwrap_err();

    assert_eq!(
        err,
        SgsError::Vetoed(Veto::NotEnoughChannels {
            needed: 12,
            available: 11
        })
    );
    assert_eq!(f.song.structure().parts(), parts_before);
    assert_eq!(f.mix.bound_channels(), channels_before);
}

#[derive(Default)]
struct NoRemovals {
    seen: Mutex<Vec<String>>,
}

impl SgsChangeListener for NoRemovals {
    fn authorize_change(&self, proposal: &ChangeProposal) -> Result<(), Veto> {
        match proposal.change {
            SgsChange::PartsRemoved(_) => Err(Veto::Rejected("removals are locked".to_string())),
            _ => Ok(()),
        }
    }

    fn song_structure_changed(&self, _sgs: &SongStructure, change: &SgsChange) {
        self.seen.lock().unwrap().push(change.name().to_string());
    }
}

#[test]
fn test_veto_precedes_mutation() {
    let f = fixture();
    let listener = Arc::new(NoRemovals::default());
    f.song.structure().add_listener(listener.clone());
    let before = f.song.structure().parts();

    let last = before.last().unwrap().id();
    let err = f.song.structure().remove_parts(&[last]).unwrap_err();
    assert!(matches!(err, SgsError::Vetoed(Veto::Rejected(_))));
    assert_eq!(f.song.structure().parts(), before);
    assert!(!f.song.undo_manager().can_undo());

    let seen = listener.seen.lock().unwrap();
    assert!(!seen.iter().any(|name| name == "remove parts"));
    assert!(seen.iter().any(|name| name == "removeParts"));
}

#[test]
fn test_lead_sheet_veto_leaves_sheet_unchanged() {
    let mut f = fixture();
    let listener = Arc::new(NoRemovals::default());
    f.song.structure().add_listener(listener);
    let sections_before = f.lead_sheet.sections().to_vec();

    let b = f.lead_sheet.section_at(4).unwrap().id;
    assert!(f.lead_sheet.remove_section(b).is_err());
    assert_eq!(f.lead_sheet.sections(), sections_before.as_slice());
    assert_eq!(f.song.structure().len(), 3);
}

#[test]
fn test_solo_scenario() {
    let f = fixture();
    f.mix.set_mute(4, true).unwrap();
    f.mix.set_solo(3, true).unwrap();
    for channel in [1, 2, 4, 9] {
        assert!(f.mix.instrument_mix(channel).unwrap().is_mute());
    }
    assert!(!f.mix.instrument_mix(3).unwrap().is_mute());

    // Repeating a solo changes nothing
    f.mix.set_solo(3, true).unwrap();
    f.mix.set_solo(3, false).unwrap();
    for channel in [1, 2, 3, 9] {
        assert!(!f.mix.instrument_mix(channel).unwrap().is_mute());
    }
    assert!(f.mix.instrument_mix(4).unwrap().is_mute());
}

#[test]
fn test_not_enough_channels_leaves_table_unchanged() {
    let sixteen = Arc::new(wide_rhythm("wide-16", 16));
    let eight = Arc::new(wide_rhythm("wide-8", 8));
    let mix = MidiMix::for_rhythm(&sixteen);
    let before = mix.bound_channels();

    let err = mix.add_instrument_mixes(&MidiMix::for_rhythm(&eight), &eight).unwrap_err();
    assert_eq!(
        err,
        MixError::NotEnoughChannels {
            needed: 8,
            available: 0
        }
    );
    assert_eq!(mix.bound_channels(), before);
    assert_eq!(mix.unused_channels(), Vec::<u8>::new());
}

#[test]
fn test_user_phrases_follow_mix() {
    let f = fixture();
    f.song.add_user_phrase(UserPhrase::new("Melody", false)).unwrap();
    let channel = f.mix.user_channel("Melody").unwrap();
    assert_eq!(channel, 10);

    f.song.rename_user_phrase("Melody", "Lead").unwrap();
    assert_eq!(f.mix.user_channel("Lead"), Some(channel));
    f.mix.check_consistency(&f.song, true).unwrap();

    f.song.remove_user_phrase("Lead").unwrap();
    assert!(f.mix.voice(channel).is_none());

    // Adding and removing are undoable together with the channel
    assert!(f.song.undo());
    assert_eq!(f.mix.user_channel("Lead"), Some(channel));
    f.mix.check_consistency(&f.song, true).unwrap();
}

#[test]
fn test_user_phrase_vetoed_when_channels_full() {
    let catalog = Arc::new(InMemoryCatalog::demo());
    let wide = catalog.add(wide_rhythm("wide-16", 16));
    let sgs = SongStructure::new(catalog.clone());
    sgs.add_parts(vec![Part::new(wide, 0, 8, "A", None)]).unwrap();
    let song = Song::new("Full", sgs);
    let manager = MidiMixManager::new(Settings::default(), catalog);
    let mix = manager.find_mix(&song).unwrap();
    assert_eq!(mix.used_channels().len(), NB_CHANNELS);

    let err = song.add_user_phrase(UserPhrase::new("Melody", false)).unwrap_err();
    assert_eq!(
        err,
        SongError::Vetoed(Veto::NotEnoughChannels {
            needed: 1,
            available: 0
        })
    );
    assert!(song.phrase_names().is_empty());
}

#[test]
fn test_import_mix() {
    let f = fixture();
    let bossa = f.catalog.rhythm(&RhythmId::new("bossa-nova")).unwrap();
    let foreign = MidiMix::for_rhythm(&bossa);
    foreign.set_volume(1, 90).unwrap();

    let imported = f.mix.import_from(&foreign).unwrap();
    // Drums, bass and the first chord voice match by kind
    assert_eq!(imported, 3);
    let bass_mix = f.mix.instrument_mix(1).unwrap();
    assert_eq!(bass_mix.instrument().patch_name, "Fingered Bass");
    assert_eq!(bass_mix.settings().volume, 90);
    assert_eq!(f.mix.instrument_mix(2).unwrap().instrument().patch_name, "Nylon Guitar");

    assert!(f.song.undo());
    assert_eq!(f.mix.instrument_mix(1).unwrap().instrument().patch_name, "Acoustic Bass");
}

#[test]
fn test_mix_file_round_trip() {
    let f = fixture();
    use_waltz_for_b(&f);
    f.mix.set_transposition(10, -5).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.mix.yaml");
    f.mix.save(&path).unwrap();

    let file = MixFile::load(&path).unwrap();
    assert_eq!(file.channels.len(), 9);
    let loaded = MidiMix::load(&path, f.catalog.as_ref()).unwrap();
    assert_eq!(loaded.used_channels(), f.mix.used_channels());
    assert_eq!(loaded.instrument_mix(10).unwrap().settings().transposition, -5);
    loaded.check_consistency(&f.song, true).unwrap();
}

#[test]
fn test_parameter_and_rename_are_not_vetoed() {
    let f = fixture();
    let first = f.song.structure().parts()[0].id();
    f.song
        .structure()
        .set_rhythm_parameter_value(first, "Variation", "Main B-1")
        .unwrap();
    f.song.structure().set_parts_name(&[first], "Intro").unwrap();
    let part = f.song.structure().part(first).unwrap();
    assert_eq!(part.param_value("Variation"), Some("Main B-1"));
    assert_eq!(part.name(), "Intro");
    assert_eq!(f.mix.used_channels().len(), 5);
}

#[test]
fn test_remove_middle_section_bars() {
    let catalog = Arc::new(InMemoryCatalog::demo());
    let mut ls = LeadSheet::new("A", TimeSignature::FOUR_FOUR, 12);
    ls.add_section("B", TimeSignature::FOUR_FOUR, 4).unwrap();
    ls.add_section("C", TimeSignature::THREE_FOUR, 8).unwrap();
    let song = Song::from_lead_sheet("Scenario", &mut ls, catalog);

    let signatures: Vec<_> = song
        .structure()
        .parts()
        .iter()
        .map(|p| (p.start_bar(), p.time_signature()))
        .collect();
    assert_eq!(
        signatures,
        vec![
            (0, TimeSignature::FOUR_FOUR),
            (4, TimeSignature::FOUR_FOUR),
            (8, TimeSignature::THREE_FOUR)
        ]
    );

    ls.delete_bars(4, 4).unwrap();
    let parts = song.structure().parts();
    assert_eq!(parts.len(), 2);
    assert_eq!((parts[0].start_bar(), parts[0].nb_bars()), (0, 4));
    assert_eq!((parts[1].name(), parts[1].start_bar(), parts[1].nb_bars()), ("C", 4, 4));
    assert_contiguous(song.structure());
}
