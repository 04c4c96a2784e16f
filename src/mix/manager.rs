// Copyright (c) 2026 Robert L. Snyder, Sierra Vista, AZ
// Licensed under the MIT License. See LICENSE file in the project root for details.

//! Per-song mix lookup and creation.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use super::{MidiMix, MixFile};
use crate::config::Settings;
use crate::error::MixError;
use crate::rhythm::{Rhythm, RhythmCatalog, RhythmId};
use crate::song::{Song, SongId};

/// Source of the default mix of a rhythm
pub trait RhythmMixProvider: Send + Sync {
    /// Get a mix holding the channels of `rhythm`; callers may modify it
    fn rhythm_mix(&self, rhythm: &Arc<Rhythm>) -> Arc<MidiMix>;
}

/// Default rhythm mixes read from `<dir>/<rhythm id>.mix.yaml`
pub struct RhythmMixLibrary {
    dir: Option<PathBuf>,
    catalog: Arc<dyn RhythmCatalog>,
    files: Mutex<HashMap<RhythmId, Option<MixFile>>>,
}

impl RhythmMixLibrary {
    /// Create a library; without a directory every rhythm gets its built-in mix
    pub fn new(dir: Option<PathBuf>, catalog: Arc<dyn RhythmCatalog>) -> Self {
        Self {
            dir,
            catalog,
            files: Mutex::new(HashMap::new()),
        }
    }

    fn mix_file(&self, id: &RhythmId) -> Option<MixFile> {
        let dir = self.dir.as_ref()?;
        let mut files = self.files.lock().expect("library lock poisoned");
        files
            .entry(id.clone())
            .or_insert_with(|| {
                let path = dir.join(format!("{}.mix.yaml", id));
                if !path.exists() {
                    return None;
                }
                match MixFile::load(&path) {
                    Ok(file) => Some(file),
                    Err(e) => {
                        warn!(rhythm = %id, error = %e, "Failed to load rhythm mix");
                        None
                    }
                }
            })
            .clone()
    }
}

impl RhythmMixProvider for RhythmMixLibrary {
    fn rhythm_mix(&self, rhythm: &Arc<Rhythm>) -> Arc<MidiMix> {
        let source = crate::rhythm::source_rhythm(rhythm);
        if let Some(file) = self.mix_file(source.id()) {
            match MidiMix::from_file(&file, self.catalog.as_ref()) {
                Ok(mix) if mix.rhythm_ids() == vec![source.id().clone()] => {
                    let complete = source.voices().len() == mix.used_channels().len();
                    if complete {
                        return mix;
                    }
                    warn!(rhythm = %source.id(), "Rhythm mix does not cover all voices, using defaults");
                }
                Ok(_) => warn!(rhythm = %source.id(), "Rhythm mix holds other rhythms, using defaults"),
                Err(e) => warn!(rhythm = %source.id(), error = %e, "Invalid rhythm mix, using defaults"),
            }
        }
        MidiMix::for_rhythm(&source)
    }
}

/// Finds, creates and caches the mix of each song
pub struct MidiMixManager {
    settings: Settings,
    library: Arc<RhythmMixLibrary>,
    catalog: Arc<dyn RhythmCatalog>,
    /// Most recently used first
    cache: Mutex<VecDeque<(SongId, Arc<MidiMix>)>>,
}

impl MidiMixManager {
    /// Create a manager
    pub fn new(settings: Settings, catalog: Arc<dyn RhythmCatalog>) -> Self {
        let library = Arc::new(RhythmMixLibrary::new(
            settings.rhythm_mix_dir.clone(),
            catalog.clone(),
        ));
        Self {
            settings,
            library,
            catalog,
            cache: Mutex::new(VecDeque::new()),
        }
    }

    /// Get settings
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Get the default mix of a rhythm
    pub fn rhythm_mix(&self, rhythm: &Arc<Rhythm>) -> Arc<MidiMix> {
        self.library.rhythm_mix(rhythm)
    }

    /// Get the mix of a song, loading or creating it when not cached
    pub fn find_mix(&self, song: &Arc<Song>) -> Result<Arc<MidiMix>, MixError> {
        if let Some(mix) = self.cached(song.id()) {
            return Ok(mix);
        }
        let mix = match self.load_song_mix(song) {
            Some(mix) => mix,
            None => self.create_mix(song)?,
        };
        self.insert(song.id(), mix.clone());
        Ok(mix)
    }

    /// Build a fresh mix for a song: rhythm channels then user channels
    pub fn create_mix(&self, song: &Arc<Song>) -> Result<Arc<MidiMix>, MixError> {
        let mix = MidiMix::new();
        self.configure(&mix);
        let mut first: Option<RhythmId> = None;
        for rhythm in song.structure().unique_rhythms(true) {
            let incoming = self.library.rhythm_mix(&rhythm);
            if let Some(first) = &first {
                mix.adapt_instrument_mixes(&incoming, first);
            }
            mix.add_instrument_mixes(&incoming, &rhythm)?;
            first.get_or_insert_with(|| rhythm.id().clone());
        }
        for phrase in song.user_phrases() {
            mix.add_user_channel(phrase.name(), phrase.is_drums())?;
        }
        mix.attach(song);
        info!(song = %song.id(), channels = mix.used_channels().len(), "Created song mix");
        Ok(mix)
    }

    /// Forget the mix of a song and stop it following the song
    pub fn release(&self, id: SongId) -> bool {
        let mut cache = self.cache.lock().expect("mix cache lock poisoned");
        match cache.iter().position(|(song, _)| *song == id) {
            Some(index) => {
                if let Some((_, mix)) = cache.remove(index) {
                    mix.detach();
                }
                true
            }
            None => false,
        }
    }

    /// Number of cached mixes
    pub fn cached_count(&self) -> usize {
        self.cache.lock().expect("mix cache lock poisoned").len()
    }

    fn configure(&self, mix: &MidiMix) {
        mix.set_match_policy(self.settings.match_policy());
        mix.set_rhythm_mix_provider(Some(self.library.clone()));
    }

    fn cached(&self, id: SongId) -> Option<Arc<MidiMix>> {
        let mut cache = self.cache.lock().expect("mix cache lock poisoned");
        let index = cache.iter().position(|(song, _)| *song == id)?;
        let entry = cache.remove(index)?;
        let mix = entry.1.clone();
        cache.push_front(entry);
        Some(mix)
    }

    fn insert(&self, id: SongId, mix: Arc<MidiMix>) {
        let evicted: Vec<(SongId, Arc<MidiMix>)> = {
            let mut cache = self.cache.lock().expect("mix cache lock poisoned");
            cache.push_front((id, mix));
            let capacity = self.settings.mix_cache_capacity.max(1);
            let mut evicted = Vec::new();
            while cache.len() > capacity {
                if let Some(entry) = cache.pop_back() {
                    evicted.push(entry);
                }
            }
            evicted
        };
        for (song, mix) in evicted {
            debug!(%song, "Evicted song mix");
            mix.detach();
        }
    }

    fn load_song_mix(&self, song: &Arc<Song>) -> Option<Arc<MidiMix>> {
        let path = song.mix_file()?;
        if !path.exists() {
            return None;
        }
        let mix = match MidiMix::load(&path, self.catalog.as_ref()) {
            Ok(mix) => mix,
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to load song mix, creating a new one");
                return None;
            }
        };
        if let Err(e) = mix.check_consistency(song, true) {
            warn!(path = ?path, error = %e, "Song mix does not match the song, creating a new one");
            return None;
        }
        self.configure(&mix);
        mix.attach(song);
        info!(song = %song.id(), path = ?path, "Loaded song mix");
        Some(mix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arrangement::{Part, SongStructure};
    use crate::rhythm::{InMemoryCatalog, TimeSignature};
    use crate::song::UserPhrase;

    fn catalog() -> Arc<InMemoryCatalog> {
        Arc::new(InMemoryCatalog::demo())
    }

    fn song(catalog: &Arc<InMemoryCatalog>) -> Arc<Song> {
        let sgs = SongStructure::new(catalog.clone());
        let swing = catalog.rhythm(&RhythmId::new("medium-swing")).unwrap();
        let waltz = catalog.rhythm(&RhythmId::new("jazz-waltz")).unwrap();
        sgs.add_parts(vec![
            Part::new(swing, 0, 8, "A", None),
            Part::new(waltz, 8, 4, "B", None),
        ])
        .unwrap();
        Song::new("Test", sgs)
    }

    #[test]
    fn test_create_mix() {
        let catalog = catalog();
        let song = song(&catalog);
        song.add_user_phrase(UserPhrase::new("Melody", false)).unwrap();
        let manager = MidiMixManager::new(Settings::default(), catalog);

        let mix = manager.find_mix(&song).unwrap();
        // 5 swing voices, 4 waltz voices, 1 user phrase
        assert_eq!(mix.used_channels().len(), 10);
        assert!(mix.user_channel("Melody").is_some());
        mix.check_consistency(&song, true).unwrap();
        assert!(Arc::ptr_eq(&mix, &manager.find_mix(&song).unwrap()));
        assert!(mix.song().is_some());
    }

    #[test]
    fn test_waltz_adapted_to_swing() {
        let catalog = catalog();
        let song = song(&catalog);
        let manager = MidiMixManager::new(Settings::default(), catalog);
        let mix = manager.find_mix(&song).unwrap();

        let pianos: Vec<_> = mix
            .bound_channels()
            .into_iter()
            .filter(|(_, voice, _)| voice.name() == "Piano")
            .collect();
        assert_eq!(pianos.len(), 2);
        assert_eq!(pianos[1].2.instrument().patch_name, "Acoustic Grand Piano");
        assert_eq!(pianos[0].2.instrument(), pianos[1].2.instrument());
    }

    #[test]
    fn test_cache_eviction_detaches() {
        let catalog = catalog();
        let settings = Settings {
            mix_cache_capacity: 1,
            ..Settings::default()
        };
        let manager = MidiMixManager::new(settings, catalog.clone());
        let first = song(&catalog);
        let second = song(&catalog);

        let first_mix = manager.find_mix(&first).unwrap();
        manager.find_mix(&second).unwrap();
        assert_eq!(manager.cached_count(), 1);
        assert!(first_mix.song().is_none());

        assert!(manager.release(second.id()));
        assert!(!manager.release(second.id()));
        assert_eq!(manager.cached_count(), 0);
    }

    #[test]
    fn test_load_saved_song_mix() {
        let catalog = catalog();
        let song = song(&catalog);
        let manager = MidiMixManager::new(Settings::default(), catalog.clone());
        let mix = manager.create_mix(&song).unwrap();
        mix.set_transposition(1, 5).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.mix.yaml");
        mix.save(&path).unwrap();
        mix.detach();
        song.set_mix_file(Some(path.as_path()));

        let loaded = manager.find_mix(&song).unwrap();
        assert!(!Arc::ptr_eq(&mix, &loaded));
        assert_eq!(loaded.instrument_mix(1).unwrap().settings().transposition, 5);
        assert_eq!(loaded.used_channels(), mix.used_channels());
    }

    #[test]
    fn test_rhythm_mix_library() {
        let catalog = catalog();
        let swing = catalog.rhythm(&RhythmId::new("medium-swing")).unwrap();
        let dir = tempfile::tempdir().unwrap();

        let custom = MidiMix::for_rhythm(&swing);
        custom.set_volume(1, 70).unwrap();
        custom.save(dir.path().join("medium-swing.mix.yaml")).unwrap();

        let library = RhythmMixLibrary::new(Some(dir.path().to_path_buf()), catalog.clone());
        let mix = library.rhythm_mix(&swing);
        assert_eq!(mix.instrument_mix(1).unwrap().settings().volume, 70);

        // Adapted rhythms use the mix of their source
        let adapted = catalog.adapted_rhythm(&swing, TimeSignature::THREE_FOUR).unwrap();
        let mix = library.rhythm_mix(&adapted);
        assert_eq!(mix.instrument_mix(1).unwrap().settings().volume, 70);

        let waltz = catalog.rhythm(&RhythmId::new("jazz-waltz")).unwrap();
        let mix = library.rhythm_mix(&waltz);
        assert_eq!(mix.instrument_mix(1).unwrap().settings().volume, 100);
    }
}
